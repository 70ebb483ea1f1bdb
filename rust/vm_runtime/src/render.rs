//! Value formatting for template output and diagnostics.
//!
//! Rendered text flows through [`write_value`] against the host's sink.
//! When escaping is on, string and buffer bytes pass through the HTML
//! escape; structural punctuation around lists and maps is emitted as-is.

use std::io::{self, Write};

use crate::memory::{HeapObject, Key, Memory};
use crate::value::Value;

/// Format a value to the sink.  Scalars are human-readable, floats use the
/// shortest round-trip form, containers recurse, and iterators collapse to
/// placeholders.
pub fn write_value(
    out: &mut dyn Write,
    memory: &Memory<'_>,
    value: Value,
    escape: bool,
) -> io::Result<()> {
    match value {
        Value::Int(v) => write!(out, "{v}"),
        Value::Float(v) => write!(out, "{v}"),
        Value::Bool(v) => write!(out, "{v}"),
        Value::Null => out.write_all(b"null"),
        Value::Str(s) => write_text(out, memory.str_bytes(s), escape),
        Value::Ref(handle) => {
            let Ok(object) = memory.object(handle) else {
                return out.write_all(b"<freed>");
            };
            match object {
                HeapObject::Buffer(bytes) => write_text(out, bytes, escape),
                HeapObject::List(items) => {
                    out.write_all(b"[")?;
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            out.write_all(b", ")?;
                        }
                        write_value(out, memory, *item, escape)?;
                    }
                    out.write_all(b"]")
                }
                HeapObject::Map(entries) => {
                    out.write_all(b"{")?;
                    for (i, (key, item)) in entries.iter().enumerate() {
                        if i > 0 {
                            out.write_all(b", ")?;
                        }
                        write_key(out, key, escape)?;
                        out.write_all(b": ")?;
                        write_value(out, memory, *item, escape)?;
                    }
                    out.write_all(b"}")
                }
                HeapObject::MapEntry { map, index } => {
                    match memory.map_entry(*map, *index) {
                        Some((key, item)) => {
                            write_key(out, key, escape)?;
                            out.write_all(b": ")?;
                            write_value(out, memory, *item, escape)
                        }
                        None => out.write_all(b"<stale entry>"),
                    }
                }
                HeapObject::ListIter { .. } => out.write_all(b"[...]"),
                HeapObject::MapIter { .. } => out.write_all(b"{...}"),
                HeapObject::Free => out.write_all(b"<freed>"),
            }
        }
    }
}

fn write_key(out: &mut dyn Write, key: &Key, escape: bool) -> io::Result<()> {
    match key {
        Key::Int(v) => write!(out, "{v}"),
        Key::Str(bytes) => write_text(out, bytes, escape),
    }
}

/// Write raw or HTML-escaped bytes.
pub fn write_text(out: &mut dyn Write, bytes: &[u8], escape: bool) -> io::Result<()> {
    if escape {
        write_escaped(out, bytes)
    } else {
        out.write_all(bytes)
    }
}

/// HTML escape: `&`, `<`, `>`, `"`, `'` become their entity encodings.
/// Runs of ordinary bytes are written in one piece.
pub fn write_escaped(out: &mut dyn Write, bytes: &[u8]) -> io::Result<()> {
    let mut plain = 0;
    for (i, byte) in bytes.iter().enumerate() {
        let entity: &[u8] = match byte {
            b'&' => b"&amp;",
            b'<' => b"&lt;",
            b'>' => b"&gt;",
            b'"' => b"&#34;",
            b'\'' => b"&#39;",
            _ => continue,
        };
        out.write_all(&bytes[plain..i])?;
        out.write_all(entity)?;
        plain = i + 1;
    }
    out.write_all(&bytes[plain..])
}

/// Render a value to an owned string for error messages.
pub fn describe(memory: &Memory<'_>, value: Value) -> String {
    let mut buf = Vec::new();
    let _ = write_value(&mut buf, memory, value, false);
    String::from_utf8_lossy(&buf).into_owned()
}
