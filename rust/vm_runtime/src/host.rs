//! Host function hook for the Weft VM.
//!
//! The compiler lowers calls it cannot express in the core instruction set
//! to `CALL_HOST` with a registered function id.  Each host function takes
//! the per-run arena and a slice of already-evaluated arguments and returns
//! either an owned value or an error that is bubbled up through the
//! interpreter.  A host function that returns one of its arguments must
//! retain it first; the interpreter releases the arguments after dispatch.
//!
//! The standard registry is small and deterministic: it is the only route by
//! which template code observes iterators, buffers, and map mutation.

use std::collections::HashMap;

use thiserror::Error;

use crate::memory::{HeapObject, HeapRef, Key, KeyRef, Memory, MemoryError};
use crate::value::Value;

/// Runtime error surfaced when a host function rejects provided arguments.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("unknown host function #{0}")]
    Unknown(u32),
    #[error("expected {expected} arguments but received {actual}")]
    Arity { expected: usize, actual: usize },
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("host call failed: {0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub type HostResult = Result<Value, HostError>;

type HostFn = fn(&mut Memory<'_>, &[Value]) -> HostResult;

pub const HOST_LEN: u32 = 1;
pub const HOST_ITERATE: u32 = 2;
pub const HOST_NEXT: u32 = 3;
pub const HOST_ENTRY_KEY: u32 = 4;
pub const HOST_ENTRY_VALUE: u32 = 5;
pub const HOST_BUFFER: u32 = 6;
pub const HOST_APPEND: u32 = 7;
pub const HOST_LIST_NEW: u32 = 8;
pub const HOST_LIST_PUSH: u32 = 9;
pub const HOST_MAP_NEW: u32 = 10;
pub const HOST_MAP_INSERT: u32 = 11;
pub const HOST_MAP_REMOVE: u32 = 12;
pub const HOST_MAP_CONTAINS: u32 = 13;

/// Registry of available host functions.
#[derive(Debug, Clone)]
pub struct HostFunctions {
    registry: HashMap<u32, (&'static str, HostFn)>,
}

impl HostFunctions {
    /// An empty registry; every `CALL_HOST` fails.
    pub fn empty() -> Self {
        Self {
            registry: HashMap::new(),
        }
    }

    /// Construct the default registry the template compiler targets.
    pub fn standard() -> Self {
        let mut hosts = Self::empty();
        hosts.register(HOST_LEN, "len", host_len);
        hosts.register(HOST_ITERATE, "iterate", host_iterate);
        hosts.register(HOST_NEXT, "next", host_next);
        hosts.register(HOST_ENTRY_KEY, "entry_key", host_entry_key);
        hosts.register(HOST_ENTRY_VALUE, "entry_value", host_entry_value);
        hosts.register(HOST_BUFFER, "buffer", host_buffer);
        hosts.register(HOST_APPEND, "append", host_append);
        hosts.register(HOST_LIST_NEW, "list_new", host_list_new);
        hosts.register(HOST_LIST_PUSH, "list_push", host_list_push);
        hosts.register(HOST_MAP_NEW, "map_new", host_map_new);
        hosts.register(HOST_MAP_INSERT, "map_insert", host_map_insert);
        hosts.register(HOST_MAP_REMOVE, "map_remove", host_map_remove);
        hosts.register(HOST_MAP_CONTAINS, "map_contains", host_map_contains);
        hosts
    }

    pub fn register(&mut self, id: u32, name: &'static str, handler: HostFn) {
        self.registry.insert(id, (name, handler));
    }

    pub fn call(&self, id: u32, memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
        let (_, handler) = self.registry.get(&id).ok_or(HostError::Unknown(id))?;
        handler(memory, args)
    }

    /// Registered `(id, name)` pairs for documentation and telemetry.
    pub fn descriptors(&self) -> Vec<(u32, &'static str)> {
        let mut names: Vec<_> = self
            .registry
            .iter()
            .map(|(id, (name, _))| (*id, *name))
            .collect();
        names.sort_by_key(|(id, _)| *id);
        names
    }
}

/// Resolution interface for `@include` partials.  The front end calls this
/// while compiling; the runtime only defines the seam.
pub trait PartialResolver {
    fn resolve_partial(
        &self,
        template_key: &str,
        include_key: &str,
    ) -> Result<ResolvedPartial, HostError>;
}

/// A resolved partial: its canonical key and its source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPartial {
    pub key: String,
    pub source: String,
}

fn ensure_arity(args: &[Value], expected: usize) -> Result<(), HostError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(HostError::Arity {
            expected,
            actual: args.len(),
        })
    }
}

fn expect_ref(memory: &Memory<'_>, value: Value) -> Result<HeapRef, HostError> {
    value.as_ref().ok_or_else(|| HostError::TypeMismatch {
        expected: "heap object",
        found: value.kind(memory),
    })
}

fn key_of(memory: &Memory<'_>, value: Value) -> Result<Key, HostError> {
    if let Value::Int(v) = value {
        return Ok(Key::Int(v));
    }
    match memory.text_of(value) {
        Some(bytes) => Ok(Key::Str(bytes.into())),
        None => Err(HostError::TypeMismatch {
            expected: "int or string key",
            found: value.kind(memory),
        }),
    }
}

fn host_len(memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
    ensure_arity(args, 1)?;
    if let Some(bytes) = memory.text_of(args[0]) {
        return Ok(Value::Int(bytes.len() as i64));
    }
    let handle = expect_ref(memory, args[0])?;
    match memory.object(handle)? {
        HeapObject::List(items) => Ok(Value::Int(items.len() as i64)),
        HeapObject::Map(entries) => Ok(Value::Int(entries.len() as i64)),
        other => Err(HostError::TypeMismatch {
            expected: "string, buffer, list, or map",
            found: other.kind(),
        }),
    }
}

fn host_iterate(memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
    ensure_arity(args, 1)?;
    let handle = expect_ref(memory, args[0])?;
    let iterator = match memory.object(handle)? {
        HeapObject::List(_) => HeapObject::ListIter {
            list: handle,
            index: 0,
        },
        HeapObject::Map(_) => HeapObject::MapIter {
            map: handle,
            cursor: 0,
        },
        other => {
            return Err(HostError::TypeMismatch {
                expected: "list or map",
                found: other.kind(),
            })
        }
    };
    // The iterator owns a strong reference to its container.
    memory.retain_ref(handle);
    Ok(Value::Ref(memory.alloc(iterator)?))
}

fn host_next(memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
    ensure_arity(args, 1)?;
    let iter = expect_ref(memory, args[0])?;
    enum Step {
        Element(Value),
        Entry(HeapRef, usize),
        Done,
    }
    let step = match memory.object(iter)? {
        HeapObject::ListIter { list, index } => {
            let (list, index) = (*list, *index);
            match memory.object(list)? {
                HeapObject::List(items) => match items.get(index) {
                    Some(item) => Step::Element(*item),
                    None => Step::Done,
                },
                other => {
                    return Err(HostError::TypeMismatch {
                        expected: "list",
                        found: other.kind(),
                    })
                }
            }
        }
        HeapObject::MapIter { map, cursor } => {
            let (map, cursor) = (*map, *cursor);
            match memory.object(map)? {
                HeapObject::Map(entries) if cursor < entries.len() => Step::Entry(map, cursor),
                HeapObject::Map(_) => Step::Done,
                other => {
                    return Err(HostError::TypeMismatch {
                        expected: "map",
                        found: other.kind(),
                    })
                }
            }
        }
        other => {
            return Err(HostError::TypeMismatch {
                expected: "iterator",
                found: other.kind(),
            })
        }
    };
    match step {
        Step::Element(item) => {
            advance(memory, iter)?;
            memory.retain(item);
            Ok(item)
        }
        Step::Entry(map, cursor) => {
            advance(memory, iter)?;
            memory.retain_ref(map);
            let entry = memory.alloc(HeapObject::MapEntry { map, index: cursor })?;
            Ok(Value::Ref(entry))
        }
        Step::Done => Ok(Value::Null),
    }
}

fn advance(memory: &mut Memory<'_>, iter: HeapRef) -> Result<(), HostError> {
    match memory.object_mut(iter)? {
        HeapObject::ListIter { index, .. } => *index += 1,
        HeapObject::MapIter { cursor, .. } => *cursor += 1,
        _ => return Err(HostError::InvalidState("advance on a non-iterator")),
    }
    Ok(())
}

fn host_entry_key(memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
    ensure_arity(args, 1)?;
    let handle = expect_ref(memory, args[0])?;
    let (map, index) = match memory.object(handle)? {
        HeapObject::MapEntry { map, index } => (*map, *index),
        other => {
            return Err(HostError::TypeMismatch {
                expected: "map entry",
                found: other.kind(),
            })
        }
    };
    match memory.map_entry(map, index) {
        Some((Key::Int(v), _)) => Ok(Value::Int(*v)),
        Some((Key::Str(bytes), _)) => {
            let bytes = bytes.to_vec();
            Ok(Value::Str(memory.intern(&bytes)?))
        }
        // The slot went away under the entry; the view reads as null.
        None => Ok(Value::Null),
    }
}

fn host_entry_value(memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
    ensure_arity(args, 1)?;
    let handle = expect_ref(memory, args[0])?;
    let (map, index) = match memory.object(handle)? {
        HeapObject::MapEntry { map, index } => (*map, *index),
        other => {
            return Err(HostError::TypeMismatch {
                expected: "map entry",
                found: other.kind(),
            })
        }
    };
    match memory.map_entry(map, index) {
        Some((_, item)) => {
            let item = *item;
            memory.retain(item);
            Ok(item)
        }
        None => Ok(Value::Null),
    }
}

fn host_buffer(memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
    ensure_arity(args, 0)?;
    Ok(Value::Ref(memory.alloc(HeapObject::Buffer(Vec::new()))?))
}

fn host_append(memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
    ensure_arity(args, 2)?;
    let buffer = expect_ref(memory, args[0])?;
    let bytes = match memory.text_of(args[1]) {
        Some(bytes) => bytes.to_vec(),
        None => {
            return Err(HostError::TypeMismatch {
                expected: "string or buffer",
                found: args[1].kind(memory),
            })
        }
    };
    memory.buffer_append(buffer, &bytes)?;
    Ok(Value::Null)
}

fn host_list_new(memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
    ensure_arity(args, 0)?;
    Ok(Value::Ref(memory.alloc(HeapObject::List(Vec::new()))?))
}

fn host_list_push(memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
    ensure_arity(args, 2)?;
    let list = expect_ref(memory, args[0])?;
    let item = args[1];
    memory.retain(item);
    memory.list_push(list, item)?;
    Ok(Value::Null)
}

fn host_map_new(memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
    ensure_arity(args, 0)?;
    Ok(Value::Ref(memory.alloc(HeapObject::Map(Default::default()))?))
}

fn host_map_insert(memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
    ensure_arity(args, 3)?;
    let map = expect_ref(memory, args[0])?;
    let key = key_of(memory, args[1])?;
    let item = args[2];
    memory.retain(item);
    if let Some(displaced) = memory.map_insert(map, key, item)? {
        memory.release(displaced);
    }
    Ok(Value::Null)
}

fn host_map_remove(memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
    ensure_arity(args, 2)?;
    let map = expect_ref(memory, args[0])?;
    let removed = match args[1] {
        Value::Int(v) => memory.map_remove(map, KeyRef::Int(v))?,
        other => {
            let bytes = match memory.text_of(other) {
                Some(bytes) => bytes.to_vec(),
                None => {
                    return Err(HostError::TypeMismatch {
                        expected: "int or string key",
                        found: other.kind(memory),
                    })
                }
            };
            memory.map_remove(map, KeyRef::Str(&bytes))?
        }
    };
    // Ownership of the removed value moves from the map to the caller.
    Ok(removed.unwrap_or(Value::Null))
}

fn host_map_contains(memory: &mut Memory<'_>, args: &[Value]) -> HostResult {
    ensure_arity(args, 2)?;
    let map = expect_ref(memory, args[0])?;
    let present = match args[1] {
        Value::Int(v) => memory.map_get(map, KeyRef::Int(v))?.is_some(),
        other => match memory.text_of(other) {
            Some(bytes) => memory.map_get(map, KeyRef::Str(bytes))?.is_some(),
            None => {
                return Err(HostError::TypeMismatch {
                    expected: "int or string key",
                    found: other.kind(memory),
                })
            }
        },
    };
    Ok(Value::Bool(present))
}
