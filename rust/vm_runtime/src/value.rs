//! Runtime values and their comparison semantics.
//!
//! A value is a small copyable tag: scalars travel by value, text travels as
//! a handle into the image or pool, and containers travel as heap handles.
//! Equality and ordering need the arena to resolve handles, so they are free
//! functions over `&Memory` rather than trait impls; the derived `PartialEq`
//! on [`Value`] compares handles structurally and is not the language's
//! equality.

use std::cmp::Ordering;

use thiserror::Error;

use crate::memory::{HeapObject, HeapRef, Memory, StrRef};

/// A runtime value on the stack, in a local slot, or inside a container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Str(StrRef),
    Ref(HeapRef),
}

/// Raised when two values have no defined equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("values of these kinds cannot be compared")]
pub struct Incompatible;

impl Value {
    /// Only `Bool(true)` is true; every other value, including nonzero
    /// numbers and non-empty collections, is false.
    pub fn is_true(self) -> bool {
        matches!(self, Value::Bool(true))
    }

    pub fn as_int(self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_float(self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_ref(self) -> Option<HeapRef> {
        match self {
            Value::Ref(handle) => Some(handle),
            _ => None,
        }
    }

    /// Helpful string describing the value's kind for diagnostics.
    pub fn kind(self, memory: &Memory<'_>) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::Str(_) => "string",
            Value::Ref(handle) => match memory.object(handle) {
                Ok(object) => object.kind(),
                Err(_) => "freed",
            },
        }
    }
}

/// Language equality.
///
/// Buffers compare as the string of their current bytes; ints promote to
/// float against floats; null is unequal to (never incompatible with) every
/// other kind; lists and maps compare structurally; iterators are never
/// equal to anything, themselves included.
pub fn equal(memory: &Memory<'_>, a: Value, b: Value) -> Result<bool, Incompatible> {
    if let (Some(x), Some(y)) = (memory.text_of(a), memory.text_of(b)) {
        return Ok(x == y);
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x == y),
        (Value::Float(x), Value::Float(y)) => Ok(x == y),
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => Ok(x as f64 == y),
        (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
        (Value::Null, Value::Null) => Ok(true),
        (Value::Null, _) | (_, Value::Null) => Ok(false),
        (Value::Ref(x), Value::Ref(y)) => equal_refs(memory, x, y),
        _ => Err(Incompatible),
    }
}

fn equal_refs(memory: &Memory<'_>, x: HeapRef, y: HeapRef) -> Result<bool, Incompatible> {
    let ox = memory.object(x).map_err(|_| Incompatible)?;
    let oy = memory.object(y).map_err(|_| Incompatible)?;
    if is_iterator(ox) || is_iterator(oy) {
        return Ok(false);
    }
    match (ox, oy) {
        (HeapObject::List(xs), HeapObject::List(ys)) => {
            if xs.len() != ys.len() {
                return Ok(false);
            }
            for (a, b) in xs.iter().zip(ys.iter()) {
                if !equal(memory, *a, *b).unwrap_or(false) {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (HeapObject::Map(xs), HeapObject::Map(ys)) => {
            if xs.len() != ys.len() {
                return Ok(false);
            }
            for (key, a) in xs {
                match ys.get(key) {
                    Some(b) if equal(memory, *a, *b).unwrap_or(false) => {}
                    _ => return Ok(false),
                }
            }
            Ok(true)
        }
        (HeapObject::MapEntry { map: xm, index: xi }, HeapObject::MapEntry { map: ym, index: yi }) => {
            match (memory.map_entry(*xm, *xi), memory.map_entry(*ym, *yi)) {
                (Some((ka, va)), Some((kb, vb))) => {
                    Ok(ka == kb && equal(memory, *va, *vb).unwrap_or(false))
                }
                // A stale entry no longer equals anything.
                _ => Ok(false),
            }
        }
        _ => Err(Incompatible),
    }
}

/// Language ordering; total over all values.
///
/// Tags that differ order by a fixed ordinal after numeric promotion; NaN
/// comparisons settle as equal.
pub fn order(memory: &Memory<'_>, a: Value, b: Value) -> Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => return x.cmp(&y),
        (Value::Int(x), Value::Float(y)) => return float_order(x as f64, y),
        (Value::Float(x), Value::Int(y)) => return float_order(x, y as f64),
        (Value::Float(x), Value::Float(y)) => return float_order(x, y),
        _ => {}
    }
    if let (Some(x), Some(y)) = (memory.text_of(a), memory.text_of(b)) {
        return x.cmp(y);
    }
    let (ta, tb) = (ordinal(memory, a), ordinal(memory, b));
    if ta != tb {
        return ta.cmp(&tb);
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(&y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Ref(x), Value::Ref(y)) => order_refs(memory, x, y),
        _ => Ordering::Equal,
    }
}

fn order_refs(memory: &Memory<'_>, x: HeapRef, y: HeapRef) -> Ordering {
    let (Ok(ox), Ok(oy)) = (memory.object(x), memory.object(y)) else {
        return Ordering::Equal;
    };
    match (ox, oy) {
        (HeapObject::List(xs), HeapObject::List(ys)) => {
            match xs.len().cmp(&ys.len()) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
            for (a, b) in xs.iter().zip(ys.iter()) {
                match order(memory, *a, *b) {
                    Ordering::Equal => {}
                    unequal => return unequal,
                }
            }
            Ordering::Equal
        }
        // Maps order by entry count only.
        (HeapObject::Map(xs), HeapObject::Map(ys)) => xs.len().cmp(&ys.len()),
        (HeapObject::MapEntry { map: xm, index: xi }, HeapObject::MapEntry { map: ym, index: yi }) => {
            match (memory.map_entry(*xm, *xi), memory.map_entry(*ym, *yi)) {
                (Some((ka, va)), Some((kb, vb))) => match ka.cmp(kb) {
                    Ordering::Equal => order(memory, *va, *vb),
                    unequal => unequal,
                },
                _ => Ordering::Equal,
            }
        }
        // Iterators are indistinguishable among themselves.
        _ => Ordering::Equal,
    }
}

fn float_order(x: f64, y: f64) -> Ordering {
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

fn is_iterator(object: &HeapObject) -> bool {
    matches!(
        object,
        HeapObject::ListIter { .. } | HeapObject::MapIter { .. }
    )
}

/// Fixed tag ordinal for cross-kind ordering.  Iterators sit below every
/// other heap kind.
fn ordinal(memory: &Memory<'_>, value: Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::Str(_) => 4,
        Value::Ref(handle) => match memory.object(handle) {
            Ok(HeapObject::Buffer(_)) => 4,
            Ok(HeapObject::List(_)) => 5,
            Ok(HeapObject::Map(_)) => 6,
            Ok(HeapObject::MapEntry { .. }) => 7,
            _ => 3,
        },
    }
}
