//! Memory subsystem for the Weft VM runtime.
//!
//! Everything a render allocates lives here and dies with the `Memory`
//! value: a pool of immutable byte blocks backing run-created strings, and a
//! table of heap cells holding buffers, containers, and iterators.  Cells
//! carry a strong count so iterators can pin their container and shared
//! substructure stays alive when a slot is reassigned; the counter is 32-bit,
//! which puts overflow past the byte budget's reach.  Container growth is
//! accounted-for explicitly with coarse per-entry constants so a render
//! cannot outgrow the arena budget unnoticed.

use std::hash::{Hash, Hasher};

use indexmap::{Equivalent, IndexMap};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::{read_string, Image};
use crate::value::Value;

/// Default arena ceiling applied when the caller does not provide an explicit
/// budget (16 MiB keeps template renders honest yet generous).
pub const DEFAULT_BUDGET_BYTES: usize = 16 * 1024 * 1024;

/// Approximate accounting constants used when tracking container growth.
const CELL_BASE_BYTES: usize = 64;
const LIST_ELEMENT_BYTES: usize = 16;
const MAP_ENTRY_BYTES: usize = 48;
const POOL_BLOCK_BASE_BYTES: usize = 16;

/// Insertion-ordered table backing map objects.  Re-insertion updates the
/// existing entry without moving it.
pub type MapTable = IndexMap<Key, Value, ahash::RandomState>;

/// Handle to a heap cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapRef(u32);

/// Handle to immutable text: a slice of the image data section or of a pool
/// block allocated during the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrRef {
    Data { start: u32, len: u32 },
    Pool { block: u32, start: u32, len: u32 },
}

impl StrRef {
    pub fn len(&self) -> usize {
        match self {
            StrRef::Data { len, .. } | StrRef::Pool { len, .. } => *len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A one-byte sub-slice at `at`, which must be within bounds.
    pub(crate) fn byte_at(self, at: u32) -> StrRef {
        match self {
            StrRef::Data { start, .. } => StrRef::Data {
                start: start + at,
                len: 1,
            },
            StrRef::Pool { block, start, .. } => StrRef::Pool {
                block,
                start: start + at,
                len: 1,
            },
        }
    }
}

/// A map key: a 64-bit int or an owned byte string.  Keys of different kinds
/// are never equal; hashing covers a kind discriminant plus the raw payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Key {
    Int(i64),
    Str(Box<[u8]>),
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Key::Int(value) => {
                0u8.hash(state);
                value.hash(state);
            }
            Key::Str(bytes) => {
                1u8.hash(state);
                bytes.hash(state);
            }
        }
    }
}

/// Borrowed probe key for map lookups; hashes identically to [`Key`].
#[derive(Debug, Clone, Copy)]
pub enum KeyRef<'a> {
    Int(i64),
    Str(&'a [u8]),
}

impl Hash for KeyRef<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            KeyRef::Int(value) => {
                0u8.hash(state);
                value.hash(state);
            }
            KeyRef::Str(bytes) => {
                1u8.hash(state);
                bytes.hash(state);
            }
        }
    }
}

impl Equivalent<Key> for KeyRef<'_> {
    fn equivalent(&self, key: &Key) -> bool {
        match (self, key) {
            (KeyRef::Int(a), Key::Int(b)) => a == b,
            (KeyRef::Str(a), Key::Str(b)) => *a == &b[..],
            _ => false,
        }
    }
}

/// Payload of a heap cell.
#[derive(Debug)]
pub enum HeapObject {
    /// Growable byte vector; interchangeable with a string under equality
    /// and ordering.
    Buffer(Vec<u8>),
    /// Insertion-ordered keyed map.
    Map(MapTable),
    /// Ordered sequence of values.
    List(Vec<Value>),
    /// View of one map slot; stale once the map is structurally mutated.
    MapEntry { map: HeapRef, index: usize },
    /// List cursor holding a strong reference to its list.
    ListIter { list: HeapRef, index: usize },
    /// Map cursor holding a strong reference to its map.
    MapIter { map: HeapRef, cursor: usize },
    /// Released cell; the slot is dead for the rest of the run.
    Free,
}

impl HeapObject {
    /// Helpful string describing the variant for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            HeapObject::Buffer(_) => "buffer",
            HeapObject::Map(_) => "map",
            HeapObject::List(_) => "list",
            HeapObject::MapEntry { .. } => "map entry",
            HeapObject::ListIter { .. } => "list iterator",
            HeapObject::MapIter { .. } => "map iterator",
            HeapObject::Free => "freed",
        }
    }
}

#[derive(Debug)]
struct HeapCell {
    count: u32,
    object: HeapObject,
}

/// Memory usage snapshot surfaced alongside the sandbox metrics.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub bytes_current: usize,
    pub bytes_peak: usize,
    pub allocations: usize,
}

/// Memory level errors bubbled up to the interpreter.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("arena budget exceeded: used {used} bytes, attempted {requested} additional bytes (budget {budget})")]
    BudgetExceeded {
        used: usize,
        requested: usize,
        budget: usize,
    },
    #[error("heap handle addresses a released cell")]
    StaleHandle,
    #[error("heap handle outside the cell table")]
    InvalidHandle,
}

/// Per-run arena: borrowed image data plus everything the run allocates.
#[derive(Debug)]
pub struct Memory<'img> {
    data: &'img [u8],
    pool: Vec<Box<[u8]>>,
    cells: Vec<HeapCell>,
    budget_bytes: usize,
    metrics: MemoryMetrics,
}

impl<'img> Memory<'img> {
    pub fn new(image: &'img Image) -> Self {
        Self::with_budget(image, DEFAULT_BUDGET_BYTES)
    }

    pub fn with_budget(image: &'img Image, budget_bytes: usize) -> Self {
        Self {
            data: image.data(),
            pool: Vec::new(),
            cells: Vec::new(),
            budget_bytes,
            metrics: MemoryMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &MemoryMetrics {
        &self.metrics
    }

    /// Resolve a string literal in the image data section.
    pub fn data_str(&self, offset: usize) -> Option<StrRef> {
        let (start, len) = read_string(self.data, offset)?;
        Some(StrRef::Data {
            start: start as u32,
            len: len as u32,
        })
    }

    /// The bytes a string handle addresses.  Handles produced by this arena
    /// and by [`Self::data_str`] are always in bounds; anything else reads
    /// as empty.
    pub fn str_bytes(&self, s: StrRef) -> &[u8] {
        let resolved = match s {
            StrRef::Data { start, len } => {
                self.data.get(start as usize..(start + len) as usize)
            }
            StrRef::Pool { block, start, len } => self
                .pool
                .get(block as usize)
                .and_then(|b| b.get(start as usize..(start + len) as usize)),
        };
        resolved.unwrap_or(&[])
    }

    /// The text behind a value, if it has any: string bytes, or a buffer's
    /// current contents.  This is the normalization equality, ordering, and
    /// keying use to treat buffers and strings interchangeably.
    pub fn text_of(&self, value: Value) -> Option<&[u8]> {
        match value {
            Value::Str(s) => Some(self.str_bytes(s)),
            Value::Ref(r) => match self.object(r) {
                Ok(HeapObject::Buffer(bytes)) => Some(bytes),
                _ => None,
            },
            _ => None,
        }
    }

    /// Copy bytes into the pool, returning a handle that stays valid for the
    /// rest of the run.
    pub fn intern(&mut self, bytes: &[u8]) -> Result<StrRef, MemoryError> {
        self.grow(POOL_BLOCK_BASE_BYTES + bytes.len())?;
        let block = self.pool.len() as u32;
        self.pool.push(bytes.into());
        Ok(StrRef::Pool {
            block,
            start: 0,
            len: bytes.len() as u32,
        })
    }

    /// Allocate a heap cell with a strong count of one.
    pub fn alloc(&mut self, object: HeapObject) -> Result<HeapRef, MemoryError> {
        self.grow(CELL_BASE_BYTES + object_cost(&object))?;
        self.metrics.allocations += 1;
        let handle = HeapRef(self.cells.len() as u32);
        self.cells.push(HeapCell { count: 1, object });
        Ok(handle)
    }

    pub fn object(&self, r: HeapRef) -> Result<&HeapObject, MemoryError> {
        let cell = self
            .cells
            .get(r.0 as usize)
            .ok_or(MemoryError::InvalidHandle)?;
        if matches!(cell.object, HeapObject::Free) {
            return Err(MemoryError::StaleHandle);
        }
        Ok(&cell.object)
    }

    pub fn object_mut(&mut self, r: HeapRef) -> Result<&mut HeapObject, MemoryError> {
        let cell = self
            .cells
            .get_mut(r.0 as usize)
            .ok_or(MemoryError::InvalidHandle)?;
        if matches!(cell.object, HeapObject::Free) {
            return Err(MemoryError::StaleHandle);
        }
        Ok(&mut cell.object)
    }

    /// Current strong count of a cell; zero once released.
    pub fn strong_count(&self, r: HeapRef) -> u32 {
        self.cells.get(r.0 as usize).map(|c| c.count).unwrap_or(0)
    }

    /// Take one additional strong reference if the value is a heap handle.
    pub fn retain(&mut self, value: Value) {
        if let Value::Ref(r) = value {
            self.retain_ref(r);
        }
    }

    pub fn retain_ref(&mut self, r: HeapRef) {
        if let Some(cell) = self.cells.get_mut(r.0 as usize) {
            cell.count = cell.count.saturating_add(1);
        }
    }

    /// Drop one strong reference if the value is a heap handle.
    pub fn release(&mut self, value: Value) {
        if let Value::Ref(r) = value {
            self.release_ref(r);
        }
    }

    /// Drop one strong reference; a cell reaching zero is marked free, its
    /// accounted bytes are returned to the budget, and the references it
    /// held are released in turn.  The backing allocations die with the
    /// arena, so a freed cell is only a tombstone.
    pub fn release_ref(&mut self, r: HeapRef) {
        let mut work = vec![r];
        while let Some(r) = work.pop() {
            let Some(cell) = self.cells.get_mut(r.0 as usize) else {
                continue;
            };
            if matches!(cell.object, HeapObject::Free) {
                continue;
            }
            if cell.count > 1 {
                cell.count -= 1;
                continue;
            }
            cell.count = 0;
            let object = std::mem::replace(&mut cell.object, HeapObject::Free);
            self.shrink(CELL_BASE_BYTES + object_cost(&object));
            match object {
                HeapObject::Buffer(_) => {}
                HeapObject::List(items) => {
                    for item in items {
                        if let Value::Ref(child) = item {
                            work.push(child);
                        }
                    }
                }
                HeapObject::Map(entries) => {
                    for (_, item) in entries {
                        if let Value::Ref(child) = item {
                            work.push(child);
                        }
                    }
                }
                HeapObject::MapEntry { map, .. } | HeapObject::MapIter { map, .. } => {
                    work.push(map);
                }
                HeapObject::ListIter { list, .. } => {
                    work.push(list);
                }
                HeapObject::Free => {}
            }
        }
    }

    /// Append to a list, accounting for the new slot.  The caller retains
    /// the value before handing it over.
    pub fn list_push(&mut self, list: HeapRef, value: Value) -> Result<(), MemoryError> {
        self.grow(LIST_ELEMENT_BYTES)?;
        match self.object_mut(list)? {
            HeapObject::List(items) => {
                items.push(value);
                Ok(())
            }
            _ => Err(MemoryError::StaleHandle),
        }
    }

    /// Insert or update a map entry.  Re-insertion updates the value in
    /// place without moving the entry; the displaced value, if any, is
    /// returned for the caller to release.
    pub fn map_insert(
        &mut self,
        map: HeapRef,
        key: Key,
        value: Value,
    ) -> Result<Option<Value>, MemoryError> {
        self.grow(MAP_ENTRY_BYTES)?;
        let displaced = match self.object_mut(map)? {
            HeapObject::Map(entries) => entries.insert(key, value),
            _ => return Err(MemoryError::StaleHandle),
        };
        if displaced.is_some() {
            self.shrink(MAP_ENTRY_BYTES);
        }
        Ok(displaced)
    }

    pub fn map_get(&self, map: HeapRef, key: KeyRef<'_>) -> Result<Option<Value>, MemoryError> {
        match self.object(map)? {
            HeapObject::Map(entries) => Ok(entries.get(&key).copied()),
            _ => Err(MemoryError::StaleHandle),
        }
    }

    /// Remove a map entry, preserving the order of the remaining entries.
    /// Ownership of the removed value moves to the caller.
    pub fn map_remove(&mut self, map: HeapRef, key: KeyRef<'_>) -> Result<Option<Value>, MemoryError> {
        let removed = match self.object_mut(map)? {
            HeapObject::Map(entries) => entries.shift_remove(&key),
            _ => return Err(MemoryError::StaleHandle),
        };
        if removed.is_some() {
            self.shrink(MAP_ENTRY_BYTES);
        }
        Ok(removed)
    }

    /// The `(key, value)` pair at a map slot, or `None` once the slot index
    /// has gone stale.
    pub fn map_entry(&self, map: HeapRef, index: usize) -> Option<(&Key, &Value)> {
        match self.object(map).ok()? {
            HeapObject::Map(entries) => entries.get_index(index),
            _ => None,
        }
    }

    /// Append bytes to a buffer, accounting for the growth.
    pub fn buffer_append(&mut self, buffer: HeapRef, bytes: &[u8]) -> Result<(), MemoryError> {
        self.grow(bytes.len())?;
        match self.object_mut(buffer)? {
            HeapObject::Buffer(contents) => {
                contents.extend_from_slice(bytes);
                Ok(())
            }
            _ => Err(MemoryError::StaleHandle),
        }
    }

    fn grow(&mut self, bytes: usize) -> Result<(), MemoryError> {
        if bytes == 0 {
            return Ok(());
        }
        let projected = self.metrics.bytes_current.saturating_add(bytes);
        if projected > self.budget_bytes {
            return Err(MemoryError::BudgetExceeded {
                used: self.metrics.bytes_current,
                requested: bytes,
                budget: self.budget_bytes,
            });
        }
        self.metrics.bytes_current = projected;
        if projected > self.metrics.bytes_peak {
            self.metrics.bytes_peak = projected;
        }
        Ok(())
    }

    fn shrink(&mut self, bytes: usize) {
        self.metrics.bytes_current = self.metrics.bytes_current.saturating_sub(bytes);
    }
}

fn object_cost(object: &HeapObject) -> usize {
    match object {
        HeapObject::Buffer(bytes) => bytes.len(),
        HeapObject::List(items) => items.len() * LIST_ELEMENT_BYTES,
        HeapObject::Map(entries) => entries.len() * MAP_ENTRY_BYTES,
        HeapObject::MapEntry { .. }
        | HeapObject::ListIter { .. }
        | HeapObject::MapIter { .. }
        | HeapObject::Free => 0,
    }
}
