//! Generational handle tables.
//!
//! GPU objects are never referenced by raw pointer or device address outside
//! the component that owns them. Owners keep a [`HandleTable`] and hand out
//! small typed ids; a destroyed slot bumps its generation so stale ids are
//! detected instead of aliasing a newer object.

use std::fmt;
use std::marker::PhantomData;

use crate::error::{CoreError, Result};

/// Names a handle type in error messages.
pub trait HandleKind {
    /// Human-readable kind, e.g. `"buffer"`.
    const KIND: &'static str;
}

/// A typed, generational index into a [`HandleTable`].
pub struct Handle<K> {
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Handle<K> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _kind: PhantomData,
        }
    }

    /// The slot index.
    pub fn index(self) -> u32 {
        self.index
    }

    /// The slot generation this handle was issued for.
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<K> Eq for Handle<K> {}

impl<K> std::hash::Hash for Handle<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<K: HandleKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}:{}", K::KIND, self.index, self.generation)
    }
}

/// Marker for buffer handles.
#[derive(Debug)]
pub enum BufferKind {}

impl HandleKind for BufferKind {
    const KIND: &'static str = "buffer";
}

/// Marker for top-level acceleration structure handles.
#[derive(Debug)]
pub enum TlasKind {}

impl HandleKind for TlasKind {
    const KIND: &'static str = "TLAS";
}

/// Identifies a buffer owned by the buffer manager.
pub type BufferId = Handle<BufferKind>;

/// Identifies a top-level acceleration structure.
pub type TlasId = Handle<TlasKind>;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
    dependents: u32,
}

/// Slot storage with generation checks and dependent counting.
///
/// Removing an entry that still has dependents is rejected with
/// [`CoreError::InUse`]; removing it twice is rejected with
/// [`CoreError::StaleHandle`].
pub struct HandleTable<K, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: HandleKind, T> Default for HandleTable<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: HandleKind, T> HandleTable<K, T> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            _kind: PhantomData,
        }
    }

    /// Stores a value and returns its handle.
    pub fn insert(&mut self, value: T) -> Handle<K> {
        self.insert_with(|_| value)
    }

    /// Stores a value built from its own handle.
    pub fn insert_with(&mut self, make: impl FnOnce(Handle<K>) -> T) -> Handle<K> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let handle = Handle::new(index, slot.generation);
            slot.value = Some(make(handle));
            slot.dependents = 0;
            handle
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let handle = Handle::new(self.slots.len() as u32, 0);
            self.slots.push(Slot {
                generation: 0,
                value: Some(make(handle)),
                dependents: 0,
            });
            handle
        }
    }

    fn slot(&self, handle: Handle<K>) -> Result<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation && s.value.is_some())
            .ok_or_else(|| stale::<K>(handle))
    }

    fn slot_mut(&mut self, handle: Handle<K>) -> Result<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation && s.value.is_some())
            .ok_or_else(|| stale::<K>(handle))
    }

    /// Looks up a live entry.
    pub fn get(&self, handle: Handle<K>) -> Result<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
            .ok_or_else(|| stale::<K>(handle))
    }

    /// Looks up a live entry mutably.
    pub fn get_mut(&mut self, handle: Handle<K>) -> Result<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
            .ok_or_else(|| stale::<K>(handle))
    }

    /// Whether the handle refers to a live entry.
    pub fn contains(&self, handle: Handle<K>) -> bool {
        self.slot(handle).is_ok()
    }

    /// Records that another live object depends on this entry.
    pub fn retain(&mut self, handle: Handle<K>) -> Result<()> {
        self.slot_mut(handle)?.dependents += 1;
        Ok(())
    }

    /// Drops one dependent.
    pub fn release(&mut self, handle: Handle<K>) -> Result<()> {
        let slot = self.slot_mut(handle)?;
        slot.dependents = slot.dependents.saturating_sub(1);
        Ok(())
    }

    /// Number of live dependents of an entry.
    pub fn dependents(&self, handle: Handle<K>) -> Result<u32> {
        Ok(self.slot(handle)?.dependents)
    }

    /// Removes an entry that has no dependents.
    pub fn remove(&mut self, handle: Handle<K>) -> Result<T> {
        let slot = self.slot_mut(handle)?;
        if slot.dependents > 0 {
            return Err(CoreError::InUse {
                kind: K::KIND,
                index: handle.index,
                dependents: slot.dependents,
            });
        }
        let value = slot.value.take().ok_or_else(|| stale::<K>(handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(value)
    }

    /// Removes every live entry regardless of dependents, in slot order.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                slot.dependents = 0;
                self.free.push(index as u32);
                out.push(value);
            }
        }
        out
    }

    /// Iterates live entries.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<K>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value
                .as_ref()
                .map(|v| (Handle::new(i as u32, s.generation), v))
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    /// Whether the table has no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn stale<K: HandleKind>(handle: Handle<K>) -> CoreError {
    CoreError::StaleHandle {
        kind: K::KIND,
        index: handle.index,
        generation: handle.generation,
    }
}
