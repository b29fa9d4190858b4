//! Slab arena with typed `u32` handles.
//!
//! Operation records, scan records and pages are all arena-allocated and
//! addressed by stable integer indices with an explicit null sentinel, so
//! queue links can be stored inside packed page words and record fields
//! without raw pointers.

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

use crate::common::fatal;

/// Typed index into an [`Arena<T>`]. `Handle::null()` is the sentinel.
pub(crate) struct Handle<T> {
    raw: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) const NULL_RAW: u32 = u32::MAX;

    pub(crate) fn null() -> Self {
        Self::from_raw(Self::NULL_RAW)
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(self) -> u32 {
        self.raw
    }

    pub(crate) fn is_null(self) -> bool {
        self.raw == Self::NULL_RAW
    }

    pub(crate) fn is_some(self) -> bool {
        self.raw != Self::NULL_RAW
    }
}

// Manual impls: derives would put unnecessary bounds on `T`.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Handle<T> {}

impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "Handle(null)")
        } else {
            write!(f, "Handle({})", self.raw)
        }
    }
}

enum Slot<T> {
    Occupied(T),
    Free { next_free: u32 },
}

/// Bounded slab. `insert` returns `None` when the configured record budget
/// is exhausted; the caller surfaces that as a resource-exhaustion refusal.
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: u32,
    len: usize,
    max_records: usize,
}

impl<T> Arena<T> {
    pub(crate) fn with_max_records(max_records: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_head: Handle::<T>::NULL_RAW,
            len: 0,
            max_records,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn insert(&mut self, value: T) -> Option<Handle<T>> {
        if self.len >= self.max_records {
            return None;
        }
        self.len += 1;
        if self.free_head != Handle::<T>::NULL_RAW {
            let idx = self.free_head;
            match self.slots[idx as usize] {
                Slot::Free { next_free } => self.free_head = next_free,
                Slot::Occupied(_) => fatal!("arena free list points at an occupied slot {idx}"),
            }
            self.slots[idx as usize] = Slot::Occupied(value);
            Some(Handle::from_raw(idx))
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot::Occupied(value));
            Some(Handle::from_raw(idx))
        }
    }

    pub(crate) fn remove(&mut self, handle: Handle<T>) -> T {
        let idx = handle.raw() as usize;
        let slot = std::mem::replace(
            &mut self.slots[idx],
            Slot::Free {
                next_free: self.free_head,
            },
        );
        match slot {
            Slot::Occupied(value) => {
                self.free_head = handle.raw();
                self.len -= 1;
                value
            }
            Slot::Free { .. } => fatal!("double free of arena slot {idx}"),
        }
    }

    pub(crate) fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.raw() as usize) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.raw() as usize) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }
}

impl<T> Index<Handle<T>> for Arena<T> {
    type Output = T;

    fn index(&self, handle: Handle<T>) -> &T {
        match self.get(handle) {
            Some(value) => value,
            None => fatal!("dangling arena handle {:?}", handle),
        }
    }
}

impl<T> IndexMut<Handle<T>> for Arena<T> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        match self.slots.get_mut(handle.raw() as usize) {
            Some(Slot::Occupied(value)) => value,
            _ => fatal!("dangling arena handle {:?}", handle),
        }
    }
}
