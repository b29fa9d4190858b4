//! Collaborator seams toward the surrounding storage engine.
//!
//! The index never owns row data. It hands out and receives opaque local
//! keys, reads primary keys back through [`PrimaryKeyReader`] when a hash
//! collision (or an exhausted reduced hash) forces a full comparison, and
//! reports committed deletes through [`RowDeallocation`].

use crate::common::{FragmentId, LocalKey};
use crate::page::{new_page_mem, PageMem};

/// Source of 8 KiB index pages.
///
/// Implementations decide the backing store and the budget; the engine
/// treats `None` from [`allocate_page`](Self::allocate_page) as index
/// memory exhaustion and surfaces it to the caller, never retrying
/// internally.
pub trait PageAllocator: Send {
    fn allocate_page(&mut self) -> Option<PageMem>;
    fn free_page(&mut self, mem: PageMem);
}

/// Heap-backed allocator with a page budget.
pub struct HeapAllocator {
    in_use: usize,
    max_pages: usize,
}

impl HeapAllocator {
    pub fn new(max_pages: usize) -> Self {
        Self {
            in_use: 0,
            max_pages,
        }
    }

    pub fn pages_in_use(&self) -> usize {
        self.in_use
    }
}

impl PageAllocator for HeapAllocator {
    fn allocate_page(&mut self) -> Option<PageMem> {
        if self.in_use >= self.max_pages {
            #[cfg(feature = "logging")]
            log::warn!("page budget exhausted ({} pages in use)", self.in_use);
            return None;
        }
        self.in_use += 1;
        Some(new_page_mem())
    }

    fn free_page(&mut self, mem: PageMem) {
        drop(mem);
        self.in_use -= 1;
    }
}

/// Reads the primary key of a stored row back out of row storage.
///
/// `None` means the row copy is gone. Under a locked element the index
/// falls back to keys carried by queued operations; under an unlocked one
/// it surfaces as [`TupleGone`](crate::Refusal::TupleGone).
pub trait PrimaryKeyReader: Send + Sync {
    fn read_pk(&self, local_key: LocalKey) -> Option<Vec<u8>>;
}

/// Receives row-deallocation notifications in two steps.
///
/// [`notify_pending_delete`](Self::notify_pending_delete) arrives as soon
/// as a row version is doomed (its delete committed or its insert
/// aborted); operations queued on the element may still hold the local
/// key at that point. [`trigger_delete`](Self::trigger_delete) arrives
/// once the index has dropped its last reference and row storage may
/// reclaim the row.
pub trait RowDeallocation: Send + Sync {
    fn notify_pending_delete(&self, fragment: FragmentId, local_key: LocalKey);
    fn trigger_delete(&self, fragment: FragmentId, local_key: LocalKey);
}

/// Discards deallocation notifications; for callers that track row
/// lifetime themselves.
pub struct NoopDeallocation;

impl RowDeallocation for NoopDeallocation {
    fn notify_pending_delete(&self, _fragment: FragmentId, _local_key: LocalKey) {}
    fn trigger_delete(&self, _fragment: FragmentId, _local_key: LocalKey) {}
}
