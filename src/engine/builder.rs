//! Knobs for [`Engine`] construction and per-fragment tuning.

use crate::common::error::Refusal;
use crate::engine::Engine;
use crate::fragment::FragConfig;
use crate::traits::{HeapAllocator, NoopDeallocation, PageAllocator, PrimaryKeyReader, RowDeallocation};

const DEFAULT_MAX_OPERATIONS: usize = 1024;
const DEFAULT_MAX_SCANS: usize = 64;
const DEFAULT_PAGE_BUDGET: usize = 4096;

/// Builds an [`Engine`].
///
/// ```
/// use lhix::{Engine, PrimaryKeyReader, LocalKey};
///
/// struct NoRows;
/// impl PrimaryKeyReader for NoRows {
///     fn read_pk(&self, _key: LocalKey) -> Option<Vec<u8>> {
///         None
///     }
/// }
///
/// let engine = Engine::builder(Box::new(NoRows))
///     .max_operations(256)
///     .page_budget(128)
///     .build();
/// ```
#[must_use]
pub struct EngineBuilder {
    max_operations: usize,
    max_scans: usize,
    page_budget: usize,
    allocator: Option<Box<dyn PageAllocator>>,
    pk: Box<dyn PrimaryKeyReader>,
    dealloc: Box<dyn RowDeallocation>,
}

impl EngineBuilder {
    pub(crate) fn new(pk: Box<dyn PrimaryKeyReader>) -> Self {
        Self {
            max_operations: DEFAULT_MAX_OPERATIONS,
            max_scans: DEFAULT_MAX_SCANS,
            page_budget: DEFAULT_PAGE_BUDGET,
            allocator: None,
            pk,
            dealloc: Box::new(NoopDeallocation),
        }
    }

    /// Capacity of the operation-record arena, shared by all fragments.
    pub fn max_operations(mut self, max_operations: usize) -> Self {
        self.max_operations = max_operations;
        self
    }

    /// Capacity of the scan-record arena, shared by all fragments.
    pub fn max_scans(mut self, max_scans: usize) -> Self {
        self.max_scans = max_scans;
        self
    }

    /// Page budget of the default heap allocator. Ignored when a custom
    /// allocator is set.
    pub fn page_budget(mut self, page_budget: usize) -> Self {
        self.page_budget = page_budget;
        self
    }

    /// Replaces the default heap-backed page allocator.
    pub fn page_allocator(mut self, allocator: Box<dyn PageAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Receives the two-step deallocation notifications for doomed rows.
    pub fn row_deallocation(mut self, dealloc: Box<dyn RowDeallocation>) -> Self {
        self.dealloc = dealloc;
        self
    }

    pub fn build(self) -> Engine {
        let alloc = self
            .allocator
            .unwrap_or_else(|| Box::new(HeapAllocator::new(self.page_budget)));
        Engine::from_parts(self.max_operations, self.max_scans, alloc, self.pk, self.dealloc)
    }
}

/// Per-fragment tuning, passed to [`Engine::add_fragment`].
///
/// Load bounds are rows per bucket: past `max_load_per_bucket` the
/// fragment queues an expand, below `min_load_per_bucket` (scaled by the
/// bucket count) a shrink.
#[derive(Clone, Copy, Debug)]
#[must_use]
pub struct FragmentOptions {
    max_load: u32,
    min_load: u32,
    max_pages: usize,
    hasher: Option<fn(&[u8]) -> u32>,
    key_eq: Option<fn(&[u8], &[u8]) -> bool>,
}

impl Default for FragmentOptions {
    fn default() -> Self {
        Self {
            max_load: 5,
            min_load: 2,
            max_pages: 1024,
            hasher: None,
            key_eq: None,
        }
    }
}

impl FragmentOptions {
    pub fn max_load_per_bucket(mut self, rows: u32) -> Self {
        self.max_load = rows;
        self
    }

    pub fn min_load_per_bucket(mut self, rows: u32) -> Self {
        self.min_load = rows;
        self
    }

    /// Hard page cap for the fragment, bucket pages and overflow pages
    /// together.
    pub fn max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Hasher used to recompute a row's bucket from its primary key, both
    /// for hash-free requests and when a stored reduced hash runs out of
    /// bits during expand.
    pub fn hasher(mut self, hasher: fn(&[u8]) -> u32) -> Self {
        self.hasher = hasher.into();
        self
    }

    /// Key comparator for collation-aware keys; byte equality by default.
    pub fn key_comparator(mut self, key_eq: fn(&[u8], &[u8]) -> bool) -> Self {
        self.key_eq = key_eq.into();
        self
    }

    pub(crate) fn config(&self) -> FragConfig {
        FragConfig {
            max_load: self.max_load,
            min_load: self.min_load,
            max_pages: self.max_pages,
            hasher: self.hasher,
            key_eq: self.key_eq,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Refusal> {
        if self.max_load == 0 || self.min_load >= self.max_load || self.max_pages == 0 {
            return Err(Refusal::InvalidRequest);
        }
        Ok(())
    }
}
