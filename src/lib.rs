//! An in-memory linear-hash row index with row-level locking, the kind of
//! structure a database data node keeps per table partition: it maps
//! primary keys to opaque local row keys, arbitrates row locks through
//! per-element operation queues, and supports full-fragment scans that
//! stay exactly-once while the table grows and shrinks underneath them.
//!
//! The index is organized as fragments (partitions), each a classic
//! linear-hash table over 8 KiB pages of fixed-size containers. Buckets
//! split and merge one at a time from a deferred job queue, so resizes
//! never stall a request. Locks live in the index itself: a locked
//! element's word points at the owning operation, which anchors a parallel
//! queue of compatible holders and a serial queue of waiters.
//!
//! # Example
//!
//! ```
//! use lhix::{
//!     Engine, FragmentId, FragmentOptions, KeyOutcome, KeyRequest, LocalKey, LockMode, OpKind,
//!     PrimaryKeyReader, TxnId,
//! };
//!
//! // Row storage that can hand primary keys back to the index.
//! struct Rows;
//! impl PrimaryKeyReader for Rows {
//!     fn read_pk(&self, key: LocalKey) -> Option<Vec<u8>> {
//!         Some(key.0.to_be_bytes().to_vec())
//!     }
//! }
//!
//! fn hash(key: &[u8]) -> u32 {
//!     key.iter().fold(0x811c_9dc5u32, |h, b| {
//!         (h ^ u32::from(*b)).wrapping_mul(0x0100_0193)
//!     })
//! }
//!
//! let engine = Engine::builder(Box::new(Rows)).build();
//! let frag = FragmentId(0);
//! engine
//!     .add_fragment(frag, &FragmentOptions::default().hasher(hash))
//!     .unwrap();
//!
//! let key = 7u32.to_be_bytes();
//! let op = engine.seize_lock_context(frag, 1, TxnId(1)).unwrap();
//! let outcome = engine
//!     .key_request(
//!         op,
//!         &KeyRequest {
//!             kind: OpKind::Insert,
//!             lock_mode: LockMode::Exclusive,
//!             nowait: false,
//!             hash: None,
//!             key: &key,
//!             local_key: LocalKey(7),
//!         },
//!     )
//!     .unwrap();
//! assert_eq!(outcome, KeyOutcome::Granted(LocalKey(7)));
//! engine.commit(op).unwrap();
//!
//! assert_eq!(engine.lookup(frag, None, &key), Ok(LocalKey(7)));
//! ```

mod chain;
mod common;
mod directory;
mod engine;
mod fragment;
mod jobs;
mod lock;
mod page;
mod scan;
mod traits;

pub use common::error::{KeyOutcome, Refusal};
pub use common::{FragmentId, LocalKey, TxnId, MAX_SCANS_PER_FRAGMENT};
pub use engine::{
    Completion, Engine, EngineBuilder, FragmentOptions, FragmentStats, KeyRequest, OpId, ScanId,
    ScanOutcome,
};
pub use lock::{LockMode, OpKind};
pub use page::{new_page_mem, PageMem};
pub use traits::{
    HeapAllocator, NoopDeallocation, PageAllocator, PrimaryKeyReader, RowDeallocation,
};
