//! Caller-visible refusal codes.
//!
//! Every request entry point reports failures as explicit codes; nothing in
//! the index retries or blocks internally. Lock conflicts are *not* errors
//! (they produce a pending state resolved by a later completion event), and
//! resize deferral is invisible to callers entirely.

use crate::common::LocalKey;

/// The reason a request was refused.
#[derive(thiserror::Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Refusal {
    /// Read, update or delete addressed a key that is not in the index.
    #[error("key not found")]
    KeyNotFound,

    /// Insert addressed a key that is already in the index.
    #[error("duplicate key")]
    DuplicateKey,

    /// The lock could not be granted immediately and the request asked not
    /// to wait.
    #[error("lock wait refused (nowait)")]
    LockWaitRefused,

    /// The operation-record budget is exhausted.
    #[error("out of operation records")]
    NoFreeOperation,

    /// All scan slots of the fragment are in use, or the scan-record budget
    /// is exhausted.
    #[error("out of scan records")]
    NoFreeScan,

    /// The page allocator could not provide another index page.
    #[error("out of index memory pages")]
    OutOfIndexMemory,

    /// The bucket directory cannot address any more pages.
    #[error("directory range full")]
    DirectoryRangeFull,

    /// The row-storage collaborator no longer holds the referenced tuple.
    #[error("tuple gone")]
    TupleGone,

    /// The fragment still carries locks or active scans and cannot be
    /// dropped.
    #[error("fragment busy")]
    FragmentBusy,

    /// No fragment with the given id exists in the registry.
    #[error("unknown fragment")]
    UnknownFragment,

    /// The request is malformed for the addressed record's current state
    /// (e.g. committing an operation that never ran).
    #[error("invalid request")]
    InvalidRequest,
}

/// Outcome of a `key_request`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KeyOutcome {
    /// The lock was granted and the operation ran; for reads this carries
    /// the row's local key.
    Granted(LocalKey),
    /// The request was queued behind an incompatible lock; resolution
    /// arrives later as a [`Completion`](crate::engine::Completion) event.
    Pending,
    /// The request was refused; the operation record has been released.
    Refused(Refusal),
}

impl KeyOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, KeyOutcome::Granted(_))
    }

    pub fn local_key(&self) -> Option<LocalKey> {
        match self {
            KeyOutcome::Granted(key) => Some(*key),
            _ => None,
        }
    }
}
