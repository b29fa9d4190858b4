//! Shared fixtures: a map-backed row store standing in for the row-storage
//! collaborator, a seeded hasher, and request shorthands.

#![allow(dead_code)]

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use ahash::RandomState;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use lhix::{
    Engine, FragmentId, FragmentOptions, KeyRequest, LocalKey, LockMode, OpId, OpKind,
    PrimaryKeyReader, RowDeallocation, TxnId,
};

pub const FRAG: FragmentId = FragmentId(1);

static HASHER: Lazy<RandomState> = Lazy::new(|| RandomState::with_seeds(11, 23, 47, 89));

pub fn hash_key(key: &[u8]) -> u32 {
    let mut h = HASHER.build_hasher();
    key.hash(&mut h);
    h.finish() as u32
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Row storage stub: local key to primary-key bytes.
#[derive(Clone, Default)]
pub struct Rows {
    inner: Arc<Mutex<HashMap<u32, Vec<u8>>>>,
}

impl Rows {
    pub fn put(&self, local_key: LocalKey, key: &[u8]) {
        self.inner.lock().insert(local_key.0, key.to_vec());
    }

    pub fn forget(&self, local_key: LocalKey) {
        self.inner.lock().remove(&local_key.0);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl PrimaryKeyReader for Rows {
    fn read_pk(&self, local_key: LocalKey) -> Option<Vec<u8>> {
        self.inner.lock().get(&local_key.0).cloned()
    }
}

/// Records both deallocation phases in arrival order.
#[derive(Clone, Default)]
pub struct Released {
    pending: Arc<Mutex<Vec<(FragmentId, LocalKey)>>>,
    triggered: Arc<Mutex<Vec<(FragmentId, LocalKey)>>>,
}

impl Released {
    /// Rows whose deallocation has fully triggered.
    pub fn take(&self) -> Vec<(FragmentId, LocalKey)> {
        std::mem::take(&mut *self.triggered.lock())
    }

    /// Rows announced as doomed so far, triggered or not.
    pub fn pending(&self) -> Vec<(FragmentId, LocalKey)> {
        self.pending.lock().clone()
    }
}

impl RowDeallocation for Released {
    fn notify_pending_delete(&self, fragment: FragmentId, local_key: LocalKey) {
        self.pending.lock().push((fragment, local_key));
    }

    fn trigger_delete(&self, fragment: FragmentId, local_key: LocalKey) {
        self.triggered.lock().push((fragment, local_key));
    }
}

pub fn engine(rows: &Rows) -> Engine {
    init_logger();
    Engine::builder(Box::new(rows.clone())).build()
}

/// An engine with one fragment under [`FRAG`], hashing with [`hash_key`].
pub fn engine_with_fragment(rows: &Rows) -> Engine {
    let engine = engine(rows);
    engine
        .add_fragment(FRAG, &FragmentOptions::default().hasher(hash_key))
        .unwrap();
    engine
}

pub fn req<'a>(kind: OpKind, key: &'a [u8]) -> KeyRequest<'a> {
    KeyRequest {
        kind,
        lock_mode: LockMode::Exclusive,
        nowait: false,
        hash: None,
        key,
        local_key: LocalKey(0),
    }
}

/// Seizes an operation and runs an exclusive insert, asserting the grant.
pub fn insert(engine: &Engine, rows: &Rows, txn: TxnId, key: &[u8], local_key: LocalKey) -> OpId {
    rows.put(local_key, key);
    let op = engine.seize_lock_context(FRAG, local_key.0 as u64, txn).unwrap();
    let outcome = engine
        .key_request(
            op,
            &KeyRequest {
                local_key,
                ..req(OpKind::Insert, key)
            },
        )
        .unwrap();
    assert!(outcome.is_granted(), "insert of {key:?} not granted: {outcome:?}");
    op
}

pub fn insert_committed(engine: &Engine, rows: &Rows, txn: TxnId, key: &[u8], local_key: LocalKey) {
    let op = insert(engine, rows, txn, key, local_key);
    engine.commit(op).unwrap();
}
