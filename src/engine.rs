//! The engine: fragment registry, operation and scan arenas, and the
//! public request surface.
//!
//! Every fragment is an independent hash index behind its own
//! `RwLock`; the operation and scan arenas are shared across fragments
//! behind mutexes. Lock order is fragment first, then operations, then
//! scans, then the page allocator. Requests resolve synchronously when
//! they can; lock waits resolve later through the completion channel, and
//! load-factor maintenance runs from [`Engine::run_pending_jobs`].

pub(crate) mod builder;

use std::collections::HashMap;

use crossbeam_channel::{unbounded, Receiver, Sender};
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard, RwLock};
use smallvec::SmallVec;
use triomphe::Arc;

use crate::common::arena::{Arena, Handle};
use crate::common::error::{KeyOutcome, Refusal};
use crate::common::{FragmentId, LocalKey, ScanMask, TxnId};
use crate::fragment::{Fragment, ResizeStep};
use crate::jobs::{Job, MAX_JOB_STEPS};
use crate::lock::{LockMode, OpKind, OpRecord, OpState};
use crate::scan::{ScanFind, ScanRec};
use crate::traits::{PageAllocator, PrimaryKeyReader, RowDeallocation};

pub use builder::{EngineBuilder, FragmentOptions};

/// Handle to a seized operation record. Valid until the operation is
/// committed, aborted or refused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct OpId(pub(crate) u32);

/// Handle to an open scan.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ScanId(pub(crate) u32);

/// Asynchronous resolution of a request that answered
/// [`KeyOutcome::Pending`]. A refusal delivered here means the waiting
/// operation's record has already been freed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Completion {
    pub user_ref: u64,
    pub outcome: KeyOutcome,
}

/// A key-addressed request executed against a seized operation.
#[derive(Clone, Copy, Debug)]
pub struct KeyRequest<'a> {
    pub kind: OpKind,
    pub lock_mode: LockMode,
    /// Refuse with [`Refusal::LockWaitRefused`] instead of queueing.
    pub nowait: bool,
    /// Precomputed hash of `key`; `None` uses the fragment's hasher.
    pub hash: Option<u32>,
    pub key: &'a [u8],
    /// For inserts: the local key of the row being indexed.
    pub local_key: LocalKey,
}

/// Point-in-time size of one fragment.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FragmentStats {
    pub elements: u64,
    pub buckets: u32,
    pub pages: usize,
}

/// One `scan_next` result.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScanOutcome {
    /// A row, locked under `op` unless the scan runs read-committed.
    Row {
        op: Option<OpId>,
        local_key: LocalKey,
    },
    /// The next row is lock-blocked; resolution arrives as a
    /// [`Completion`] for the scan's user reference.
    Blocked { op: OpId },
    /// Both laps are done; only close remains.
    Finished,
}

type FragmentCell = Arc<CachePadded<RwLock<Fragment>>>;

/// Shared mutable state threaded through fragment-level code.
pub(crate) struct Ctx<'a> {
    pub(crate) ops: &'a mut Arena<OpRecord>,
    pub(crate) scans: &'a mut Arena<ScanRec>,
    pub(crate) alloc: &'a mut dyn PageAllocator,
    pub(crate) pk: &'a dyn PrimaryKeyReader,
    pub(crate) dealloc: &'a dyn RowDeallocation,
    pub(crate) completions: &'a Sender<Completion>,
    pub(crate) jobs: &'a Sender<Job>,
}

/// Builds a [`Ctx`] from the engine's guards. A macro because the
/// borrows must come from locals living in the caller's frame.
macro_rules! ctx {
    ($self:ident, $ops:ident, $scans:ident, $alloc:ident) => {
        Ctx {
            ops: &mut $ops,
            scans: &mut $scans,
            alloc: $alloc.as_mut(),
            pk: $self.pk.as_ref(),
            dealloc: $self.dealloc.as_ref(),
            completions: &$self.completion_tx,
            jobs: &$self.job_tx,
        }
    };
}

pub struct Engine {
    fragments: RwLock<HashMap<FragmentId, FragmentCell>>,
    ops: Mutex<Arena<OpRecord>>,
    scans: Mutex<Arena<ScanRec>>,
    alloc: Mutex<Box<dyn PageAllocator>>,
    pk: Box<dyn PrimaryKeyReader>,
    dealloc: Box<dyn RowDeallocation>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    job_tx: Sender<Job>,
    job_rx: Receiver<Job>,
}

impl Engine {
    /// Entry point; see [`EngineBuilder`] for the knobs.
    pub fn builder(pk: Box<dyn PrimaryKeyReader>) -> EngineBuilder {
        EngineBuilder::new(pk)
    }

    pub(crate) fn from_parts(
        max_operations: usize,
        max_scans: usize,
        alloc: Box<dyn PageAllocator>,
        pk: Box<dyn PrimaryKeyReader>,
        dealloc: Box<dyn RowDeallocation>,
    ) -> Self {
        let (completion_tx, completion_rx) = unbounded();
        let (job_tx, job_rx) = unbounded();
        Self {
            fragments: RwLock::new(HashMap::new()),
            ops: Mutex::new(Arena::with_max_records(max_operations)),
            scans: Mutex::new(Arena::with_max_records(max_scans)),
            alloc: Mutex::new(alloc),
            pk,
            dealloc,
            completion_tx,
            completion_rx,
            job_tx,
            job_rx,
        }
    }

    fn fragment_cell(&self, id: FragmentId) -> Result<FragmentCell, Refusal> {
        self.fragments
            .read()
            .get(&id)
            .cloned()
            .ok_or(Refusal::UnknownFragment)
    }

    fn guards(
        &self,
    ) -> (
        MutexGuard<'_, Arena<OpRecord>>,
        MutexGuard<'_, Arena<ScanRec>>,
        MutexGuard<'_, Box<dyn PageAllocator>>,
    ) {
        (self.ops.lock(), self.scans.lock(), self.alloc.lock())
    }

    // -- fragment lifecycle --------------------------------------------------

    /// Creates an empty one-bucket fragment under the given id.
    pub fn add_fragment(&self, id: FragmentId, options: &FragmentOptions) -> Result<(), Refusal> {
        options.validate()?;
        let mut map = self.fragments.write();
        if map.contains_key(&id) {
            return Err(Refusal::InvalidRequest);
        }
        let (mut ops, mut scans, mut alloc) = self.guards();
        let mut ctx = ctx!(self, ops, scans, alloc);
        let fragment = Fragment::new(id, options.config(), &mut ctx)?;
        map.insert(id, Arc::new(CachePadded::new(RwLock::new(fragment))));
        Ok(())
    }

    /// Tears a fragment down, returning its pages to the allocator.
    /// Refused while any lock or scan is still live on it.
    pub fn drop_fragment(&self, id: FragmentId) -> Result<(), Refusal> {
        let mut map = self.fragments.write();
        let cell = map.get(&id).ok_or(Refusal::UnknownFragment)?;
        {
            let mut fragment = cell.write();
            if fragment.lock_count > 0 || fragment.scan_slots.iter().any(Option::is_some) {
                return Err(Refusal::FragmentBusy);
            }
            let (mut ops, mut scans, mut alloc) = self.guards();
            let mut ctx = ctx!(self, ops, scans, alloc);
            fragment.release_all_pages(&mut ctx);
        }
        map.remove(&id);
        Ok(())
    }

    pub fn fragment_stats(&self, fragment: FragmentId) -> Result<FragmentStats, Refusal> {
        let cell = self.fragment_cell(fragment)?;
        let frag = cell.read();
        Ok(FragmentStats {
            elements: frag.elem_count,
            buckets: frag.top + 1,
            pages: frag.pages.len(),
        })
    }

    // -- key-addressed operations --------------------------------------------

    /// Seizes an operation record bound to a fragment and transaction.
    pub fn seize_lock_context(
        &self,
        fragment: FragmentId,
        user_ref: u64,
        txn: TxnId,
    ) -> Result<OpId, Refusal> {
        if !self.fragments.read().contains_key(&fragment) {
            return Err(Refusal::UnknownFragment);
        }
        let mut ops = self.ops.lock();
        let h = ops
            .insert(OpRecord::seize(user_ref, txn, fragment))
            .ok_or(Refusal::NoFreeOperation)?;
        Ok(OpId(h.raw()))
    }

    /// Executes a read, insert, update or delete on a seized operation.
    ///
    /// `Granted` and `Pending` keep the operation alive until [`commit`]
    /// or [`abort`]; a refusal frees it immediately.
    ///
    /// [`commit`]: Engine::commit
    /// [`abort`]: Engine::abort
    pub fn key_request(&self, op: OpId, req: &KeyRequest<'_>) -> Result<KeyOutcome, Refusal> {
        if req.kind == OpKind::ScanRead {
            return Err(Refusal::InvalidRequest);
        }
        let h: Handle<OpRecord> = Handle::from_raw(op.0);
        let fragment = {
            let ops = self.ops.lock();
            let rec = ops.get(h).ok_or(Refusal::InvalidRequest)?;
            if rec.state != OpState::Idle {
                return Err(Refusal::InvalidRequest);
            }
            rec.fragment
        };
        let cell = self.fragment_cell(fragment)?;
        let mut frag = cell.write();
        let (mut ops, mut scans, mut alloc) = self.guards();
        let mut ctx = ctx!(self, ops, scans, alloc);

        let hash = match req.hash {
            Some(hash) => hash,
            None => match frag.config.hasher {
                Some(hasher) => hasher(req.key),
                None => {
                    ctx.ops.remove(h);
                    return Err(Refusal::InvalidRequest);
                }
            },
        };
        {
            let rec = &mut ctx.ops[h];
            rec.kind = req.kind;
            rec.lock_mode = if req.kind == OpKind::Read {
                req.lock_mode
            } else {
                LockMode::Exclusive
            };
            rec.nowait = req.nowait;
            rec.hash = hash;
            rec.key.clear();
            rec.key.extend_from_slice(req.key);
            rec.local_key = req.local_key.0;
        }
        let outcome = frag.key_request(h, &mut ctx);
        if let KeyOutcome::Refused(_) = outcome {
            ctx.ops.remove(h);
        }
        Ok(outcome)
    }

    /// Commits an executed operation and frees its record.
    pub fn commit(&self, op: OpId) -> Result<(), Refusal> {
        self.resolve(op, true)
    }

    /// Aborts an operation (executed, still waiting, or never run) and
    /// frees its record.
    pub fn abort(&self, op: OpId) -> Result<(), Refusal> {
        self.resolve(op, false)
    }

    fn resolve(&self, op: OpId, commit: bool) -> Result<(), Refusal> {
        let h: Handle<OpRecord> = Handle::from_raw(op.0);
        let fragment = {
            let mut ops = self.ops.lock();
            let rec = ops.get(h).ok_or(Refusal::InvalidRequest)?;
            if rec.state == OpState::Idle {
                // Seized but never run; there is no fragment state to
                // unwind. Abort hands the record back, commit is nonsense.
                if commit {
                    return Err(Refusal::InvalidRequest);
                }
                ops.remove(h);
                return Ok(());
            }
            rec.fragment
        };
        let cell = self.fragment_cell(fragment)?;
        let mut frag = cell.write();
        let (mut ops, mut scans, mut alloc) = self.guards();
        let mut ctx = ctx!(self, ops, scans, alloc);
        if commit {
            frag.commit_op(h, &mut ctx)?;
        } else {
            frag.abort_op(h, &mut ctx)?;
        }
        ctx.ops.remove(h);
        Ok(())
    }

    /// Re-parents an executed operation onto another transaction, for
    /// commit-ownership transfer after a coordinator failover.
    pub fn take_over(&self, op: OpId, new_txn: TxnId) -> Result<(), Refusal> {
        let h: Handle<OpRecord> = Handle::from_raw(op.0);
        let mut ops = self.ops.lock();
        let rec = ops.get_mut(h).ok_or(Refusal::InvalidRequest)?;
        if rec.state != OpState::Executed {
            return Err(Refusal::InvalidRequest);
        }
        rec.txn = new_txn;
        Ok(())
    }

    /// Lock-free-to-the-caller point lookup under the fragment read lock.
    pub fn lookup(
        &self,
        fragment: FragmentId,
        hash: Option<u32>,
        key: &[u8],
    ) -> Result<LocalKey, Refusal> {
        let cell = self.fragment_cell(fragment)?;
        let frag = cell.read();
        let hash = match hash {
            Some(hash) => hash,
            None => match frag.config.hasher {
                Some(hasher) => hasher(key),
                None => return Err(Refusal::InvalidRequest),
            },
        };
        let ops = self.ops.lock();
        frag.find_element(hash, key, &ops, self.pk.as_ref())?
            .map(|(_, _, local_key)| LocalKey(local_key))
            .ok_or(Refusal::KeyNotFound)
    }

    // -- scans ---------------------------------------------------------------

    /// Opens a scan over the fragment. `lock_mode: None` runs it
    /// read-committed.
    pub fn scan_start(
        &self,
        fragment: FragmentId,
        user_ref: u64,
        txn: TxnId,
        lock_mode: Option<LockMode>,
    ) -> Result<ScanId, Refusal> {
        let cell = self.fragment_cell(fragment)?;
        let mut frag = cell.write();
        let mut scans = self.scans.lock();
        let h = scans
            .insert(ScanRec::new(user_ref, txn, fragment, 0, lock_mode))
            .ok_or(Refusal::NoFreeScan)?;
        match frag.scan_slot_acquire(h) {
            Some(slot) => {
                let rec = &mut scans[h];
                rec.slot = slot;
                rec.mask = ScanMask::single(slot);
                Ok(ScanId(h.raw()))
            }
            None => {
                scans.remove(h);
                Err(Refusal::NoFreeScan)
            }
        }
    }

    /// Delivers the scan's next row, locking it first unless the scan is
    /// read-committed.
    pub fn scan_next(&self, scan: ScanId) -> Result<ScanOutcome, Refusal> {
        let sh: Handle<ScanRec> = Handle::from_raw(scan.0);
        let (fragment, lock_mode, user_ref, txn) = {
            let scans = self.scans.lock();
            let rec = scans.get(sh).ok_or(Refusal::InvalidRequest)?;
            (rec.fragment, rec.lock_mode, rec.user_ref, rec.txn)
        };
        let cell = self.fragment_cell(fragment)?;
        let mut frag = cell.write();
        let (mut ops, mut scans, mut alloc) = self.guards();
        let mut ctx = ctx!(self, ops, scans, alloc);

        // Rows get marked as they are found, so the operation record a
        // locking scan needs must be reserved before walking.
        let pre_op = match lock_mode {
            Some(mode) => {
                let mut rec = OpRecord::seize(user_ref, txn, fragment);
                rec.kind = OpKind::ScanRead;
                rec.lock_mode = mode;
                rec.scan = Some(sh);
                Some(ctx.ops.insert(rec).ok_or(Refusal::NoFreeOperation)?)
            }
            None => None,
        };

        match frag.scan_next_elem(sh, &mut ctx) {
            ScanFind::Completed => {
                if let Some(oh) = pre_op {
                    ctx.ops.remove(oh);
                }
                Ok(ScanOutcome::Finished)
            }
            ScanFind::Elem {
                ptr,
                header,
                local_key,
            } => match pre_op {
                None => Ok(ScanOutcome::Row {
                    op: None,
                    local_key: LocalKey(local_key),
                }),
                Some(oh) => {
                    let bucket = ctx.scans[sh].cur_bucket;
                    let outcome = frag.lock_scanned_elem(oh, ptr, header, local_key, bucket, &mut ctx);
                    let scan_rec = &mut ctx.scans[sh];
                    scan_rec.live_ops += 1;
                    scan_rec.open_ops.push(oh);
                    match outcome {
                        KeyOutcome::Granted(local_key) => Ok(ScanOutcome::Row {
                            op: Some(OpId(oh.raw())),
                            local_key,
                        }),
                        KeyOutcome::Pending => Ok(ScanOutcome::Blocked { op: OpId(oh.raw()) }),
                        KeyOutcome::Refused(refusal) => {
                            let scan_rec = &mut ctx.scans[sh];
                            scan_rec.live_ops -= 1;
                            scan_rec.open_ops.pop();
                            ctx.ops.remove(oh);
                            Err(refusal)
                        }
                    }
                }
            },
        }
    }

    /// Commits the previously delivered row, then fetches the next one.
    pub fn scan_next_commit(&self, scan: ScanId, prev: OpId) -> Result<ScanOutcome, Refusal> {
        self.commit(prev)?;
        self.scan_next(scan)
    }

    /// Closes a scan: aborts its undelivered lock holds, erases its marks
    /// from the fragment and frees the scan slot.
    pub fn scan_close(&self, scan: ScanId) -> Result<(), Refusal> {
        let sh: Handle<ScanRec> = Handle::from_raw(scan.0);
        let fragment = {
            let scans = self.scans.lock();
            scans.get(sh).ok_or(Refusal::InvalidRequest)?.fragment
        };
        let cell = self.fragment_cell(fragment)?;
        let mut frag = cell.write();
        let (mut ops, mut scans, mut alloc) = self.guards();
        let mut ctx = ctx!(self, ops, scans, alloc);

        let open: SmallVec<[Handle<OpRecord>; 4]> = ctx.scans[sh].open_ops.clone();
        for oh in open {
            frag.abort_op(oh, &mut ctx)?;
            ctx.ops.remove(oh);
        }
        let rec = ctx.scans.remove(sh);
        frag.scan_release(&rec, ctx.ops);
        Ok(())
    }

    // -- completions and maintenance -----------------------------------------

    /// Next resolved wait, if any.
    pub fn poll_completion(&self) -> Option<Completion> {
        self.completion_rx.try_recv().ok()
    }

    /// True while resize work is queued.
    pub fn pending_jobs(&self) -> bool {
        !self.job_rx.is_empty()
    }

    /// Drains queued maintenance, a bounded number of bucket moves per
    /// call. Steps deferred by scan interference re-queue themselves.
    pub fn run_pending_jobs(&self) {
        let mut requeue: SmallVec<[Job; 4]> = SmallVec::new();
        for _ in 0..MAX_JOB_STEPS {
            let job = match self.job_rx.try_recv() {
                Ok(job) => job,
                Err(_) => break,
            };
            let Job::Resize { fragment } = job;
            let Some(cell) = self.fragments.read().get(&fragment).cloned() else {
                continue;
            };
            let mut frag = cell.write();
            frag.resize_queued = false;
            let (mut ops, mut scans, mut alloc) = self.guards();
            let mut ctx = ctx!(self, ops, scans, alloc);
            let step = if frag.needs_expand() {
                frag.expand_step(&mut ctx)
            } else if frag.needs_shrink() {
                frag.shrink_step(&mut ctx)
            } else {
                ResizeStep::Idle
            };
            match step {
                ResizeStep::Done => frag.resize_check(&mut ctx),
                ResizeStep::Deferred => {
                    frag.resize_queued = true;
                    requeue.push(job);
                }
                ResizeStep::Idle => {}
            }
        }
        for job in requeue {
            let _ = self.job_tx.send(job);
        }
    }
}
