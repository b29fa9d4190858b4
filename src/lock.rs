//! Row-level lock queues anchored in the hash index.
//!
//! A locked element's word points at its lock owner instead of carrying the
//! reduced hash, which the owner keeps parked until release. The owner
//! anchors two intrusive lists through the operation arena: the parallel
//! queue of compatible co-holders (its own transaction's operations, plus
//! cross-transaction sharers while nobody waits) and the serial queue of
//! everything else. Waiters resolve asynchronously through the completion
//! channel when the lock is handed over, upgraded past, or the element
//! disappears under them.

use smallvec::SmallVec;

use crate::common::arena::{Arena, Handle};
use crate::common::error::{KeyOutcome, Refusal};
use crate::common::{fatal, FragmentId, LocalKey, ScanMask, TxnId};
use crate::engine::{Completion, Ctx};
use crate::fragment::{reduced_fresh, Fragment};
use crate::page::{ElemHeader, ElemPtr};
use crate::scan::ScanRec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Insert,
    Update,
    Delete,
    ScanRead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpState {
    /// Seized but not yet carrying a request.
    Idle,
    /// Parked in a serial queue.
    Waiting,
    /// Lock held; awaiting commit or abort.
    Executed,
}

pub(crate) struct OpRecord {
    pub(crate) user_ref: u64,
    pub(crate) txn: TxnId,
    pub(crate) fragment: FragmentId,
    pub(crate) kind: OpKind,
    pub(crate) lock_mode: LockMode,
    pub(crate) state: OpState,
    pub(crate) nowait: bool,
    pub(crate) hash: u32,
    pub(crate) key: SmallVec<[u8; 32]>,
    pub(crate) local_key: u32,
    /// Element position; owners keep it current across moves.
    pub(crate) elem: Option<ElemPtr>,
    /// Bucket the element currently hashes to; kept current across
    /// expand and shrink moves.
    pub(crate) bucket: u32,
    /// Reduced hash displaced from the element word while it is locked.
    pub(crate) parked_reduced: u16,
    /// Scan marks displaced from the element word while it is locked.
    pub(crate) parked_bits: ScanMask,
    pub(crate) is_owner: bool,
    /// Strongest mode held across the parallel queue; owner only.
    pub(crate) queue_mode: LockMode,
    pub(crate) next_parallel: Handle<OpRecord>,
    pub(crate) prev_parallel: Handle<OpRecord>,
    pub(crate) next_serial: Handle<OpRecord>,
    pub(crate) prev_serial: Handle<OpRecord>,
    pub(crate) lock_owner: Handle<OpRecord>,
    /// The locked element was deleted or its insert aborted while this
    /// operation was queued behind it.
    pub(crate) elem_disappeared: bool,
    /// Doomed by the abort of a same-transaction insert it piggybacked on.
    pub(crate) pending_abort: bool,
    pub(crate) scan: Option<Handle<ScanRec>>,
    /// Local key of the doomed row a collapsed reinsert replaced.
    pub(crate) prev_local_key: u32,
    pub(crate) reinserted_over_delete: bool,
    /// A same-transaction reinsert collapsed onto this delete; committing
    /// it releases the doomed row but leaves the revived element in place.
    pub(crate) superseded_by_reinsert: bool,
}

impl OpRecord {
    pub(crate) fn seize(user_ref: u64, txn: TxnId, fragment: FragmentId) -> Self {
        Self {
            user_ref,
            txn,
            fragment,
            kind: OpKind::Read,
            lock_mode: LockMode::Shared,
            state: OpState::Idle,
            nowait: false,
            hash: 0,
            key: SmallVec::new(),
            local_key: 0,
            elem: None,
            bucket: 0,
            parked_reduced: 0,
            parked_bits: ScanMask::empty(),
            is_owner: false,
            queue_mode: LockMode::Shared,
            next_parallel: Handle::null(),
            prev_parallel: Handle::null(),
            next_serial: Handle::null(),
            prev_serial: Handle::null(),
            lock_owner: Handle::null(),
            elem_disappeared: false,
            pending_abort: false,
            scan: None,
            prev_local_key: 0,
            reinserted_over_delete: false,
            superseded_by_reinsert: false,
        }
    }

    pub(crate) fn has_key(&self) -> bool {
        !self.key.is_empty()
    }
}

/// Parked element state carried through an ownership hand-off.
#[derive(Clone, Copy)]
struct Parked {
    reduced: u16,
    bits: ScanMask,
    elem: ElemPtr,
    local_key: u32,
    bucket: u32,
}

impl Fragment {
    /// Executes a key-addressed request on an already-seized operation
    /// record. The record must carry kind, mode, hash, key and (for
    /// inserts) the new row's local key.
    pub(crate) fn key_request(&mut self, h: Handle<OpRecord>, ctx: &mut Ctx<'_>) -> KeyOutcome {
        let (kind, hash) = {
            let op = &ctx.ops[h];
            (op.kind, op.hash)
        };
        let key: SmallVec<[u8; 32]> = ctx.ops[h].key.clone();
        let found = match self.find_element(hash, &key, ctx.ops, ctx.pk) {
            Ok(found) => found,
            Err(refusal) => return KeyOutcome::Refused(refusal),
        };
        match (kind, found) {
            (OpKind::Insert, None) => self.insert_fresh(h, ctx),
            (OpKind::Insert, Some((_, ElemHeader::Unlocked { .. }, _))) => {
                KeyOutcome::Refused(Refusal::DuplicateKey)
            }
            (OpKind::Insert, Some((ptr, ElemHeader::Locked { op_raw }, local_key))) => {
                self.insert_on_locked(h, ptr, Handle::from_raw(op_raw), local_key, ctx)
            }
            (_, None) => KeyOutcome::Refused(Refusal::KeyNotFound),
            (_, Some((ptr, ElemHeader::Unlocked { reduced, scan_bits }, local_key))) => {
                let bucket = self.bucket_of(hash);
                self.grant_unlocked(h, ptr, reduced, scan_bits, local_key, bucket, ctx)
            }
            (_, Some((ptr, ElemHeader::Locked { op_raw }, local_key))) => {
                self.enqueue_on_locked(h, ptr, Handle::from_raw(op_raw), local_key, ctx)
            }
        }
    }

    /// Locks the element a scan just delivered. Same queue rules as a
    /// key-addressed request, but addressed by position.
    pub(crate) fn lock_scanned_elem(
        &mut self,
        h: Handle<OpRecord>,
        ptr: ElemPtr,
        header: ElemHeader,
        local_key: u32,
        bucket: u32,
        ctx: &mut Ctx<'_>,
    ) -> KeyOutcome {
        match header {
            ElemHeader::Unlocked { reduced, scan_bits } => {
                self.grant_unlocked(h, ptr, reduced, scan_bits, local_key, bucket, ctx)
            }
            ElemHeader::Locked { op_raw } => {
                self.enqueue_on_locked(h, ptr, Handle::from_raw(op_raw), local_key, ctx)
            }
        }
    }

    // -- grant paths ---------------------------------------------------------

    fn insert_fresh(&mut self, h: Handle<OpRecord>, ctx: &mut Ctx<'_>) -> KeyOutcome {
        let hash = ctx.ops[h].hash;
        let local_key = ctx.ops[h].local_key;
        let bucket = self.bucket_of(hash);
        let reduced = reduced_fresh(hash, self.addr_bits(bucket));
        let header = ElemHeader::Locked { op_raw: h.raw() };
        let ptr = match self.place_elem(bucket, header, local_key, ScanMask::empty(), ctx) {
            Ok(ptr) => ptr,
            Err(refusal) => return KeyOutcome::Refused(refusal),
        };
        let op = &mut ctx.ops[h];
        op.elem = Some(ptr);
        op.bucket = bucket;
        op.parked_reduced = reduced;
        op.parked_bits = ScanMask::empty();
        op.is_owner = true;
        op.queue_mode = LockMode::Exclusive;
        op.state = OpState::Executed;
        self.lock_count += 1;
        self.resize_check(ctx);
        KeyOutcome::Granted(LocalKey(local_key))
    }

    fn grant_unlocked(
        &mut self,
        h: Handle<OpRecord>,
        ptr: ElemPtr,
        reduced: u16,
        scan_bits: ScanMask,
        local_key: u32,
        bucket: u32,
        ctx: &mut Ctx<'_>,
    ) -> KeyOutcome {
        self.pages[ptr.container.page].write_elem_header(
            ptr.container.buf,
            ptr.container.end,
            ptr.idx,
            ElemHeader::Locked { op_raw: h.raw() },
        );
        let op = &mut ctx.ops[h];
        op.elem = Some(ptr);
        op.bucket = bucket;
        op.local_key = local_key;
        op.parked_reduced = reduced;
        op.parked_bits = scan_bits;
        op.is_owner = true;
        op.queue_mode = op.lock_mode;
        op.state = OpState::Executed;
        self.lock_count += 1;
        KeyOutcome::Granted(LocalKey(local_key))
    }

    fn insert_on_locked(
        &mut self,
        h: Handle<OpRecord>,
        ptr: ElemPtr,
        owner: Handle<OpRecord>,
        doomed_local_key: u32,
        ctx: &mut Ctx<'_>,
    ) -> KeyOutcome {
        let txn = ctx.ops[h].txn;
        let tail = parallel_tail(ctx.ops, owner);
        if ctx.ops[tail].txn == txn {
            if ctx.ops[tail].kind != OpKind::Delete {
                return KeyOutcome::Refused(Refusal::DuplicateKey);
            }
            // Delete-then-reinsert by the same transaction: the element is
            // revived in place with the new row's local key. The delete
            // keeps the doomed key so an abort can restore it.
            let new_local_key = ctx.ops[h].local_key;
            self.pages[ptr.container.page].write_elem_key(
                ptr.container.buf,
                ptr.container.end,
                ptr.idx,
                new_local_key,
            );
            self.link_parallel(h, owner, ctx.ops);
            let owner_bucket = ctx.ops[owner].bucket;
            let op = &mut ctx.ops[h];
            op.elem = Some(ptr);
            op.bucket = owner_bucket;
            op.prev_local_key = doomed_local_key;
            op.reinserted_over_delete = true;
            op.state = OpState::Executed;
            ctx.ops[tail].superseded_by_reinsert = true;
            ctx.ops[owner].queue_mode = LockMode::Exclusive;
            return KeyOutcome::Granted(LocalKey(new_local_key));
        }
        // Another transaction holds the element, typically an uncommitted
        // insert. Wait it out: if the element survives the wait becomes a
        // duplicate-key refusal, if it disappears the insert proceeds.
        if ctx.ops[h].nowait {
            return KeyOutcome::Refused(Refusal::LockWaitRefused);
        }
        // Unlike other waiters the insert keeps its own row's local key; it
        // is what revives the element if the holder deletes it.
        let own = ctx.ops[h].local_key;
        self.link_serial(h, owner, own, ctx.ops);
        KeyOutcome::Pending
    }

    fn enqueue_on_locked(
        &mut self,
        h: Handle<OpRecord>,
        _ptr: ElemPtr,
        owner: Handle<OpRecord>,
        local_key: u32,
        ctx: &mut Ctx<'_>,
    ) -> KeyOutcome {
        let (txn, mode, nowait) = {
            let op = &ctx.ops[h];
            (op.txn, op.lock_mode, op.nowait)
        };
        if self.can_join_parallel(owner, txn, mode, ctx.ops) {
            self.link_parallel(h, owner, ctx.ops);
            let owner_bucket = ctx.ops[owner].bucket;
            let op = &mut ctx.ops[h];
            op.local_key = local_key;
            op.bucket = owner_bucket;
            op.state = OpState::Executed;
            if mode == LockMode::Exclusive {
                ctx.ops[owner].queue_mode = LockMode::Exclusive;
            }
            return KeyOutcome::Granted(LocalKey(local_key));
        }
        if nowait {
            return KeyOutcome::Refused(Refusal::LockWaitRefused);
        }
        self.link_serial(h, owner, local_key, ctx.ops);
        KeyOutcome::Pending
    }

    /// A request may share the parallel queue when every member belongs to
    /// its transaction (any mode, including an upgrade), or when everything
    /// is shared on both sides and nobody already waits serially.
    fn can_join_parallel(
        &self,
        owner: Handle<OpRecord>,
        txn: TxnId,
        mode: LockMode,
        ops: &Arena<OpRecord>,
    ) -> bool {
        let mut all_same_txn = true;
        let mut cur = owner;
        while cur.is_some() {
            if ops[cur].txn != txn {
                all_same_txn = false;
                break;
            }
            cur = ops[cur].next_parallel;
        }
        if all_same_txn {
            return true;
        }
        mode == LockMode::Shared
            && ops[owner].queue_mode == LockMode::Shared
            && ops[owner].next_serial.is_null()
    }

    // -- queue links ---------------------------------------------------------

    fn link_parallel(&mut self, h: Handle<OpRecord>, owner: Handle<OpRecord>, ops: &mut Arena<OpRecord>) {
        let tail = parallel_tail(ops, owner);
        ops[tail].next_parallel = h;
        ops[h].prev_parallel = tail;
        ops[h].next_parallel = Handle::null();
        ops[h].lock_owner = owner;
    }

    fn link_serial(
        &mut self,
        h: Handle<OpRecord>,
        owner: Handle<OpRecord>,
        local_key: u32,
        ops: &mut Arena<OpRecord>,
    ) {
        let mut tail = owner;
        while ops[tail].next_serial.is_some() {
            tail = ops[tail].next_serial;
        }
        ops[tail].next_serial = h;
        ops[h].prev_serial = tail;
        ops[h].next_serial = Handle::null();
        ops[h].lock_owner = owner;
        ops[h].local_key = local_key;
        ops[h].state = OpState::Waiting;
    }

    fn unlink_parallel(&mut self, h: Handle<OpRecord>, ops: &mut Arena<OpRecord>) {
        let prev = ops[h].prev_parallel;
        let next = ops[h].next_parallel;
        if prev.is_some() {
            ops[prev].next_parallel = next;
        }
        if next.is_some() {
            ops[next].prev_parallel = prev;
        }
        ops[h].prev_parallel = Handle::null();
        ops[h].next_parallel = Handle::null();
    }

    fn unlink_serial(&mut self, h: Handle<OpRecord>, ops: &mut Arena<OpRecord>) {
        let prev = ops[h].prev_serial;
        let next = ops[h].next_serial;
        if prev.is_some() {
            ops[prev].next_serial = next;
        }
        if next.is_some() {
            ops[next].prev_serial = prev;
        }
        ops[h].prev_serial = Handle::null();
        ops[h].next_serial = Handle::null();
    }

    fn recompute_queue_mode(&mut self, owner: Handle<OpRecord>, ops: &mut Arena<OpRecord>) {
        let mut mode = LockMode::Shared;
        let mut cur = owner;
        while cur.is_some() {
            if ops[cur].lock_mode == LockMode::Exclusive
                || (ops[cur].kind != OpKind::Read && ops[cur].kind != OpKind::ScanRead)
            {
                mode = LockMode::Exclusive;
            }
            cur = ops[cur].next_parallel;
        }
        ops[owner].queue_mode = mode;
    }

    // -- resolution ----------------------------------------------------------

    /// Commits one operation: deletes become physical removals (with
    /// disappeared-element hand-off to any waiters), everything else just
    /// releases its lock participation.
    pub(crate) fn commit_op(&mut self, h: Handle<OpRecord>, ctx: &mut Ctx<'_>) -> Result<(), Refusal> {
        match ctx.ops[h].state {
            OpState::Executed => {}
            OpState::Waiting | OpState::Idle => return Err(Refusal::InvalidRequest),
        }
        // A follower whose same-transaction insert anchor aborted has no
        // row version to commit; it can only be aborted.
        if ctx.ops[h].pending_abort {
            return Err(Refusal::InvalidRequest);
        }
        let kind = ctx.ops[h].kind;
        if let Some(scan) = ctx.ops[h].scan {
            detach_from_scan(ctx.scans, scan, h);
        }
        match kind {
            OpKind::Delete => {
                let doomed = ctx.ops[h].local_key;
                let fragment = ctx.ops[h].fragment;
                ctx.dealloc.notify_pending_delete(fragment, LocalKey(doomed));
                // A collapsed reinsert keeps the element; only the doomed
                // row version goes, and nothing still references it.
                let elem_gone = !ctx.ops[h].superseded_by_reinsert;
                if !elem_gone {
                    ctx.dealloc.trigger_delete(fragment, LocalKey(doomed));
                }
                self.release_op(h, elem_gone, ctx);
                // Freed space may unblock a stalled expand.
                self.expand_stalled = false;
            }
            _ => self.release_op(h, false, ctx),
        }
        self.resize_check(ctx);
        Ok(())
    }

    /// Aborts one operation: inserts take their element (or the revived
    /// local key) back out, everything else releases as on commit.
    pub(crate) fn abort_op(&mut self, h: Handle<OpRecord>, ctx: &mut Ctx<'_>) -> Result<(), Refusal> {
        match ctx.ops[h].state {
            OpState::Executed => {}
            OpState::Waiting => {
                // Still parked in a serial queue; just leave it.
                self.unlink_serial(h, ctx.ops);
                if let Some(scan) = ctx.ops[h].scan {
                    detach_from_scan(ctx.scans, scan, h);
                }
                return Ok(());
            }
            OpState::Idle => return Err(Refusal::InvalidRequest),
        }
        if let Some(scan) = ctx.ops[h].scan {
            detach_from_scan(ctx.scans, scan, h);
        }
        let kind = ctx.ops[h].kind;
        match kind {
            OpKind::Insert if ctx.ops[h].reinserted_over_delete => {
                let fragment = ctx.ops[h].fragment;
                let own = ctx.ops[h].local_key;
                ctx.dealloc.notify_pending_delete(fragment, LocalKey(own));
                if self.unsupersede_delete(h, ctx) {
                    // Undo the collapse: the element goes back to naming
                    // the doomed row, which the still-queued delete
                    // anchors. Resize moves only keep the queue owner's
                    // position current, so address through it.
                    let anchor = if ctx.ops[h].is_owner {
                        h
                    } else {
                        ctx.ops[h].lock_owner
                    };
                    let ptr = ctx.ops[anchor].elem.unwrap_or_else(|| {
                        fatal!("collapsed reinsert without an element position")
                    });
                    let prev = ctx.ops[h].prev_local_key;
                    self.pages[ptr.container.page].write_elem_key(
                        ptr.container.buf,
                        ptr.container.end,
                        ptr.idx,
                        prev,
                    );
                    ctx.dealloc.trigger_delete(fragment, LocalKey(own));
                    self.release_op(h, false, ctx);
                } else {
                    // The delete already committed; nothing is left for
                    // the element to name.
                    self.doom_same_txn_followers(h, ctx);
                    self.release_op(h, true, ctx);
                }
            }
            OpKind::Insert => {
                let fragment = ctx.ops[h].fragment;
                let own = ctx.ops[h].local_key;
                ctx.dealloc.notify_pending_delete(fragment, LocalKey(own));
                self.doom_same_txn_followers(h, ctx);
                self.release_op(h, true, ctx);
            }
            _ => self.release_op(h, false, ctx),
        }
        self.resize_check(ctx);
        Ok(())
    }

    /// Finds the still-queued delete a collapsed reinsert superseded and
    /// re-arms it. False when the delete has already resolved.
    fn unsupersede_delete(&mut self, h: Handle<OpRecord>, ctx: &mut Ctx<'_>) -> bool {
        let txn = ctx.ops[h].txn;
        let prev = ctx.ops[h].prev_local_key;
        let mut cur = if ctx.ops[h].is_owner {
            h
        } else {
            ctx.ops[h].lock_owner
        };
        while cur.is_some() {
            if cur != h {
                let op = &mut ctx.ops[cur];
                if op.txn == txn
                    && op.kind == OpKind::Delete
                    && op.superseded_by_reinsert
                    && op.local_key == prev
                {
                    op.superseded_by_reinsert = false;
                    return true;
                }
            }
            cur = ctx.ops[cur].next_parallel;
        }
        false
    }

    /// An aborting insert owner dooms same-transaction followers that
    /// piggybacked on its element: their row version never existed outside
    /// the transaction.
    fn doom_same_txn_followers(&mut self, owner: Handle<OpRecord>, ctx: &mut Ctx<'_>) {
        let txn = ctx.ops[owner].txn;
        let mut cur = ctx.ops[owner].next_parallel;
        while cur.is_some() {
            let next = ctx.ops[cur].next_parallel;
            if ctx.ops[cur].txn == txn {
                ctx.ops[cur].pending_abort = true;
                ctx.ops[cur].elem_disappeared = true;
            }
            cur = next;
        }
    }

    /// Removes a resolved operation from its queues, handing the element
    /// (or its disappearance) to whoever is next.
    fn release_op(&mut self, h: Handle<OpRecord>, elem_gone: bool, ctx: &mut Ctx<'_>) {
        if !ctx.ops[h].is_owner {
            // Co-holder or queued entry; the owner keeps the element.
            let owner = ctx.ops[h].lock_owner;
            if ctx.ops[h].state == OpState::Waiting {
                self.unlink_serial(h, ctx.ops);
            } else {
                self.unlink_parallel(h, ctx.ops);
                self.recompute_queue_mode(owner, ctx.ops);
            }
            if elem_gone {
                // A committed delete that was not the queue owner: the
                // element survives until the whole queue drains, but it is
                // doomed and everything queued behind it must learn so.
                ctx.ops[owner].elem_disappeared = true;
                self.propagate_disappearance(owner, ctx);
            }
            return;
        }

        // A doomed marker left by a co-held delete sticks to the owner.
        let elem_gone = elem_gone || ctx.ops[h].elem_disappeared;
        let parked = Parked {
            reduced: ctx.ops[h].parked_reduced,
            bits: ctx.ops[h].parked_bits,
            elem: ctx.ops[h].elem.unwrap_or_else(|| fatal!("lock owner without an element")),
            local_key: ctx.ops[h].local_key,
            bucket: ctx.ops[h].bucket,
        };
        let next_parallel = ctx.ops[h].next_parallel;
        let serial_head = ctx.ops[h].next_serial;

        if next_parallel.is_some() {
            self.promote_parallel(h, next_parallel, serial_head, parked, elem_gone, ctx);
        } else if serial_head.is_some() {
            self.promote_serial(serial_head, parked, elem_gone, ctx);
        } else {
            self.settle_element(parked, elem_gone, ctx);
        }
    }

    /// Hands ownership to the next parallel co-holder.
    fn promote_parallel(
        &mut self,
        old: Handle<OpRecord>,
        new_owner: Handle<OpRecord>,
        serial_head: Handle<OpRecord>,
        parked: Parked,
        elem_gone: bool,
        ctx: &mut Ctx<'_>,
    ) {
        let ops = &mut *ctx.ops;
        ops[new_owner].prev_parallel = Handle::null();
        ops[new_owner].is_owner = true;
        ops[new_owner].lock_owner = Handle::null();
        ops[new_owner].parked_reduced = parked.reduced;
        ops[new_owner].parked_bits = parked.bits;
        ops[new_owner].elem = Some(parked.elem);
        ops[new_owner].bucket = parked.bucket;
        ops[new_owner].elem_disappeared = elem_gone;
        ops[new_owner].next_serial = serial_head;
        if serial_head.is_some() {
            ops[serial_head].prev_serial = new_owner;
        }
        // Both lists keep their back-references current.
        let mut cur = ops[new_owner].next_parallel;
        while cur.is_some() {
            ops[cur].lock_owner = new_owner;
            cur = ops[cur].next_parallel;
        }
        let mut cur = serial_head;
        while cur.is_some() {
            ops[cur].lock_owner = new_owner;
            cur = ops[cur].next_serial;
        }
        ops[old].next_parallel = Handle::null();
        ops[old].next_serial = Handle::null();
        ops[old].is_owner = false;
        self.recompute_queue_mode(new_owner, ctx.ops);
        self.pages[parked.elem.container.page].write_elem_header(
            parked.elem.container.buf,
            parked.elem.container.end,
            parked.elem.idx,
            ElemHeader::Locked {
                op_raw: new_owner.raw(),
            },
        );
        if elem_gone {
            self.propagate_disappearance(new_owner, ctx);
        }
    }

    /// Promotes serial waiters after the last holder left. Disappeared
    /// elements refuse non-insert waiters one by one until an insert can
    /// revive the element or the queue drains.
    fn promote_serial(
        &mut self,
        mut head: Handle<OpRecord>,
        mut parked: Parked,
        elem_gone: bool,
        ctx: &mut Ctx<'_>,
    ) {
        while head.is_some() {
            let next = ctx.ops[head].next_serial;
            if elem_gone {
                match ctx.ops[head].kind {
                    OpKind::Insert => {
                        // The duplicate it waited on is gone; the doomed
                        // row loses its last index reference and the
                        // element is revived with the insert's own row.
                        ctx.dealloc.trigger_delete(self.id, LocalKey(parked.local_key));
                        let hash = ctx.ops[head].hash;
                        let new_key = ctx.ops[head].local_key;
                        parked.reduced =
                            reduced_fresh(hash, self.addr_bits(self.bucket_of(hash)));
                        parked.local_key = new_key;
                        self.pages[parked.elem.container.page].write_elem_key(
                            parked.elem.container.buf,
                            parked.elem.container.end,
                            parked.elem.idx,
                            new_key,
                        );
                    }
                    _ => {
                        self.drop_refused(head, Refusal::KeyNotFound, ctx);
                        head = next;
                        continue;
                    }
                }
            } else if ctx.ops[head].kind == OpKind::Insert {
                // Waited out a foreign lock and the element survived.
                self.drop_refused(head, Refusal::DuplicateKey, ctx);
                head = next;
                continue;
            }

            // `head` becomes the new owner, the rest of the serial chain
            // hangs off it.
            let ops = &mut *ctx.ops;
            ops[head].prev_serial = Handle::null();
            ops[head].next_serial = next;
            if next.is_some() {
                ops[next].prev_serial = head;
            }
            ops[head].is_owner = true;
            ops[head].lock_owner = Handle::null();
            ops[head].state = OpState::Executed;
            // Any disappearance it was flagged with is resolved: the
            // element it now owns is alive (possibly just revived).
            ops[head].elem_disappeared = false;
            ops[head].next_parallel = Handle::null();
            ops[head].prev_parallel = Handle::null();
            ops[head].parked_reduced = parked.reduced;
            ops[head].parked_bits = parked.bits;
            ops[head].elem = Some(parked.elem);
            ops[head].bucket = parked.bucket;
            ops[head].local_key = parked.local_key;
            ops[head].queue_mode = ops[head].lock_mode;
            let user_ref = ops[head].user_ref;
            let granted = LocalKey(parked.local_key);
            self.pages[parked.elem.container.page].write_elem_header(
                parked.elem.container.buf,
                parked.elem.container.end,
                parked.elem.idx,
                ElemHeader::Locked {
                    op_raw: head.raw(),
                },
            );
            let _ = ctx.completions.send(Completion {
                user_ref,
                outcome: KeyOutcome::Granted(granted),
            });
            self.admit_compatible_waiters(head, ctx);
            let mut cur = ctx.ops[head].next_serial;
            while cur.is_some() {
                ctx.ops[cur].lock_owner = head;
                cur = ctx.ops[cur].next_serial;
            }
            return;
        }
        // Every waiter resolved without taking the element over.
        self.settle_element(parked, elem_gone, ctx);
    }

    /// After a serial promotion, pull every immediately-following waiter
    /// that is compatible with the new owner into the parallel queue.
    fn admit_compatible_waiters(&mut self, owner: Handle<OpRecord>, ctx: &mut Ctx<'_>) {
        loop {
            let head = ctx.ops[owner].next_serial;
            if head.is_null() {
                return;
            }
            let (txn, mode, kind) = {
                let w = &ctx.ops[head];
                (w.txn, w.lock_mode, w.kind)
            };
            if kind == OpKind::Insert {
                return;
            }
            let compatible = txn == ctx.ops[owner].txn
                || (mode == LockMode::Shared && ctx.ops[owner].queue_mode == LockMode::Shared);
            if !compatible {
                return;
            }
            self.unlink_serial_head(owner, head, ctx.ops);
            self.link_parallel(head, owner, ctx.ops);
            let (owner_key, owner_bucket) = {
                let o = &ctx.ops[owner];
                (o.local_key, o.bucket)
            };
            let op = &mut ctx.ops[head];
            op.state = OpState::Executed;
            op.local_key = owner_key;
            op.bucket = owner_bucket;
            let user_ref = op.user_ref;
            if mode == LockMode::Exclusive {
                ctx.ops[owner].queue_mode = LockMode::Exclusive;
            }
            let _ = ctx.completions.send(Completion {
                user_ref,
                outcome: KeyOutcome::Granted(LocalKey(owner_key)),
            });
        }
    }

    fn unlink_serial_head(
        &mut self,
        owner: Handle<OpRecord>,
        head: Handle<OpRecord>,
        ops: &mut Arena<OpRecord>,
    ) {
        let next = ops[head].next_serial;
        ops[owner].next_serial = next;
        if next.is_some() {
            ops[next].prev_serial = owner;
        }
        ops[head].next_serial = Handle::null();
        ops[head].prev_serial = Handle::null();
    }

    /// Refuses a queued waiter and frees its record.
    fn drop_refused(&mut self, h: Handle<OpRecord>, refusal: Refusal, ctx: &mut Ctx<'_>) {
        let op = ctx.ops.remove(h);
        if let Some(scan) = op.scan {
            detach_from_scan(ctx.scans, scan, h);
        }
        let _ = ctx.completions.send(Completion {
            user_ref: op.user_ref,
            outcome: KeyOutcome::Refused(refusal),
        });
    }

    /// The queue drained; the element becomes unlocked again or, when the
    /// last holder deleted it, leaves the index.
    fn settle_element(&mut self, parked: Parked, elem_gone: bool, ctx: &mut Ctx<'_>) {
        self.lock_count -= 1;
        // The slot must look unlocked before swap-removal can reshuffle it.
        self.pages[parked.elem.container.page].write_elem_header(
            parked.elem.container.buf,
            parked.elem.container.end,
            parked.elem.idx,
            ElemHeader::Unlocked {
                reduced: parked.reduced,
                scan_bits: parked.bits,
            },
        );
        if elem_gone {
            self.remove_elem(parked.bucket, parked.elem, ctx);
            ctx.dealloc.trigger_delete(self.id, LocalKey(parked.local_key));
        }
    }

    /// Marks everything queued behind a now-doomed element.
    fn propagate_disappearance(&mut self, owner: Handle<OpRecord>, ctx: &mut Ctx<'_>) {
        let mut cur = ctx.ops[owner].next_serial;
        while cur.is_some() {
            ctx.ops[cur].elem_disappeared = true;
            cur = ctx.ops[cur].next_serial;
        }
    }
}

fn detach_from_scan(scans: &mut Arena<ScanRec>, scan: Handle<ScanRec>, h: Handle<OpRecord>) {
    let s = &mut scans[scan];
    s.live_ops -= 1;
    s.open_ops.retain(|x| *x != h);
}

fn parallel_tail(ops: &Arena<OpRecord>, owner: Handle<OpRecord>) -> Handle<OpRecord> {
    let mut cur = owner;
    while ops[cur].next_parallel.is_some() {
        cur = ops[cur].next_parallel;
    }
    cur
}
