//! Fragment scans: a first lap over every bucket, an optional second lap
//! over the rescan range that shrinks recorded, and exactly-once delivery
//! through scan marks.
//!
//! Each row delivered gets the scan's bit set on its element; a container's
//! bit is set only once every element in it is marked, and only on a chain
//! prefix, so container bits always describe a superset-ordered accelerator
//! over the per-element ground truth. Marks survive every expand, shrink
//! and swap-removal until the scan closes, which is what makes the
//! rewind-to-bucket-head recovery after a bucket mutation duplicate-free.

use smallvec::SmallVec;

use crate::common::arena::{Arena, Handle};
use crate::common::{FragmentId, ScanMask, TxnId};
use crate::engine::Ctx;
use crate::fragment::{FragScan, Fragment};
use crate::lock::{LockMode, OpKind, OpRecord};
use crate::page::{ElemHeader, ElemPtr};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Lap {
    First,
    Second,
    Completed,
}

pub(crate) struct ScanRec {
    pub(crate) user_ref: u64,
    pub(crate) txn: TxnId,
    pub(crate) fragment: FragmentId,
    pub(crate) slot: u8,
    pub(crate) mask: ScanMask,
    /// `None` runs the scan read-committed: no locks taken, uncommitted
    /// inserts skipped.
    pub(crate) lock_mode: Option<LockMode>,
    pub(crate) lap: Lap,
    pub(crate) cur_bucket: u32,
    /// Chain-order index of the next element to examine in `cur_bucket`.
    pub(crate) cur_index: u32,
    /// Inclusive rescan range for the second lap; empty while `lo > hi`.
    pub(crate) rescan_lo: u32,
    pub(crate) rescan_hi: u32,
    /// Delivered operations not yet committed or aborted by the caller.
    pub(crate) live_ops: u32,
    /// Handles of those operations, unwound when the scan closes early.
    pub(crate) open_ops: SmallVec<[Handle<OpRecord>; 4]>,
}

impl ScanRec {
    pub(crate) fn new(
        user_ref: u64,
        txn: TxnId,
        fragment: FragmentId,
        slot: u8,
        lock_mode: Option<LockMode>,
    ) -> Self {
        Self {
            user_ref,
            txn,
            fragment,
            slot,
            mask: ScanMask::single(slot),
            lock_mode,
            lap: Lap::First,
            cur_bucket: 0,
            cur_index: 0,
            rescan_lo: 1,
            rescan_hi: 0,
            live_ops: 0,
            open_ops: SmallVec::new(),
        }
    }

    pub(crate) fn read_committed(&self) -> bool {
        self.lock_mode.is_none()
    }

    /// A shrink merged bucket `bucket` behind this scan's cursor; revisit
    /// it on the second lap.
    pub(crate) fn note_rescan(&mut self, bucket: u32) {
        if self.rescan_lo > self.rescan_hi {
            self.rescan_lo = bucket;
            self.rescan_hi = bucket;
        } else {
            self.rescan_lo = self.rescan_lo.min(bucket);
            self.rescan_hi = self.rescan_hi.max(bucket);
        }
    }

    /// The current bucket's chain was reshuffled under the cursor; start
    /// the bucket over. Marks keep already-delivered rows out.
    pub(crate) fn rewind_bucket(&mut self) {
        self.cur_index = 0;
    }
}

/// What a walk step produced.
pub(crate) enum ScanFind {
    /// An undelivered element, already marked for this scan.
    Elem {
        ptr: ElemPtr,
        header: ElemHeader,
        local_key: u32,
    },
    Completed,
}

impl Fragment {
    /// Claims a scan-bit slot, or `None` when all four are in use.
    pub(crate) fn scan_slot_acquire(&mut self, scan: Handle<ScanRec>) -> Option<u8> {
        let slot = self.scan_slots.iter().position(|s| s.is_none())?;
        self.scan_slots[slot] = Some(FragScan {
            scan,
            cur_bucket: 0,
        });
        Some(slot as u8)
    }

    /// Advances the scan to its next undelivered element and marks it.
    pub(crate) fn scan_next_elem(&mut self, h: Handle<ScanRec>, ctx: &mut Ctx<'_>) -> ScanFind {
        let scans = &mut *ctx.scans;
        let ops = &mut *ctx.ops;
        let s = &mut scans[h];
        loop {
            match s.lap {
                Lap::Completed => return ScanFind::Completed,
                Lap::First => {
                    if s.cur_bucket > self.top {
                        if s.rescan_lo <= s.rescan_hi {
                            s.lap = Lap::Second;
                            s.cur_bucket = s.rescan_lo;
                            s.cur_index = 0;
                            self.sync_frag_scan(s.slot, s.cur_bucket);
                            continue;
                        }
                        s.lap = Lap::Completed;
                        self.sync_frag_scan(s.slot, u32::MAX);
                        return ScanFind::Completed;
                    }
                }
                Lap::Second => {
                    if s.cur_bucket > s.rescan_hi || s.cur_bucket > self.top {
                        s.lap = Lap::Completed;
                        self.sync_frag_scan(s.slot, u32::MAX);
                        return ScanFind::Completed;
                    }
                }
            }

            while let Some((ptr, header, local_key)) = self.elem_at(s.cur_bucket, s.cur_index) {
                s.cur_index += 1;
                let bits = self.effective_scan_bits(ptr, header, ops);
                if bits.is_superset_of(s.mask) {
                    continue;
                }
                if s.read_committed() {
                    if let ElemHeader::Locked { op_raw } = header {
                        let owner: Handle<OpRecord> = Handle::from_raw(op_raw);
                        // The row does not exist yet outside its own
                        // transaction; leave it unmarked so a committed
                        // version can still be picked up on a rewind.
                        if ops[owner].kind == OpKind::Insert {
                            continue;
                        }
                    }
                }
                let header = self.mark_elem(ptr, header, s.mask, ops);
                return ScanFind::Elem {
                    ptr,
                    header,
                    local_key,
                };
            }

            self.seal_bucket_prefix(s.cur_bucket, s.mask, ops);
            s.cur_bucket += 1;
            s.cur_index = 0;
            let frag_bucket = if s.lap == Lap::First || s.cur_bucket <= s.rescan_hi {
                s.cur_bucket
            } else {
                u32::MAX
            };
            self.sync_frag_scan(s.slot, frag_bucket);
        }
    }

    fn sync_frag_scan(&mut self, slot: u8, bucket: u32) {
        if let Some(fs) = self.scan_slots[usize::from(slot)].as_mut() {
            fs.cur_bucket = bucket;
        }
    }

    /// Sets the scan's bit on one element and returns the updated header.
    fn mark_elem(
        &mut self,
        ptr: ElemPtr,
        header: ElemHeader,
        mask: ScanMask,
        ops: &mut Arena<OpRecord>,
    ) -> ElemHeader {
        match header {
            ElemHeader::Unlocked { reduced, scan_bits } => {
                let updated = ElemHeader::Unlocked {
                    reduced,
                    scan_bits: scan_bits.union(mask),
                };
                self.pages[ptr.container.page].write_elem_header(
                    ptr.container.buf,
                    ptr.container.end,
                    ptr.idx,
                    updated,
                );
                updated
            }
            ElemHeader::Locked { op_raw } => {
                let owner: Handle<OpRecord> = Handle::from_raw(op_raw);
                ops[owner].parked_bits = ops[owner].parked_bits.union(mask);
                header
            }
        }
    }

    /// After a bucket is fully consumed, promote the per-element marks into
    /// container bits on the longest chain prefix where every element is
    /// marked. Later containers keep relying on element bits, preserving
    /// the rule that a container's bits never exceed its predecessor's.
    fn seal_bucket_prefix(&mut self, bucket: u32, mask: ScanMask, ops: &Arena<OpRecord>) {
        let mut cur = self.head_of(bucket);
        loop {
            let mut header = self.container_header_at(cur);
            let mut all_marked = true;
            for idx in 0..header.len {
                let (elem, _) = self.pages[cur.page].read_elem(cur.buf, cur.end, idx);
                let bits = match elem {
                    ElemHeader::Unlocked { scan_bits, .. } => scan_bits,
                    ElemHeader::Locked { op_raw } => {
                        let owner: Handle<OpRecord> = Handle::from_raw(op_raw);
                        ops[owner].parked_bits
                    }
                };
                if !bits.is_superset_of(mask) {
                    all_marked = false;
                    break;
                }
            }
            if !all_marked {
                return;
            }
            header.scan_bits = header.scan_bits.union(mask);
            self.pages[cur.page].write_container(cur.buf, cur.end, &header);
            match self.next_container(cur, &header) {
                Some(next) => cur = next,
                None => return,
            }
        }
    }

    /// Clears every trace of the scan from the fragment: the bit on every
    /// container and element it may have touched, and the scan slot.
    pub(crate) fn scan_release(&mut self, s: &ScanRec, ops: &mut Arena<OpRecord>) {
        for bucket in 0..=self.top {
            let mut cur = self.head_of(bucket);
            loop {
                let mut header = self.container_header_at(cur);
                if !header.scan_bits.intersect(s.mask).is_empty() {
                    header.scan_bits = header.scan_bits.without(s.mask);
                    self.pages[cur.page].write_container(cur.buf, cur.end, &header);
                }
                for idx in 0..header.len {
                    let (elem, _) = self.pages[cur.page].read_elem(cur.buf, cur.end, idx);
                    match elem {
                        ElemHeader::Unlocked { reduced, scan_bits } => {
                            if !scan_bits.intersect(s.mask).is_empty() {
                                self.pages[cur.page].write_elem_header(
                                    cur.buf,
                                    cur.end,
                                    idx,
                                    ElemHeader::Unlocked {
                                        reduced,
                                        scan_bits: scan_bits.without(s.mask),
                                    },
                                );
                            }
                        }
                        ElemHeader::Locked { op_raw } => {
                            let owner: Handle<OpRecord> = Handle::from_raw(op_raw);
                            ops[owner].parked_bits = ops[owner].parked_bits.without(s.mask);
                        }
                    }
                }
                match self.next_container(cur, &header) {
                    Some(next) => cur = next,
                    None => break,
                }
            }
        }
        self.scan_slots[usize::from(s.slot)] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescan_range_grows_both_ways() {
        let mut s = ScanRec::new(1, TxnId(1), FragmentId(0), 0, None);
        assert!(s.rescan_lo > s.rescan_hi);
        s.note_rescan(5);
        assert_eq!((s.rescan_lo, s.rescan_hi), (5, 5));
        s.note_rescan(2);
        assert_eq!((s.rescan_lo, s.rescan_hi), (2, 5));
        s.note_rescan(9);
        assert_eq!((s.rescan_lo, s.rescan_hi), (2, 9));
    }

    #[test]
    fn rewind_resets_only_the_index() {
        let mut s = ScanRec::new(1, TxnId(1), FragmentId(0), 2, Some(LockMode::Shared));
        s.cur_bucket = 7;
        s.cur_index = 3;
        s.rewind_bucket();
        assert_eq!(s.cur_bucket, 7);
        assert_eq!(s.cur_index, 0);
    }
}
