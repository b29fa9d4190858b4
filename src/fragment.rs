//! Per-partition fragment state: the linear-hash level, the slack counter
//! driving resizes, and the single-bucket expand/shrink steps.
//!
//! A fragment owns its pages, its bucket directory and up to
//! [`MAX_SCANS_PER_FRAGMENT`](crate::common::MAX_SCANS_PER_FRAGMENT)
//! concurrent scan slots. Expand and shrink move exactly one bucket per
//! call and defer (without error) when a scan is positioned on an involved
//! bucket; the maintenance job re-runs them later.

use smallvec::SmallVec;

use crate::common::arena::{Arena, Handle};
use crate::common::error::Refusal;
use crate::common::{fatal, FragmentId, ScanMask, MAX_SCANS_PER_FRAGMENT};
use crate::directory::Directory;
use crate::engine::Ctx;
use crate::jobs::Job;
use crate::lock::OpRecord;
use crate::page::{ElemHeader, Page, PageRef, BUCKETS_PER_PAGE, CONTAINER_CAP};
use crate::scan::{Lap, ScanRec};

/// Number of hash bits a fresh element parks in its reduced-hash field.
pub(crate) const REDUCED_BITS: u32 = 15;

// ---------------------------------------------------------------------------
// Reduced hash values
//
// An element caches the hash bits that were *not* consumed by bucket
// addressing, newest-needed bit first, behind a sentinel bit that encodes
// how many cached bits are still valid:
//
//     stored = (1 << n) | b_{n-1} .. b_0
//
// where b_{n-1} is the next bit a split would consume. Expanding strips the
// top bit; shrinking pushes the merged-away bit back on top (shifting the
// word right once the cache is full, which drops the farthest-future bit).
// When the cache runs empty the full hash is recomputed from the primary
// key via the fragment's hasher.
// ---------------------------------------------------------------------------

/// Builds a fresh reduced-hash value for a hash stored in a bucket
/// addressed with `k` bits.
pub(crate) fn reduced_fresh(hash: u32, k: u32) -> u16 {
    let mut v: u16 = 0;
    for j in 0..REDUCED_BITS {
        let bit = if k + j < 32 { (hash >> (k + j)) & 1 } else { 0 };
        v = (v << 1) | bit as u16;
    }
    (1u16 << REDUCED_BITS) | v
}

fn reduced_valid_bits(stored: u16) -> u32 {
    if stored == 0 {
        fatal!("reduced hash value without sentinel bit");
    }
    15 - stored.leading_zeros()
}

/// Strips the next split bit. `None` when the cache is exhausted and the
/// caller must recompute the full hash.
pub(crate) fn reduced_split(stored: u16) -> Option<(u32, u16)> {
    let n = reduced_valid_bits(stored);
    if n == 0 {
        return None;
    }
    let bit = u32::from(stored >> (n - 1)) & 1;
    let rest = (1u16 << (n - 1)) | (stored & ((1u16 << (n - 1)) - 1));
    Some((bit, rest))
}

/// Pushes the bit a merge made insignificant back on top of the cache.
pub(crate) fn reduced_merge(stored: u16, bit: u32) -> u16 {
    let n = reduced_valid_bits(stored);
    if n < REDUCED_BITS {
        (1u16 << (n + 1)) | ((bit as u16) << n) | (stored & ((1u16 << n) - 1))
    } else {
        (1u16 << REDUCED_BITS) | ((bit as u16) << (REDUCED_BITS - 1)) | ((stored & 0x7fff) >> 1)
    }
}

/// Compares a stored reduced value against a probe hash for a bucket
/// addressed with `k` bits, honoring only the stored value's valid bits.
pub(crate) fn reduced_matches(stored: u16, hash: u32, k: u32) -> bool {
    let n = reduced_valid_bits(stored);
    let mut probe: u16 = 0;
    for j in 0..n {
        let bit = if k + j < 32 { (hash >> (k + j)) & 1 } else { 0 };
        probe = (probe << 1) | bit as u16;
    }
    stored & ((1u16 << n) - 1) == probe
}

/// Outcome of one resize step.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ResizeStep {
    /// One bucket was split or merged; more work may remain.
    Done,
    /// A scan occupies an involved bucket; retry later.
    Deferred,
    /// Nothing to do (or growth is stalled on resources).
    Idle,
}

/// Fragment-side mirror of an active scan, consulted by resize and
/// swap-removal code without touching the scan arena.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FragScan {
    pub(crate) scan: Handle<ScanRec>,
    pub(crate) cur_bucket: u32,
}

/// Per-fragment configuration, built by
/// [`FragmentOptions`](crate::engine::FragmentOptions).
#[derive(Clone, Copy)]
pub(crate) struct FragConfig {
    pub(crate) max_load: u32,
    pub(crate) min_load: u32,
    pub(crate) max_pages: usize,
    pub(crate) hasher: Option<fn(&[u8]) -> u32>,
    pub(crate) key_eq: Option<fn(&[u8], &[u8]) -> bool>,
}

pub(crate) struct Fragment {
    pub(crate) id: FragmentId,
    /// Highest bucket index; bucket count is `top + 1`.
    pub(crate) top: u32,
    pub(crate) elem_count: u64,
    /// Remaining insert capacity before an expand is due. Negative slack
    /// triggers expand; slack above `slack_limit` triggers shrink.
    pub(crate) slack: i64,
    pub(crate) config: FragConfig,
    pub(crate) pages: Arena<Page>,
    pub(crate) directory: Directory,
    pub(crate) overflow_pages: Vec<PageRef>,
    pub(crate) lock_count: u32,
    pub(crate) scan_slots: [Option<FragScan>; MAX_SCANS_PER_FRAGMENT],
    /// A resize job for this fragment is already queued.
    pub(crate) resize_queued: bool,
    /// Expand hit a resource limit; retried after the next delete.
    pub(crate) expand_stalled: bool,
}

impl Fragment {
    pub(crate) fn new(id: FragmentId, config: FragConfig, ctx: &mut Ctx<'_>) -> Result<Self, Refusal> {
        let mut fragment = Self {
            id,
            top: 0,
            elem_count: 0,
            slack: 0,
            config,
            pages: Arena::with_max_records(config.max_pages),
            directory: Directory::new(config.max_pages),
            overflow_pages: Vec::new(),
            lock_count: 0,
            scan_slots: [None; MAX_SCANS_PER_FRAGMENT],
            resize_queued: false,
            expand_stalled: false,
        };
        let page = fragment.grab_normal_page(0, ctx)?;
        fragment.directory.set(0, page)?;
        fragment.slack = fragment.capacity() - fragment.elem_count as i64;
        Ok(fragment)
    }

    /// Releases every page back to the allocator. Callers must have checked
    /// that no locks or scans are outstanding.
    pub(crate) fn release_all_pages(&mut self, ctx: &mut Ctx<'_>) {
        let mut refs: SmallVec<[PageRef; 16]> = SmallVec::new();
        for page_no in 0..=self.top / BUCKETS_PER_PAGE as u32 {
            if let Some(page) = self.directory.peek(page_no) {
                refs.push(page);
            }
        }
        refs.extend(self.overflow_pages.drain(..));
        for page_ref in refs {
            let page = self.pages.remove(page_ref);
            ctx.alloc.free_page(page.into_mem());
        }
    }

    // -- linear-hash level ---------------------------------------------------

    /// `(L, s)`: `2^L <= bucket count < 2^(L+1)` and `s` is the split
    /// pointer (buckets below `s` are already addressed with `L + 1` bits).
    fn level(&self) -> (u32, u32) {
        let n = self.top + 1;
        let l = 31 - n.leading_zeros();
        (l, n - (1 << l))
    }

    /// Classic linear-hash addressing: mask with `L` bits, fold up to
    /// `L + 1` bits for buckets below the split pointer.
    pub(crate) fn bucket_of(&self, hash: u32) -> u32 {
        let (l, s) = self.level();
        let masked = hash & ((1 << l) - 1);
        if masked < s {
            hash & ((1 << (l + 1)) - 1)
        } else {
            masked
        }
    }

    /// Number of hash bits addressing the given bucket.
    pub(crate) fn addr_bits(&self, bucket: u32) -> u32 {
        let (l, s) = self.level();
        if bucket < s || bucket >= (1 << l) {
            l + 1
        } else {
            l
        }
    }

    // -- slack ---------------------------------------------------------------

    fn capacity(&self) -> i64 {
        i64::from(self.top + 1) * i64::from(self.config.max_load)
    }

    fn slack_limit(&self) -> i64 {
        i64::from(self.top + 1) * i64::from(self.config.max_load - self.config.min_load)
    }

    pub(crate) fn recompute_slack(&mut self) {
        self.slack = self.capacity() - self.elem_count as i64;
    }

    pub(crate) fn needs_expand(&self) -> bool {
        self.slack < 0 && !self.expand_stalled
    }

    pub(crate) fn needs_shrink(&self) -> bool {
        self.top > 0 && self.slack > self.slack_limit()
    }

    pub(crate) fn needs_resize(&self) -> bool {
        self.needs_expand() || self.needs_shrink()
    }

    /// Queues a resize job when the load factor left its band and none is
    /// queued yet.
    pub(crate) fn resize_check(&mut self, ctx: &mut Ctx<'_>) {
        if self.needs_resize() && !self.resize_queued {
            self.resize_queued = true;
            let _ = ctx.jobs.send(Job::Resize { fragment: self.id });
        }
    }

    // -- scan interference ---------------------------------------------------

    /// True when an active scan is currently positioned on the bucket.
    pub(crate) fn scan_touches(&self, bucket: u32) -> bool {
        self.scan_slots
            .iter()
            .flatten()
            .any(|fs| fs.cur_bucket == bucket)
    }

    fn check_scan_expand(&self, split_bucket: u32) -> bool {
        !self.scan_touches(split_bucket)
    }

    fn check_scan_shrink(&self, src: u32, dst: u32, scans: &Arena<ScanRec>) -> bool {
        if self.scan_touches(src) || self.scan_touches(dst) {
            return false;
        }
        // A second-lap scan that already passed the merge destination has no
        // third lap to pick the moved elements up in; hold the shrink until
        // it moves on.
        for fs in self.scan_slots.iter().flatten() {
            let scan = &scans[fs.scan];
            if scan.lap == Lap::Second && scan.cur_bucket > dst {
                return false;
            }
        }
        true
    }

    // -- expand --------------------------------------------------------------

    /// Splits the split-pointer bucket into a new top bucket. One bucket
    /// per call; the caller re-queues while `needs_expand()` holds.
    pub(crate) fn expand_step(&mut self, ctx: &mut Ctx<'_>) -> ResizeStep {
        if !self.needs_expand() {
            return ResizeStep::Idle;
        }
        let (l, s) = self.level();
        let split_bucket = s;
        let new_bucket = self.top + 1;
        if !self.check_scan_expand(split_bucket) {
            #[cfg(feature = "logging")]
            log::debug!(
                "fragment {:?}: expand of bucket {split_bucket} deferred by scan",
                self.id
            );
            return ResizeStep::Deferred;
        }
        if let Err(refusal) = self.ensure_bucket_page(new_bucket, ctx) {
            #[cfg(feature = "logging")]
            log::warn!(
                "fragment {:?}: expand stalled: {refusal}",
                self.id
            );
            self.expand_stalled = true;
            return ResizeStep::Idle;
        }

        // The split bucket is addressed with `l` bits; the examined bit
        // decides between it and the new bucket, both addressed with
        // `l + 1` bits afterwards.
        let k = l;

        // Pre-flight: every element must be able to produce its split bit,
        // either from its cached reduced hash, from the owning operation's
        // full hash, or by rehashing the primary key.
        if self.config.hasher.is_none() {
            let mut i = 0;
            while let Some((_, header, _)) = self.elem_at(split_bucket, i) {
                let available = match header {
                    ElemHeader::Unlocked { reduced, .. } => reduced_split(reduced).is_some(),
                    ElemHeader::Locked { op_raw } => {
                        let op: Handle<OpRecord> = Handle::from_raw(op_raw);
                        reduced_split(ctx.ops[op].parked_reduced).is_some()
                            || ctx.ops[op].has_key()
                    }
                };
                if !available {
                    #[cfg(feature = "logging")]
                    log::warn!(
                        "fragment {:?}: expand stalled: reduced hash exhausted and no hasher",
                        self.id
                    );
                    self.expand_stalled = true;
                    return ResizeStep::Idle;
                }
                i += 1;
            }
        }

        struct Mover {
            header: ElemHeader,
            local_key: u32,
            bits: ScanMask,
        }
        let mut movers: SmallVec<[Mover; CONTAINER_CAP as usize]> = SmallVec::new();

        let mut i = 0;
        loop {
            let Some((ptr, header, local_key)) = self.elem_at(split_bucket, i) else {
                break;
            };
            let effective_bits = self.effective_scan_bits(ptr, header, ctx.ops);
            let (bit, new_header) = match header {
                ElemHeader::Unlocked { reduced, scan_bits } => match reduced_split(reduced) {
                    Some((bit, rest)) => (
                        bit,
                        ElemHeader::Unlocked {
                            reduced: rest,
                            scan_bits,
                        },
                    ),
                    None => {
                        let hash = self.rehash(local_key, ctx);
                        let bit = (hash >> k) & 1;
                        (
                            bit,
                            ElemHeader::Unlocked {
                                reduced: reduced_fresh(hash, k + 1),
                                scan_bits,
                            },
                        )
                    }
                },
                ElemHeader::Locked { op_raw } => {
                    let op: Handle<OpRecord> = Handle::from_raw(op_raw);
                    let parked = ctx.ops[op].parked_reduced;
                    match reduced_split(parked) {
                        Some((bit, rest)) => {
                            ctx.ops[op].parked_reduced = rest;
                            (bit, header)
                        }
                        None => {
                            let hash = if ctx.ops[op].has_key() {
                                ctx.ops[op].hash
                            } else {
                                self.rehash(local_key, ctx)
                            };
                            ctx.ops[op].parked_reduced = reduced_fresh(hash, k + 1);
                            ((hash >> k) & 1, header)
                        }
                    }
                }
            };
            if bit == 1 {
                movers.push(Mover {
                    header: new_header,
                    local_key,
                    bits: effective_bits,
                });
                self.remove_elem(split_bucket, ptr, ctx);
                // The swapped-in element is re-examined at the same index.
            } else {
                self.pages[ptr.container.page].write_elem_header(
                    ptr.container.buf,
                    ptr.container.end,
                    ptr.idx,
                    new_header,
                );
                i += 1;
            }
        }

        self.top = new_bucket;
        for mover in movers {
            // The receiving bucket was freshly set up; the only failure mode
            // is overflow-page exhaustion, which must not lose elements.
            let ptr = match self.place_elem(new_bucket, mover.header, mover.local_key, mover.bits, ctx)
            {
                Ok(ptr) => ptr,
                Err(refusal) => fatal!(
                    "fragment {:?}: lost element during expand: {refusal}",
                    self.id
                ),
            };
            if let ElemHeader::Locked { op_raw } = mover.header {
                let op: Handle<OpRecord> = Handle::from_raw(op_raw);
                ctx.ops[op].elem = Some(ptr);
                ctx.ops[op].bucket = new_bucket;
            }
        }
        self.recompute_slack();
        #[cfg(feature = "logging")]
        log::debug!(
            "fragment {:?}: expanded bucket {split_bucket} into {new_bucket}, top now {}",
            self.id,
            self.top
        );
        ResizeStep::Done
    }

    /// Makes sure the page hosting `bucket`'s head container exists.
    fn ensure_bucket_page(&mut self, bucket: u32, ctx: &mut Ctx<'_>) -> Result<(), Refusal> {
        let page_no = bucket / BUCKETS_PER_PAGE as u32;
        if self.directory.peek(page_no).is_some() {
            return Ok(());
        }
        let page = self.grab_normal_page(page_no, ctx)?;
        if let Err(refusal) = self.directory.set(page_no, page) {
            let page = self.pages.remove(page);
            ctx.alloc.free_page(page.into_mem());
            return Err(refusal);
        }
        Ok(())
    }

    fn grab_normal_page(&mut self, page_no: u32, ctx: &mut Ctx<'_>) -> Result<PageRef, Refusal> {
        if self.pages.len() >= self.config.max_pages {
            return Err(Refusal::OutOfIndexMemory);
        }
        let mem = ctx.alloc.allocate_page().ok_or(Refusal::OutOfIndexMemory)?;
        match self.pages.insert(Page::init_normal(mem, page_no)) {
            Some(page) => Ok(page),
            None => fatal!("page arena full below its record budget"),
        }
    }

    fn rehash(&self, local_key: u32, ctx: &mut Ctx<'_>) -> u32 {
        let Some(hasher) = self.config.hasher else {
            fatal!("reduced hash exhausted without a configured hasher");
        };
        let Some(pk) = ctx.pk.read_pk(crate::common::LocalKey(local_key)) else {
            fatal!("primary key unreadable for resident element {local_key:#x}");
        };
        hasher(&pk)
    }

    // -- shrink --------------------------------------------------------------

    /// Merges the top bucket back into its split source. One bucket per
    /// call; the caller re-queues while `needs_shrink()` holds.
    pub(crate) fn shrink_step(&mut self, ctx: &mut Ctx<'_>) -> ResizeStep {
        if !self.needs_shrink() {
            return ResizeStep::Idle;
        }
        let src = self.top;
        let src_top_bit = 31 - src.leading_zeros();
        let dst = src - (1 << src_top_bit);
        if !self.check_scan_shrink(src, dst, ctx.scans) {
            #[cfg(feature = "logging")]
            log::debug!(
                "fragment {:?}: shrink of bucket {src} into {dst} deferred by scan",
                self.id
            );
            return ResizeStep::Deferred;
        }

        // Scans that already passed the destination must revisit it on
        // their second lap to pick up the merged-in elements.
        for slot in 0..MAX_SCANS_PER_FRAGMENT {
            let Some(fs) = self.scan_slots[slot] else { continue };
            let scan = &mut ctx.scans[fs.scan];
            let passed = match scan.lap {
                Lap::First => fs.cur_bucket > dst,
                Lap::Second => false, // checked above: lap-2 cursor is at or below dst
                Lap::Completed => false,
            };
            if passed {
                scan.note_rescan(dst);
            }
        }

        // Re-aim the destination bucket's resident elements first: one
        // fewer hash bit is significant, so bit `k` (known 0 for them) goes
        // back into the reduced value.
        let mut i = 0;
        while let Some((ptr, header, _)) = self.elem_at(dst, i) {
            match header {
                ElemHeader::Unlocked { reduced, scan_bits } => {
                    self.pages[ptr.container.page].write_elem_header(
                        ptr.container.buf,
                        ptr.container.end,
                        ptr.idx,
                        ElemHeader::Unlocked {
                            reduced: reduced_merge(reduced, 0),
                            scan_bits,
                        },
                    );
                }
                ElemHeader::Locked { op_raw } => {
                    let op: Handle<OpRecord> = Handle::from_raw(op_raw);
                    let reduced = ctx.ops[op].parked_reduced;
                    ctx.ops[op].parked_reduced = reduced_merge(reduced, 0);
                }
            }
            i += 1;
        }

        // Drain the source bucket into the destination.
        while let Some((ptr, header, local_key)) = self.elem_at(src, 0) {
            let bits = self.effective_scan_bits(ptr, header, ctx.ops);
            let moved = match header {
                ElemHeader::Unlocked { reduced, scan_bits } => ElemHeader::Unlocked {
                    reduced: reduced_merge(reduced, 1),
                    scan_bits,
                },
                ElemHeader::Locked { op_raw } => {
                    let op: Handle<OpRecord> = Handle::from_raw(op_raw);
                    let reduced = ctx.ops[op].parked_reduced;
                    ctx.ops[op].parked_reduced = reduced_merge(reduced, 1);
                    header
                }
            };
            self.remove_elem(src, ptr, ctx);
            let new_ptr = match self.place_elem(dst, moved, local_key, bits, ctx) {
                Ok(ptr) => ptr,
                Err(refusal) => fatal!(
                    "fragment {:?}: lost element during shrink: {refusal}",
                    self.id
                ),
            };
            if let ElemHeader::Locked { op_raw } = moved {
                let op: Handle<OpRecord> = Handle::from_raw(op_raw);
                ctx.ops[op].elem = Some(new_ptr);
                ctx.ops[op].bucket = dst;
            }
        }

        // Retire the source bucket's head page when it hosted the page's
        // only remaining bucket.
        self.top = src - 1;
        if src % BUCKETS_PER_PAGE as u32 == 0 {
            let page_no = src / BUCKETS_PER_PAGE as u32;
            let page_ref = self.directory.get(page_no);
            self.directory.trim(page_no);
            let page = self.pages.remove(page_ref);
            ctx.alloc.free_page(page.into_mem());
        }
        self.recompute_slack();
        self.expand_stalled = false;
        #[cfg(feature = "logging")]
        log::debug!(
            "fragment {:?}: merged bucket {src} into {dst}, top now {}",
            self.id,
            self.top
        );
        ResizeStep::Done
    }
}
