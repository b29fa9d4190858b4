//! Container-chain algorithms over one bucket: element placement, lookup
//! and swap-removal.
//!
//! A bucket is its head container (fixed slot on a normal page) plus a
//! chain of overflow containers. Removal always backfills the vacated slot
//! with the bucket's logically last element, so chains stay dense and the
//! trailing container shrinks toward release. Scan state obeys one rule
//! throughout: per-element scan bits are ground truth, container scan bits
//! are a superset-ordered accelerator that may be conservatively cleared.

use crate::common::arena::{Arena, Handle};
use crate::common::error::Refusal;
use crate::common::{fatal, LocalKey, ScanMask};
use crate::engine::Ctx;
use crate::fragment::{reduced_matches, Fragment};
use crate::lock::OpRecord;
use crate::page::{
    ContainerHeader, ContainerLink, ContainerPtr, ElemHeader, ElemPtr, End, Page,
    BUCKETS_PER_PAGE,
};
use crate::traits::PrimaryKeyReader;

impl Fragment {
    pub(crate) fn head_of(&self, bucket: u32) -> ContainerPtr {
        ContainerPtr {
            page: self.directory.get(bucket / BUCKETS_PER_PAGE as u32),
            buf: (bucket % BUCKETS_PER_PAGE as u32) as u8,
            end: End::Left,
        }
    }

    pub(crate) fn container_header_at(&self, c: ContainerPtr) -> ContainerHeader {
        self.pages[c.page].read_container(c.buf, c.end)
    }

    fn write_container_at(&mut self, c: ContainerPtr, header: &ContainerHeader) {
        self.pages[c.page].write_container(c.buf, c.end, header);
    }

    pub(crate) fn next_container(
        &self,
        c: ContainerPtr,
        header: &ContainerHeader,
    ) -> Option<ContainerPtr> {
        header.next.map(|link| ContainerPtr {
            page: link.page.unwrap_or(c.page),
            buf: link.buf,
            end: link.end,
        })
    }

    /// The bucket's `i`-th element in chain order, if any.
    pub(crate) fn elem_at(&self, bucket: u32, i: u32) -> Option<(ElemPtr, ElemHeader, u32)> {
        let mut cur = self.head_of(bucket);
        let mut remaining = i;
        loop {
            let header = self.container_header_at(cur);
            if remaining < u32::from(header.len) {
                let idx = remaining as u8;
                let (elem, key) = self.pages[cur.page].read_elem(cur.buf, cur.end, idx);
                return Some((
                    ElemPtr {
                        container: cur,
                        idx,
                    },
                    elem,
                    key,
                ));
            }
            remaining -= u32::from(header.len);
            cur = self.next_container(cur, &header)?;
        }
    }

    /// Ground-truth "returned by scan" bits of an element: its own bits (or
    /// the owning operation's parked bits) unioned with its container's.
    pub(crate) fn effective_scan_bits(
        &self,
        ptr: ElemPtr,
        header: ElemHeader,
        ops: &Arena<OpRecord>,
    ) -> ScanMask {
        let container_bits = self.container_header_at(ptr.container).scan_bits;
        let elem_bits = match header {
            ElemHeader::Unlocked { scan_bits, .. } => scan_bits,
            ElemHeader::Locked { op_raw } => {
                let op: Handle<OpRecord> = Handle::from_raw(op_raw);
                ops[op].parked_bits
            }
        };
        container_bits.union(elem_bits)
    }

    /// Inserts an element into the bucket's chain. The element lands in the
    /// first container that has room and whose scan bits are compatible
    /// (no container may claim an element scanned that is not); otherwise a
    /// new container is linked to the chain end, from a same-page buffer,
    /// an existing overflow page, or a freshly allocated one.
    pub(crate) fn place_elem(
        &mut self,
        bucket: u32,
        header: ElemHeader,
        local_key: u32,
        bits: ScanMask,
        ctx: &mut Ctx<'_>,
    ) -> Result<ElemPtr, Refusal> {
        let mut cur = self.head_of(bucket);
        let target = loop {
            let h = self.container_header_at(cur);
            if bits.is_superset_of(h.scan_bits) && self.pages[cur.page].container_has_room(cur.buf, cur.end)
            {
                break cur;
            }
            match self.next_container(cur, &h) {
                Some(next) => cur = next,
                None => break self.append_container(cur, ctx)?,
            }
        };
        let mut h = self.container_header_at(target);
        let idx = h.len;
        match header {
            ElemHeader::Unlocked { reduced, .. } => {
                self.pages[target.page].write_elem(
                    target.buf,
                    target.end,
                    idx,
                    ElemHeader::Unlocked {
                        reduced,
                        scan_bits: bits,
                    },
                    local_key,
                );
            }
            ElemHeader::Locked { op_raw } => {
                self.pages[target.page].write_elem(target.buf, target.end, idx, header, local_key);
                let op: Handle<OpRecord> = Handle::from_raw(op_raw);
                ctx.ops[op].parked_bits = bits;
            }
        }
        h.len += 1;
        self.write_container_at(target, &h);
        self.elem_count += 1;
        self.slack -= 1;
        Ok(ElemPtr {
            container: target,
            idx,
        })
    }

    /// Links a brand-new empty container after the chain's last one.
    fn append_container(
        &mut self,
        last: ContainerPtr,
        ctx: &mut Ctx<'_>,
    ) -> Result<ContainerPtr, Refusal> {
        // Same page first, then any overflow page with a free buffer end,
        // then a new overflow page.
        let (page_ref, buf, end) = if let Some((buf, end)) = self.pages[last.page].acquire_container()
        {
            (last.page, buf, end)
        } else if let Some((page_ref, buf, end)) = self.acquire_from_overflow_pages() {
            (page_ref, buf, end)
        } else {
            let page_ref = self.grab_overflow_page(ctx)?;
            let (buf, end) = match self.pages[page_ref].acquire_container() {
                Some(slot) => slot,
                None => fatal!("fresh overflow page has no free container"),
            };
            (page_ref, buf, end)
        };
        let mut last_header = self.container_header_at(last);
        if last_header.next.is_some() {
            fatal!("append to a container that is not the chain tail");
        }
        last_header.next = Some(ContainerLink {
            end,
            buf,
            page: (page_ref != last.page).then(|| page_ref),
        });
        self.write_container_at(last, &last_header);
        Ok(ContainerPtr {
            page: page_ref,
            buf,
            end,
        })
    }

    fn acquire_from_overflow_pages(&mut self) -> Option<(crate::page::PageRef, u8, End)> {
        for i in 0..self.overflow_pages.len() {
            let page_ref = self.overflow_pages[i];
            if let Some((buf, end)) = self.pages[page_ref].acquire_container() {
                return Some((page_ref, buf, end));
            }
        }
        None
    }

    fn grab_overflow_page(&mut self, ctx: &mut Ctx<'_>) -> Result<crate::page::PageRef, Refusal> {
        if self.pages.len() >= self.config.max_pages {
            return Err(Refusal::OutOfIndexMemory);
        }
        let mem = ctx.alloc.allocate_page().ok_or(Refusal::OutOfIndexMemory)?;
        let page_ref = match self.pages.insert(Page::init_overflow(mem)) {
            Some(page_ref) => page_ref,
            None => fatal!("page arena full below its record budget"),
        };
        self.overflow_pages.push(page_ref);
        Ok(page_ref)
    }

    /// Swap-removal: the bucket's logically last element backfills the
    /// vacated slot, the trailing container shrinks and is unlinked once
    /// empty (the head container never is). Scans positioned in this bucket
    /// are rewound to the bucket head; their per-element marks make the
    /// rewind duplicate-free.
    pub(crate) fn remove_elem(&mut self, bucket: u32, ptr: ElemPtr, ctx: &mut Ctx<'_>) {
        let head = self.head_of(bucket);
        let mut prev: Option<ContainerPtr> = None;
        let mut last = head;
        let mut last_header = self.container_header_at(last);
        while let Some(next) = self.next_container(last, &last_header) {
            prev = Some(last);
            last = next;
            last_header = self.container_header_at(last);
        }
        if last_header.len == 0 {
            fatal!("swap-removal from an empty bucket {bucket}");
        }
        let last_idx = last_header.len - 1;

        if !(ptr.container == last && ptr.idx == last_idx) {
            let (moved, moved_key) = self.pages[last.page].read_elem(last.buf, last.end, last_idx);
            let moved_bits = self.effective_scan_bits(
                ElemPtr {
                    container: last,
                    idx: last_idx,
                },
                moved,
                ctx.ops,
            );
            match moved {
                ElemHeader::Unlocked { reduced, .. } => {
                    self.pages[ptr.container.page].write_elem(
                        ptr.container.buf,
                        ptr.container.end,
                        ptr.idx,
                        ElemHeader::Unlocked {
                            reduced,
                            scan_bits: moved_bits,
                        },
                        moved_key,
                    );
                }
                ElemHeader::Locked { op_raw } => {
                    self.pages[ptr.container.page].write_elem(
                        ptr.container.buf,
                        ptr.container.end,
                        ptr.idx,
                        moved,
                        moved_key,
                    );
                    let op: Handle<OpRecord> = Handle::from_raw(op_raw);
                    ctx.ops[op].elem = Some(ptr);
                    ctx.ops[op].parked_bits = moved_bits;
                }
            }
            // The destination (and everything after it) may not claim scan
            // coverage the moved element does not have.
            let dest_header = self.container_header_at(ptr.container);
            let excess = dest_header.scan_bits.without(moved_bits);
            if !excess.is_empty() {
                let mut cur = ptr.container;
                loop {
                    let mut h = self.container_header_at(cur);
                    h.scan_bits = h.scan_bits.without(excess);
                    self.write_container_at(cur, &h);
                    match self.next_container(cur, &h) {
                        Some(next) => cur = next,
                        None => break,
                    }
                }
            }
        }

        // Shrink the trailing container (re-read: the bit clearing above may
        // have rewritten its header).
        let mut last_header = self.container_header_at(last);
        last_header.len -= 1;
        self.write_container_at(last, &last_header);

        if last_header.len == 0 && last != head {
            let prev = match prev {
                Some(prev) => prev,
                None => fatal!("non-head container without a predecessor"),
            };
            let mut prev_header = self.container_header_at(prev);
            prev_header.next = None;
            self.write_container_at(prev, &prev_header);
            self.pages[last.page].release_container(last.buf, last.end);
            if self.pages[last.page].is_reclaimable() {
                self.overflow_pages.retain(|p| *p != last.page);
                let page = self.pages.remove(last.page);
                ctx.alloc.free_page(page.into_mem());
            }
        }

        for fs in self.scan_slots.iter().flatten() {
            if fs.cur_bucket == bucket {
                ctx.scans[fs.scan].rewind_bucket();
            }
        }

        self.elem_count -= 1;
        self.slack += 1;
    }

    /// Bucket-chain lookup: reduced-hash prefilter, then primary-key
    /// comparison. Locked elements compare through the owning operation's
    /// parked reduced value and stored key, falling back to the earliest
    /// queued operation carrying the key, and finally to the row itself.
    /// An unlocked element whose row the primary-key reader no longer
    /// holds is a `TupleGone` refusal.
    pub(crate) fn find_element(
        &self,
        hash: u32,
        key: &[u8],
        ops: &Arena<OpRecord>,
        pk: &dyn PrimaryKeyReader,
    ) -> Result<Option<(ElemPtr, ElemHeader, u32)>, Refusal> {
        let bucket = self.bucket_of(hash);
        let k = self.addr_bits(bucket);
        let mut cur = self.head_of(bucket);
        loop {
            let header = self.container_header_at(cur);
            for idx in 0..header.len {
                let (elem, local_key) = self.pages[cur.page].read_elem(cur.buf, cur.end, idx);
                let candidate = match elem {
                    ElemHeader::Unlocked { reduced, .. } => reduced_matches(reduced, hash, k),
                    ElemHeader::Locked { op_raw } => {
                        let op: Handle<OpRecord> = Handle::from_raw(op_raw);
                        reduced_matches(ops[op].parked_reduced, hash, k)
                    }
                };
                if !candidate {
                    continue;
                }
                let matched = match elem {
                    ElemHeader::Unlocked { .. } => match pk.read_pk(LocalKey(local_key)) {
                        Some(stored_key) => self.key_eq(&stored_key, key),
                        None => return Err(Refusal::TupleGone),
                    },
                    ElemHeader::Locked { op_raw } => {
                        let op: Handle<OpRecord> = Handle::from_raw(op_raw);
                        match queue_key(ops, op) {
                            Some(stored_key) => self.key_eq(stored_key, key),
                            None => match pk.read_pk(LocalKey(local_key)) {
                                Some(stored_key) => self.key_eq(&stored_key, key),
                                // Row gone and no queued operation knows the
                                // key; cannot be the probe's row.
                                None => false,
                            },
                        }
                    }
                };
                if matched {
                    return Ok(Some((
                        ElemPtr {
                            container: cur,
                            idx,
                        },
                        elem,
                        local_key,
                    )));
                }
            }
            match self.next_container(cur, &header) {
                Some(next) => cur = next,
                None => return Ok(None),
            }
        }
    }

    pub(crate) fn key_eq(&self, a: &[u8], b: &[u8]) -> bool {
        match self.config.key_eq {
            Some(eq) => eq(a, b),
            None => a == b,
        }
    }
}

/// First operation in the element's lock queue that carries the primary
/// key: the owner, then parallel queue order, then serial queue order.
fn queue_key(ops: &Arena<OpRecord>, owner: Handle<OpRecord>) -> Option<&[u8]> {
    let mut cur = owner;
    while cur.is_some() {
        let op = &ops[cur];
        if op.has_key() {
            return Some(&op.key);
        }
        cur = op.next_parallel;
    }
    let mut cur = ops[owner].next_serial;
    while cur.is_some() {
        let op = &ops[cur];
        if op.has_key() {
            return Some(&op.key);
        }
        cur = op.next_serial;
    }
    None
}

#[cfg(test)]
impl Fragment {
    /// Walks one bucket asserting the chain rule: a container never
    /// carries a scan bit its predecessor lacks.
    fn assert_chain_bits_descend(&self, bucket: u32) {
        let mut cur = self.head_of(bucket);
        let mut prev_bits: Option<ScanMask> = None;
        loop {
            let header = self.container_header_at(cur);
            if let Some(prev) = prev_bits {
                assert!(
                    prev.is_superset_of(header.scan_bits),
                    "bucket {bucket}: container bits {:?} exceed predecessor's {:?}",
                    header.scan_bits,
                    prev,
                );
            }
            prev_bits = Some(header.scan_bits);
            match self.next_container(cur, &header) {
                Some(next) => cur = next,
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FragmentId;
    use crate::fragment::{reduced_fresh, FragConfig};
    use crate::scan::ScanRec;
    use crate::traits::{HeapAllocator, NoopDeallocation, PageAllocator};

    struct NoRows;

    impl PrimaryKeyReader for NoRows {
        fn read_pk(&self, _local_key: LocalKey) -> Option<Vec<u8>> {
            None
        }
    }

    fn with_fragment(f: impl FnOnce(&mut Fragment, &mut Ctx<'_>)) {
        let mut ops: Arena<OpRecord> = Arena::with_max_records(8);
        let mut scans: Arena<ScanRec> = Arena::with_max_records(4);
        let mut alloc: Box<dyn PageAllocator> = Box::new(HeapAllocator::new(16));
        let pk = NoRows;
        let dealloc = NoopDeallocation;
        let (completion_tx, _completion_rx) = crossbeam_channel::unbounded();
        let (job_tx, _job_rx) = crossbeam_channel::unbounded();
        let mut ctx = Ctx {
            ops: &mut ops,
            scans: &mut scans,
            alloc: alloc.as_mut(),
            pk: &pk,
            dealloc: &dealloc,
            completions: &completion_tx,
            jobs: &job_tx,
        };
        let config = FragConfig {
            max_load: 1000,
            min_load: 1,
            max_pages: 16,
            hasher: None,
            key_eq: None,
        };
        let mut frag = Fragment::new(FragmentId(9), config, &mut ctx).unwrap();
        f(&mut frag, &mut ctx);
    }

    fn xorshift(state: &mut u32) -> u32 {
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *state = x;
        x
    }

    fn place_unmarked(frag: &mut Fragment, local_key: u32, ctx: &mut Ctx<'_>) {
        let header = ElemHeader::Unlocked {
            reduced: reduced_fresh(local_key.wrapping_mul(0x9e37_79b9), 0),
            scan_bits: ScanMask::empty(),
        };
        frag.place_elem(0, header, local_key, ScanMask::empty(), ctx).unwrap();
    }

    #[test]
    fn swap_removal_keeps_container_bits_descending() {
        with_fragment(|frag, ctx| {
            let initial = 40u32;
            for i in 0..initial {
                place_unmarked(frag, i, ctx);
            }

            // Mark a prefix of the chain the way a part-way scan would:
            // element bits first, then container bits on every container
            // whose elements are all marked.
            let mark = ScanMask::single(0);
            for i in 0..30 {
                let (ptr, header, _) = frag.elem_at(0, i).unwrap();
                if let ElemHeader::Unlocked { reduced, .. } = header {
                    frag.pages[ptr.container.page].write_elem_header(
                        ptr.container.buf,
                        ptr.container.end,
                        ptr.idx,
                        ElemHeader::Unlocked {
                            reduced,
                            scan_bits: mark,
                        },
                    );
                }
            }
            let mut cur = frag.head_of(0);
            loop {
                let mut header = frag.container_header_at(cur);
                let mut all_marked = true;
                for idx in 0..header.len {
                    let (elem, _) = frag.pages[cur.page].read_elem(cur.buf, cur.end, idx);
                    if let ElemHeader::Unlocked { scan_bits, .. } = elem {
                        if !scan_bits.is_superset_of(mark) {
                            all_marked = false;
                            break;
                        }
                    }
                }
                if !all_marked {
                    break;
                }
                header.scan_bits = header.scan_bits.union(mark);
                frag.pages[cur.page].write_container(cur.buf, cur.end, &header);
                match frag.next_container(cur, &header) {
                    Some(next) => cur = next,
                    None => break,
                }
            }
            frag.assert_chain_bits_descend(0);

            // Random removals (with the occasional unmarked insert mixed
            // in) must keep the rule through every swap and excess-bit
            // clearing.
            let mut rng = 0x2545_f491u32;
            let mut remaining = initial;
            let mut fresh = 0u32;
            while remaining > 0 {
                let pick = xorshift(&mut rng) % remaining;
                let (ptr, _, _) = frag.elem_at(0, pick).unwrap();
                frag.remove_elem(0, ptr, ctx);
                remaining -= 1;
                frag.assert_chain_bits_descend(0);
                if fresh < 8 && remaining % 5 == 2 {
                    place_unmarked(frag, 1000 + fresh, ctx);
                    fresh += 1;
                    remaining += 1;
                    frag.assert_chain_bits_descend(0);
                }
            }
            assert_eq!(frag.elem_count, 0);
        });
    }
}
