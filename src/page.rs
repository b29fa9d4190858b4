//! 8 KiB index pages and the container/element word codecs.
//!
//! A page is 2048 `u32` words: a 32-word header followed by 72 buffers of
//! 28 words. Each buffer can host up to two containers, one growing from
//! the left end and one from the right end. A container is two header words
//! plus densely packed 2-word elements; the two ends of a buffer share the
//! 24 non-header words once both are in use.
//!
//! Normal pages keep bucket head containers at fixed buffer positions
//! (buffer index = bucket number within the page); overflow pages hand out
//! both ends of every buffer dynamically.

use crate::common::arena::Handle;
use crate::common::{fatal, ScanMask};

pub(crate) const PAGE_WORDS: usize = 2048;
pub(crate) const HEADER_WORDS: usize = 32;
pub(crate) const BUFFER_WORDS: usize = 28;
pub(crate) const BUFFERS_PER_PAGE: usize = 72;
pub(crate) const BUCKETS_PER_PAGE: usize = 64;

/// Elements a lone container can hold (26 words / 2).
pub(crate) const CONTAINER_CAP: u8 = 13;
/// Combined element budget of a buffer once both ends are in use
/// (28 words - 2 headers * 2 words).
pub(crate) const SHARED_CAP: u8 = 12;
pub(crate) const ELEM_WORDS: usize = 2;

/// Raw page memory as handed out by the page allocator.
pub type PageMem = Box<[u32; PAGE_WORDS]>;

pub(crate) type PageRef = Handle<Page>;

// Header word offsets.
const W_PAGE_NO: usize = 0;
const W_KIND: usize = 1;
const W_ALLOC: usize = 2;
const W_FREE_LEFT: usize = 3; // 3 words, bit b = left end of buffer b is free
const W_FREE_RIGHT: usize = 6; // 3 words, bit b = right end of buffer b is free
const W_CHECKSUM: usize = 9;

const KIND_NORMAL: u32 = 0;
const KIND_OVERFLOW: u32 = 1;

/// Which end of a buffer a container occupies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum End {
    Left,
    Right,
}

impl End {
    fn encode(self) -> u32 {
        match self {
            End::Left => 0,
            End::Right => 1,
        }
    }

    fn decode(bit: u32) -> Self {
        if bit == 0 {
            End::Left
        } else {
            End::Right
        }
    }
}

/// Address of one container on one page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ContainerPtr {
    pub(crate) page: PageRef,
    pub(crate) buf: u8,
    pub(crate) end: End,
}

/// Address of one element slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ElemPtr {
    pub(crate) container: ContainerPtr,
    pub(crate) idx: u8,
}

/// Link from a container to the next one in its bucket chain.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ContainerLink {
    pub(crate) end: End,
    pub(crate) buf: u8,
    /// `None` when the next container lives on the same page.
    pub(crate) page: Option<PageRef>,
}

/// Decoded container header (2 packed words).
///
/// Word 0: bits 0..4 element count, bits 4..8 scan bits, bit 8 both ends in
/// use, bit 9 has next, bit 10 next end, bit 11 next on same page,
/// bits 12..19 next buffer index. Word 1: next page id.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct ContainerHeader {
    pub(crate) len: u8,
    pub(crate) scan_bits: ScanMask,
    pub(crate) both_ends: bool,
    pub(crate) next: Option<ContainerLink>,
}

impl ContainerHeader {
    pub(crate) fn empty() -> Self {
        Self {
            len: 0,
            scan_bits: ScanMask::empty(),
            both_ends: false,
            next: None,
        }
    }

    fn encode(&self) -> (u32, u32) {
        debug_assert!(self.len <= CONTAINER_CAP);
        let mut w0 = u32::from(self.len)
            | (u32::from(self.scan_bits.bits()) << 4)
            | (u32::from(self.both_ends) << 8);
        let mut w1 = 0;
        if let Some(link) = self.next {
            debug_assert!((link.buf as usize) < BUFFERS_PER_PAGE);
            w0 |= 1 << 9;
            w0 |= link.end.encode() << 10;
            match link.page {
                None => w0 |= 1 << 11,
                Some(page) => w1 = page.raw(),
            }
            w0 |= u32::from(link.buf) << 12;
        }
        (w0, w1)
    }

    fn decode(w0: u32, w1: u32) -> Self {
        let len = (w0 & 0xf) as u8;
        if len > CONTAINER_CAP {
            fatal!("container header claims {len} elements");
        }
        let next = if w0 & (1 << 9) != 0 {
            let buf = ((w0 >> 12) & 0x7f) as u8;
            if buf as usize >= BUFFERS_PER_PAGE {
                fatal!("container link to buffer {buf} out of range");
            }
            Some(ContainerLink {
                end: End::decode((w0 >> 10) & 1),
                buf,
                page: if w0 & (1 << 11) != 0 {
                    None
                } else {
                    Some(PageRef::from_raw(w1))
                },
            })
        } else {
            None
        };
        Self {
            len,
            scan_bits: ScanMask::from_bits(((w0 >> 4) & 0xf) as u8),
            both_ends: w0 & (1 << 8) != 0,
            next,
        }
    }
}

/// Decoded element header word.
///
/// Bit 0 is the lock tag. Unlocked: bits 1..5 per-element scan bits,
/// bits 16..32 reduced hash. Locked: bits 1..32 the owning operation's
/// arena index; the reduced hash and scan bits are parked in that record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ElemHeader {
    Unlocked { reduced: u16, scan_bits: ScanMask },
    Locked { op_raw: u32 },
}

impl ElemHeader {
    pub(crate) fn encode(self) -> u32 {
        match self {
            ElemHeader::Unlocked { reduced, scan_bits } => {
                (u32::from(reduced) << 16) | (u32::from(scan_bits.bits()) << 1)
            }
            ElemHeader::Locked { op_raw } => {
                debug_assert!(op_raw < (1 << 31));
                (op_raw << 1) | 1
            }
        }
    }

    pub(crate) fn decode(w: u32) -> Self {
        if w & 1 != 0 {
            ElemHeader::Locked { op_raw: w >> 1 }
        } else {
            ElemHeader::Unlocked {
                reduced: (w >> 16) as u16,
                scan_bits: ScanMask::from_bits(((w >> 1) & 0xf) as u8),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_locked(self) -> bool {
        matches!(self, ElemHeader::Locked { .. })
    }
}

pub(crate) struct Page {
    words: PageMem,
}

impl Page {
    /// Wraps allocator memory as a normal page hosting bucket heads. Every
    /// bucket-head container (left ends of buffers `0..BUCKETS_PER_PAGE`)
    /// is initialized empty and permanently allocated.
    pub(crate) fn init_normal(mut mem: PageMem, logical_page_no: u32) -> Self {
        mem.fill(0);
        mem[W_PAGE_NO] = logical_page_no;
        mem[W_KIND] = KIND_NORMAL;
        mem[W_ALLOC] = BUCKETS_PER_PAGE as u32;
        let mut page = Self { words: mem };
        for buf in 0..BUCKETS_PER_PAGE as u8 {
            page.write_container(buf, End::Left, &ContainerHeader::empty());
        }
        set_bit_range(
            page.free_bits_mut(End::Left),
            BUCKETS_PER_PAGE,
            BUFFERS_PER_PAGE,
        );
        set_bit_range(page.free_bits_mut(End::Right), 0, BUFFERS_PER_PAGE);
        page.refresh_checksum();
        page
    }

    /// Wraps allocator memory as an overflow page; every buffer end starts
    /// free.
    pub(crate) fn init_overflow(mut mem: PageMem) -> Self {
        mem.fill(0);
        mem[W_PAGE_NO] = u32::MAX;
        mem[W_KIND] = KIND_OVERFLOW;
        let mut page = Self { words: mem };
        set_bit_range(page.free_bits_mut(End::Left), 0, BUFFERS_PER_PAGE);
        set_bit_range(page.free_bits_mut(End::Right), 0, BUFFERS_PER_PAGE);
        page.refresh_checksum();
        page
    }

    /// Returns the page memory to the caller for release to the allocator.
    pub(crate) fn into_mem(self) -> PageMem {
        self.words
    }

    pub(crate) fn is_overflow(&self) -> bool {
        self.words[W_KIND] == KIND_OVERFLOW
    }

    #[cfg(test)]
    pub(crate) fn logical_page_no(&self) -> u32 {
        self.words[W_PAGE_NO]
    }

    /// Containers currently allocated on this page.
    pub(crate) fn alloc_count(&self) -> u32 {
        self.words[W_ALLOC]
    }

    /// An overflow page with no containers left can be handed back to the
    /// allocator.
    pub(crate) fn is_reclaimable(&self) -> bool {
        self.is_overflow() && self.alloc_count() == 0
    }

    fn buffer_base(buf: u8) -> usize {
        debug_assert!((buf as usize) < BUFFERS_PER_PAGE);
        HEADER_WORDS + buf as usize * BUFFER_WORDS
    }

    fn header_word(buf: u8, end: End) -> usize {
        let base = Self::buffer_base(buf);
        match end {
            End::Left => base,
            End::Right => base + BUFFER_WORDS - 2,
        }
    }

    /// Word offset of element `idx` of the container at (`buf`, `end`).
    fn elem_word(buf: u8, end: End, idx: u8) -> usize {
        let base = Self::buffer_base(buf);
        match end {
            End::Left => base + 2 + idx as usize * ELEM_WORDS,
            End::Right => base + BUFFER_WORDS - 2 - (idx as usize + 1) * ELEM_WORDS,
        }
    }

    pub(crate) fn read_container(&self, buf: u8, end: End) -> ContainerHeader {
        let at = Self::header_word(buf, end);
        ContainerHeader::decode(self.words[at], self.words[at + 1])
    }

    pub(crate) fn write_container(&mut self, buf: u8, end: End, header: &ContainerHeader) {
        let at = Self::header_word(buf, end);
        let (w0, w1) = header.encode();
        self.words[at] = w0;
        self.words[at + 1] = w1;
    }

    pub(crate) fn read_elem(&self, buf: u8, end: End, idx: u8) -> (ElemHeader, u32) {
        let at = Self::elem_word(buf, end, idx);
        (ElemHeader::decode(self.words[at]), self.words[at + 1])
    }

    pub(crate) fn write_elem(&mut self, buf: u8, end: End, idx: u8, header: ElemHeader, key: u32) {
        let at = Self::elem_word(buf, end, idx);
        self.words[at] = header.encode();
        self.words[at + 1] = key;
    }

    pub(crate) fn write_elem_header(&mut self, buf: u8, end: End, idx: u8, header: ElemHeader) {
        let at = Self::elem_word(buf, end, idx);
        self.words[at] = header.encode();
    }

    pub(crate) fn write_elem_key(&mut self, buf: u8, end: End, idx: u8, key: u32) {
        let at = Self::elem_word(buf, end, idx);
        self.words[at + 1] = key;
    }

    /// Whether one more element fits into the container at (`buf`, `end`).
    pub(crate) fn container_has_room(&self, buf: u8, end: End) -> bool {
        let header = self.read_container(buf, end);
        if header.both_ends {
            let other = self.read_container(buf, end.opposite());
            header.len + other.len < SHARED_CAP
        } else {
            header.len < CONTAINER_CAP
        }
    }

    fn free_bits(&self, end: End) -> &[u32] {
        match end {
            End::Left => &self.words[W_FREE_LEFT..W_FREE_LEFT + 3],
            End::Right => &self.words[W_FREE_RIGHT..W_FREE_RIGHT + 3],
        }
    }

    fn free_bits_mut(&mut self, end: End) -> &mut [u32] {
        match end {
            End::Left => &mut self.words[W_FREE_LEFT..W_FREE_LEFT + 3],
            End::Right => &mut self.words[W_FREE_RIGHT..W_FREE_RIGHT + 3],
        }
    }

    /// Acquires a free buffer end and initializes an empty container there.
    /// Left ends are preferred; a shared buffer is only used while its
    /// sibling leaves room for the second header and at least one element.
    pub(crate) fn acquire_container(&mut self) -> Option<(u8, End)> {
        for end in [End::Left, End::Right] {
            let mut candidate = first_set_bit(self.free_bits(end));
            while let Some(buf) = candidate {
                let sibling_used = !test_bit(self.free_bits(end.opposite()), buf);
                let sibling_len = if sibling_used {
                    self.read_container(buf, end.opposite()).len
                } else {
                    0
                };
                if !sibling_used || sibling_len < SHARED_CAP {
                    clear_bit(self.free_bits_mut(end), buf);
                    let header = ContainerHeader {
                        both_ends: sibling_used,
                        ..ContainerHeader::empty()
                    };
                    self.write_container(buf, end, &header);
                    if sibling_used {
                        let mut sibling = self.read_container(buf, end.opposite());
                        sibling.both_ends = true;
                        self.write_container(buf, end.opposite(), &sibling);
                    }
                    self.words[W_ALLOC] += 1;
                    self.refresh_checksum();
                    return Some((buf, end));
                }
                candidate = next_set_bit(self.free_bits(end), buf);
            }
        }
        None
    }

    /// Returns an emptied container's buffer end to the free lists. Bucket
    /// head containers are never released.
    pub(crate) fn release_container(&mut self, buf: u8, end: End) {
        let header = self.read_container(buf, end);
        if header.len != 0 {
            fatal!("release of non-empty container (buf {buf}, {end:?})");
        }
        if !self.is_overflow() && end == End::Left && (buf as usize) < BUCKETS_PER_PAGE {
            fatal!("release of a bucket head container (buf {buf})");
        }
        set_bit(self.free_bits_mut(end), buf);
        if header.both_ends {
            let mut sibling = self.read_container(buf, end.opposite());
            sibling.both_ends = false;
            self.write_container(buf, end.opposite(), &sibling);
        }
        self.words[W_ALLOC] -= 1;
        self.refresh_checksum();
    }

    pub(crate) fn refresh_checksum(&mut self) {
        let sum = self.words[..W_CHECKSUM]
            .iter()
            .fold(0u32, |acc, w| acc ^ *w);
        self.words[W_CHECKSUM] = sum;
    }

    #[cfg(test)]
    pub(crate) fn checksum_ok(&self) -> bool {
        let sum = self.words[..W_CHECKSUM]
            .iter()
            .fold(0u32, |acc, w| acc ^ *w);
        self.words[W_CHECKSUM] == sum
    }
}

impl End {
    pub(crate) fn opposite(self) -> Self {
        match self {
            End::Left => End::Right,
            End::Right => End::Left,
        }
    }
}

fn test_bit(bits: &[u32], buf: u8) -> bool {
    bits[buf as usize / 32] & (1 << (buf as usize % 32)) != 0
}

fn set_bit(bits: &mut [u32], buf: u8) {
    bits[buf as usize / 32] |= 1 << (buf as usize % 32);
}

fn clear_bit(bits: &mut [u32], buf: u8) {
    bits[buf as usize / 32] &= !(1 << (buf as usize % 32));
}

fn set_bit_range(bits: &mut [u32], from: usize, to: usize) {
    for b in from..to {
        bits[b / 32] |= 1 << (b % 32);
    }
}

fn first_set_bit(bits: &[u32]) -> Option<u8> {
    for (i, w) in bits.iter().enumerate() {
        if *w != 0 {
            return Some((i * 32 + w.trailing_zeros() as usize) as u8);
        }
    }
    None
}

fn next_set_bit(bits: &[u32], after: u8) -> Option<u8> {
    let mut idx = after as usize + 1;
    while idx < BUFFERS_PER_PAGE {
        let w = bits[idx / 32] >> (idx % 32);
        if w != 0 {
            return Some((idx + w.trailing_zeros() as usize) as u8);
        }
        idx = (idx / 32 + 1) * 32;
    }
    None
}

pub fn new_page_mem() -> PageMem {
    // Large array; build through a Vec to avoid a stack copy.
    vec![0u32; PAGE_WORDS]
        .into_boxed_slice()
        .try_into()
        .unwrap_or_else(|_| fatal!("page memory size mismatch"))
}
