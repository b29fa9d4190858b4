pub(crate) mod arena;
pub(crate) mod error;

/// Opaque reference to a row owned by the row-storage collaborator,
/// conventionally a packed (page, slot) pair. The index never looks inside
/// it; it only stores, returns and hands it to the primary-key reader.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LocalKey(pub u32);

/// Identifies one table partition (fragment) in the registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FragmentId(pub u32);

/// Transaction identity used for lock-compatibility decisions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TxnId(pub u64);

/// Maximum number of concurrent full-fragment scans per fragment. Bounded
/// by the scan-bit width in container headers and element words.
pub const MAX_SCANS_PER_FRAGMENT: usize = 4;

/// A set of scan slots, one bit per concurrent scan of a fragment.
///
/// On a container header the bit means "every element currently inside was
/// already returned by that scan" (an accelerator that may be conservatively
/// cleared). On an element word the bit is ground truth for "this element
/// was returned by that scan".
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub(crate) struct ScanMask(u8);

impl ScanMask {
    pub(crate) const ALL: u8 = (1 << MAX_SCANS_PER_FRAGMENT as u8) - 1;

    pub(crate) fn empty() -> Self {
        Self(0)
    }

    pub(crate) fn single(slot: u8) -> Self {
        debug_assert!((slot as usize) < MAX_SCANS_PER_FRAGMENT);
        Self(1 << slot)
    }

    pub(crate) fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[cfg(test)]
    pub(crate) fn contains(self, slot: u8) -> bool {
        self.0 & (1 << slot) != 0
    }

    #[cfg(test)]
    pub(crate) fn set(&mut self, slot: u8) {
        self.0 |= 1 << slot;
    }

    #[cfg(test)]
    pub(crate) fn clear(&mut self, slot: u8) {
        self.0 &= !(1 << slot);
    }

    pub(crate) fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub(crate) fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub(crate) fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub(crate) fn is_superset_of(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[cfg(test)]
    pub(crate) fn iter_slots(self) -> impl Iterator<Item = u8> {
        (0..MAX_SCANS_PER_FRAGMENT as u8).filter(move |s| self.0 & (1 << s) != 0)
    }
}

/// Logs at error level (when the `logging` feature is enabled) and aborts.
/// Used for invariant violations only: a corrupted lock queue or an
/// impossible container state must not be papered over.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        #[cfg(feature = "logging")]
        log::error!($($arg)+);
        panic!($($arg)+);
    }};
}

pub(crate) use fatal;

#[cfg(test)]
mod tests {
    use super::ScanMask;

    #[test]
    fn scan_mask_ops() {
        let mut m = ScanMask::empty();
        assert!(m.is_empty());
        m.set(1);
        m.set(3);
        assert!(m.contains(1));
        assert!(!m.contains(0));
        assert!(m.is_superset_of(ScanMask::single(3)));
        assert!(!ScanMask::single(3).is_superset_of(m));
        assert_eq!(m.iter_slots().collect::<Vec<_>>(), vec![1, 3]);
        m.clear(1);
        assert_eq!(m, ScanMask::single(3));
        assert_eq!(ScanMask::from_bits(0xff).bits(), ScanMask::ALL);
    }
}
