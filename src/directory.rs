//! Radix-paged directory from logical bucket-page number to page handle.
//!
//! Two levels: a vector of 256-entry leaves allocated on demand. Entries are
//! set when a normal page is allocated for a new bucket range and trimmed
//! back during shrink; a leaf is freed once every entry in it is cleared.
//! Not safe for concurrent mutation; callers hold the fragment write lock.

use crate::common::arena::Handle;
use crate::common::error::Refusal;
use crate::common::fatal;
use crate::page::Page;

pub(crate) type PageRef = Handle<Page>;

const LEAF_ENTRIES: usize = 256;

struct Leaf {
    entries: [PageRef; LEAF_ENTRIES],
    used: u16,
}

impl Leaf {
    fn new() -> Box<Self> {
        Box::new(Self {
            entries: [PageRef::null(); LEAF_ENTRIES],
            used: 0,
        })
    }
}

pub(crate) struct Directory {
    leaves: Vec<Option<Box<Leaf>>>,
    max_pages: usize,
}

impl Directory {
    pub(crate) fn new(max_pages: usize) -> Self {
        Self {
            leaves: Vec::new(),
            max_pages,
        }
    }

    /// Looks up the physical page for a logical page number. Fatal if the
    /// entry was never set: bucket addressing must only produce mapped
    /// indices.
    pub(crate) fn get(&self, index: u32) -> PageRef {
        match self.peek(index) {
            Some(page) => page,
            None => fatal!("directory entry {index} is unmapped"),
        }
    }

    pub(crate) fn peek(&self, index: u32) -> Option<PageRef> {
        let leaf = self.leaves.get(index as usize / LEAF_ENTRIES)?.as_ref()?;
        let page = leaf.entries[index as usize % LEAF_ENTRIES];
        page.is_some().then(|| page)
    }

    /// Maps a logical page number, growing the radix structure as needed.
    pub(crate) fn set(&mut self, index: u32, page: PageRef) -> Result<(), Refusal> {
        if index as usize >= self.max_pages {
            return Err(Refusal::DirectoryRangeFull);
        }
        let leaf_idx = index as usize / LEAF_ENTRIES;
        if leaf_idx >= self.leaves.len() {
            self.leaves.resize_with(leaf_idx + 1, || None);
        }
        let leaf = self.leaves[leaf_idx].get_or_insert_with(Leaf::new);
        let entry = &mut leaf.entries[index as usize % LEAF_ENTRIES];
        if entry.is_some() {
            fatal!("directory entry {index} set twice");
        }
        *entry = page;
        leaf.used += 1;
        Ok(())
    }

    /// Clears a mapping, freeing the leaf once it holds no entries.
    pub(crate) fn trim(&mut self, index: u32) {
        let leaf_idx = index as usize / LEAF_ENTRIES;
        let Some(Some(leaf)) = self.leaves.get_mut(leaf_idx) else {
            fatal!("trim of unmapped directory entry {index}");
        };
        let entry = &mut leaf.entries[index as usize % LEAF_ENTRIES];
        if entry.is_null() {
            fatal!("trim of unmapped directory entry {index}");
        }
        *entry = PageRef::null();
        leaf.used -= 1;
        if leaf.used == 0 {
            self.leaves[leaf_idx] = None;
            while matches!(self.leaves.last(), Some(None)) {
                self.leaves.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Directory, PageRef, LEAF_ENTRIES};
    use crate::common::error::Refusal;

    fn page(raw: u32) -> PageRef {
        PageRef::from_raw(raw)
    }

    #[test]
    fn set_get_trim() {
        let mut dir = Directory::new(1024);
        dir.set(0, page(7)).unwrap();
        dir.set(300, page(8)).unwrap();
        assert_eq!(dir.get(0), page(7));
        assert_eq!(dir.get(300), page(8));
        assert!(dir.peek(1).is_none());
        dir.trim(0);
        assert!(dir.peek(0).is_none());
        assert_eq!(dir.get(300), page(8));
    }

    #[test]
    fn leaves_are_freed_and_regrown() {
        let mut dir = Directory::new(LEAF_ENTRIES * 4);
        for i in 0..4 {
            dir.set(i * LEAF_ENTRIES as u32, page(i)).unwrap();
        }
        for i in (0..4).rev() {
            dir.trim(i * LEAF_ENTRIES as u32);
        }
        assert!(dir.leaves.is_empty());
        dir.set(2, page(9)).unwrap();
        assert_eq!(dir.get(2), page(9));
    }

    #[test]
    fn range_full() {
        let mut dir = Directory::new(2);
        dir.set(0, page(0)).unwrap();
        dir.set(1, page(1)).unwrap();
        assert_eq!(dir.set(2, page(2)), Err(Refusal::DirectoryRangeFull));
    }

    #[test]
    #[should_panic]
    fn double_set_is_fatal() {
        let mut dir = Directory::new(8);
        dir.set(3, page(1)).unwrap();
        dir.set(3, page(2)).unwrap();
    }
}
