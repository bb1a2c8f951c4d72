//! The hardware address-space mapping interface.
//!
//! The fault handler and the frame table only ever talk to a process's page
//! directory through [`PageDirectory`]. [`PageManager`] implements it on top of
//! x86 page table entries kept in kernel memory.

// Addresses below PHYS_BASE always fit in 32 bits.
#![allow(clippy::cast_possible_truncation)]

use alloc::collections::BTreeMap;
use kidneyos_shared::{
    mem::{is_user_vaddr, PAGE_FRAME_SIZE},
    paging::{PageTableEntry, VirtualAddress},
};

/// A process's page directory, as seen by the virtual memory layer.
///
/// All addresses are page aligned user virtual addresses (`upage`) and
/// physical frame addresses (`phys`).
pub trait PageDirectory: Send {
    /// Maps `upage` to the frame at `phys`. Returns `false` if the mapping
    /// could not be installed, e.g. because a page table could not be
    /// allocated.
    #[must_use]
    fn install(&mut self, upage: usize, phys: usize, writable: bool) -> bool;

    /// The frame `upage` is mapped to, if any.
    fn query(&self, upage: usize) -> Option<usize>;

    /// Removes the mapping for `upage`, so that the next access faults.
    fn clear(&mut self, upage: usize);

    /// Whether `upage` has been written to since it was mapped, or since the
    /// dirty bit was last cleared.
    fn is_dirty(&self, upage: usize) -> bool;

    fn set_dirty(&mut self, upage: usize, dirty: bool);

    /// Whether `upage` has been accessed since the accessed bit was last
    /// cleared.
    fn is_accessed(&self, upage: usize) -> bool;

    fn set_accessed(&mut self, upage: usize, accessed: bool);

    /// Whether `upage` is mapped read-write.
    fn is_writable(&self, upage: usize) -> bool;

    /// Records an access to `upage` the way the MMU does: sets the accessed
    /// bit, and the dirty bit for writes. The kernel calls this when it
    /// touches user pages through its own mapping of the frame.
    ///
    /// Returns `false` if the access would fault: the page is not mapped, or
    /// it is a write to a read-only page.
    fn access(&mut self, upage: usize, write: bool) -> bool {
        if self.query(upage).is_none() || (write && !self.is_writable(upage)) {
            return false;
        }
        self.set_accessed(upage, true);
        if write {
            self.set_dirty(upage, true);
        }
        true
    }
}

/// Page directory holding one x86 page table entry per mapped user page.
#[derive(Default)]
pub struct PageManager {
    entries: BTreeMap<u32, PageTableEntry>,
    capacity: Option<usize>,
}

impl PageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A page directory that can hold at most `capacity` mappings. Installing
    /// more fails, the way a real one does when no page table can be allocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: Some(capacity),
        }
    }

    fn key(upage: usize) -> Option<u32> {
        if !is_user_vaddr(upage) || upage % PAGE_FRAME_SIZE != 0 {
            return None;
        }
        let addr = VirtualAddress::new_with_raw_value(upage as u32);
        Some(addr.page_number().value())
    }

    fn entry(&self, upage: usize) -> Option<&PageTableEntry> {
        self.entries.get(&Self::key(upage)?)
    }

    fn update(&mut self, upage: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        let Some(key) = Self::key(upage) else {
            return;
        };
        if let Some(entry) = self.entries.get_mut(&key) {
            *entry = f(*entry);
        }
    }

    /// Number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }
}

impl PageDirectory for PageManager {
    fn install(&mut self, upage: usize, phys: usize, writable: bool) -> bool {
        let Some(key) = Self::key(upage) else {
            return false;
        };
        if self.entries.contains_key(&key) {
            return false;
        }
        if self.capacity.is_some_and(|cap| self.entries.len() >= cap) {
            return false;
        }
        let Some(entry) = PageTableEntry::user_mapping(phys, writable) else {
            return false;
        };
        self.entries.insert(key, entry);
        true
    }

    fn query(&self, upage: usize) -> Option<usize> {
        self.entry(upage).map(PageTableEntry::phys_addr)
    }

    fn clear(&mut self, upage: usize) {
        if let Some(key) = Self::key(upage) {
            self.entries.remove(&key);
        }
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|e| e.dirty())
    }

    fn set_dirty(&mut self, upage: usize, dirty: bool) {
        self.update(upage, |e| e.with_dirty(dirty));
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|e| e.accessed())
    }

    fn set_accessed(&mut self, upage: usize, accessed: bool) {
        self.update(upage, |e| e.with_accessed(accessed));
    }

    fn is_writable(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|e| e.read_write())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kidneyos_shared::mem::PHYS_BASE;

    const UPAGE: usize = 0x0804_8000;
    const FRAME: usize = 0x0010_0000;

    #[test]
    fn test_install_query_clear() {
        let mut pd = PageManager::new();
        assert_eq!(pd.query(UPAGE), None);
        assert!(pd.install(UPAGE, FRAME, false));
        assert_eq!(pd.query(UPAGE), Some(FRAME));
        assert!(!pd.is_writable(UPAGE));

        // Existing mappings are never replaced.
        assert!(!pd.install(UPAGE, FRAME + PAGE_FRAME_SIZE, true));
        assert_eq!(pd.query(UPAGE), Some(FRAME));

        pd.clear(UPAGE);
        assert_eq!(pd.query(UPAGE), None);
        assert_eq!(pd.mapped_pages(), 0);
    }

    #[test]
    fn test_rejects_kernel_and_unaligned_pages() {
        let mut pd = PageManager::new();
        assert!(!pd.install(PHYS_BASE, FRAME, true));
        assert!(!pd.install(UPAGE + 4, FRAME, true));
        assert!(!pd.install(UPAGE, FRAME + 4, true));
    }

    #[test]
    fn test_capacity_limits_installs() {
        let mut pd = PageManager::with_capacity(1);
        assert!(pd.install(UPAGE, FRAME, true));
        assert!(!pd.install(UPAGE + PAGE_FRAME_SIZE, FRAME + PAGE_FRAME_SIZE, true));
    }

    #[test]
    fn test_access_sets_accessed_and_dirty_bits() {
        let mut pd = PageManager::new();
        assert!(pd.install(UPAGE, FRAME, true));
        assert!(!pd.is_accessed(UPAGE));

        assert!(pd.access(UPAGE, false));
        assert!(pd.is_accessed(UPAGE));
        assert!(!pd.is_dirty(UPAGE));

        assert!(pd.access(UPAGE, true));
        assert!(pd.is_dirty(UPAGE));

        pd.set_accessed(UPAGE, false);
        pd.set_dirty(UPAGE, false);
        assert!(!pd.is_accessed(UPAGE));
        assert!(!pd.is_dirty(UPAGE));
    }

    #[test]
    fn test_access_faults_like_the_mmu() {
        let mut pd = PageManager::new();
        assert!(!pd.access(UPAGE, false));
        assert!(pd.install(UPAGE, FRAME, false));
        assert!(!pd.access(UPAGE, true));
        assert!(!pd.is_dirty(UPAGE));
    }
}
