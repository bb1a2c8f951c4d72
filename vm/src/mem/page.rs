//! Supplemental page table: how to bring back a user page that is not resident.

use crate::fs::{FileHandle, Offset};
use crate::swapping::SwapSlot;
use alloc::collections::BTreeMap;
use core::fmt;
use kidneyos_shared::mem::{is_user_vaddr, pg_round_down, PAGE_FRAME_SIZE};
use thiserror::Error;

/// The part of a file a page is loaded from.
///
/// The first `read_bytes` bytes of the page come from the file at `offset`, the remaining
/// `zero_bytes` are zero. Together they always make up exactly one page.
#[derive(Clone)]
pub struct FileMapping {
    pub file: FileHandle,
    pub offset: Offset,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl FileMapping {
    pub fn new(
        file: FileHandle,
        offset: Offset,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Result<Self, SptError> {
        if read_bytes.checked_add(zero_bytes) != Some(PAGE_FRAME_SIZE) {
            return Err(SptError::SizeMismatch {
                read_bytes,
                zero_bytes,
            });
        }
        Ok(Self {
            file,
            offset,
            read_bytes,
            zero_bytes,
        })
    }

    /// Fills `page` from the file. Returns the number of bytes read, which is less than
    /// `read_bytes` if the file is too short.
    pub fn load(&self, page: &mut [u8]) -> usize {
        let (data, zeros) = page.split_at_mut(self.read_bytes);
        zeros.fill(0);
        self.file.read_at(data, self.offset)
    }

    /// Writes a modified page back to the file.
    ///
    /// Only the `read_bytes` that came from the file are written. If the program also wrote
    /// to the zero-filled tail the page cannot be represented by the file, and nothing is
    /// written. Returns whether the file now holds the page.
    pub fn write_back(&self, page: &[u8]) -> bool {
        let (data, zeros) = page.split_at(self.read_bytes);
        if zeros.iter().any(|&b| b != 0) {
            return false;
        }
        self.file.write_at(data, self.offset) == self.read_bytes
    }
}

impl fmt::Debug for FileMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMapping")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish_non_exhaustive()
    }
}

/// Where the contents of a non-resident page live.
#[derive(Clone, Debug)]
pub enum PageSource {
    File(FileMapping),
    Swap(SwapSlot),
    /// All zeros.
    Zero,
}

/// A supplemental page table entry.
#[derive(Clone, Debug)]
pub struct PageEntry {
    pub upage: usize,
    pub writable: bool,
    pub source: PageSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SptError {
    #[error("page {0:#x} already has a supplemental page table entry")]
    Duplicate(usize),
    #[error("address {0:#x} is not page aligned")]
    Unaligned(usize),
    #[error("{read_bytes} read bytes and {zero_bytes} zero bytes do not make up whole pages")]
    SizeMismatch { read_bytes: usize, zero_bytes: usize },
    #[error("page {0:#x} is already resident")]
    AlreadyResident(usize),
    #[error("address {0:#x} is not a user address")]
    NotUserAddress(usize),
}

/// Per-process map from user page to the entry describing how to load it.
#[derive(Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<usize, PageEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `upage` to be loaded lazily: from `file` when one is given, as a zero page
    /// otherwise.
    pub fn register(
        &mut self,
        file: Option<FileHandle>,
        offset: Offset,
        read_bytes: usize,
        zero_bytes: usize,
        upage: usize,
        writable: bool,
    ) -> Result<(), SptError> {
        let source = match file {
            Some(file) => PageSource::File(FileMapping::new(file, offset, read_bytes, zero_bytes)?),
            None if read_bytes.checked_add(zero_bytes) == Some(PAGE_FRAME_SIZE) => {
                PageSource::Zero
            }
            None => {
                return Err(SptError::SizeMismatch {
                    read_bytes,
                    zero_bytes,
                })
            }
        };
        self.insert(PageEntry {
            upage,
            writable,
            source,
        })
    }

    /// Adds `entry`, refusing a second entry for the same page.
    pub fn insert(&mut self, entry: PageEntry) -> Result<(), SptError> {
        let upage = entry.upage;
        if !is_user_vaddr(upage) {
            return Err(SptError::NotUserAddress(upage));
        }
        if upage % PAGE_FRAME_SIZE != 0 {
            return Err(SptError::Unaligned(upage));
        }
        if self.entries.contains_key(&upage) {
            return Err(SptError::Duplicate(upage));
        }
        self.entries.insert(upage, entry);
        Ok(())
    }

    /// The entry for the page containing `addr`.
    pub fn lookup(&self, addr: usize) -> Option<&PageEntry> {
        self.entries.get(&pg_round_down(addr))
    }

    /// Drops the entry for `upage` once the page is resident.
    pub fn remove(&mut self, upage: usize) -> Option<PageEntry> {
        self.entries.remove(&upage)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empties the table, yielding every entry.
    pub fn drain(&mut self) -> impl Iterator<Item = PageEntry> {
        core::mem::take(&mut self.entries).into_values()
    }
}
