//! The frame table: every frame of the user pool, who owns it and what page it holds.
//!
//! A frame is free, allocated and pinned, or bound to a user page. Allocation hands out a
//! pinned frame, so the replacement policy never picks it while the fault handler fills
//! it. [`FrameTable::bind`] maps it into the owner's page directory, and the frame becomes
//! evictable once the handler [unpins](FrameTable::unpin) it.
//!
//! Locks are always taken in the order frame table, process table, address space, then
//! swap space or file.

use super::page::{FileMapping, PageEntry, PageSource};
use super::user_pool::UserPool;
use crate::block::BlockError;
use crate::swapping::{PageReplacementPolicy, ReplacementCandidates, SwapSpace};
use crate::threading::process::{AddressSpace, Pid, ProcessTable};
use alloc::{boxed::Box, vec::Vec};
use bitbybit::bitfield;
use log::{debug, error, info};
use spin::Mutex;
use thiserror::Error;

#[bitfield(u8, default = 0)]
pub struct FrameFlags {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    pinned: bool,
    #[bit(2, rw)]
    writable: bool,
}

/// What the page held by a frame is a copy of.
#[derive(Clone, Debug)]
pub enum Backing {
    /// Loaded from a file. Clean pages can be dropped and loaded again.
    File(FileMapping),
    /// Started out zero filled. Clean pages can be dropped.
    Zero,
    /// Only exists in memory, e.g. after it was swapped in.
    Anonymous,
}

#[derive(Clone)]
struct Resident {
    upage: usize,
    backing: Backing,
}

struct FrameEntry {
    flags: FrameFlags,
    owner: Option<Pid>,
    resident: Option<Resident>,
}

impl FrameEntry {
    const FREE: Self = Self {
        flags: FrameFlags::DEFAULT,
        owner: None,
        resident: None,
    };
}

/// A frame handed out by [`FrameTable::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    index: usize,
    phys: usize,
}

impl Frame {
    /// Physical address of the frame.
    pub fn phys(&self) -> usize {
        self.phys
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The evicted page could not be written out. The victim is left untouched.
    #[error("failed to write out evicted page: {0}")]
    WriteBack(#[from] BlockError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub total: usize,
    pub allocated: usize,
    pub evictions: usize,
}

struct FrameTableInner {
    pool: UserPool,
    entries: Box<[FrameEntry]>,
    policy: Box<dyn PageReplacementPolicy>,
    /// Where the next search for a free frame starts.
    position: usize,
    allocated: usize,
    evictions: usize,
}

pub struct FrameTable {
    inner: Mutex<FrameTableInner>,
}

/// Lets the replacement policy inspect frames, and the accessed bits of the pages in them.
struct Candidates<'a> {
    entries: &'a [FrameEntry],
    processes: &'a ProcessTable,
}

impl ReplacementCandidates for Candidates<'_> {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_evictable(&self, index: usize) -> bool {
        let entry = &self.entries[index];
        entry.flags.allocated() && !entry.flags.pinned() && entry.resident.is_some()
    }

    fn take_accessed(&mut self, index: usize) -> bool {
        let entry = &self.entries[index];
        let (Some(owner), Some(resident)) = (entry.owner, &entry.resident) else {
            return false;
        };
        let Some(space) = self.processes.get(owner) else {
            return false;
        };
        let mut space = space.lock();
        let accessed = space.pagedir.is_accessed(resident.upage);
        space.pagedir.set_accessed(resident.upage, false);
        accessed
    }
}

impl FrameTableInner {
    fn frame(&self, index: usize) -> Frame {
        Frame {
            index,
            phys: self.pool.phys(index),
        }
    }

    /// Next fit search for a free frame.
    fn next_free(&mut self) -> Option<usize> {
        let total = self.entries.len();
        let found = (0..total)
            .map(|i| (self.position + i) % total)
            .find(|&i| !self.entries[i].flags.allocated())?;
        self.position = (found + 1) % total;
        Some(found)
    }

    /// The entry for `frame`, which must have been handed out by this table.
    fn entry_mut(&mut self, frame: Frame) -> &mut FrameEntry {
        let known = frame.index < self.entries.len()
            && self.pool.phys(frame.index) == frame.phys
            && self.entries[frame.index].flags.allocated();
        if !known {
            error!("Frame table: unknown frame {:#x}", frame.phys);
            panic!("frame {:#x} is not an allocated user frame", frame.phys);
        }
        &mut self.entries[frame.index]
    }

    fn free(&mut self, index: usize) {
        self.entries[index] = FrameEntry::FREE;
        self.pool.page_mut(index).fill(0);
        self.allocated -= 1;
        self.policy.frame_released(index);
    }

    /// Evicts a page and returns the now free frame it occupied.
    fn evict(&mut self, processes: &ProcessTable, swap: &SwapSpace) -> Result<usize, FrameError> {
        let victim = {
            let mut candidates = Candidates {
                entries: &self.entries,
                processes,
            };
            self.policy.evict_page(&mut candidates)
        };
        let Some(victim) = victim else {
            error!("Frame table: all {} frames are pinned", self.entries.len());
            panic!("no frame found to evict");
        };

        let entry = &self.entries[victim];
        let writable = entry.flags.writable();
        let (Some(owner), Some(resident)) = (entry.owner, entry.resident.clone()) else {
            panic!("frame {victim} was picked for eviction but holds no page");
        };
        let upage = resident.upage;

        // The owner may be exiting, in which case its pages are simply dropped.
        if let Some(space) = processes.get(owner) {
            let mut space = space.lock();
            let source = self.write_out(victim, &space, &resident, swap)?;
            space.pagedir.clear(upage);
            let page = PageEntry {
                upage,
                writable,
                source,
            };
            if let Err(err) = space.spt.insert(page) {
                panic!("evicted page of process {owner}: {err}");
            }
        }

        self.free(victim);
        self.evictions += 1;
        debug!(
            "Frame table: evicted page {:#x} of process {} from frame {}",
            upage, owner, victim
        );
        Ok(victim)
    }

    /// Saves the page in frame `index` wherever it can be restored from.
    fn write_out(
        &self,
        index: usize,
        space: &AddressSpace,
        resident: &Resident,
        swap: &SwapSpace,
    ) -> Result<PageSource, FrameError> {
        let page = self.pool.page(index);
        let dirty = space.pagedir.is_dirty(resident.upage);

        let source = match &resident.backing {
            Backing::File(mapping) if !dirty || mapping.write_back(page) => {
                PageSource::File(mapping.clone())
            }
            Backing::Zero if !dirty => PageSource::Zero,
            _ => PageSource::Swap(swap.swap_out(page)?),
        };
        Ok(source)
    }
}

impl FrameTable {
    /// Registers every frame of `pool` as free.
    pub fn new(pool: UserPool, policy: Box<dyn PageReplacementPolicy>) -> Self {
        let entries: Vec<FrameEntry> = (0..pool.len()).map(|_| FrameEntry::FREE).collect();
        info!("Frame table: {} user frames", entries.len());
        Self {
            inner: Mutex::new(FrameTableInner {
                pool,
                entries: entries.into_boxed_slice(),
                policy,
                position: 0,
                allocated: 0,
                evictions: 0,
            }),
        }
    }

    /// Allocates a zeroed frame for process `owner`, evicting a page if no frame is free.
    ///
    /// The frame comes back pinned. It must be either [bound](Self::bind) and unpinned, or
    /// [released](Self::release).
    pub fn allocate(
        &self,
        owner: Pid,
        processes: &ProcessTable,
        swap: &SwapSpace,
    ) -> Result<Frame, FrameError> {
        let mut inner = self.inner.lock();
        if inner.entries.is_empty() {
            error!("Frame table: the user pool is empty");
            panic!("no frames in the user pool");
        }

        let index = match inner.next_free() {
            Some(index) => index,
            None => inner.evict(processes, swap)?,
        };

        inner.entries[index] = FrameEntry {
            flags: FrameFlags::DEFAULT.with_allocated(true).with_pinned(true),
            owner: Some(owner),
            resident: None,
        };
        inner.pool.page_mut(index).fill(0);
        inner.allocated += 1;

        let frame = inner.frame(index);
        debug!(
            "Frame table: frame {:#x} allocated to process {}",
            frame.phys, owner
        );
        Ok(frame)
    }

    /// Returns `frame` to the pool, zeroing it. The frame must not be mapped anywhere.
    ///
    /// Panics if `frame` is not allocated.
    pub fn release(&self, frame: Frame) {
        let mut inner = self.inner.lock();
        inner.entry_mut(frame);
        inner.free(frame.index);
    }

    /// Maps `frame` at `upage` in `space`, the address space of `owner`.
    ///
    /// Returns `false`, changing nothing, if `upage` is already mapped or the mapping cannot
    /// be installed. The caller then releases the frame. The frame stays pinned either way.
    pub fn bind(
        &self,
        frame: Frame,
        owner: Pid,
        space: &Mutex<AddressSpace>,
        upage: usize,
        writable: bool,
        backing: Backing,
    ) -> bool {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(frame);
        assert_eq!(entry.owner, Some(owner), "binding frame of another process");
        assert!(entry.resident.is_none(), "frame is already bound");

        {
            let mut space = space.lock();
            if space.pagedir.query(upage).is_some()
                || !space.pagedir.install(upage, frame.phys, writable)
            {
                return false;
            }
        }

        entry.flags = entry.flags.with_writable(writable);
        entry.resident = Some(Resident { upage, backing });
        inner.policy.frame_loaded(frame.index);
        true
    }

    /// Makes a bound frame available for eviction.
    pub fn unpin(&self, frame: Frame) {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(frame);
        entry.flags = entry.flags.with_pinned(false);
    }

    /// Runs `f` on the contents of a pinned frame.
    pub fn with_frame_mut<R>(&self, frame: Frame, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.lock();
        assert!(inner.entry_mut(frame).flags.pinned(), "frame is not pinned");
        f(inner.pool.page_mut(frame.index))
    }

    /// Runs `f` on the frame `upage` is mapped to in `space`, setting the accessed bit of
    /// the page, and the dirty bit if `write` is set.
    ///
    /// Returns `None` if the page is not resident, or if `write` is set and the page is
    /// read-only. The frame cannot be evicted while `f` runs.
    pub fn with_user_page<R>(
        &self,
        space: &Mutex<AddressSpace>,
        upage: usize,
        write: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        {
            let mut space = space.lock();
            let phys = space.pagedir.query(upage)?;
            let index = inner.pool.index_of(phys)?;
            if !space.pagedir.access(upage, write) {
                return None;
            }
            Some(f(inner.pool.page_mut(index)))
        }
    }

    /// Releases every frame owned by `pid`. Its page directory is going away, so no
    /// mappings are cleared. Returns the number of frames released.
    pub fn release_process(&self, pid: Pid) -> usize {
        let mut inner = self.inner.lock();
        let owned: Vec<usize> = inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.flags.allocated() && e.owner == Some(pid))
            .map(|(i, _)| i)
            .collect();
        for &index in &owned {
            inner.free(index);
        }
        owned.len()
    }

    pub fn stats(&self) -> FrameStats {
        let inner = self.inner.lock();
        FrameStats {
            total: inner.entries.len(),
            allocated: inner.allocated,
            evictions: inner.evictions,
        }
    }
}
