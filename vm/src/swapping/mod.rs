//! The swap partition: page sized slots on the swap block device.

pub mod page_replacement;

use crate::block::{Block, BlockError, BlockManager, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use alloc::sync::Arc;
use bitvec::vec::BitVec;
use core::fmt;
use kidneyos_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};
use log::{debug, error, info};
use spin::Mutex;

pub use page_replacement::{Clock, Fifo, PageReplacementPolicy, ReplacementCandidates};

/// Index of a page sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub usize);

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct SwapInner {
    block: Arc<Block>,
    /// One bit per slot, set while the slot holds a page.
    bitmap: BitVec,
}

impl SwapInner {
    fn in_use(&self, slot: SwapSlot) -> bool {
        slot.0 < self.bitmap.len() && self.bitmap[slot.0]
    }

    // Slots only cover sectors of the device, whose size is a BlockSector.
    #[allow(clippy::cast_possible_truncation)]
    fn sector(slot: SwapSlot, i: usize) -> BlockSector {
        (slot.0 * SECTORS_PER_PAGE + i) as BlockSector
    }
}

pub struct SwapSpace {
    inner: Mutex<SwapInner>,
}

impl SwapSpace {
    pub fn new(block: Arc<Block>) -> Self {
        let slots = block.get_size() as usize / SECTORS_PER_PAGE;
        info!(
            "Swap: {} slots on block device \"{}\"",
            slots,
            block.get_name()
        );
        Self {
            inner: Mutex::new(SwapInner {
                block,
                bitmap: BitVec::repeat(false, slots),
            }),
        }
    }

    /// Sets up swap on the first block device registered for the swap role.
    pub fn init(blocks: &BlockManager) -> Self {
        let Some(block) = blocks.by_role(BlockType::Swap) else {
            error!("Swap: no block device has the swap role");
            panic!("no swap block device found");
        };
        Self::new(block)
    }

    /// Total number of slots.
    pub fn slots(&self) -> usize {
        self.inner.lock().bitmap.len()
    }

    /// Number of slots currently holding a page.
    pub fn used(&self) -> usize {
        self.inner.lock().bitmap.count_ones()
    }

    pub fn is_in_use(&self, slot: SwapSlot) -> bool {
        self.inner.lock().in_use(slot)
    }

    /// Writes `page` to a free slot and returns the slot.
    ///
    /// On an I/O error the slot stays free.
    pub fn swap_out(&self, page: &[u8]) -> Result<SwapSlot, BlockError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        let mut inner = self.inner.lock();

        let Some(index) = inner.bitmap.first_zero() else {
            error!("Swap: all {} slots are in use", inner.bitmap.len());
            panic!("swap partition is full");
        };
        let slot = SwapSlot(index);

        for (i, sector) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            inner.block.write(SwapInner::sector(slot, i), sector)?;
        }
        inner.bitmap.set(index, true);

        debug!("Swap: wrote page to slot {}", slot);
        Ok(slot)
    }

    /// Reads the page in `slot` into `page` and frees the slot.
    ///
    /// The slot is only freed once the whole page has been read; on an I/O error it still
    /// holds the page.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8]) -> Result<(), BlockError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        let mut inner = self.inner.lock();

        if !inner.in_use(slot) {
            error!("Swap: read of free slot {}", slot);
            panic!("swap in of free swap slot {slot}");
        }

        for (i, sector) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            inner.block.read(SwapInner::sector(slot, i), sector)?;
        }
        inner.bitmap.set(slot.0, false);

        debug!("Swap: read page from slot {}", slot);
        Ok(())
    }

    /// Releases `slot` without reading it, for pages that are no longer needed.
    pub fn swap_free(&self, slot: SwapSlot) {
        let mut inner = self.inner.lock();
        if !inner.in_use(slot) {
            error!("Swap: double free of slot {}", slot);
            panic!("freeing free swap slot {slot}");
        }
        inner.bitmap.set(slot.0, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ram_disk::RamDisk;
    use alloc::{boxed::Box, vec, vec::Vec};
    use kidneyos_shared::sizes::{SWAP_SECTORS, SWAP_SIZE, SWAP_SLOTS};
    use proptest::prelude::*;

    fn swap_with_slots(slots: usize) -> SwapSpace {
        let sectors = (slots * SECTORS_PER_PAGE) as BlockSector;
        let mut blocks = BlockManager::new();
        blocks.register_block(BlockType::Swap, "hdb2", sectors, Box::new(RamDisk::new(sectors)));
        SwapSpace::init(&blocks)
    }

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; PAGE_FRAME_SIZE]
    }

    #[test]
    fn test_slot_count_from_device_size() {
        let swap = swap_with_slots(4);
        assert_eq!(swap.slots(), 4);
        assert_eq!(swap.used(), 0);
    }

    #[test]
    fn test_default_partition_size() {
        let mut blocks = BlockManager::new();
        blocks.register_block(
            BlockType::Swap,
            "hdb2",
            SWAP_SECTORS,
            Box::new(RamDisk::new(SWAP_SECTORS)),
        );
        let swap = SwapSpace::init(&blocks);
        assert_eq!(swap.slots() * PAGE_FRAME_SIZE, SWAP_SIZE as usize);
        assert_eq!(swap.slots(), SWAP_SLOTS);
    }

    #[test]
    #[should_panic(expected = "no swap block device found")]
    fn test_init_without_swap_device() {
        let mut blocks = BlockManager::new();
        blocks.register_block(BlockType::FileSystem, "hda1", 8, Box::new(RamDisk::new(8)));
        SwapSpace::init(&blocks);
    }

    #[test]
    fn test_swap_in_frees_slot() {
        let swap = swap_with_slots(2);
        let slot = swap.swap_out(&page_of(5)).expect("write succeeds");
        assert!(swap.is_in_use(slot));

        let mut page = page_of(0);
        swap.swap_in(slot, &mut page).expect("read succeeds");
        assert_eq!(page, page_of(5));
        assert!(!swap.is_in_use(slot));
        assert_eq!(swap.used(), 0);
    }

    #[test]
    #[should_panic(expected = "swap in of free swap slot")]
    fn test_swap_in_free_slot() {
        let swap = swap_with_slots(2);
        swap.swap_in(SwapSlot(1), &mut page_of(0)).ok();
    }

    #[test]
    #[should_panic(expected = "freeing free swap slot")]
    fn test_double_free() {
        let swap = swap_with_slots(2);
        let slot = swap.swap_out(&page_of(1)).expect("write succeeds");
        swap.swap_free(slot);
        swap.swap_free(slot);
    }

    #[test]
    #[should_panic(expected = "freeing free swap slot 0")]
    fn test_free_of_never_used_slot() {
        let swap = swap_with_slots(2);
        swap.swap_free(SwapSlot(0));
    }

    #[test]
    fn test_full_partition_keeps_bitmap() {
        let swap = swap_with_slots(3);
        for i in 0..3 {
            swap.swap_out(&page_of(i)).expect("write succeeds");
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            swap.swap_out(&page_of(9)).ok();
        }));
        assert!(result.is_err());

        // Every slot still holds its page.
        assert_eq!(swap.used(), 3);
        for i in 0..3 {
            let mut page = page_of(0);
            swap.swap_in(SwapSlot(i), &mut page).expect("read succeeds");
            assert_eq!(page, page_of(i as u8));
        }
    }

    #[test]
    fn test_failed_write_leaves_slot_free() {
        let sectors = SECTORS_PER_PAGE as BlockSector;
        let mut blocks = BlockManager::new();
        blocks.register_block(
            BlockType::Swap,
            "hdb2",
            sectors,
            Box::new(RamDisk::failing_writes(sectors)),
        );
        let swap = SwapSpace::init(&blocks);
        assert_eq!(swap.swap_out(&page_of(1)), Err(BlockError::WriteError));
        assert_eq!(swap.used(), 0);
    }

    #[test]
    fn test_failed_read_keeps_slot() {
        let sectors = SECTORS_PER_PAGE as BlockSector;
        let mut blocks = BlockManager::new();
        blocks.register_block(
            BlockType::Swap,
            "hdb2",
            sectors,
            Box::new(RamDisk::failing_reads(sectors)),
        );
        let swap = SwapSpace::init(&blocks);
        let slot = swap.swap_out(&page_of(1)).expect("write succeeds");
        assert_eq!(
            swap.swap_in(slot, &mut page_of(0)),
            Err(BlockError::ReadError)
        );
        assert!(swap.is_in_use(slot));
    }

    proptest! {
        #[test]
        fn prop_swap_round_trip(seed in any::<u8>(), fill in 1usize..4) {
            let swap = swap_with_slots(4);
            let pages: Vec<Vec<u8>> = (0..fill)
                .map(|n| (0..PAGE_FRAME_SIZE).map(|i| (i as u8) ^ seed ^ (n as u8)).collect())
                .collect();
            let slots: Vec<SwapSlot> = pages
                .iter()
                .map(|p| swap.swap_out(p).expect("write succeeds"))
                .collect();
            prop_assert_eq!(swap.used(), fill);
            for (slot, expected) in slots.into_iter().zip(&pages).rev() {
                let mut page = page_of(0);
                swap.swap_in(slot, &mut page).expect("read succeeds");
                prop_assert_eq!(&page, expected);
            }
            prop_assert_eq!(swap.used(), 0);
        }
    }
}
