use super::block_error::BlockError;
use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use log::info;
use spin::Mutex;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = kidneyos_shared::sizes::SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// The role a block device plays in the system.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// OS Kernel
    Kernel,
    /// File system
    FileSystem,
    /// Scratch
    Scratch,
    /// Swap
    Swap,
    /// "Raw" device with unidentified contents
    Raw,
    /// Owned by non-KidneyOS operating system
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Kernel => write!(f, "Kernel"),
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Raw => write!(f, "Raw"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers
///
/// Callers guarantee that `sector` is in bounds and that `buf` holds exactly
/// `BLOCK_SECTOR_SIZE` bytes.
pub trait BlockOp: Send {
    /// Read a block sector
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// A block device
///
/// **Note:** Once blocks are registered they are immutable, apart from their
/// driver state and I/O counters.
pub struct Block {
    /// Unique and immutable index of the block
    index: usize,
    /// The name of the block device
    block_name: String,

    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: Mutex<Box<dyn BlockOp>>,

    /// The size of the block device in sectors
    block_size: BlockSector,

    /// The read count
    read_count: AtomicU32,
    /// The write count
    write_count: AtomicU32,
}

impl Block {
    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid(buf.len()));
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            return Err(BlockError::SectorOutOfBounds {
                sector,
                size: self.block_size,
            });
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.lock().read(sector, buf)?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        if self.block_type == BlockType::Foreign {
            return Err(BlockError::Foreign);
        }

        self.driver.lock().write(sector, buf)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn get_index(&self) -> usize {
        self.index
    }
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }
    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "    {:04} | \"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.index,
            self.block_name,
            self.block_type,
            self.block_size,
            self.read_count(),
            self.write_count()
        )
    }
}

/// Maintain a list of blocks
#[derive(Default)]
pub struct BlockManager {
    /// All the block devices
    all_blocks: Vec<Arc<Block>>,
}

impl BlockManager {
    /// Create a new block manager
    pub fn new() -> Self {
        BlockManager::with_capacity(10)
    }

    /// Create a new block manager with a given capacity
    pub fn with_capacity(cap: usize) -> Self {
        BlockManager {
            all_blocks: Vec::with_capacity(cap),
        }
    }

    /// Register a block device with the given `name`. The block device's `size` in sectors and its
    /// `device_type` must be provided, as well as the `driver` to access the block.
    ///
    /// Returns the index of the block device.
    pub fn register_block(
        &mut self,
        block_type: BlockType,
        block_name: &str,
        block_size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> usize {
        let index = self.all_blocks.len();
        self.all_blocks.push(Arc::new(Block {
            index,
            block_name: String::from(block_name),
            block_type,
            driver: Mutex::new(driver),
            block_size,
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
        }));

        info!(
            "Registered block device \"{}\" ({} type) with {} sectors",
            block_name, block_type, block_size,
        );

        index
    }

    /// Get the block device with the given `index`.
    ///
    /// If the index is out of bounds, returns `None`.
    pub fn by_id(&self, idx: usize) -> Option<Arc<Block>> {
        self.all_blocks.get(idx).cloned()
    }

    /// Get the first block device registered for `role`.
    pub fn by_role(&self, role: BlockType) -> Option<Arc<Block>> {
        self.all_blocks
            .iter()
            .find(|b| b.block_type == role)
            .cloned()
    }

    /// Get the block device with the given `name`.
    ///
    /// **Note:** This function is very inefficient and should be avoided.
    pub fn by_name(&self, name: &str) -> Option<Arc<Block>> {
        self.all_blocks
            .iter()
            .find(|b| b.block_name == name)
            .cloned()
    }
}

impl fmt::Display for BlockManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Block Devices:")?;
        for block in self.all_blocks.iter() {
            writeln!(f, "{}", block)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ram_disk::RamDisk;
    use alloc::vec;

    fn manager_with_swap(sectors: BlockSector) -> BlockManager {
        let mut manager = BlockManager::new();
        manager.register_block(
            BlockType::Scratch,
            "hdb1",
            4,
            Box::new(RamDisk::new(4)),
        );
        manager.register_block(
            BlockType::Swap,
            "hdb2",
            sectors,
            Box::new(RamDisk::new(sectors)),
        );
        manager
    }

    #[test]
    fn test_lookup_by_role_and_name() {
        let manager = manager_with_swap(16);
        let swap = manager.by_role(BlockType::Swap).expect("swap registered");
        assert_eq!(swap.get_name(), "hdb2");
        assert_eq!(swap.get_index(), 1);
        assert_eq!(swap.get_size(), 16);
        assert!(manager.by_role(BlockType::FileSystem).is_none());
        assert_eq!(
            manager.by_name("hdb1").map(|b| b.get_type()),
            Some(BlockType::Scratch)
        );
        assert!(manager.by_id(2).is_none());
    }

    #[test]
    fn test_read_write_counts() {
        let manager = manager_with_swap(16);
        let block = manager.by_role(BlockType::Swap).expect("swap registered");

        let data = [0xab; BLOCK_SECTOR_SIZE];
        block.write(3, &data).expect("write in bounds");
        let mut buf = [0; BLOCK_SECTOR_SIZE];
        block.read(3, &mut buf).expect("read in bounds");

        assert_eq!(buf, data);
        assert_eq!(block.read_count(), 1);
        assert_eq!(block.write_count(), 1);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let manager = manager_with_swap(16);
        let block = manager.by_role(BlockType::Swap).expect("swap registered");

        let mut buf = [0; BLOCK_SECTOR_SIZE];
        assert_eq!(
            block.read(16, &mut buf),
            Err(BlockError::SectorOutOfBounds {
                sector: 16,
                size: 16
            })
        );
        let mut short = vec![0; BLOCK_SECTOR_SIZE - 1];
        assert_eq!(
            block.read(0, &mut short),
            Err(BlockError::BufferInvalid(BLOCK_SECTOR_SIZE - 1))
        );
        assert_eq!(block.read_count(), 0);
    }

    #[test]
    fn test_foreign_blocks_are_read_only() {
        let mut manager = BlockManager::new();
        manager.register_block(BlockType::Foreign, "hda3", 2, Box::new(RamDisk::new(2)));
        let block = manager.by_id(0).expect("registered");
        assert_eq!(
            block.write(0, &[0; BLOCK_SECTOR_SIZE]),
            Err(BlockError::Foreign)
        );
    }
}
