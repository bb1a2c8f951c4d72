use crate::block::{BlockError, BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use alloc::{vec, vec::Vec};

/// A block device driver backed by kernel memory.
///
/// Used for the swap partition when no disk is attached, and by tests.
pub struct RamDisk {
    data: Vec<u8>,
    fail_reads: bool,
    fail_writes: bool,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: vec![0; sectors as usize * BLOCK_SECTOR_SIZE],
            fail_reads: false,
            fail_writes: false,
        }
    }

    /// A disk whose every read reports an I/O error.
    pub fn failing_reads(sectors: BlockSector) -> Self {
        Self {
            fail_reads: true,
            ..Self::new(sectors)
        }
    }

    /// A disk whose every write reports an I/O error.
    pub fn failing_writes(sectors: BlockSector) -> Self {
        Self {
            fail_writes: true,
            ..Self::new(sectors)
        }
    }

    fn sector_range(sector: BlockSector) -> core::ops::Range<usize> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        start..start + BLOCK_SECTOR_SIZE
    }
}

impl BlockOp for RamDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        if self.fail_reads {
            return Err(BlockError::ReadError);
        }
        let src = self
            .data
            .get(Self::sector_range(sector))
            .ok_or(BlockError::ReadError)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if self.fail_writes {
            return Err(BlockError::WriteError);
        }
        let dst = self
            .data
            .get_mut(Self::sector_range(sector))
            .ok_or(BlockError::WriteError)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}
