pub const KB: usize = 1024;
pub const MB: usize = KB * KB;
pub const GB: usize = MB * KB;

/// Bytes in one disk sector.
pub const SECTOR_SIZE: u32 = 512;

/// Size of the swap partition the build image creates, in sectors.
pub const SWAP_SECTORS: u32 = 8192;
pub const SWAP_SIZE: u32 = SECTOR_SIZE * SWAP_SECTORS;
/// Page slots on a partition of `SWAP_SECTORS`.
pub const SWAP_SLOTS: usize = SWAP_SIZE as usize / (4 * KB);
