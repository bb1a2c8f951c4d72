use crate::sizes::{KB, MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// Top of user virtual memory. User stacks grow down from here.
pub const PHYS_BASE: usize = OFFSET;

/// Number of block sectors that hold one page.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / SECTOR_SIZE as usize;

/// Largest size a user stack may grow to.
pub const USER_STACK_LIMIT: usize = 8 * MB;

/// How far below the stack pointer an access may land and still count as a push.
///
/// `pusha` writes 32 bytes below `esp` before adjusting it.
pub const USER_STACK_SLACK: usize = 32;

/// Rounds `addr` down to the start of the page containing it.
#[inline]
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary.
#[inline]
pub const fn pg_round_up(addr: usize) -> usize {
    pg_round_down(addr + PAGE_FRAME_SIZE - 1)
}

/// Offset of `addr` within its page.
#[inline]
pub const fn pg_ofs(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

/// Virtual page number of `addr`.
#[inline]
pub const fn pg_no(addr: usize) -> usize {
    addr / PAGE_FRAME_SIZE
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < PHYS_BASE
}

#[inline]
pub const fn is_kernel_vaddr(addr: usize) -> bool {
    addr >= PHYS_BASE
}
