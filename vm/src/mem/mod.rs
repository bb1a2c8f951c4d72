pub mod frame_table;
pub mod page;
pub mod user;
pub mod user_pool;

pub use frame_table::{Backing, Frame, FrameError, FrameStats, FrameTable};
pub use kidneyos_shared::mem::{
    pg_ofs, pg_round_down, pg_round_up, PAGE_FRAME_SIZE, PHYS_BASE, SECTORS_PER_PAGE,
    USER_STACK_LIMIT, USER_STACK_SLACK,
};
pub use page::{FileMapping, PageEntry, PageSource, SptError, SupplementalPageTable};
pub use user_pool::UserPool;

/// Which page replacement policy the frame table evicts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacementPolicyKind {
    /// Second chance.
    #[default]
    Clock,
    Fifo,
}

/// Runtime tunables of the virtual memory system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Largest size, in bytes, a user stack may grow to.
    pub stack_limit: usize,
    /// How far below the stack pointer a fault may land and still grow the stack.
    pub stack_slack: usize,
    pub replacement: ReplacementPolicyKind,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_limit: USER_STACK_LIMIT,
            stack_slack: USER_STACK_SLACK,
            replacement: ReplacementPolicyKind::default(),
        }
    }
}
