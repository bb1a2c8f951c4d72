use crate::block::BlockManager;
use crate::mem::frame_table::FrameTable;
use crate::mem::page::PageSource;
use crate::mem::{ReplacementPolicyKind, UserPool, VmConfig};
use crate::paging::PageDirectory;
use crate::swapping::{Clock, Fifo, PageReplacementPolicy, SwapSpace};
use crate::threading::process::{Pid, ProcessTable};
use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{debug, info};
use once_cell::race::OnceBox;

/// Kernel-lifetime virtual memory state.
pub struct VmSystem {
    pub frames: FrameTable,
    pub swap: SwapSpace,
    pub processes: ProcessTable,
    pub config: VmConfig,
    /// Number of page faults handled.
    pub(crate) faults: AtomicUsize,
}

impl VmSystem {
    /// Sets up the frame table over `pool` and swap on the swap device in `blocks`.
    ///
    /// Panics if there is no swap device.
    pub fn new(pool: UserPool, blocks: &BlockManager, config: VmConfig) -> Self {
        let policy: Box<dyn PageReplacementPolicy> = match config.replacement {
            ReplacementPolicyKind::Clock => Box::new(Clock::default()),
            ReplacementPolicyKind::Fifo => Box::new(Fifo::default()),
        };
        Self {
            frames: FrameTable::new(pool, policy),
            swap: SwapSpace::init(blocks),
            processes: ProcessTable::new(),
            config,
            faults: AtomicUsize::new(0),
        }
    }

    /// Creates an empty address space for a new process.
    pub fn create_process(&self, pagedir: Box<dyn PageDirectory>) -> Pid {
        let pid = self.processes.add(pagedir);
        debug!("VM: created address space for process {}", pid);
        pid
    }

    /// Tears down the address space of `pid`, releasing its frames and swap slots.
    pub fn exit_process(&self, pid: Pid) {
        // Once removed, eviction no longer finds the process and drops its pages instead.
        let Some(space) = self.processes.remove(pid) else {
            return;
        };
        let frames = self.frames.release_process(pid);

        let mut slots = 0;
        for entry in space.lock().spt.drain() {
            if let PageSource::Swap(slot) = entry.source {
                self.swap.swap_free(slot);
                slots += 1;
            }
        }
        debug!(
            "VM: process {} exited, released {} frames and {} swap slots",
            pid, frames, slots
        );
    }

    pub fn page_faults(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn print_stats(&self) {
        let frames = self.frames.stats();
        info!("Exception: {} page faults", self.page_faults());
        info!(
            "Frames: {}/{} allocated, {} evictions",
            frames.allocated, frames.total, frames.evictions
        );
        info!("Swap: {}/{} slots in use", self.swap.used(), self.swap.slots());
    }
}

static VM: OnceBox<VmSystem> = OnceBox::new();

/// Publishes the virtual memory system. Called once at boot.
pub fn vm_init(system: VmSystem) -> &'static VmSystem {
    if VM.set(Box::new(system)).is_err() {
        panic!("Virtual memory initialized twice.");
    }
    unwrap_vm()
}

pub fn unwrap_vm() -> &'static VmSystem {
    VM.get().expect("Virtual memory not initialized.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockSector, BlockType};
    use crate::drivers::ram_disk::RamDisk;
    use crate::interrupts::page_fault::{handle_page_fault, PageFault, PageFaultErrorCode};
    use crate::mem::user::{check_and_copy_user_memory, copy_to_user_memory};
    use crate::paging::PageManager;
    use alloc::{sync::Arc, vec::Vec};
    use kidneyos_shared::mem::{PAGE_FRAME_SIZE, PHYS_BASE, SECTORS_PER_PAGE};

    fn blocks(swap_slots: usize) -> BlockManager {
        let sectors = (swap_slots * SECTORS_PER_PAGE) as BlockSector;
        let mut blocks = BlockManager::new();
        blocks.register_block(BlockType::Swap, "swap", sectors, Box::new(RamDisk::new(sectors)));
        blocks
    }

    /// A user write fault at `esp`, with the stack pointer at the faulting address.
    fn stack_fault(vm: &VmSystem, pid: Pid, esp: usize) {
        let fault = PageFault {
            fault_addr: esp,
            error_code: PageFaultErrorCode::DEFAULT.with_user(true).with_write(true),
            esp,
        };
        handle_page_fault(vm, pid, &fault, None).expect("fault resolves");
    }

    fn push(vm: &VmSystem, pid: Pid, page: usize) {
        let space = vm.processes.get(pid).expect("process exists");
        let esp = PHYS_BASE - page * PAGE_FRAME_SIZE;
        stack_fault(vm, pid, esp);
        assert!(copy_to_user_memory(&vm.frames, &space, esp, &[1]));
    }

    #[test]
    fn test_exit_releases_frames_and_slots() {
        let vm = VmSystem::new(UserPool::leaked(2, 0x0010_0000), &blocks(4), VmConfig::default());
        let pid = vm.create_process(Box::new(PageManager::new()));
        for page in 1..=4 {
            push(&vm, pid, page);
        }
        assert_eq!(vm.frames.stats().allocated, 2);
        assert_eq!(vm.swap.used(), 2);

        vm.exit_process(pid);
        assert_eq!(vm.frames.stats().allocated, 0);
        assert_eq!(vm.swap.used(), 0);
        assert!(vm.processes.get(pid).is_none());

        // Exiting twice is harmless.
        vm.exit_process(pid);
    }

    #[test]
    fn test_concurrent_faults_under_eviction() {
        use std::thread;

        const THREADS: u8 = 4;
        const PAGES: usize = 8;
        const ROUNDS: u8 = 3;

        let vm = Arc::new(VmSystem::new(
            UserPool::leaked(usize::from(THREADS), 0x0010_0000),
            &blocks(usize::from(THREADS) * PAGES),
            VmConfig::default(),
        ));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let vm = vm.clone();
                thread::spawn(move || {
                    let pid = vm.create_process(Box::new(PageManager::new()));
                    let space = vm.processes.get(pid).expect("process exists");
                    let addr = |page: usize| PHYS_BASE - page * PAGE_FRAME_SIZE;

                    for round in 0..ROUNDS {
                        // Other threads may evict a page between the fault and the copy.
                        for page in 1..=PAGES {
                            let mark = [t, round, page as u8];
                            while !copy_to_user_memory(&vm.frames, &space, addr(page), &mark) {
                                stack_fault(&vm, pid, addr(page));
                            }
                        }
                        for page in 1..=PAGES {
                            let bytes = loop {
                                let copied =
                                    check_and_copy_user_memory(&vm.frames, &space, addr(page), 3);
                                if let Some(bytes) = copied {
                                    break bytes;
                                }
                                stack_fault(&vm, pid, addr(page));
                            };
                            assert_eq!(bytes, [t, round, page as u8]);
                        }
                    }
                    vm.exit_process(pid);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread finished");
        }

        let stats = vm.frames.stats();
        assert_eq!(stats.allocated, 0);
        assert!(stats.evictions > 0);
        assert_eq!(vm.swap.used(), 0);
        assert!(vm.processes.is_empty());
    }

    #[test]
    fn test_fifo_config() {
        let config = VmConfig {
            replacement: ReplacementPolicyKind::Fifo,
            ..VmConfig::default()
        };
        let vm = VmSystem::new(UserPool::leaked(1, 0x0010_0000), &blocks(2), config);
        let pid = vm.create_process(Box::new(PageManager::new()));
        push(&vm, pid, 1);
        push(&vm, pid, 2);
        assert_eq!(vm.frames.stats().evictions, 1);
        assert_eq!(vm.page_faults(), 2);
        vm.print_stats();
    }

    #[test]
    fn test_global_instance() {
        let vm = vm_init(VmSystem::new(
            UserPool::leaked(1, 0x0010_0000),
            &blocks(1),
            VmConfig::default(),
        ));
        assert!(core::ptr::eq(vm, unwrap_vm()));
    }
}
