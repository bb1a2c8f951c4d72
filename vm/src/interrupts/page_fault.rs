//! Resolves page faults: grows stacks, loads lazily registered pages, and swaps pages back
//! in.

use crate::block::BlockError;
use crate::mem::frame_table::{Backing, Frame, FrameError};
use crate::mem::page::{PageEntry, PageSource};
use crate::system::VmSystem;
use crate::threading::process::{AddressSpace, Pid};
use bitbybit::bitfield;
use core::sync::atomic::Ordering;
use kidneyos_shared::mem::{is_user_vaddr, pg_round_down, PHYS_BASE};
use log::{debug, error, warn};
use spin::Mutex;
use thiserror::Error;

/// The error code the CPU pushes for a page fault.
#[bitfield(u32, default = 0, debug)]
pub struct PageFaultErrorCode {
    /// Set for protection violations, clear if the page was not present.
    #[bit(0, rw)]
    pub present: bool,
    #[bit(1, rw)]
    pub write: bool,
    /// Set if the fault happened in user mode.
    #[bit(2, rw)]
    pub user: bool,
}

/// Everything the handler needs to know about a fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    /// The faulting address, read from `cr2`.
    pub fault_addr: usize,
    pub error_code: PageFaultErrorCode,
    /// Stack pointer in the interrupt frame.
    pub esp: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    StackGrowth,
    Loaded,
    SwappedIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PageFaultError {
    #[error("no address space for process {0}")]
    NoProcess(Pid),
    #[error("rights violation")]
    RightsViolation,
    #[error("{0:#x} is not a user address")]
    NotUserAddress(usize),
    #[error("{0:#x} is not mapped")]
    Unmapped(usize),
    #[error("stack growth to {0:#x} exceeds the stack limit")]
    StackOverflow(usize),
    #[error("write to read-only page {0:#x}")]
    ReadOnly(usize),
    #[error("{0}")]
    Frame(#[from] FrameError),
    #[error("read {read} of {expected} bytes from file")]
    ShortRead { expected: usize, read: usize },
    #[error("swap in failed: {0}")]
    Swap(#[from] BlockError),
    #[error("could not map page {0:#x}")]
    Install(usize),
}

/// What the interrupt handler does after a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Return to the faulting instruction.
    Resolved,
    /// Terminate the faulting process with `status`.
    Kill { status: i32 },
}

/// Resolves a fault by process `pid`.
///
/// `saved_esp` is the user stack pointer saved on entry to the kernel. It decides stack
/// growth for faults in kernel mode, where the interrupt frame holds the kernel stack.
///
/// Any frame allocated along the way is released again if the fault cannot be resolved.
pub fn handle_page_fault(
    vm: &VmSystem,
    pid: Pid,
    fault: &PageFault,
    saved_esp: Option<usize>,
) -> Result<FaultResolution, PageFaultError> {
    vm.faults.fetch_add(1, Ordering::Relaxed);

    if fault.error_code.present() {
        return Err(PageFaultError::RightsViolation);
    }

    let addr = fault.fault_addr;
    if !is_user_vaddr(addr) {
        return Err(PageFaultError::NotUserAddress(addr));
    }
    let upage = pg_round_down(addr);

    let space = vm
        .processes
        .get(pid)
        .ok_or(PageFaultError::NoProcess(pid))?;
    let entry = space.lock().spt.lookup(upage).cloned();

    match entry {
        None => {
            let esp = if fault.error_code.user() {
                Some(fault.esp)
            } else {
                saved_esp
            };
            grow_stack(vm, pid, &space, addr, esp)
        }
        Some(entry) if fault.error_code.write() && !entry.writable => {
            Err(PageFaultError::ReadOnly(upage))
        }
        Some(entry) => load_page(vm, pid, &space, entry),
    }
}

fn grow_stack(
    vm: &VmSystem,
    pid: Pid,
    space: &Mutex<AddressSpace>,
    addr: usize,
    esp: Option<usize>,
) -> Result<FaultResolution, PageFaultError> {
    // A stack pointer within the slack of address zero has no room to grow.
    let Some(lowest) = esp.and_then(|esp| esp.checked_sub(vm.config.stack_slack)) else {
        return Err(PageFaultError::Unmapped(addr));
    };
    if addr < lowest {
        return Err(PageFaultError::Unmapped(addr));
    }
    let upage = pg_round_down(addr);
    if PHYS_BASE - upage > vm.config.stack_limit {
        return Err(PageFaultError::StackOverflow(upage));
    }

    let frame = vm.frames.allocate(pid, &vm.processes, &vm.swap)?;
    if !vm
        .frames
        .bind(frame, pid, space, upage, true, Backing::Zero)
    {
        vm.frames.release(frame);
        return Err(PageFaultError::Install(upage));
    }
    vm.frames.unpin(frame);

    debug!("Page fault: grew stack of process {} to {:#x}", pid, upage);
    Ok(FaultResolution::StackGrowth)
}

fn load_page(
    vm: &VmSystem,
    pid: Pid,
    space: &Mutex<AddressSpace>,
    entry: PageEntry,
) -> Result<FaultResolution, PageFaultError> {
    let upage = entry.upage;
    let frame = vm.frames.allocate(pid, &vm.processes, &vm.swap)?;

    let filled = fill_frame(vm, frame, &entry.source);
    let (backing, resolution) = match filled {
        Ok(filled) => filled,
        Err(err) => {
            vm.frames.release(frame);
            return Err(err);
        }
    };
    let swapped = resolution == FaultResolution::SwappedIn;

    if !vm
        .frames
        .bind(frame, pid, space, upage, entry.writable, backing)
    {
        vm.frames.release(frame);
        if swapped {
            // The slot is already free, so the entry can no longer restore the page.
            space.lock().spt.remove(upage);
        }
        return Err(PageFaultError::Install(upage));
    }

    space.lock().spt.remove(upage);
    vm.frames.unpin(frame);

    debug!(
        "Page fault: {:?} page {:#x} of process {}",
        resolution, upage, pid
    );
    Ok(resolution)
}

/// Fills a freshly allocated, zeroed frame from `source`.
fn fill_frame(
    vm: &VmSystem,
    frame: Frame,
    source: &PageSource,
) -> Result<(Backing, FaultResolution), PageFaultError> {
    match source {
        PageSource::File(mapping) => {
            let read = vm.frames.with_frame_mut(frame, |page| mapping.load(page));
            if read != mapping.read_bytes {
                return Err(PageFaultError::ShortRead {
                    expected: mapping.read_bytes,
                    read,
                });
            }
            Ok((Backing::File(mapping.clone()), FaultResolution::Loaded))
        }
        PageSource::Zero => Ok((Backing::Zero, FaultResolution::Loaded)),
        PageSource::Swap(slot) => {
            vm.frames
                .with_frame_mut(frame, |page| vm.swap.swap_in(*slot, page))?;
            Ok((Backing::Anonymous, FaultResolution::SwappedIn))
        }
    }
}

/// Entry point from the page fault interrupt.
///
/// Faults that cannot be resolved kill the process if they happened in user mode, and
/// halt the kernel otherwise.
pub fn page_fault(
    vm: &VmSystem,
    pid: Pid,
    fault: &PageFault,
    saved_esp: Option<usize>,
) -> FaultDisposition {
    let err = match handle_page_fault(vm, pid, fault, saved_esp) {
        Ok(_) => return FaultDisposition::Resolved,
        Err(err) => err,
    };

    let code = fault.error_code;
    warn!(
        "Page fault at {:#x}: {} error {} page in {} context.",
        fault.fault_addr,
        if code.present() {
            "rights violation"
        } else {
            "not present"
        },
        if code.write() { "writing" } else { "reading" },
        if code.user() { "user" } else { "kernel" },
    );

    if !code.user() {
        error!("Page fault in kernel context: {}", err);
        panic!("Kernel bug - unexpected page fault in kernel: {err}");
    }

    warn!("Killing process {}: {}", pid, err);
    FaultDisposition::Kill { status: -1 }
}
