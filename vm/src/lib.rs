//! Demand paging for KidneyOS user processes.
//!
//! User pages are materialized on first access by the page fault handler, from a program
//! file, as zeros, or from swap. When the user pool runs out of frames the frame table
//! evicts a page, writing it back to its file or to the swap partition.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod interrupts;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod system;
pub mod threading;

pub use interrupts::{handle_page_fault, page_fault, FaultDisposition, PageFault};
pub use system::{unwrap_vm, vm_init, VmSystem};
