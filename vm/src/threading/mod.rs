pub mod process;

pub use process::{AddressSpace, Pid, ProcessTable};
