use crate::fs::{FileHandle, Offset};
use crate::mem::page::{SptError, SupplementalPageTable};
use crate::paging::PageDirectory;
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicU16, Ordering};
use kidneyos_shared::mem::{is_user_vaddr, PAGE_FRAME_SIZE};
use spin::Mutex;

pub type Pid = u16;
pub type AtomicPid = AtomicU16;

/// The virtual memory of one user process.
pub struct AddressSpace {
    pid: Pid,
    pub pagedir: Box<dyn PageDirectory>,
    pub spt: SupplementalPageTable,
}

impl AddressSpace {
    pub fn new(pid: Pid, pagedir: Box<dyn PageDirectory>) -> Self {
        Self {
            pid,
            pagedir,
            spt: SupplementalPageTable::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Registers one page to be loaded on first access. See
    /// [`SupplementalPageTable::register`].
    pub fn register_page(
        &mut self,
        file: Option<FileHandle>,
        offset: Offset,
        read_bytes: usize,
        zero_bytes: usize,
        upage: usize,
        writable: bool,
    ) -> Result<(), SptError> {
        if is_user_vaddr(upage) && self.pagedir.query(upage).is_some() {
            return Err(SptError::AlreadyResident(upage));
        }
        self.spt
            .register(file, offset, read_bytes, zero_bytes, upage, writable)
    }

    /// Registers a program segment starting at `upage`: `read_bytes` bytes of `file` from
    /// `offset`, followed by `zero_bytes` zeros.
    ///
    /// Pages with nothing to read become zero pages. On error, pages registered before the
    /// failing one stay registered.
    pub fn register_segment(
        &mut self,
        file: Option<FileHandle>,
        mut offset: Offset,
        mut upage: usize,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) -> Result<(), SptError> {
        if upage % PAGE_FRAME_SIZE != 0 {
            return Err(SptError::Unaligned(upage));
        }
        if (read_bytes + zero_bytes) % PAGE_FRAME_SIZE != 0 {
            return Err(SptError::SizeMismatch {
                read_bytes,
                zero_bytes,
            });
        }

        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_FRAME_SIZE);
            let page_zero_bytes = PAGE_FRAME_SIZE - page_read_bytes;
            let page_file = file.clone().filter(|_| page_read_bytes > 0);

            self.register_page(
                page_file,
                offset,
                page_read_bytes,
                page_zero_bytes,
                upage,
                writable,
            )?;

            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            offset += page_read_bytes as Offset;
            upage += PAGE_FRAME_SIZE;
        }
        Ok(())
    }
}

/// Maps process ids to address spaces.
///
/// Frames refer to their owner by id, so a process that exits leaves nothing dangling
/// behind in the frame table.
pub struct ProcessTable {
    content: Mutex<BTreeMap<Pid, Arc<Mutex<AddressSpace>>>>,
    next_pid: AtomicPid,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self {
            content: Mutex::new(BTreeMap::new()),
            next_pid: AtomicPid::new(1),
        }
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_pid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if pid == 0 {
            panic!("PID overflow");
        }
        pid
    }

    /// Creates an empty address space around `pagedir` and returns its process id.
    pub fn add(&self, pagedir: Box<dyn PageDirectory>) -> Pid {
        let pid = self.allocate_pid();
        let space = Arc::new(Mutex::new(AddressSpace::new(pid, pagedir)));
        let previous = self.content.lock().insert(pid, space);
        assert!(
            previous.is_none(),
            "Address space with pid {pid} already added to process table."
        );
        pid
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<Mutex<AddressSpace>>> {
        self.content.lock().remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Mutex<AddressSpace>>> {
        self.content.lock().get(&pid).cloned()
    }

    pub fn len(&self) -> usize {
        self.content.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.lock().is_empty()
    }
}
