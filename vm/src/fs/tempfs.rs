use super::{BackingFile, Offset};
use alloc::vec::Vec;
use core::cmp::min;
use spin::Mutex;

/// In-memory file.
///
/// Files never grow past the length they were created with, the same way
/// writes to an executable cannot extend it.
pub struct TempFile {
    data: Mutex<Vec<u8>>,
}

impl TempFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// A copy of the whole file.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BackingFile for TempFile {
    fn read_at(&self, buf: &mut [u8], offset: Offset) -> usize {
        let data = self.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= data.len() {
            return 0;
        }
        let count = min(buf.len(), data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        count
    }

    fn write_at(&self, buf: &[u8], offset: Offset) -> usize {
        let mut data = self.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= data.len() {
            return 0;
        }
        let count = min(buf.len(), data.len() - start);
        data[start..start + count].copy_from_slice(&buf[..count]);
        count
    }

    fn len(&self) -> Offset {
        self.data.lock().len() as Offset
    }
}
