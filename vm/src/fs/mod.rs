//! The file interface the pager reads program segments from and writes dirty
//! file-backed pages back to.

pub mod tempfs;

use alloc::sync::Arc;

pub use tempfs::TempFile;

/// Byte offset within a file.
pub type Offset = u64;

/// A file that pages can be loaded from and written back to.
///
/// Both operations are positional, so concurrent faults on pages of the same
/// file never race on a shared cursor.
pub trait BackingFile: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes actually read, which is short at end of file.
    fn read_at(&self, buf: &mut [u8], offset: Offset) -> usize;

    /// Writes `buf` at `offset`. Returns the number of bytes actually written.
    fn write_at(&self, buf: &[u8], offset: Offset) -> usize;

    /// Current length of the file in bytes.
    fn len(&self) -> Offset;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handle to an open file.
pub type FileHandle = Arc<dyn BackingFile>;
