use alloc::boxed::Box;
use core::{ptr::NonNull, slice};
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

#[repr(C, align(4096))]
struct PageBuf([u8; PAGE_FRAME_SIZE]);

/// The physical frames handed out to user processes.
pub struct UserPool {
    start: NonNull<u8>,
    phys_start: usize,
    frames: usize,
}

// SAFETY: The pool exclusively owns the memory it points to.
unsafe impl Send for UserPool {}

impl UserPool {
    /// Creates a pool over `frames` frames starting at `start`.
    ///
    /// # Safety
    ///
    /// `start` must be page aligned and point to `frames * PAGE_FRAME_SIZE` bytes that nothing
    /// else accesses for the lifetime of the pool. `phys_start` is the physical address the
    /// first frame is mapped at.
    pub unsafe fn new(start: NonNull<u8>, phys_start: usize, frames: usize) -> Self {
        assert_eq!(start.as_ptr() as usize % PAGE_FRAME_SIZE, 0);
        assert_eq!(phys_start % PAGE_FRAME_SIZE, 0);
        Self {
            start,
            phys_start,
            frames,
        }
    }

    /// A pool of `frames` zeroed frames taken from the kernel heap and never returned.
    pub fn leaked(frames: usize, phys_start: usize) -> Self {
        let pages: Box<[PageBuf]> = (0..frames).map(|_| PageBuf([0; PAGE_FRAME_SIZE])).collect();
        let start = NonNull::from(Box::leak(pages)).cast::<u8>();
        // SAFETY: The leaked pages are aligned by `PageBuf` and owned by nobody else.
        unsafe { Self::new(start, phys_start, frames) }
    }

    pub fn len(&self) -> usize {
        self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Physical address of frame `index`.
    pub fn phys(&self, index: usize) -> usize {
        self.phys_start + index * PAGE_FRAME_SIZE
    }

    /// Index of the frame at physical address `phys`, if it belongs to the pool.
    pub fn index_of(&self, phys: usize) -> Option<usize> {
        let offset = phys.checked_sub(self.phys_start)?;
        let index = offset / PAGE_FRAME_SIZE;
        (offset % PAGE_FRAME_SIZE == 0 && index < self.frames).then_some(index)
    }

    pub fn page(&self, index: usize) -> &[u8] {
        assert!(index < self.frames, "frame {index} is outside the user pool");
        // SAFETY: The frame lies inside the memory owned by the pool.
        unsafe {
            slice::from_raw_parts(
                self.start.as_ptr().add(index * PAGE_FRAME_SIZE),
                PAGE_FRAME_SIZE,
            )
        }
    }

    pub fn page_mut(&mut self, index: usize) -> &mut [u8] {
        assert!(index < self.frames, "frame {index} is outside the user pool");
        // SAFETY: As above, and `&mut self` rules out any other borrow of the frame.
        unsafe {
            slice::from_raw_parts_mut(
                self.start.as_ptr().add(index * PAGE_FRAME_SIZE),
                PAGE_FRAME_SIZE,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_addresses() {
        let pool = UserPool::leaked(3, 0x0010_0000);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.phys(2), 0x0010_2000);
        assert_eq!(pool.index_of(0x0010_1000), Some(1));
        assert_eq!(pool.index_of(0x0010_1004), None);
        assert_eq!(pool.index_of(0x0010_3000), None);
        assert_eq!(pool.index_of(0x000f_f000), None);
    }

    #[test]
    fn test_pages_are_disjoint() {
        let mut pool = UserPool::leaked(2, 0);
        pool.page_mut(0).fill(1);
        assert!(pool.page(1).iter().all(|&b| b == 0));
        assert_eq!(pool.page(0).len(), PAGE_FRAME_SIZE);
        assert_eq!(pool.page(0).as_ptr() as usize % PAGE_FRAME_SIZE, 0);
    }
}
