use alloc::collections::VecDeque;

/// The frame table, as seen by a replacement policy.
pub trait ReplacementCandidates {
    /// Number of frames in the table.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether frame `index` holds a user page that may be evicted right now. Free and pinned
    /// frames are never evictable.
    fn is_evictable(&self, index: usize) -> bool;

    /// Whether the page in frame `index` was accessed since the last call. Clears the
    /// accessed bit.
    fn take_accessed(&mut self, index: usize) -> bool;
}

/// Chooses which frame to evict when the user pool is exhausted.
pub trait PageReplacementPolicy: Send {
    /// Picks a victim among the evictable frames, or returns `None` if there is none.
    ///
    /// The victim is not evicted until [`PageReplacementPolicy::frame_released`] is called
    /// for it, so the same frame may be picked again if writing it out fails.
    fn evict_page(&mut self, frames: &mut dyn ReplacementCandidates) -> Option<usize>;

    /// A user page was mapped into frame `index`.
    fn frame_loaded(&mut self, _index: usize) {}

    /// Frame `index` was released or evicted.
    fn frame_released(&mut self, _index: usize) {}
}

/// Second chance replacement.
///
/// The hand sweeps over the frames, clearing accessed bits, and evicts the first frame it
/// finds that has not been accessed since the previous sweep.
#[derive(Default)]
pub struct Clock {
    hand: usize,
}

impl PageReplacementPolicy for Clock {
    fn evict_page(&mut self, frames: &mut dyn ReplacementCandidates) -> Option<usize> {
        let len = frames.len();
        if len == 0 {
            return None;
        }

        // After one full sweep every accessed bit is clear.
        for _ in 0..2 * len {
            let index = self.hand % len;
            self.hand = (index + 1) % len;

            if frames.is_evictable(index) && !frames.take_accessed(index) {
                return Some(index);
            }
        }
        None
    }
}

/// Evicts the page that was loaded first, ignoring accesses.
#[derive(Default)]
pub struct Fifo {
    queue: VecDeque<usize>,
}

impl PageReplacementPolicy for Fifo {
    fn evict_page(&mut self, frames: &mut dyn ReplacementCandidates) -> Option<usize> {
        self.queue
            .iter()
            .copied()
            .find(|&index| frames.is_evictable(index))
    }

    fn frame_loaded(&mut self, index: usize) {
        self.queue.push_back(index);
    }

    fn frame_released(&mut self, index: usize) {
        self.queue.retain(|&i| i != index);
    }
}
