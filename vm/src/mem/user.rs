use super::frame_table::FrameTable;
use crate::threading::process::AddressSpace;
use alloc::vec::Vec;
use kidneyos_shared::mem::{pg_ofs, pg_round_down, PAGE_FRAME_SIZE, PHYS_BASE};
use spin::Mutex;

/// Splits `[pointer, pointer + count)` into `(upage, offset, len)` runs, one per page.
///
/// Returns `None` if any part of the range lies in kernel memory.
fn user_runs(
    pointer: usize,
    count: usize,
) -> Option<impl Iterator<Item = (usize, usize, usize)>> {
    let range_end = pointer.checked_add(count)?;

    // Trying to access kernel memory.
    if range_end > PHYS_BASE {
        return None;
    }

    let mut addr = pointer;
    Some(core::iter::from_fn(move || {
        if addr >= range_end {
            return None;
        }
        let offset = pg_ofs(addr);
        let len = (PAGE_FRAME_SIZE - offset).min(range_end - addr);
        let run = (pg_round_down(addr), offset, len);
        addr += len;
        Some(run)
    }))
}

/// Copies `count` bytes at user address `pointer` out of `space`.
///
/// Returns `None` unless every byte lies on a resident user page. Callers fault the pages
/// in first.
pub fn check_and_copy_user_memory(
    frames: &FrameTable,
    space: &Mutex<AddressSpace>,
    pointer: usize,
    count: usize,
) -> Option<Vec<u8>> {
    let mut bytes = Vec::with_capacity(count);
    for (upage, offset, len) in user_runs(pointer, count)? {
        frames.with_user_page(space, upage, false, |page| {
            bytes.extend_from_slice(&page[offset..offset + len]);
        })?;
    }
    Some(bytes)
}

/// Copies `data` to user address `pointer` in `space`, marking the pages dirty.
///
/// Returns `false` unless every byte lies on a resident, writable user page. A prefix of
/// `data` may have been written by then.
pub fn copy_to_user_memory(
    frames: &FrameTable,
    space: &Mutex<AddressSpace>,
    pointer: usize,
    data: &[u8],
) -> bool {
    let Some(runs) = user_runs(pointer, data.len()) else {
        return false;
    };

    let mut rest = data;
    for (upage, offset, len) in runs {
        let (chunk, tail) = rest.split_at(len);
        let copied = frames.with_user_page(space, upage, true, |page| {
            page[offset..offset + len].copy_from_slice(chunk);
        });
        if copied.is_none() {
            return false;
        }
        rest = tail;
    }
    true
}
