// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform, which is all we support. It would be nice if
// you could tell clippy that you were only dealing with 32-bit usizes...
#![allow(clippy::cast_possible_truncation)]

use crate::mem::PAGE_FRAME_SIZE;
use arbitrary_int::{u12, u20, Number};
use bitbybit::bitfield;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    pub present: bool,
    #[bit(1, rw)]
    pub read_write: bool,
    #[bit(2, rw)]
    pub user_supervisor: bool,
    #[bit(3, rw)]
    pub write_through: bool,
    #[bit(4, rw)]
    pub cache_disable: bool,
    #[bit(5, rw)]
    pub accessed: bool,
    #[bit(6, rw)]
    pub dirty: bool,
    #[bit(7, rw)]
    pub page_attribute_table: bool,
    #[bit(8, rw)]
    pub global: bool,
    #[bits(12..=31, rw)]
    pub page_frame_address: u20,
}

impl PageTableEntry {
    /// A present user mapping of the frame at physical address `phys`.
    ///
    /// Returns `None` if `phys` is not page aligned or lies beyond what a
    /// 32-bit entry can address.
    pub fn user_mapping(phys: usize, writable: bool) -> Option<Self> {
        let frame_number = phys / PAGE_FRAME_SIZE;
        if phys % PAGE_FRAME_SIZE != 0 || frame_number > u20::MAX.value() as usize {
            return None;
        }

        Some(
            Self::DEFAULT
                .with_present(true)
                .with_read_write(writable)
                .with_user_supervisor(true)
                .with_page_frame_address(u20::new(frame_number as u32)),
        )
    }

    /// Physical address of the frame this entry points at.
    pub fn phys_addr(&self) -> usize {
        self.page_frame_address().value() as usize * PAGE_FRAME_SIZE
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(12..=31, r)]
    pub page_number: u20,
    #[bits(0..=11, r)]
    pub offset: u12,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_mapping_bits() {
        let entry = PageTableEntry::user_mapping(0x0012_3000, true).expect("aligned address");
        assert!(entry.present());
        assert!(entry.read_write());
        assert!(entry.user_supervisor());
        assert!(!entry.dirty());
        assert!(!entry.accessed());
        assert_eq!(entry.phys_addr(), 0x0012_3000);
    }

    #[test]
    fn test_user_mapping_rejects_bad_addresses() {
        assert!(PageTableEntry::user_mapping(0x0012_3004, false).is_none());
        #[cfg(target_pointer_width = "64")]
        assert!(PageTableEntry::user_mapping(1 << 32, false).is_none());
    }

    #[test]
    fn test_user_mapping_highest_frame() {
        let top = u20::MAX.value() as usize * PAGE_FRAME_SIZE;
        let entry = PageTableEntry::user_mapping(top, false).expect("addressable frame");
        assert_eq!(entry.phys_addr(), top);
        assert!(!entry.read_write());
    }

    #[test]
    fn test_virtual_address_split() {
        let addr = VirtualAddress::new_with_raw_value(0x0804_8123);
        assert_eq!(addr.page_number().value(), 0x08048);
        assert_eq!(addr.offset().value(), 0x123);
    }
}
