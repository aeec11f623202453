//! The segment mapping plan dyld's loader hands back.
//!
//! `JustInTimeLoader::withRegions` enumerates one packed record per mapped
//! span of the image. The record layout is ABI (generated on the fly by the
//! host linker), so it is mirrored bit for bit here; the mapping decision
//! itself is a pure predicate so it can be exercised without a host linker.

use bitflags::bitflags;

bitflags! {
    /// The three permission bits inside a region record; numerically the
    /// same as `VM_PROT_*` / `PROT_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionPerms: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXECUTE = 4;
    }
}

/// One mapped span: `vmOffset:59, perms:3, isZeroFill:1, readOnlyData:1`
/// packed into the first word, then the file offset and size.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Region {
    bits: u64,
    pub file_offset: u32,
    pub file_size: u32,
}

/// Regions produced by the host linker, `lsl::Array` layout.
#[repr(C)]
pub struct RegionArray {
    pub elements: *const Region,
    pub alloc_count: usize,
    pub used_count: usize,
}

const VM_OFFSET_BITS: u32 = 59;

impl Region {
    pub fn new(
        vm_offset: u64,
        perms: RegionPerms,
        is_zero_fill: bool,
        read_only_data: bool,
        file_offset: u32,
        file_size: u32,
    ) -> Self {
        let mut bits = vm_offset & ((1 << VM_OFFSET_BITS) - 1);
        bits |= u64::from(perms.bits()) << VM_OFFSET_BITS;
        bits |= u64::from(is_zero_fill) << 62;
        bits |= u64::from(read_only_data) << 63;
        Self {
            bits,
            file_offset,
            file_size,
        }
    }

    pub fn vm_offset(&self) -> u64 {
        self.bits & ((1 << VM_OFFSET_BITS) - 1)
    }

    pub fn perms(&self) -> RegionPerms {
        RegionPerms::from_bits_truncate(((self.bits >> VM_OFFSET_BITS) & 0x7) as u8)
    }

    /// mmap/mprotect protection value for this region.
    pub fn prot(&self) -> i32 {
        i32::from(self.perms().bits())
    }

    pub fn is_zero_fill(&self) -> bool {
        (self.bits >> 62) & 1 != 0
    }

    pub fn read_only_data(&self) -> bool {
        (self.bits >> 63) & 1 != 0
    }
}

/// Whether a region gets bytes copied into the reserved space.
///
/// Zero-fill and empty regions have nothing to copy. A region back at
/// vm-offset 0 after something already mapped is the linker re-describing
/// the header span; the first segment already covered it. A region that
/// would run past the analyzed VM space is never copied.
pub fn should_map(region: &Region, mapped_so_far: u32, vm_space: u64) -> bool {
    if region.is_zero_fill() || region.file_size == 0 {
        return false;
    }
    if region.vm_offset() == 0 && mapped_so_far > 0 {
        return false;
    }
    region.vm_offset() + u64::from(region.file_size) <= vm_space
}

#[cfg(test)]
mod test {
    use super::*;

    const RX: RegionPerms = RegionPerms::READ.union(RegionPerms::EXECUTE);
    const RW: RegionPerms = RegionPerms::READ.union(RegionPerms::WRITE);

    #[test]
    fn packing_round_trips() {
        let r = Region::new(0x1_4000, RX, false, false, 0x4000, 0x8000);
        assert_eq!(r.vm_offset(), 0x1_4000);
        assert_eq!(r.perms(), RX);
        assert_eq!(r.prot(), 5);
        assert!(!r.is_zero_fill());
        assert!(!r.read_only_data());

        let z = Region::new(0x2000, RW, true, true, 0, 0);
        assert!(z.is_zero_fill());
        assert!(z.read_only_data());
        assert_eq!(z.prot(), 3);
    }

    #[test]
    fn layout_matches_the_linker_record() {
        assert_eq!(size_of::<Region>(), 16);
        assert_eq!(size_of::<RegionArray>(), 24);
    }

    #[test]
    fn zero_fill_and_empty_regions_are_skipped() {
        let bss = Region::new(0x8000, RW, true, false, 0, 0x4000);
        assert!(!should_map(&bss, 1, 0x10000));

        let empty = Region::new(0x8000, RW, false, false, 0, 0);
        assert!(!should_map(&empty, 1, 0x10000));
    }

    #[test]
    fn duplicate_header_region_is_skipped() {
        let header = Region::new(0, RX, false, false, 0, 0x4000);
        // The very first region at offset 0 maps; any later one does not.
        assert!(should_map(&header, 0, 0x10000));
        assert!(!should_map(&header, 1, 0x10000));
        assert!(!should_map(&header, 3, 0x10000));
    }

    #[test]
    fn overrunning_region_is_skipped() {
        let fits = Region::new(0xc000, RW, false, false, 0xc000, 0x4000);
        assert!(should_map(&fits, 1, 0x10000));

        let overruns = Region::new(0xc000, RW, false, false, 0xc000, 0x4001);
        assert!(!should_map(&overruns, 1, 0x10000));
    }
}
