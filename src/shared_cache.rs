//! Reading the dyld shared-region from first principles.
//!
//! Every process maps the shared cache at the address reported by the
//! `shared_region_check_np` trap. Its header is a stable, append-only
//! structure; the loader reads just enough of it to compute the cache slide
//! and to find hosted images by install path, without asking dyld anything.

use std::ffi::CStr;

use crate::macho::{MachHeader64, cstr_eq};

// dyld_cache_header from dyld's dyld_cache_format.h. Append-only across OS
// releases; only the handful of fields the loader touches are named in code,
// but the full layout is carried so their offsets stay right.
#[repr(C)]
pub struct DyldCacheHeader {
    pub magic: [u8; 16],
    pub mapping_offset: u32,
    pub mapping_count: u32,
    pub images_offset_old: u32,
    pub images_count_old: u32,
    pub dyld_base_address: u64,
    pub code_signature_offset: u64,
    pub code_signature_size: u64,
    pub slide_info_offset_unused: u64,
    pub slide_info_size_unused: u64,
    pub local_symbols_offset: u64,
    pub local_symbols_size: u64,
    pub uuid: [u8; 16],
    pub cache_type: u64,
    pub branch_pools_offset: u32,
    pub branch_pools_count: u32,
    pub accelerate_info_addr: u64,
    pub accelerate_info_size: u64,
    pub images_text_offset: u64,
    pub images_text_count: u64,
    pub patch_info_addr: u64,
    pub patch_info_size: u64,
    pub other_image_group_addr_unused: u64,
    pub other_image_group_size_unused: u64,
    pub prog_closures_addr: u64,
    pub prog_closures_size: u64,
    pub prog_closures_trie_addr: u64,
    pub prog_closures_trie_size: u64,
    pub platform: u32,
    pub format_flags: u32, // formatVersion:8 and assorted single-bit flags
    pub shared_region_start: u64,
    pub shared_region_size: u64,
    pub max_slide: u64,
    pub dylibs_image_array_addr: u64,
    pub dylibs_image_array_size: u64,
    pub dylibs_trie_addr: u64,
    pub dylibs_trie_size: u64,
    pub other_image_array_addr: u64,
    pub other_image_array_size: u64,
    pub other_trie_addr: u64,
    pub other_trie_size: u64,
    pub mapping_with_slide_offset: u32,
    pub mapping_with_slide_count: u32,
    pub dylibs_pbl_state_array_addr_unused: u64,
    pub dylibs_pbl_set_addr: u64,
    pub programs_pbl_set_pool_addr: u64,
    pub programs_pbl_set_pool_size: u64,
    pub program_trie_addr: u64,
    pub program_trie_size: u32,
    pub os_version: u32,
    pub alt_platform: u32,
    pub alt_os_version: u32,
    pub swift_opts_offset: u64,
    pub swift_opts_size: u64,
    pub sub_cache_array_offset: u32,
    pub sub_cache_array_count: u32,
    pub symbol_file_uuid: [u8; 16],
    pub rosetta_read_only_addr: u64,
    pub rosetta_read_only_size: u64,
    pub rosetta_read_write_addr: u64,
    pub rosetta_read_write_size: u64,
    pub images_offset: u32,
    pub images_count: u32,
}

// dyld_cache_image_info
#[repr(C)]
pub struct ImageInfo {
    pub address: u64,
    pub mod_time: u64,
    pub inode: u64,
    pub path_file_offset: u32,
    pub pad: u32,
}

// shared_file_mapping_np
#[repr(C)]
pub struct SharedFileMapping {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

/// A live view of the mapped shared cache.
pub struct SharedCache {
    region_start: u64,
}

impl SharedCache {
    /// Interprets `region_start` (the `shared_region_check_np` result) as a
    /// cache header.
    ///
    /// Returns `None` when the probe came back empty or the header carries
    /// no image directory in either the legacy or the current field pair.
    ///
    /// # Safety
    ///
    /// A non-zero `region_start` must be the address of a mapped shared
    /// cache.
    pub unsafe fn from_region_start(region_start: u64) -> Option<Self> {
        if region_start == 0 {
            return None;
        }
        let cache = Self { region_start };
        let (offset, count) = cache.image_directory();
        if offset == 0 || count == 0 {
            return None;
        }
        Some(cache)
    }

    fn header(&self) -> *const DyldCacheHeader {
        self.region_start as *const DyldCacheHeader
    }

    /// The image directory, preferring the pre-iOS 15 field pair when it is
    /// populated (newer caches zero it and use the fields at the tail).
    fn image_directory(&self) -> (u32, u32) {
        // SAFETY: from_region_start contract
        unsafe {
            let header = &*self.header();
            let mut offset = header.images_offset_old;
            let mut count = header.images_count_old;
            if count == 0 {
                count = header.images_count;
            }
            if offset == 0 {
                offset = header.images_offset;
            }
            (offset, count)
        }
    }

    /// Difference between where the cache is mapped and where its first
    /// mapping record expects to live.
    pub fn slide(&self) -> u64 {
        // SAFETY: from_region_start contract
        unsafe {
            let header = &*self.header();
            let mapping = self
                .region_start
                .wrapping_add(u64::from(header.mapping_offset))
                as *const SharedFileMapping;
            self.region_start.wrapping_sub((*mapping).address)
        }
    }

    /// Linear scan of the image directory for an exact install path.
    ///
    /// Returns the image's slid base address.
    pub fn image_base(&self, path: &CStr) -> Option<u64> {
        let (offset, count) = self.image_directory();
        let slide = self.slide();
        // SAFETY: from_region_start contract; path strings live inside the
        // mapped cache at their recorded file offsets
        unsafe {
            let images = self.region_start.wrapping_add(u64::from(offset)) as *const ImageInfo;
            for i in 0..count as usize {
                let img = images.add(i);
                let img_path =
                    self.region_start.wrapping_add(u64::from((*img).path_file_offset)) as *const u8;
                if cstr_eq(img_path, path) {
                    return Some((*img).address.wrapping_add(slide));
                }
            }
        }
        None
    }

    /// Typed view of a hosted image's header.
    pub fn image_header(&self, path: &CStr) -> Option<*const MachHeader64> {
        self.image_base(path).map(|base| base as *const MachHeader64)
    }
}
