//! Minimal Mach-O 64 walking over raw memory.
//!
//! The loader inspects two kinds of image it must never treat as an owned
//! byte slice: dylibs inside the shared cache (unbounded, live) and the
//! payload after it has been mapped. Both are walked through raw pointers
//! with the `#[repr(C)]` structures below; nothing here touches libc, so the
//! same routines are safe to run inside the linker's protected-stack scope.

use std::ffi::{CStr, c_void};
use std::ptr::NonNull;

// usr/include/mach-o/loader.h, magic number for MachHeader
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
// usr/include/mach-o/loader.h, dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
// usr/include/mach-o/loader.h, dynamically bound bundle file
pub const MH_BUNDLE: u32 = 0x8;
// usr/include/mach-o/loader.h, link-edit stab symbol table info
pub const LC_SYMTAB: u32 = 0x2;
// usr/include/mach-o/loader.h, dynamically linked shared lib ident
pub const LC_ID_DYLIB: u32 = 0xd;
// usr/include/mach-o/loader.h, command to map a segment
pub const LC_SEGMENT_64: u32 = 0x19;
// usr/include/mach-o/loader.h, delay load of dylib until first use
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;

/// Byte offset of `file_type` inside [`MachHeader64`].
pub const HEADER_FILETYPE_OFFSET: usize = 12;

// usr/include/mach-o/loader.h
#[repr(C)]
#[derive(Clone)]
pub struct MachHeader64 {
    pub magic: u32,         // mach magic number identifier
    pub cpu_type: i32,      // cpu_type_t cpu specifier
    pub cpu_sub_type: i32,  // cpu_subtype_t machine specifier
    pub file_type: u32,     // type of file
    pub num_commands: u32,  // number of load commands
    pub size_commands: u32, // size of all the load commands
    pub flags: u32,
    __reserved: u32,
}

// usr/include/mach-o/loader.h
#[repr(C)]
pub struct LoadCommandBase {
    pub cmd: u32,      // type of load command
    pub cmd_size: u32, // total size of the command in bytes
}

/*
 * The 64-bit segment load command indicates that a part of this file is to be
 * mapped into a 64-bit task's address space.  If the 64-bit segment has
 * sections then section_64 structures directly follow the 64-bit segment
 * command and their size is reflected in cmdsize.
 */
#[repr(C)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmd_size: u32,
    pub segment_name: [u8; 16],
    pub vm_addr: u64,      // memory address the segment is mapped to
    pub vm_size: u64,      // total size of the segment
    pub file_off: u64,     // file offset of the segment
    pub file_size: u64,    // amount mapped from the file
    pub max_prot: i32,     // maximum VM protection
    pub init_prot: i32,    // initial VM protection
    pub num_sections: u32, // number of sections in the segment
    pub flags: u32,
}

// usr/include/mach-o/loader.h
#[repr(C)]
pub struct Section64 {
    pub section_name: [u8; 16],
    pub segment_name: [u8; 16],
    pub addr: u64, // memory address of this section
    pub size: u64, // size in bytes of this section
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    reserved1: u32,
    reserved2: u32,
    reserved3: u32,
}

// usr/include/mach-o/loader.h
#[repr(C)]
pub struct SymtabCommand {
    pub cmd: u32,
    pub cmd_size: u32,
    pub sym_off: u32,  // symbol table offset
    pub num_syms: u32, // number of symbol table entries
    pub str_off: u32,  // string table offset
    pub str_size: u32, // string table size in bytes
}

// usr/include/mach-o/nlist.h
#[repr(C)]
pub struct Nlist64 {
    pub n_strx: u32, // index into the string table
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64, // value of this symbol (or stab offset)
}

/// Compares a NUL-terminated string at `a` against `want`, byte at a time.
///
/// # Safety
///
/// `a` must point at a readable NUL-terminated string.
pub unsafe fn cstr_eq(a: *const u8, want: &CStr) -> bool {
    for (i, &w) in want.to_bytes_with_nul().iter().enumerate() {
        // SAFETY: we never read past the terminator of either string
        if unsafe { a.add(i).read() } != w {
            return false;
        }
    }
    true
}

/// Compares a fixed 16-byte segment/section name against `want`, honoring
/// the NUL padding ("__TEXT" must not match "__TEXT_EXEC").
pub fn name16_eq(name: &[u8; 16], want: &[u8]) -> bool {
    let len = name.iter().position(|&b| b == 0).unwrap_or(16);
    &name[..len] == want
}

/// Copies `len` bytes, byte at a time, no alignment assumptions.
///
/// # Safety
///
/// Both ranges must be valid and may not overlap.
pub unsafe fn copy_bytes(src: *const u8, dst: *mut u8, len: usize) {
    for i in 0..len {
        // SAFETY: caller guarantees both ranges
        unsafe { dst.add(i).write(src.add(i).read()) };
    }
}

/// Walks the load commands that follow a [`MachHeader64`] in memory.
///
/// The iterator yields raw command pointers; callers downcast by `cmd`. A
/// command advertising a zero size would loop forever, so iteration stops
/// there.
pub struct LoadCommandsIter {
    next: *const LoadCommandBase,
    remaining: u32,
}

impl LoadCommandsIter {
    /// # Safety
    ///
    /// `header` must point at a mapped Mach-O 64 header followed by
    /// `num_commands` well-formed load commands.
    pub unsafe fn new(header: *const MachHeader64) -> Self {
        // SAFETY: per contract
        let remaining = unsafe { (*header).num_commands };
        Self {
            next: unsafe { header.add(1).cast() },
            remaining,
        }
    }
}

impl Iterator for LoadCommandsIter {
    type Item = *const LoadCommandBase;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next;
        // SAFETY: construction contract; commands are 8-byte aligned
        let size = unsafe { (*current).cmd_size };
        if size == 0 {
            self.remaining = 0;
            return None;
        }
        self.remaining -= 1;
        self.next = unsafe { current.byte_add(size as usize) };
        Some(current)
    }
}

/// Finds the named `LC_SEGMENT_64` command.
///
/// # Safety
///
/// `base` must point at a mapped Mach-O 64 image.
pub unsafe fn find_segment(base: *const MachHeader64, name: &[u8]) -> Option<*const SegmentCommand64> {
    // SAFETY: per contract
    unsafe {
        LoadCommandsIter::new(base)
            .filter(|&lc| (*lc).cmd == LC_SEGMENT_64)
            .map(|lc| lc.cast::<SegmentCommand64>())
            .find(|&seg| name16_eq(&(*seg).segment_name, name))
    }
}

/// Returns `section.addr + slide` for the named section of the named
/// segment, or `None` if either is absent.
///
/// # Safety
///
/// `base` must point at a mapped Mach-O 64 image whose recorded section
/// addresses are valid once `slide` is applied.
pub unsafe fn find_section(
    base: *const MachHeader64,
    segment: &[u8],
    section: &[u8],
    slide: u64,
) -> Option<NonNull<c_void>> {
    // SAFETY: per contract; sections directly follow their segment command
    unsafe {
        let seg = find_segment(base, segment)?;
        let mut sect = seg.add(1).cast::<Section64>();
        for _ in 0..(*seg).num_sections {
            if name16_eq(&(*sect).section_name, section) {
                return NonNull::new((*sect).addr.wrapping_add(slide) as *mut c_void);
            }
            sect = sect.add(1);
        }
        None
    }
}

/// Resolves a symbol by scanning the image's `nlist_64` table.
///
/// `__LINKEDIT`, `__TEXT`, and `LC_SYMTAB` anchor the walk; with any of the
/// three missing there is no symbol table to read and the result is `None`.
/// Entries whose `n_value` is zero are skipped (undefined imports carry the
/// name but no address). On success the returned pointer is
/// `n_value + slide`.
///
/// # Safety
///
/// `base` must point at a mapped Mach-O 64 image; the symbol and string
/// tables it references must be mapped at their recorded offsets.
pub unsafe fn find_symbol(
    base: *const MachHeader64,
    symbol: &CStr,
    slide: u64,
) -> Option<NonNull<c_void>> {
    let mut text: Option<*const SegmentCommand64> = None;
    let mut linkedit: Option<*const SegmentCommand64> = None;
    let mut symtab: Option<*const SymtabCommand> = None;

    // SAFETY: per contract
    unsafe {
        for lc in LoadCommandsIter::new(base) {
            match (*lc).cmd {
                LC_SYMTAB => symtab = Some(lc.cast()),
                LC_SEGMENT_64 => {
                    let seg = lc.cast::<SegmentCommand64>();
                    if name16_eq(&(*seg).segment_name, b"__LINKEDIT") {
                        linkedit = Some(seg);
                    } else if name16_eq(&(*seg).segment_name, b"__TEXT") {
                        text = Some(seg);
                    }
                }
                _ => {}
            }
        }

        let (text, linkedit, symtab) = (text?, linkedit?, symtab?);

        // Where __LINKEDIT landed relative to the file offsets recorded in
        // the symtab command.
        let file_slide = (*linkedit)
            .vm_addr
            .wrapping_sub((*text).vm_addr)
            .wrapping_sub((*linkedit).file_off);
        let strtab = (base as u64)
            .wrapping_add(file_slide)
            .wrapping_add(u64::from((*symtab).str_off)) as *const u8;
        let syms = (base as u64)
            .wrapping_add(file_slide)
            .wrapping_add(u64::from((*symtab).sym_off)) as *const Nlist64;

        for i in 0..(*symtab).num_syms as usize {
            let nl = syms.add(i);
            if (*nl).n_value == 0 {
                continue;
            }
            let name = strtab.add((*nl).n_strx as usize);
            if cstr_eq(name, symbol) {
                return NonNull::new((*nl).n_value.wrapping_add(slide) as *mut c_void);
            }
        }
    }

    None
}

/// [`find_symbol`], typed for code.
///
/// # Safety
///
/// `T` must be an `extern "C"` function pointer type matching the symbol's
/// real signature; `base` as for [`find_symbol`].
pub unsafe fn find_function<T: Copy>(base: *const MachHeader64, symbol: &CStr, slide: u64) -> Option<T> {
    // SAFETY: per contract; a fn pointer is pointer-sized
    unsafe {
        let p = find_symbol(base, symbol, slide)?;
        Some(std::mem::transmute_copy::<*mut c_void, T>(&p.as_ptr()))
    }
}
