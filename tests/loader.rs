#![cfg(target_os = "macos")]

//! Live-host checks: everything here runs against the real shared cache of
//! the machine executing the tests, but stops short of handing a payload to
//! the linker (that needs a staged bundle and is exercised in deployment
//! testing).

use std::ffi::CStr;

use beignet::beignet_loader;
use beignet::mac::probe_shared_cache;
use beignet::macho;

fn call_loader(buffer: &[u8], entry: &CStr) -> i32 {
    // SAFETY: pointers derive from live slices; the inputs used in these
    // tests all fail before any control transfer
    unsafe { beignet_loader(buffer.as_ptr(), buffer.len() as u64, entry.as_ptr()) }
}

#[test]
fn rejects_invalid_arguments() {
    // SAFETY: null-argument contract is exactly what is under test
    unsafe {
        assert_eq!(beignet_loader(std::ptr::null(), 0, std::ptr::null()), 1);
        assert_eq!(beignet_loader(std::ptr::null(), 64, c"_go".as_ptr()), 1);
        assert_eq!(beignet_loader(b"x".as_ptr(), 0, c"_go".as_ptr()), 1);
        assert_eq!(beignet_loader(b"x".as_ptr(), 1, std::ptr::null()), 1);
    }
}

#[test]
fn rejects_an_empty_ap32_container() {
    // AP32 tag, header_size=24, packed_size=0: a container with no stream.
    let mut buffer = [0u8; 24];
    buffer[..4].copy_from_slice(b"AP32");
    buffer[4] = 24;
    assert_eq!(call_loader(&buffer, c"_go"), 14);
}

#[test]
fn rejects_a_truncated_ap32_stream() {
    // Well-formed container whose bitstream runs dry mid-literal.
    let mut buffer = Vec::new();
    buffer.extend_from_slice(b"AP32");
    buffer.extend_from_slice(&24u32.to_le_bytes()); // header_size
    buffer.extend_from_slice(&4u32.to_le_bytes()); // packed_size
    buffer.extend_from_slice(&0u32.to_le_bytes()); // packed_crc
    buffer.extend_from_slice(&100u32.to_le_bytes()); // orig_size
    buffer.extend_from_slice(&0u32.to_le_bytes()); // orig_crc
    buffer.extend_from_slice(&[0xff, 0x00, 0x00, 0x00]);
    assert_eq!(call_loader(&buffer, c"_go"), 15);
}

#[test]
fn entry_names_truncate_at_the_first_nul() {
    // The C entry takes a `*const c_char`; everything past an embedded NUL
    // is invisible to the lookup. Exercise the same CStr marshaling against
    // a live libdyld export.
    let cache = probe_shared_cache().expect("no shared cache in this process");
    let libdyld = cache
        .image_header(c"/usr/lib/system/libdyld.dylib")
        .expect("libdyld missing from the cache");

    let with_tail = b"_dlopen\0_ignored_tail\0";
    let cut_short = b"_dl\0open\0";
    // SAFETY: both buffers are NUL-terminated; the cache image is mapped
    unsafe {
        let plain = beignet::macho::find_symbol(libdyld, c"_dlopen", cache.slide())
            .expect("_dlopen did not resolve");

        let name = CStr::from_ptr(with_tail.as_ptr().cast());
        assert_eq!(name.to_bytes(), b"_dlopen");
        let truncated = beignet::macho::find_symbol(libdyld, name, cache.slide())
            .expect("name with trailing garbage after the NUL did not resolve");
        assert_eq!(truncated, plain);

        let name = CStr::from_ptr(cut_short.as_ptr().cast());
        assert_eq!(name.to_bytes(), b"_dl");
        assert!(beignet::macho::find_symbol(libdyld, name, cache.slide()).is_none());
    }
}

#[test]
fn finds_the_linker_images_in_the_live_cache() {
    let cache = probe_shared_cache().expect("no shared cache in this process");

    let libdyld = cache
        .image_base(c"/usr/lib/system/libdyld.dylib")
        .expect("libdyld missing from the cache");
    let dyld = cache.image_base(c"/usr/lib/dyld").expect("dyld missing from the cache");
    assert_ne!(libdyld, 0);
    assert_ne!(dyld, 0);
    assert_ne!(libdyld, dyld);

    assert!(cache.image_base(c"/usr/lib/libSystem.B.dylib").is_some());
    assert!(cache.image_base(c"/no/such/library.dylib").is_none());
}

#[test]
fn cached_images_start_with_a_mach_header() {
    let cache = probe_shared_cache().expect("no shared cache in this process");
    let libdyld = cache
        .image_header(c"/usr/lib/system/libdyld.dylib")
        .expect("libdyld missing from the cache");
    // SAFETY: the cache image is mapped readable
    let magic = unsafe { (*libdyld).magic };
    assert_eq!(magic, macho::MH_MAGIC_64);
}

#[test]
fn resolves_stable_exports_from_the_cached_libdyld() {
    let cache = probe_shared_cache().expect("no shared cache in this process");
    let libdyld = cache
        .image_header(c"/usr/lib/system/libdyld.dylib")
        .expect("libdyld missing from the cache");

    // SAFETY: walking a mapped cache image
    unsafe {
        for name in [c"_NSLookupSymbolInModule", c"_NSAddressOfSymbol", c"_dlopen"] {
            let sym = macho::find_symbol(libdyld, name, cache.slide());
            assert!(sym.is_some(), "{name:?} did not resolve");
        }
        assert!(macho::find_symbol(libdyld, c"_not_a_real_export", cache.slide()).is_none());
    }
}
