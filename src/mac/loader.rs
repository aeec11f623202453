//! Entry orchestration: validate, unwrap, fingerprint the host, dispatch.

use std::ffi::{CStr, c_char};

use crate::errors::LoadError;
use crate::image;
use crate::shared_cache::SharedCache;

use super::sys;

#[cfg(target_arch = "aarch64")]
use crate::macho::{self, MachHeader64};
#[cfg(target_arch = "aarch64")]
use mach2::vm_types::mach_vm_address_t;

/// Locates the shared cache mapped into this process.
pub fn probe_shared_cache() -> Option<SharedCache> {
    let region_start = sys::shared_region_check_np();
    // SAFETY: a non-zero probe result is the mapped cache
    unsafe { SharedCache::from_region_start(region_start) }
}

/// Loads a Mach-O payload from memory and invokes `entry_symbol` in it.
///
/// The buffer may be an aPLib "AP32" container or a bare 64-bit Mach-O. On
/// success the entry has already run and returned; the mapped image stays
/// resident for the life of the process.
///
/// # Safety
///
/// The payload must be a Mach-O built for this host, sliced for this
/// architecture, whose entry symbol is a `void(void)` function; the loader
/// hands it control. One call at a time per process.
pub unsafe fn load(buffer: &[u8], entry_symbol: &CStr) -> Result<(), LoadError> {
    if buffer.is_empty() {
        return Err(LoadError::InvalidArgument);
    }

    // Unwrap a compressed container before anything interprets the bytes.
    // The depack buffer replaces the input for the rest of the load and is
    // never freed.
    let payload: &[u8] = match image::packed_header(buffer)? {
        Some(hdr) => {
            let dst = unsafe { sys::anon_rw(hdr.orig_size as usize, 0) }
                .ok_or(LoadError::DepackBufferExhausted)?;
            // SAFETY: fresh mapping of orig_size bytes
            let dst =
                unsafe { std::slice::from_raw_parts_mut(dst.as_ptr(), hdr.orig_size as usize) };
            image::depack_payload(&hdr, buffer, dst)?;
            log::debug!("depacked payload {} -> {} bytes", hdr.packed_size, hdr.orig_size);
            dst
        }
        None => buffer,
    };

    // Fingerprint the host: both linker images must be present in the
    // shared cache before any private surface is touched.
    let cache = probe_shared_cache().ok_or(LoadError::SharedCacheUnavailable)?;
    let libdyld = cache
        .image_header(c"/usr/lib/system/libdyld.dylib")
        .ok_or(LoadError::SharedCacheUnavailable)?;
    let dyld = cache
        .image_header(c"/usr/lib/dyld")
        .ok_or(LoadError::SharedCacheUnavailable)?;

    cfg_if::cfg_if! {
        if #[cfg(target_arch = "aarch64")] {
            // SAFETY: cache images verified above; payload per our contract
            let load_address = unsafe { super::dyld4::load(&cache, dyld, libdyld, payload)? };
            // SAFETY: dyld4::load mapped a full image there
            let entry = unsafe { resolve_entry(load_address, entry_symbol)? };
            log::debug!("invoking {entry_symbol:?} at {entry:#x}");
            // SAFETY: the entry contract is the caller's
            unsafe {
                let entry: unsafe extern "C" fn() = std::mem::transmute(entry);
                entry();
            }
            Ok(())
        } else {
            // The modern internals are not consulted on this pipeline, but a
            // cache without its linker is still a host we refuse to touch.
            let _ = dyld;
            // SAFETY: cache images verified above; payload per our contract
            unsafe { super::legacy::load_and_invoke(&cache, libdyld, payload, entry_symbol) }
        }
    }
}

/// Finds the entry export inside the freshly mapped image, anchored on its
/// `__TEXT` segment.
#[cfg(target_arch = "aarch64")]
unsafe fn resolve_entry(
    load_address: mach_vm_address_t,
    entry_symbol: &CStr,
) -> Result<u64, LoadError> {
    let header = load_address as *const MachHeader64;
    // SAFETY: the image at load_address was just mapped in full
    unsafe {
        let text = macho::find_segment(header, b"__TEXT").ok_or(LoadError::TextSegmentMissing)?;
        let image_slide = load_address
            .checked_sub((*text).vm_addr)
            .ok_or(LoadError::LoadAddressBelowText)?;
        let entry = macho::find_symbol(header, entry_symbol, image_slide)
            .ok_or(LoadError::EntrySymbolNotFound)?;
        Ok(entry.as_ptr() as u64)
    }
}

/// C entry point.
///
/// Returns `0` once the payload's entry has been invoked and came back,
/// otherwise a small positive error code ([`LoadError::code`]). `entry_name`
/// is NUL-terminated; embedded NULs end the name early.
///
/// # Safety
///
/// `buffer` must be readable for `length` bytes and `entry_name` must be a
/// NUL-terminated string, plus the payload contract of [`load`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn beignet_loader(
    buffer: *const u8,
    length: u64,
    entry_name: *const c_char,
) -> i32 {
    if buffer.is_null() || length == 0 || entry_name.is_null() {
        return LoadError::InvalidArgument.code();
    }
    // SAFETY: per contract
    let (buffer, entry_symbol) = unsafe {
        (
            std::slice::from_raw_parts(buffer, length as usize),
            CStr::from_ptr(entry_name),
        )
    };
    // SAFETY: per contract
    match unsafe { load(buffer, entry_symbol) } {
        Ok(()) => 0,
        Err(err) => {
            log::warn!("payload load failed: {err}");
            err.code()
        }
    }
}
