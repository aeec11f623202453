//! Legacy in-memory linkage on x86_64.
//!
//! amd64 hosts still export the NSObjectFileImage family from libdyld, and
//! those run the whole map/bind/initialize dance for a buffer that never
//! touched disk, with no private internals needed. The APIs only accept
//! bundles, so a dylib payload is first normalized in a private copy
//! (`image::normalize_to_bundle`).

use std::ffi::{CStr, c_char, c_void};
use std::ptr;

use crate::errors::LoadError;
use crate::image;
use crate::macho::{self, MachHeader64};
use crate::shared_cache::SharedCache;

use super::sys;

// mach-o/dyld.h
const NS_OBJECT_FILE_IMAGE_SUCCESS: i32 = 1;
const NS_LINK_MODULE_OPTION_RETURN_ON_ERROR: u32 = 0x4;

type CreateObjectFileImageFromMemory =
    unsafe extern "C" fn(*const c_void, usize, *mut *mut c_void) -> i32;
type LinkModule = unsafe extern "C" fn(*mut c_void, *const c_char, u32) -> *mut c_void;
type LookupSymbolInModule = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;
type AddressOfSymbol = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type DestroyObjectFileImage = unsafe extern "C" fn(*mut c_void) -> bool;

/// The stable libdyld surface this pipeline drives.
struct StableApi {
    create: CreateObjectFileImageFromMemory,
    link: LinkModule,
    lookup: LookupSymbolInModule,
    address_of: AddressOfSymbol,
    destroy: DestroyObjectFileImage,
}

impl StableApi {
    /// # Safety
    ///
    /// `libdyld` must be the cached libdyld image, valid once `slide` is
    /// applied.
    unsafe fn resolve(libdyld: *const MachHeader64, slide: u64) -> Result<Self, LoadError> {
        // SAFETY: per contract
        unsafe {
            let missing = || LoadError::LegacyApiUnresolved;
            Ok(Self {
                create: macho::find_function(libdyld, c"_NSCreateObjectFileImageFromMemory", slide)
                    .ok_or_else(missing)?,
                link: macho::find_function(libdyld, c"_NSLinkModule", slide).ok_or_else(missing)?,
                lookup: macho::find_function(libdyld, c"_NSLookupSymbolInModule", slide)
                    .ok_or_else(missing)?,
                address_of: macho::find_function(libdyld, c"_NSAddressOfSymbol", slide)
                    .ok_or_else(missing)?,
                destroy: macho::find_function(libdyld, c"_NSDestroyObjectFileImage", slide)
                    .ok_or_else(missing)?,
            })
        }
    }
}

/// Copies the payload into fresh RW pages and rewrites it into bundle shape.
/// The copy lives for the rest of the process; the caller's buffer is never
/// touched.
unsafe fn stage_bundle(payload: &[u8]) -> Result<&'static mut [u8], LoadError> {
    let copy = unsafe { sys::anon_rw(payload.len(), 0) }.ok_or(LoadError::ImagePreparation)?;
    // SAFETY: fresh mapping of payload.len() bytes, ours alone
    let staged = unsafe {
        macho::copy_bytes(payload.as_ptr(), copy.as_ptr(), payload.len());
        std::slice::from_raw_parts_mut(copy.as_ptr(), payload.len())
    };
    let outcome = image::normalize_to_bundle(staged)?;
    log::debug!(
        "normalized payload: saw_id_dylib={} rewritten={}",
        outcome.saw_id_dylib,
        outcome.rewritten_commands
    );
    Ok(staged)
}

/// Links the payload through the NSObjectFileImage pipeline and invokes the
/// entry symbol. The object-file image handle is destroyed on every path;
/// the linked module itself stays resident.
///
/// # Safety
///
/// `libdyld` must be an image of `cache`; `payload` must be a complete
/// 64-bit Mach-O. The entry symbol must be a `void(void)` function.
pub(super) unsafe fn load_and_invoke(
    cache: &SharedCache,
    libdyld: *const MachHeader64,
    payload: &[u8],
    entry_symbol: &CStr,
) -> Result<(), LoadError> {
    // SAFETY: per contract
    let api = unsafe { StableApi::resolve(libdyld, cache.slide())? };
    let bundle = unsafe { stage_bundle(payload)? };

    let mut object_image: *mut c_void = ptr::null_mut();
    // SAFETY: bundle is a mapped, normalized image; libdyld owns it from here
    unsafe {
        let created = (api.create)(bundle.as_ptr().cast(), bundle.len(), &mut object_image);
        if created != NS_OBJECT_FILE_IMAGE_SUCCESS || object_image.is_null() {
            return Err(LoadError::ObjectFileImageCreation);
        }

        let fail = |err: LoadError| {
            (api.destroy)(object_image);
            Err(err)
        };

        let module = (api.link)(
            object_image,
            c"beignet".as_ptr(),
            NS_LINK_MODULE_OPTION_RETURN_ON_ERROR,
        );
        if module.is_null() {
            return fail(LoadError::ModuleLink);
        }

        let symbol = (api.lookup)(module, entry_symbol.as_ptr());
        if symbol.is_null() {
            return fail(LoadError::EntrySymbolNotFound);
        }
        let address = (api.address_of)(symbol);
        if address.is_null() {
            return fail(LoadError::EntrySymbolNoAddress);
        }

        log::debug!("invoking entry at {address:p}");
        let entry: unsafe extern "C" fn() = std::mem::transmute(address);
        entry();

        (api.destroy)(object_image);
    }
    Ok(())
}
