//! beignet: a diskless in-memory Mach-O loader for darwin/arm64 and
//! darwin/amd64.
//!
//! Given a byte buffer holding a 64-bit Mach-O image (optionally wrapped in
//! an aPLib "AP32" container) and the name of an exported symbol, the loader
//! maps the image into the current process, resolves its dependencies
//! against the host's dynamic linker, applies fixups, runs initializers, and
//! calls the symbol, without the payload ever touching disk and without
//! routing through libc.
//!
//! On arm64 the load is driven end to end through dyld4's private
//! just-in-time loader machinery; on x86_64 the payload is
//! normalized to a bundle and handed to the legacy NSObjectFileImage APIs.
//! The host is fingerprinted first (shared cache, linker images, mangled
//! internals) and any mismatch fails fast with a numeric code; see
//! [`errors::LoadError`].
//!
//! The only external surface is the `beignet_loader` C entry point over the
//! crate-level `mac::loader::load`.

pub mod aplib;
pub mod errors;
pub mod image;
pub mod macho;
pub mod regions;
pub mod shared_cache;

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        pub mod mac;

        pub use mac::beignet_loader;
    }
}

pub use errors::LoadError;
