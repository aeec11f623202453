#[cfg(target_pointer_width = "32")]
compile_error!("the loader only targets 64-bit darwin");

pub mod loader;
pub(crate) mod sys;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        pub(crate) mod dyld4;
    } else if #[cfg(target_arch = "x86_64")] {
        pub(crate) mod legacy;
    } else {
        compile_error!("unsupported target arch");
    }
}

pub use loader::{beignet_loader, probe_shared_cache};
