use crate::aplib::DepackError;
use thiserror::Error;

/// A loader failure.
///
/// Every failure the loader can hit maps onto the small integer returned
/// from the `beignet_loader` entry point; the first failure wins and nothing
/// is rolled back. A few wire codes are overloaded (10 and 11 mean
/// different things on the two load pipelines), so the enum carries one
/// variant per distinct failure and [`LoadError::code`] does the folding.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("null buffer, zero length, or null entry name")]
    InvalidArgument,
    #[error("shared cache not found, or a required cached image is missing")]
    SharedCacheUnavailable,
    #[error("linker runtime state or syscall delegate pointer not present")]
    RuntimeStateUnavailable,
    #[error("one or more required dyld internals could not be resolved")]
    MissingDyldInternals,
    #[error("segment-layout analyzer reported zero VM space")]
    EmptySegmentLayout,
    #[error("failed to reserve VM for the payload image")]
    PayloadVmExhausted,
    #[error("failed to allocate the loader scratch page")]
    ScratchVmExhausted,
    #[error("just-in-time loader construction failed")]
    LoaderConstruction,
    #[error("dependent loading or fixup application reported a diagnostics error")]
    DependentsOrFixups,
    #[error("no __TEXT segment in the mapped image")]
    TextSegmentMissing,
    #[error("allocated load address is below the image's __TEXT vmaddr")]
    LoadAddressBelowText,
    #[error("stable in-memory linkage symbols missing from libdyld")]
    LegacyApiUnresolved,
    #[error("entry symbol not found in the loaded image")]
    EntrySymbolNotFound,
    #[error("entry symbol has no address")]
    EntrySymbolNoAddress,
    #[error("invalid aPLib container header")]
    PackedHeaderInvalid,
    #[error(transparent)]
    Depack(#[from] DepackError),
    #[error("depacked length does not match the container's orig_size")]
    DepackLengthMismatch,
    #[error("failed to allocate the depack output buffer")]
    DepackBufferExhausted,
    #[error("payload could not be normalized to a loadable bundle")]
    ImagePreparation,
    #[error("NSCreateObjectFileImageFromMemory rejected the image")]
    ObjectFileImageCreation,
    #[error("NSLinkModule failed to link the image")]
    ModuleLink,
}

impl LoadError {
    /// The integer reported to the caller of the C entry point.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArgument => 1,
            Self::SharedCacheUnavailable => 2,
            Self::RuntimeStateUnavailable => 3,
            Self::MissingDyldInternals => 4,
            Self::EmptySegmentLayout => 5,
            Self::PayloadVmExhausted => 6,
            Self::ScratchVmExhausted => 7,
            Self::LoaderConstruction => 8,
            Self::DependentsOrFixups => 9,
            Self::TextSegmentMissing => 10,
            Self::LoadAddressBelowText | Self::LegacyApiUnresolved => 11,
            Self::EntrySymbolNotFound => 12,
            Self::EntrySymbolNoAddress => 13,
            Self::PackedHeaderInvalid => 14,
            Self::Depack(_) | Self::DepackLengthMismatch | Self::DepackBufferExhausted => 15,
            Self::ImagePreparation | Self::ObjectFileImageCreation => 16,
            Self::ModuleLink => 17,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_stay_on_the_wire_table() {
        // The wire table tops out at 17 and 0 is reserved for success.
        for err in [
            LoadError::InvalidArgument,
            LoadError::SharedCacheUnavailable,
            LoadError::RuntimeStateUnavailable,
            LoadError::MissingDyldInternals,
            LoadError::EmptySegmentLayout,
            LoadError::PayloadVmExhausted,
            LoadError::ScratchVmExhausted,
            LoadError::LoaderConstruction,
            LoadError::DependentsOrFixups,
            LoadError::TextSegmentMissing,
            LoadError::LoadAddressBelowText,
            LoadError::LegacyApiUnresolved,
            LoadError::EntrySymbolNotFound,
            LoadError::EntrySymbolNoAddress,
            LoadError::PackedHeaderInvalid,
            LoadError::DepackBufferExhausted,
            LoadError::ImagePreparation,
            LoadError::ObjectFileImageCreation,
            LoadError::ModuleLink,
        ] {
            let code = err.code();
            assert!((1..=17).contains(&code), "{err}: {code}");
        }
    }

    #[test]
    fn overloaded_codes_fold() {
        assert_eq!(LoadError::LoadAddressBelowText.code(), 11);
        assert_eq!(LoadError::LegacyApiUnresolved.code(), 11);
        assert_eq!(LoadError::Depack(DepackError::TruncatedInput).code(), 15);
        assert_eq!(LoadError::DepackBufferExhausted.code(), 15);
    }
}
