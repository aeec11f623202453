//! Payload preparation.
//!
//! Two transformations happen between the staged bytes and anything the host
//! linker sees: an optional aPLib unwrap when the buffer opens with the AP32
//! container, and (on the legacy pipeline only) normalization of a dylib
//! payload into the bundle shape the in-memory linkage API accepts. Both
//! work on bounded, owned buffers, so this module parses with `goblin`
//! rather than raw pointer walks.

use goblin::mach::MachO;
use goblin::mach::load_command::CommandVariant;

use crate::aplib::{self, ContainerHeader};
use crate::errors::LoadError;
use crate::macho::{HEADER_FILETYPE_OFFSET, LC_LAZY_LOAD_DYLIB, MH_BUNDLE, MH_DYLIB};

/// Checks the front of the staged buffer for an AP32 container.
///
/// `Ok(None)` means the buffer is not a container at all and flows to the
/// Mach-O path untouched; a container with inconsistent fields is an error.
pub fn packed_header(buffer: &[u8]) -> Result<Option<ContainerHeader>, LoadError> {
    match ContainerHeader::detect(buffer) {
        None => Ok(None),
        Some(hdr) if hdr.is_well_formed(buffer.len()) => Ok(Some(hdr)),
        Some(_) => Err(LoadError::PackedHeaderInvalid),
    }
}

/// Depacks the container's bitstream into `dst`, which the caller has sized
/// to `orig_size`. A stream that decodes to any other length is rejected.
pub fn depack_payload(
    hdr: &ContainerHeader,
    buffer: &[u8],
    dst: &mut [u8],
) -> Result<(), LoadError> {
    let produced = aplib::depack(hdr.packed_stream(buffer), dst)?;
    if produced != hdr.orig_size as usize {
        return Err(LoadError::DepackLengthMismatch);
    }
    Ok(())
}

/// What [`normalize_to_bundle`] did to the private copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedImage {
    /// The image identified itself as a dylib somewhere in its commands.
    /// Bookkeeping only.
    pub saw_id_dylib: bool,
    /// Load commands rewritten to `LC_LAZY_LOAD_DYLIB`.
    pub rewritten_commands: usize,
}

/// Rewrites a private copy of the payload so `NSCreateObjectFileImageFromMemory`
/// will take it: every `LC_ID_DYLIB` becomes `LC_LAZY_LOAD_DYLIB` and an
/// `MH_DYLIB` filetype flips to `MH_BUNDLE`. Anything that is neither a
/// 64-bit dylib nor a 64-bit bundle is rejected.
pub fn normalize_to_bundle(image: &mut [u8]) -> Result<NormalizedImage, LoadError> {
    let (file_type, id_dylib_offsets) = {
        let parsed = MachO::parse(image, 0).map_err(|_| LoadError::ImagePreparation)?;
        if !parsed.is_64 {
            return Err(LoadError::ImagePreparation);
        }
        let offsets: Vec<usize> = parsed
            .load_commands
            .iter()
            .filter(|lc| matches!(lc.command, CommandVariant::IdDylib(_)))
            .map(|lc| lc.offset)
            .collect();
        (parsed.header.filetype, offsets)
    };

    match file_type {
        MH_DYLIB => {
            image[HEADER_FILETYPE_OFFSET..HEADER_FILETYPE_OFFSET + 4]
                .copy_from_slice(&MH_BUNDLE.to_le_bytes());
        }
        MH_BUNDLE => {}
        _ => return Err(LoadError::ImagePreparation),
    }

    for &off in &id_dylib_offsets {
        image[off..off + 4].copy_from_slice(&LC_LAZY_LOAD_DYLIB.to_le_bytes());
    }

    Ok(NormalizedImage {
        saw_id_dylib: !id_dylib_offsets.is_empty(),
        rewritten_commands: id_dylib_offsets.len(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::aplib::CONTAINER_TAG;
    use crate::macho::{LC_ID_DYLIB, LC_SEGMENT_64, MH_MAGIC_64};

    fn container(header_size: u32, packed_size: u32, orig_size: u32, stream: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&CONTAINER_TAG.to_le_bytes());
        buf.extend_from_slice(&header_size.to_le_bytes());
        buf.extend_from_slice(&packed_size.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&orig_size.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.resize(header_size as usize, 0);
        buf.extend_from_slice(stream);
        buf
    }

    #[test]
    fn non_container_buffers_pass_through() {
        assert_eq!(packed_header(b"").unwrap(), None);
        assert_eq!(packed_header(&MH_MAGIC_64.to_le_bytes()).unwrap(), None);

        // Tag present but the buffer is one byte short of a full header.
        let mut short = vec![0u8; 23];
        short[..4].copy_from_slice(&CONTAINER_TAG.to_le_bytes());
        assert_eq!(packed_header(&short).unwrap(), None);
    }

    #[test]
    fn malformed_containers_are_errors() {
        // packed_size == 0
        let buf = container(24, 0, 64, &[]);
        assert!(matches!(
            packed_header(&buf),
            Err(LoadError::PackedHeaderInvalid)
        ));

        // header_size beyond the buffer
        let mut buf = container(24, 4, 64, &[0; 4]);
        buf[4..8].copy_from_slice(&100u32.to_le_bytes());
        assert!(matches!(
            packed_header(&buf),
            Err(LoadError::PackedHeaderInvalid)
        ));

        // orig_size == 0
        let buf = container(24, 4, 0, &[0; 4]);
        assert!(matches!(
            packed_header(&buf),
            Err(LoadError::PackedHeaderInvalid)
        ));
    }

    #[test]
    fn depack_length_must_match_the_header() {
        // A literal-only stream for "hi": 'h' verbatim, tag byte with a
        // 0 (literal) then 110 end marker, 'i', terminator byte.
        let stream = [b'h', 0b0110_0000, b'i', 0x00];
        let buf = container(24, stream.len() as u32, 2, &stream);
        let hdr = packed_header(&buf).unwrap().unwrap();

        let mut dst = vec![0u8; 2];
        depack_payload(&hdr, &buf, &mut dst).unwrap();
        assert_eq!(dst, b"hi");

        // Same stream advertised as three bytes: decode succeeds short.
        let buf = container(24, stream.len() as u32, 3, &stream);
        let hdr = packed_header(&buf).unwrap().unwrap();
        let mut dst = vec![0u8; 3];
        assert!(matches!(
            depack_payload(&hdr, &buf, &mut dst),
            Err(LoadError::DepackLengthMismatch)
        ));
    }

    /// A minimal 64-bit image goblin will parse: header + LC_ID_DYLIB +
    /// one empty segment.
    fn tiny_image(file_type: u32, with_id: bool) -> Vec<u8> {
        let mut cmds = Vec::new();
        let mut ncmds = 0u32;
        if with_id {
            cmds.extend_from_slice(&LC_ID_DYLIB.to_le_bytes());
            cmds.extend_from_slice(&32u32.to_le_bytes()); // cmdsize
            cmds.extend_from_slice(&24u32.to_le_bytes()); // name lc_str offset
            cmds.extend_from_slice(&0u32.to_le_bytes()); // timestamp
            cmds.extend_from_slice(&0u32.to_le_bytes()); // current_version
            cmds.extend_from_slice(&0u32.to_le_bytes()); // compatibility_version
            cmds.extend_from_slice(b"t.dylib\0");
            ncmds += 1;
        }
        cmds.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
        cmds.extend_from_slice(&72u32.to_le_bytes());
        let mut name16 = [0u8; 16];
        name16[..6].copy_from_slice(b"__TEXT");
        cmds.extend_from_slice(&name16);
        cmds.extend_from_slice(&[0u8; 48]); // vm/file spans, prots, nsects
        ncmds += 1;

        let mut image = Vec::new();
        image.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
        image.extend_from_slice(&0x0100_0007u32.to_le_bytes()); // x86_64
        image.extend_from_slice(&3u32.to_le_bytes());
        image.extend_from_slice(&file_type.to_le_bytes());
        image.extend_from_slice(&ncmds.to_le_bytes());
        image.extend_from_slice(&(cmds.len() as u32).to_le_bytes());
        image.extend_from_slice(&[0u8; 8]);
        image.extend_from_slice(&cmds);
        image
    }

    #[test]
    fn dylib_is_rewritten_to_a_bundle() {
        let mut image = tiny_image(MH_DYLIB, true);
        let id_offset = 32; // first command, right after the header

        let outcome = normalize_to_bundle(&mut image).unwrap();
        assert_eq!(
            outcome,
            NormalizedImage {
                saw_id_dylib: true,
                rewritten_commands: 1
            }
        );

        let file_type = u32::from_le_bytes(image[12..16].try_into().unwrap());
        assert_eq!(file_type, MH_BUNDLE);
        let cmd = u32::from_le_bytes(image[id_offset..id_offset + 4].try_into().unwrap());
        assert_eq!(cmd, LC_LAZY_LOAD_DYLIB);

        // Still parseable after the rewrite.
        let reparsed = MachO::parse(&image, 0).unwrap();
        assert_eq!(reparsed.header.filetype, MH_BUNDLE);
        assert!(
            reparsed
                .load_commands
                .iter()
                .any(|lc| matches!(lc.command, CommandVariant::LazyLoadDylib(_)))
        );
    }

    #[test]
    fn bundle_passes_unchanged() {
        let mut image = tiny_image(MH_BUNDLE, false);
        let before = image.clone();
        let outcome = normalize_to_bundle(&mut image).unwrap();
        assert_eq!(
            outcome,
            NormalizedImage {
                saw_id_dylib: false,
                rewritten_commands: 0
            }
        );
        assert_eq!(image, before);
    }

    #[test]
    fn non_library_filetypes_are_rejected() {
        const MH_EXECUTE: u32 = 0x2;
        let mut image = tiny_image(MH_EXECUTE, false);
        assert!(matches!(
            normalize_to_bundle(&mut image),
            Err(LoadError::ImagePreparation)
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        let mut junk = vec![0u8; 64];
        assert!(matches!(
            normalize_to_bundle(&mut junk),
            Err(LoadError::ImagePreparation)
        ));

        let mut truncated = tiny_image(MH_DYLIB, true);
        truncated.truncate(40);
        assert!(matches!(
            normalize_to_bundle(&mut truncated),
            Err(LoadError::ImagePreparation)
        ));
    }
}
