//! Safe depacker for aPLib "AP32" containers.
//!
//! Payloads may arrive wrapped in the aPLib safe container: a 24-byte
//! little-endian header followed by a gamma2-coded LZSS bitstream. The
//! decoder here is the "safe" variant: every bit and byte pulled from the
//! source and every byte produced into the destination is bounds-checked, so
//! truncated or hostile input fails with an error instead of reading or
//! writing out of bounds.

use scroll::{LE, Pread};
use thiserror::Error;

/// 'AP32', little-endian.
pub const CONTAINER_TAG: u32 = 0x3233_5041;

/// Smallest valid `header_size`.
pub const CONTAINER_HEADER_MIN: u32 = 24;

/// Decoder failure. All of these fold into wire code 15.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum DepackError {
    #[error("packed stream ended early")]
    TruncatedInput,
    #[error("packed stream produced more output than advertised")]
    OutputOverflow,
    #[error("back reference reaches before the start of the output")]
    InvalidOffset,
    #[error("gamma-coded value does not fit in 32 bits")]
    GammaOverflow,
}

/// The AP32 container header.
///
/// The two CRC fields are carried but never verified; the container producer
/// guards transport integrity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub header_size: u32,
    pub packed_size: u32,
    pub packed_crc: u32,
    pub orig_size: u32,
    pub orig_crc: u32,
}

impl ContainerHeader {
    /// Reads the container header if `buf` starts with the AP32 tag.
    ///
    /// Buffers shorter than the fixed header never match, even when the
    /// first four bytes carry the tag; they flow to the Mach-O path
    /// untouched.
    pub fn detect(buf: &[u8]) -> Option<Self> {
        if buf.len() < CONTAINER_HEADER_MIN as usize {
            return None;
        }
        let tag: u32 = buf.pread_with(0, LE).ok()?;
        if tag != CONTAINER_TAG {
            return None;
        }
        Some(Self {
            header_size: buf.pread_with(4, LE).ok()?,
            packed_size: buf.pread_with(8, LE).ok()?,
            packed_crc: buf.pread_with(12, LE).ok()?,
            orig_size: buf.pread_with(16, LE).ok()?,
            orig_crc: buf.pread_with(20, LE).ok()?,
        })
    }

    /// Whether the header fields are consistent with a buffer of
    /// `total_len` bytes.
    pub fn is_well_formed(&self, total_len: usize) -> bool {
        let header_size = self.header_size as usize;
        let packed_size = self.packed_size as usize;
        if self.header_size < CONTAINER_HEADER_MIN || header_size > total_len {
            return false;
        }
        if packed_size == 0 || packed_size > total_len - header_size {
            return false;
        }
        self.orig_size != 0
    }

    /// The packed bitstream inside `buf`.
    ///
    /// Only valid after [`is_well_formed`](Self::is_well_formed).
    pub fn packed_stream<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        let start = self.header_size as usize;
        &buf[start..start + self.packed_size as usize]
    }
}

struct BitReader<'a> {
    src: &'a [u8],
    pos: usize,
    tag: u32,
    bitcount: u32,
}

impl<'a> BitReader<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self {
            src,
            pos: 0,
            tag: 0,
            bitcount: 0,
        }
    }

    fn byte(&mut self) -> Result<u8, DepackError> {
        let b = *self.src.get(self.pos).ok_or(DepackError::TruncatedInput)?;
        self.pos += 1;
        Ok(b)
    }

    fn bit(&mut self) -> Result<u32, DepackError> {
        if self.bitcount == 0 {
            self.tag = u32::from(self.byte()?);
            self.bitcount = 8;
        }
        self.bitcount -= 1;
        let bit = (self.tag >> 7) & 0x01;
        self.tag <<= 1;
        Ok(bit)
    }

    /// Reads a gamma2-coded value; the encoding never produces values
    /// below 2.
    fn gamma(&mut self) -> Result<u32, DepackError> {
        let mut v: u32 = 1;
        loop {
            if v & 0x8000_0000 != 0 {
                return Err(DepackError::GammaOverflow);
            }
            v = (v << 1) + self.bit()?;
            if self.bit()? == 0 {
                return Ok(v);
            }
        }
    }
}

/// Decodes a packed aPLib stream into `dst`, returning the number of bytes
/// produced.
///
/// `dst` must be exactly as large as the expected decompressed size; a
/// stream that would overrun it is rejected, and a stream that terminates
/// early simply reports a shorter length (the caller compares against the
/// container's `orig_size`).
pub fn depack(src: &[u8], dst: &mut [u8]) -> Result<usize, DepackError> {
    fn put(dst: &mut [u8], out: &mut usize, b: u8) -> Result<(), DepackError> {
        if *out >= dst.len() {
            return Err(DepackError::OutputOverflow);
        }
        dst[*out] = b;
        *out += 1;
        Ok(())
    }

    let mut rd = BitReader::new(src);
    let mut out = 0usize;

    // Previous long-match offset, reused by the repeat opcode.
    let mut r0 = usize::MAX;
    // Set while the last opcode was a match; biases offset decoding.
    let mut lwm = false;

    // The stream always opens with one verbatim byte.
    let first = rd.byte()?;
    put(dst, &mut out, first)?;

    loop {
        if rd.bit()? == 0 {
            // 0: literal
            let b = rd.byte()?;
            put(dst, &mut out, b)?;
            lwm = false;
            continue;
        }
        if rd.bit()? == 0 {
            // 10: long match, gamma offset + gamma length
            let mut offs = rd.gamma()? as usize;
            let len;
            if !lwm && offs == 2 {
                // repeat previous offset
                offs = r0;
                len = rd.gamma()? as usize;
            } else {
                offs -= if lwm { 2 } else { 3 };
                if offs > 0x00ff_fffe {
                    return Err(DepackError::InvalidOffset);
                }
                offs = (offs << 8) + rd.byte()? as usize;
                let mut l = rd.gamma()? as usize;
                if offs >= 32000 {
                    l += 1;
                }
                if offs >= 1280 {
                    l += 1;
                }
                if offs < 128 {
                    l += 2;
                }
                len = l;
                r0 = offs;
            }
            if offs > out {
                return Err(DepackError::InvalidOffset);
            }
            if len > dst.len() - out {
                return Err(DepackError::OutputOverflow);
            }
            for _ in 0..len {
                let b = dst[out - offs];
                put(dst, &mut out, b)?;
            }
            lwm = true;
            continue;
        }
        if rd.bit()? == 0 {
            // 110: short match, 7-bit offset, 2 or 3 bytes; offset 0 ends
            // the stream
            let b = rd.byte()? as usize;
            let len = 2 + (b & 0x01);
            let offs = b >> 1;
            if offs == 0 {
                break;
            }
            if offs > out {
                return Err(DepackError::InvalidOffset);
            }
            if len > dst.len() - out {
                return Err(DepackError::OutputOverflow);
            }
            for _ in 0..len {
                let b = dst[out - offs];
                put(dst, &mut out, b)?;
            }
            r0 = offs;
            lwm = true;
            continue;
        }

        // 111: single byte from a 4-bit offset, or a zero byte
        let mut offs = 0usize;
        for _ in 0..4 {
            offs = (offs << 1) + rd.bit()? as usize;
        }
        if offs == 0 {
            put(dst, &mut out, 0x00)?;
        } else {
            if offs > out {
                return Err(DepackError::InvalidOffset);
            }
            let b = dst[out - offs];
            put(dst, &mut out, b)?;
        }
        lwm = false;
    }

    Ok(out)
}
