//! Instrument response block decoding.
//!
//! Instruments answer trace and curve queries in one of two shapes:
//!
//! - a comma-separated ASCII number list (`-71.2, -70.9, ...`), used by the
//!   spectrum analyser when the trace format is set to ASCII;
//! - an IEEE 488.2 definite-length arbitrary block
//!   (`#<n><len digits><len bytes of payload>[terminator]`), used by the
//!   oscilloscope for binary curve data.
//!
//! Everything here is pure: a buffer and a format go in, raw (unscaled)
//! values come out.

use crate::error::{AcqError, AcqResult};

/// First byte of a self-describing block.
pub const BLOCK_MARKER: u8 = b'#';

/// Byte order of multi-byte samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first.
    BigEndian,
    /// Least significant byte first.
    LittleEndian,
}

/// Width of one sample in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleWidth {
    /// One signed byte per sample.
    Byte,
    /// Two bytes per sample (signed 16-bit).
    Word,
}

impl SampleWidth {
    /// Number of payload bytes per sample.
    pub fn bytes(self) -> usize {
        match self {
            SampleWidth::Byte => 1,
            SampleWidth::Word => 2,
        }
    }
}

/// How binary samples are laid out in a block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleEncoding {
    /// Bytes per sample.
    pub width: SampleWidth,
    /// Byte order for multi-byte samples.
    pub order: ByteOrder,
}

impl SampleEncoding {
    /// Signed 16-bit big-endian, the oscilloscope curve format (`DATa:WIDth 2`).
    pub const I16_BE: SampleEncoding = SampleEncoding {
        width: SampleWidth::Word,
        order: ByteOrder::BigEndian,
    };

    /// Signed 16-bit little-endian.
    pub const I16_LE: SampleEncoding = SampleEncoding {
        width: SampleWidth::Word,
        order: ByteOrder::LittleEndian,
    };

    /// Signed 8-bit (`DATa:WIDth 1`).
    pub const I8: SampleEncoding = SampleEncoding {
        width: SampleWidth::Byte,
        order: ByteOrder::BigEndian,
    };
}

/// Declared response format for a decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFormat {
    /// Comma-separated floating-point list, optionally behind a block header.
    Ascii,
    /// Definite-length block of fixed-width signed integers.
    Binary(SampleEncoding),
}

/// Decoded but unscaled samples.
#[derive(Debug, Clone, PartialEq)]
pub enum RawSamples {
    /// Values parsed from an ASCII list.
    Real(Vec<f64>),
    /// Integer codes read from a binary payload.
    Integer(Vec<i16>),
}

impl RawSamples {
    /// Number of samples.
    pub fn len(&self) -> usize {
        match self {
            RawSamples::Real(v) => v.len(),
            RawSamples::Integer(v) => v.len(),
        }
    }

    /// True if no samples were decoded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widen to `f64` for the scaling engine.
    pub fn into_f64(self) -> Vec<f64> {
        match self {
            RawSamples::Real(v) => v,
            RawSamples::Integer(v) => v.into_iter().map(f64::from).collect(),
        }
    }
}

/// Parsed `#<n><len>` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Bytes consumed by the header itself (`#`, the digit count and the length digits).
    pub header_len: usize,
    /// Declared payload length; `None` for an indefinite-length block (`#0`).
    pub payload_len: Option<usize>,
}

impl BlockHeader {
    /// Parse the header at the start of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not start with [`BLOCK_MARKER`].
    pub fn parse(buf: &[u8]) -> AcqResult<Option<BlockHeader>> {
        if buf.first() != Some(&BLOCK_MARKER) {
            return Ok(None);
        }
        let digit = *buf
            .get(1)
            .ok_or_else(|| AcqError::MalformedBlock("header ends after '#'".into()))?;
        let n = length_digit_count(digit)?;
        if n == 0 {
            return Ok(Some(BlockHeader {
                header_len: 2,
                payload_len: None,
            }));
        }
        let digits = buf.get(2..2 + n).ok_or_else(|| {
            AcqError::MalformedBlock(format!(
                "header declares {} length digits but only {} bytes follow",
                n,
                buf.len().saturating_sub(2)
            ))
        })?;
        Ok(Some(BlockHeader {
            header_len: 2 + n,
            payload_len: Some(parse_length_digits(digits)?),
        }))
    }
}

/// Interpret the digit following `#` as the number of length digits.
pub fn length_digit_count(byte: u8) -> AcqResult<usize> {
    if byte.is_ascii_digit() {
        Ok(usize::from(byte - b'0'))
    } else {
        Err(AcqError::MalformedBlock(format!(
            "expected length-of-length digit, found byte 0x{:02x}",
            byte
        )))
    }
}

/// Parse the ASCII length field of a block header.
pub fn parse_length_digits(digits: &[u8]) -> AcqResult<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(AcqError::MalformedBlock(format!(
            "invalid length field {:?}",
            String::from_utf8_lossy(digits)
        )));
    }
    digits.iter().try_fold(0usize, |acc, d| {
        acc.checked_mul(10)
            .and_then(|v| v.checked_add(usize::from(d - b'0')))
            .ok_or_else(|| AcqError::MalformedBlock("length field overflows".into()))
    })
}

fn is_terminator(bytes: &[u8]) -> bool {
    matches!(bytes, b"" | b"\n" | b"\r\n")
}

/// Return the payload of a block response.
///
/// With a definite-length header the declared length must match what is
/// left after the header, allowing only a trailing `\n` or `\r\n`. A buffer
/// without a header is returned unchanged. An indefinite block (`#0`) runs to
/// the end of the buffer minus one trailing newline.
pub fn split_block(buf: &[u8]) -> AcqResult<&[u8]> {
    let Some(header) = BlockHeader::parse(buf)? else {
        return Ok(buf);
    };
    let rest = &buf[header.header_len..];
    match header.payload_len {
        None => Ok(rest.strip_suffix(b"\n").unwrap_or(rest)),
        Some(len) => {
            if rest.len() < len || !is_terminator(&rest[len..]) {
                return Err(AcqError::LengthMismatch {
                    declared: len,
                    actual: rest.len(),
                });
            }
            Ok(&rest[..len])
        }
    }
}

/// Reinterpret a binary payload as signed integer samples.
pub fn decode_samples(payload: &[u8], encoding: SampleEncoding) -> AcqResult<Vec<i16>> {
    let width = encoding.width.bytes();
    if payload.len() % width != 0 {
        return Err(AcqError::MalformedBlock(format!(
            "payload of {} bytes is not a multiple of the {}-byte sample width",
            payload.len(),
            width
        )));
    }
    let samples = match encoding.width {
        SampleWidth::Byte => payload.iter().map(|&b| i16::from(b as i8)).collect(),
        SampleWidth::Word => payload
            .chunks_exact(2)
            .map(|pair| {
                let bytes = [pair[0], pair[1]];
                match encoding.order {
                    ByteOrder::BigEndian => i16::from_be_bytes(bytes),
                    ByteOrder::LittleEndian => i16::from_le_bytes(bytes),
                }
            })
            .collect(),
    };
    Ok(samples)
}

/// Decode a definite-length binary block into integer samples.
pub fn decode_binary_block(buf: &[u8], encoding: SampleEncoding) -> AcqResult<Vec<i16>> {
    decode_samples(split_block(buf)?, encoding)
}

/// Decode a comma-separated ASCII number list.
///
/// A leading block header is skipped without checking its declared length;
/// analysers disagree about whether the count includes trailing whitespace.
pub fn decode_ascii(buf: &[u8]) -> AcqResult<Vec<f64>> {
    let body = match BlockHeader::parse(buf)? {
        Some(header) => &buf[header.header_len..],
        None => buf,
    };
    let text = std::str::from_utf8(body)
        .map_err(|e| AcqError::MalformedBlock(format!("ASCII payload is not UTF-8: {}", e)))?
        .trim();
    if text.is_empty() {
        return Err(AcqError::EmptyPayload);
    }
    text.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token.parse::<f64>().map_err(|_| AcqError::NumericParseError {
                token: token.to_string(),
            })
        })
        .collect()
}

/// Decode `buf` according to `format`.
pub fn decode(buf: &[u8], format: BlockFormat) -> AcqResult<RawSamples> {
    match format {
        BlockFormat::Ascii => decode_ascii(buf).map(RawSamples::Real),
        BlockFormat::Binary(encoding) => decode_binary_block(buf, encoding).map(RawSamples::Integer),
    }
}
