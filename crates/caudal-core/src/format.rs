//! PCM sample format descriptions.
//!
//! A [`SampleFormat`] is validated at construction so the hot paths (mute,
//! delay, marshalling) never have to re-check sample sizes.

use thiserror::Error;

/// Errors from [`SampleFormat`] construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    /// The sample size is not one of the supported widths.
    #[error("unsupported sample size: {0} bytes (supported: 1, 2, 3, 4, 8)")]
    UnsupportedSize(usize),

    /// Float samples only exist in 4- and 8-byte widths.
    #[error("float samples must be 4 or 8 bytes, got {0}")]
    InvalidFloatSize(usize),
}

/// Byte order of multi-byte samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

/// A validated PCM sample format.
///
/// The supported storage widths are 1, 2, 3, 4 and 8 bytes. `packed_24`
/// marks 24 significant bits stored in a 4-byte slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFormat {
    bytes: usize,
    is_float: bool,
    endianness: Endianness,
    packed_24: bool,
}

impl SampleFormat {
    /// Create a format, validating the sample size.
    pub fn new(bytes: usize, is_float: bool, endianness: Endianness) -> Result<Self, FormatError> {
        match bytes {
            1 | 2 | 3 | 4 | 8 => {}
            other => return Err(FormatError::UnsupportedSize(other)),
        }
        if is_float && bytes != 4 && bytes != 8 {
            return Err(FormatError::InvalidFloatSize(bytes));
        }
        Ok(Self {
            bytes,
            is_float,
            endianness,
            packed_24: false,
        })
    }

    /// Signed 16-bit little-endian.
    pub fn s16_le() -> Self {
        Self {
            bytes: 2,
            is_float: false,
            endianness: Endianness::Little,
            packed_24: false,
        }
    }

    /// Signed 24-bit little-endian packed in 3 bytes.
    pub fn s24_3le() -> Self {
        Self {
            bytes: 3,
            is_float: false,
            endianness: Endianness::Little,
            packed_24: false,
        }
    }

    /// Signed 24-bit little-endian stored in a 4-byte slot.
    pub fn s24_4le() -> Self {
        Self {
            bytes: 4,
            is_float: false,
            endianness: Endianness::Little,
            packed_24: true,
        }
    }

    /// Signed 32-bit little-endian.
    pub fn s32_le() -> Self {
        Self {
            bytes: 4,
            is_float: false,
            endianness: Endianness::Little,
            packed_24: false,
        }
    }

    /// 32-bit float in native byte order.
    pub fn f32_ne() -> Self {
        Self {
            bytes: 4,
            is_float: true,
            endianness: native_endianness(),
            packed_24: false,
        }
    }

    /// 64-bit float in native byte order.
    pub fn f64_ne() -> Self {
        Self {
            bytes: 8,
            is_float: true,
            endianness: native_endianness(),
            packed_24: false,
        }
    }

    /// Storage width of one sample in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Whether samples are floating point.
    pub fn is_float(&self) -> bool {
        self.is_float
    }

    /// Byte order of the samples.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Whether this is 24 significant bits in a 4-byte slot.
    pub fn is_packed_24(&self) -> bool {
        self.packed_24
    }
}

/// The byte order of the running machine.
pub fn native_endianness() -> Endianness {
    if cfg!(target_endian = "big") {
        Endianness::Big
    } else {
        Endianness::Little
    }
}
