//! Protocol error types.

use thiserror::Error;

/// Errors that can occur when encoding or decoding bus frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is too short to be valid.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Expected minimum length.
        expected: usize,
        /// Actual length received.
        actual: usize,
    },

    /// Frame is too long.
    #[error("frame too long: maximum {max} bytes, got {actual}")]
    FrameTooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual length.
        actual: usize,
    },

    /// The inbound marker pair `ff 23` is missing.
    #[error("bad frame marker: {0:02x} {1:02x}")]
    BadMarker(u8, u8),

    /// Declared length disagrees with the bytes present.
    #[error("length mismatch: declared {declared}, got {actual} bytes")]
    LengthMismatch {
        /// Length byte value.
        declared: usize,
        /// Bytes actually covered.
        actual: usize,
    },

    /// Checksum byte does not match the frame content.
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch {
        /// Checksum computed over the frame.
        expected: u8,
        /// Checksum carried by the frame.
        actual: u8,
    },

    /// A template placeholder has no substitution value.
    #[error("missing value for placeholder <{0}>")]
    MissingPlaceholder(String),

    /// A substitution value does not fit the declared field width.
    #[error("value for <{name}> is {actual} bytes, field holds {width}")]
    FieldWidth {
        /// Placeholder name.
        name: String,
        /// Declared width.
        width: usize,
        /// Supplied value length.
        actual: usize,
    },

    /// The template itself is malformed.
    #[error("invalid template: {0}")]
    InvalidTemplate(String),
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
