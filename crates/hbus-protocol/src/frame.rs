//! Inbound frame validation and byte-level resynchronization.
//!
//! Router frames share a 4-byte prefix and end in a checksum:
//!
//! ```text
//! +----+----+-----+-----+--------+------------------+----+
//! | ff | 23 | src | len | opcode | payload[..]      | ck |
//! +----+----+-----+-----+--------+------------------+----+
//!      |<---------------- len bytes ---------------------->|
//! ```
//!
//! `len` counts from the `23` marker through the checksum, so a frame spans
//! `len + 1` bytes on the wire. `ck` is the XOR of the bytes from `23` up to
//! the checksum. The line has no framing beyond this, so the decoder treats
//! any inconsistency as misalignment and realigns on the next `ff 23`.

use bytes::{Buf, BytesMut};

use crate::constants::*;
use crate::error::{ProtocolError, Result};

/// Initial capacity of the codec buffer.
pub const READ_BUFFER_SIZE: usize = 512;

/// XOR checksum over `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Position of the first `ff 23` marker pair in `window`.
pub fn find_marker(window: &[u8]) -> Option<usize> {
    window
        .windows(2)
        .position(|w| w[0] == RESP_PREAMBLE && w[1] == RESP_MARKER)
}

/// Whether a declared length can belong to a real frame.
pub fn is_plausible_len(declared: u8) -> bool {
    (MIN_DECLARED_LEN..=MAX_DECLARED_LEN).contains(&declared)
}

// ============================================================================
// Response Frame
// ============================================================================

/// A validated router → hub frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    bytes: Vec<u8>,
}

impl ResponseFrame {
    /// Validate a complete frame including prefix and checksum.
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < RESP_PREFIX_LEN {
            return Err(ProtocolError::FrameTooShort {
                expected: RESP_PREFIX_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != RESP_PREAMBLE || bytes[1] != RESP_MARKER {
            return Err(ProtocolError::BadMarker(bytes[0], bytes[1]));
        }
        let declared = bytes[3] as usize;
        if declared < MIN_DECLARED_LEN as usize {
            return Err(ProtocolError::FrameTooShort {
                expected: MIN_DECLARED_LEN as usize,
                actual: declared,
            });
        }
        if bytes.len() != declared + 1 {
            return Err(ProtocolError::LengthMismatch {
                declared,
                actual: bytes.len().saturating_sub(1),
            });
        }
        let last = bytes.len() - 1;
        let expected = checksum(&bytes[1..last]);
        if bytes[last] != expected {
            return Err(ProtocolError::ChecksumMismatch {
                expected,
                actual: bytes[last],
            });
        }
        Ok(ResponseFrame { bytes })
    }

    /// Rebuild a frame from a body that arrived without its own prefix.
    ///
    /// `body` runs from the opcode through the checksum.
    pub fn from_appended(source: u8, body: &[u8]) -> Result<Self> {
        if body.len() + 3 > u8::MAX as usize {
            return Err(ProtocolError::FrameTooLong {
                max: u8::MAX as usize - 3,
                actual: body.len(),
            });
        }
        let mut bytes = Vec::with_capacity(RESP_PREFIX_LEN + body.len());
        bytes.extend_from_slice(&[RESP_PREAMBLE, RESP_MARKER, source, (body.len() + 3) as u8]);
        bytes.extend_from_slice(body);
        Self::parse(bytes)
    }

    /// Build a well-formed frame, as the router would send it.
    pub fn build(source: u8, opcode: u8, payload: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(RESP_PREFIX_LEN + payload.len() + 2);
        bytes.extend_from_slice(&[RESP_PREAMBLE, RESP_MARKER, source, 0, opcode]);
        bytes.extend_from_slice(payload);
        bytes[3] = (bytes.len()) as u8;
        bytes.push(checksum(&bytes[1..]));
        ResponseFrame { bytes }
    }

    /// Router id the frame came from.
    pub fn source(&self) -> u8 {
        self.bytes[2]
    }

    /// Value of the length byte.
    pub fn declared_len(&self) -> u8 {
        self.bytes[3]
    }

    /// Opcode byte.
    pub fn opcode(&self) -> u8 {
        self.bytes[RESP_OPCODE_INDEX]
    }

    /// Bytes between the opcode and the checksum.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[RESP_OPCODE_INDEX + 1..self.bytes.len() - 1]
    }

    /// The whole frame as received.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the frame, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Total length on the wire.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; a parsed frame holds at least a prefix.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ============================================================================
// Frame Codec
// ============================================================================

/// Result of one decode step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete, checksum-valid frame.
    Frame(ResponseFrame),
    /// Bytes were dropped to realign on the next marker.
    Resync {
        /// Number of bytes discarded.
        discarded: usize,
        /// What was wrong with them.
        cause: ProtocolError,
    },
    /// The buffer holds no complete frame yet.
    NeedMore,
}

/// Take one step of decoding from the front of `buf`.
///
/// Bytes before the first marker are discarded. A degenerate length or a
/// checksum failure discards a single byte so scanning resumes right after
/// the false marker. Call repeatedly until [`Decoded::NeedMore`].
pub fn decode_buf(buf: &mut BytesMut) -> Decoded {
    if buf.is_empty() {
        return Decoded::NeedMore;
    }

    match find_marker(buf) {
        Some(0) => {}
        Some(offset) => {
            let cause = ProtocolError::BadMarker(buf[0], buf[1]);
            buf.advance(offset);
            return Decoded::Resync { discarded: offset, cause };
        }
        None => {
            // Keep a trailing ff: it may be the first half of the next marker.
            let keep = usize::from(buf[buf.len() - 1] == RESP_PREAMBLE);
            let discarded = buf.len() - keep;
            if discarded == 0 {
                return Decoded::NeedMore;
            }
            let cause = ProtocolError::BadMarker(buf[0], buf.get(1).copied().unwrap_or(0));
            buf.advance(discarded);
            return Decoded::Resync { discarded, cause };
        }
    }

    if buf.len() < RESP_PREFIX_LEN {
        return Decoded::NeedMore;
    }

    let declared = buf[3];
    if !is_plausible_len(declared) {
        buf.advance(1);
        let cause = if declared < MIN_DECLARED_LEN {
            ProtocolError::FrameTooShort {
                expected: MIN_DECLARED_LEN as usize,
                actual: declared as usize,
            }
        } else {
            ProtocolError::FrameTooLong {
                max: MAX_DECLARED_LEN as usize,
                actual: declared as usize,
            }
        };
        return Decoded::Resync { discarded: 1, cause };
    }

    let total = declared as usize + 1;
    if buf.len() < total {
        return Decoded::NeedMore;
    }

    match ResponseFrame::parse(buf[..total].to_vec()) {
        Ok(frame) => {
            buf.advance(total);
            Decoded::Frame(frame)
        }
        Err(cause) => {
            buf.advance(1);
            Decoded::Resync { discarded: 1, cause }
        }
    }
}

/// A codec accumulating bytes and splitting them into router frames.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Buffer for accumulating incoming data.
    buffer: BytesMut,
}

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        FrameCodec {
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Add received data to the buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take one decode step. See [`decode_buf`].
    pub fn decode(&mut self) -> Decoded {
        decode_buf(&mut self.buffer)
    }

    /// Decode until a frame is found or more data is needed, counting the
    /// resync steps taken on the way.
    pub fn next_frame(&mut self) -> (Option<ResponseFrame>, usize) {
        let mut resyncs = 0;
        loop {
            match self.decode() {
                Decoded::Frame(frame) => return (Some(frame), resyncs),
                Decoded::Resync { .. } => resyncs += 1,
                Decoded::NeedMore => return (None, resyncs),
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
