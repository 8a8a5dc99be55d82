//! Classification of router frames received in operate mode.
//!
//! Each opcode family has a fixed or computed wire length. The router
//! sometimes appends a second frame to the first without repeating the
//! prefix; [`split_appended`] separates the two using the expected length.

use crate::constants::*;
use crate::error::Result;
use crate::events::SystemEvent;
use crate::frame::ResponseFrame;
use crate::mirror::{MirrorStatus, MIRROR_LEN};

/// Wire length of a mode acknowledgement that switched to operate mode.
pub const MODE_ACK_LEN: usize = 9;
/// Wire length of a router channel status frame.
pub const CHANNEL_STATUS_LEN: usize = 48;
/// Wire length of a collective command echo.
pub const COLLECTIVE_ECHO_LEN: usize = 7;
/// Wire length of a module mirror frame.
pub const MIRROR_FRAME_LEN: usize = RESP_PREFIX_LEN + 1 + MIRROR_LEN + 1;

/// A classified router frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    /// Mode switch acknowledgement.
    ModeAck {
        /// True when the router entered operate mode.
        operate: bool,
    },
    /// Router channel status; `None` when the router reported mode 0.
    ChannelStatus(Option<Vec<u8>>),
    /// Collective command echo.
    CollectiveEcho {
        /// Command number.
        command: u8,
    },
    /// Direct module command echo.
    DirectEcho {
        /// Module addressed.
        module: u8,
    },
    /// Forwarded command echo.
    ForwardEcho,
    /// Module mirror update.
    Mirror(MirrorStatus),
    /// System event frame.
    System(SystemEvent),
    /// System mode report.
    SystemMode {
        /// Mode byte.
        mode: u8,
    },
    /// Global flag set or reset.
    GlobalFlag {
        /// True for set.
        set: bool,
    },
    /// Anything else; dropped.
    Unrecognised {
        /// Opcode byte.
        opcode: u8,
    },
}

impl BusMessage {
    /// Expected wire length of the frame starting at `raw[0]`.
    ///
    /// `None` means the family has no fixed length and the declared length
    /// is taken as is.
    pub fn expected_len(raw: &[u8]) -> Option<usize> {
        match *raw.get(RESP_OPCODE_INDEX)? {
            OP_MODE_ACK if raw.get(5) == Some(&1) => Some(MODE_ACK_LEN),
            OP_CHANNEL_STATUS => Some(CHANNEL_STATUS_LEN),
            OP_COLLECTIVE_CMD => Some(COLLECTIVE_ECHO_LEN),
            OP_DIRECT_CMD => raw.get(8).map(|&n| n as usize + 8),
            OP_FORWARD_CMD => raw.get(7).map(|&n| n as usize),
            OP_SYSTEM_EVENT => SystemEvent::expected_len(raw),
            OP_MIRROR => Some(MIRROR_FRAME_LEN),
            _ => None,
        }
    }

    /// Classify a validated frame.
    pub fn decode(frame: &ResponseFrame) -> BusMessage {
        let raw = frame.as_bytes();
        let payload = frame.payload();
        match frame.opcode() {
            OP_MODE_ACK => BusMessage::ModeAck {
                operate: payload.first() == Some(&1),
            },
            OP_CHANNEL_STATUS => {
                let status = match payload.get(1) {
                    Some(&mode) if mode != 0 => Some(payload.to_vec()),
                    _ => None,
                };
                BusMessage::ChannelStatus(status)
            }
            OP_COLLECTIVE_CMD => BusMessage::CollectiveEcho {
                command: payload.first().copied().unwrap_or(0),
            },
            OP_DIRECT_CMD => BusMessage::DirectEcho {
                module: payload.first().copied().unwrap_or(0),
            },
            OP_FORWARD_CMD => BusMessage::ForwardEcho,
            OP_SYSTEM_EVENT => BusMessage::System(SystemEvent::decode(raw)),
            OP_MIRROR => match MirrorStatus::new(payload.to_vec()) {
                Ok(status) => BusMessage::Mirror(status),
                Err(_) => BusMessage::Unrecognised { opcode: OP_MIRROR },
            },
            OP_SYSTEM_MODE => BusMessage::SystemMode {
                mode: payload.first().copied().unwrap_or(0),
            },
            OP_GLOBAL_FLAG_SET => BusMessage::GlobalFlag { set: true },
            OP_GLOBAL_FLAG_RESET => BusMessage::GlobalFlag { set: false },
            opcode => BusMessage::Unrecognised { opcode },
        }
    }
}

/// Outcome of splitting a raw frame against its expected length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Split {
    /// The bytes form exactly one frame.
    Single(Vec<u8>),
    /// A leading frame followed by the body of an appended frame.
    Appended {
        /// The leading frame, with its length byte restored.
        first: Vec<u8>,
        /// Opcode through checksum of the appended frame.
        rest: Vec<u8>,
    },
    /// Fewer bytes than the frame family needs.
    Truncated {
        /// Expected wire length.
        expected: usize,
    },
}

/// Separate an appended frame from `raw` (prefix included).
///
/// The split falls at the first frame's full wire length, checksum included,
/// so `rest` starts at the appended frame's opcode. The leading frame gets
/// its own length written back into byte 3 so it can be checksum-verified
/// on its own.
pub fn split_appended(raw: Vec<u8>) -> Split {
    let expected = match BusMessage::expected_len(&raw) {
        Some(n) if n > RESP_PREFIX_LEN => n,
        _ => return Split::Single(raw),
    };
    if raw.len() < expected {
        return Split::Truncated { expected };
    }
    if raw.len() == expected {
        return Split::Single(raw);
    }
    let mut first = raw;
    let rest = first.split_off(expected);
    first[3] = (expected - 1) as u8;
    Split::Appended { first, rest }
}

/// Rebuild and validate the frame appended after another one.
pub fn appended_frame(source: u8, rest: &[u8]) -> Result<ResponseFrame> {
    ResponseFrame::from_appended(source, rest)
}

/// Build an appended pair the way the router emits it: the first frame's
/// length byte covers both.
pub fn join_appended(first: &ResponseFrame, second: &ResponseFrame) -> Vec<u8> {
    let mut bytes = first.as_bytes().to_vec();
    bytes.extend_from_slice(&second.as_bytes()[RESP_PREFIX_LEN..]);
    bytes[3] = (bytes.len() - 1) as u8;
    bytes
}
