//! Router Bus Protocol
//!
//! This crate provides types and utilities for talking to a bus router over
//! its serial line. It is free of I/O: callers feed it bytes and get typed
//! frames, messages and events back.
//!
//! # Protocol Overview
//!
//! - **Commands** (hub → router): `2a rtr len opcode args.. ck`, built from
//!   byte templates with named placeholders
//! - **Responses and events** (router → hub): `ff 23 src len opcode payload.. ck`
//! - **Checksum**: XOR over the frame bytes before it (inbound frames start the
//!   XOR at the `23` marker)
//!
//! In operate mode the router pushes unsolicited frames: module mirrors,
//! discrete system events and command echoes. [`BusMessage`] classifies
//! them, [`MirrorTable`] turns mirror updates into [`Event`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! use hbus_protocol::{templates, Command, FrameCodec, Decoded};
//!
//! let frame = Command::new(templates::SET_OPR_MODE)
//!     .byte("mirr", 1)
//!     .byte("evnt", 1)
//!     .encode(1)?;
//!
//! let mut codec = FrameCodec::new();
//! codec.push(&received);
//! if let Decoded::Frame(reply) = codec.decode() {
//!     assert_eq!(reply.opcode(), 0x85);
//! }
//! ```

mod constants;
mod error;
mod events;
mod frame;
mod mirror;
mod responses;
mod template;

pub use constants::*;
pub use error::*;
pub use events::*;
pub use frame::*;
pub use mirror::*;
pub use responses::*;
pub use template::*;
