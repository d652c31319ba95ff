//! The rask wire protocol.
//!
//! Every packet travels as `<size-control body-length><opcode><body>`, where
//! the body length does not count the opcode byte. All multi-byte integers
//! are big-endian. See [`wire`] for the size-control encoding and [`packet`]
//! for the typed packet readers and writers.

pub mod packet;
pub mod wire;

pub use packet::{InPacket, Opcode, OutPacket};
pub use wire::{DecodeError, MAX_BODY_SIZE};

/// The protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;
