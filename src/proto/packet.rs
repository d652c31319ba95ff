//! Typed packet construction and parsing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

use super::wire::{self, DecodeError};
use crate::tick::Tick;

/// Packet opcodes.
///
/// The opcode byte follows the size-control body length on the wire and is
/// not counted in it. Future opcodes decode as [`Opcode::Unknown`] and are
/// skipped by the framing loop.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, IntoPrimitive, FromPrimitive)]
pub enum Opcode {
    /// Heartbeat and version negotiation.
    Version = 0x80,
    /// Advertise a tenant's top-level hash.
    Tenant = 0x81,
    /// A layer of child rollup hashes within a tenant's tree.
    TenantHash = 0x82,
    /// Content hash for a file that has no priority yet.
    FileHash = 0x83,
    /// A file inode with its stat.
    FileExists = 0x90,
    /// A directory inode.
    CreateDirectory = 0x91,
    /// A move-out marker.
    MoveOut = 0x93,
    /// A block of file content at an offset.
    FileDataBlock = 0x9F,
    /// Any opcode this implementation does not know.
    #[num_enum(default)]
    Unknown = 0x00,
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// An outbound packet under construction.
///
/// Writers append to the body; [`OutPacket::encode`] produces the final
/// frame including the size-control length and the opcode byte.
#[derive(Debug)]
pub struct OutPacket {
    opcode: Opcode,
    body: BytesMut,
}

impl OutPacket {
    /// Start a packet for the given opcode.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            body: BytesMut::with_capacity(64),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.body.put_u8(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.body.put_u32(value);
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.body.put_u64(value);
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.body.put_i64(value);
        self
    }

    /// Write a tick as `i64 time` then `u32 server`.
    pub fn write_tick(&mut self, tick: Tick) -> &mut Self {
        self.body.put_i64(tick.time);
        self.body.put_u32(tick.server);
        self
    }

    /// Write a string with its byte length as a size-control prefix.
    pub fn write_str(&mut self, value: &str) -> &mut Self {
        wire::put_size_control(&mut self.body, value.len());
        self.body.put_slice(value.as_bytes());
        self
    }

    /// Write raw bytes with no length prefix.
    ///
    /// Callers must emit a size-control first when the length is not fixed
    /// by the packet layout.
    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.body.put_slice(value);
        self
    }

    /// Encode the outer frame: `<size-control body-len><opcode><body>`.
    pub fn encode(self) -> Bytes {
        let mut frame = BytesMut::with_capacity(self.body.len() + 5);
        wire::put_size_control(&mut frame, self.body.len());
        frame.put_u8(self.opcode.into());
        frame.put_slice(&self.body);
        frame.freeze()
    }
}

/// The body of a received packet.
///
/// Each typed read decrements the remaining-byte count; reads past the end
/// fail with [`DecodeError::PrematureEof`]. Unread trailing bytes are simply
/// dropped with the packet.
#[derive(Debug)]
pub struct InPacket {
    body: Bytes,
}

impl InPacket {
    pub fn new(body: Bytes) -> Self {
        Self { body }
    }

    /// True once every body byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.body.len()
    }

    fn check(&self, wanted: usize) -> Result<(), DecodeError> {
        if self.body.len() < wanted {
            Err(DecodeError::PrematureEof {
                missing: wanted - self.body.len(),
            })
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.check(1)?;
        Ok(self.body.get_u8())
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.check(4)?;
        Ok(self.body.get_u32())
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        self.check(8)?;
        Ok(self.body.get_u64())
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        self.check(8)?;
        Ok(self.body.get_i64())
    }

    /// Read a tick, advancing the process clock floor past it.
    pub fn read_tick(&mut self) -> Result<Tick, DecodeError> {
        let time = self.read_i64()?;
        let server = self.read_u32()?;
        Ok(Tick::overheard(time, server))
    }

    /// Read a size-control length prefix.
    pub fn size_control(&mut self) -> Result<usize, DecodeError> {
        wire::get_size_control(&mut self.body)
    }

    /// Read a size-control prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.size_control()?;
        let raw = self.read_bytes(len)?;
        Ok(std::str::from_utf8(&raw)?.to_owned())
    }

    /// Read exactly `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, DecodeError> {
        self.check(len)?;
        Ok(self.body.split_to(len))
    }

    /// Read a fixed 32-byte digest.
    pub fn read_digest(&mut self) -> Result<[u8; 32], DecodeError> {
        let raw = self.read_bytes(32)?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&raw);
        Ok(digest)
    }

    /// Consume the rest of the body.
    pub fn read_remaining(&mut self) -> Bytes {
        self.body.split_to(self.body.len())
    }
}

/// Split one frame off an in-memory buffer.
///
/// Returns the opcode and the packet body. Used by tests and anywhere a
/// frame is already fully buffered; the connection reader decodes straight
/// from the socket instead.
pub fn decode_frame(buf: &mut Bytes) -> Result<(Opcode, InPacket), DecodeError> {
    let body_len = wire::get_size_control(buf)?;
    if buf.remaining() < body_len + 1 {
        return Err(DecodeError::PrematureEof {
            missing: body_len + 1 - buf.remaining(),
        });
    }
    let opcode = Opcode::from(buf.get_u8());
    let body = buf.split_to(body_len);
    Ok((opcode, InPacket::new(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_are_stable() {
        assert_eq!(u8::from(Opcode::Version), 0x80);
        assert_eq!(u8::from(Opcode::Tenant), 0x81);
        assert_eq!(u8::from(Opcode::TenantHash), 0x82);
        assert_eq!(u8::from(Opcode::FileHash), 0x83);
        assert_eq!(u8::from(Opcode::FileExists), 0x90);
        assert_eq!(u8::from(Opcode::CreateDirectory), 0x91);
        assert_eq!(u8::from(Opcode::MoveOut), 0x93);
        assert_eq!(u8::from(Opcode::FileDataBlock), 0x9F);
        assert_eq!(Opcode::from(0x42), Opcode::Unknown);
    }

    #[test]
    fn frame_layout() {
        let mut packet = OutPacket::new(Opcode::Version);
        packet.write_u8(1);
        let frame = packet.encode();
        // body length excludes the opcode byte
        assert_eq!(&frame[..], &[0x01, 0x80, 0x01]);
    }

    #[test]
    fn typed_fields_roundtrip() {
        let tick = Tick {
            time: 1_234_567,
            server: 9,
        };
        let mut packet = OutPacket::new(Opcode::FileExists);
        packet
            .write_tick(tick)
            .write_str("docs")
            .write_str("a/b.txt")
            .write_u64(4096)
            .write_i64(777);
        let mut frame = packet.encode();

        let (opcode, mut body) = decode_frame(&mut frame).unwrap();
        assert_eq!(opcode, Opcode::FileExists);
        assert_eq!(body.read_tick().unwrap(), tick);
        assert_eq!(body.read_string().unwrap(), "docs");
        assert_eq!(body.read_string().unwrap(), "a/b.txt");
        assert_eq!(body.read_u64().unwrap(), 4096);
        assert_eq!(body.read_i64().unwrap(), 777);
        assert!(body.is_empty());
        assert!(frame.is_empty());
    }

    #[test]
    fn reads_past_the_body_fail() {
        let mut packet = InPacket::new(Bytes::from_static(&[0x01, 0x02]));
        assert_eq!(packet.read_u8().unwrap(), 1);
        assert!(matches!(
            packet.read_u32(),
            Err(DecodeError::PrematureEof { missing: 3 })
        ));
    }

    #[test]
    fn every_opcode_roundtrips_through_a_frame() {
        for opcode in [
            Opcode::Version,
            Opcode::Tenant,
            Opcode::TenantHash,
            Opcode::FileHash,
            Opcode::FileExists,
            Opcode::CreateDirectory,
            Opcode::MoveOut,
            Opcode::FileDataBlock,
        ] {
            let mut packet = OutPacket::new(opcode);
            packet.write_bytes(b"payload");
            let mut frame = packet.encode();
            let (decoded, mut body) = decode_frame(&mut frame).unwrap();
            assert_eq!(decoded, opcode);
            assert_eq!(&body.read_remaining()[..], b"payload");
        }
    }
}
