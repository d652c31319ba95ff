//! Size-control encoding and decode errors.
//!
//! A size-control value encodes a non-negative integer in one to four bytes:
//!
//! | first byte    | meaning                      |
//! |---------------|------------------------------|
//! | `0x00..=0x7F` | the value itself             |
//! | `0xF9`        | value in the next byte       |
//! | `0xFA`        | value in the next two bytes  |
//! | `0xFB`        | value in the next three bytes|
//! | anything else | reserved, fails decode       |
//!
//! Encode and decode are symmetric; the largest encodable value bounds a
//! single packet body at [`MAX_BODY_SIZE`].

use bytes::{Buf, BufMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest value a size-control sequence can carry (three follow-up bytes).
pub const MAX_BODY_SIZE: usize = 0xFF_FFFF;

/// Errors produced while decoding packets.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The first byte of a size-control sequence was in the reserved range.
    #[error("invalid size control byte {byte:#04x}")]
    InvalidSizeByte {
        /// The offending byte.
        byte: u8,
    },
    /// A packet body ended before a typed read was satisfied.
    #[error("packet ended {missing} bytes early")]
    PrematureEof {
        /// How many bytes were still expected.
        missing: usize,
    },
    /// A wire string was not valid UTF-8.
    #[error("string field is not valid utf-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    /// A known opcode arrived in a state this node does not support.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    /// The underlying socket failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Append `value` as a size-control sequence, using the shortest form.
///
/// Values above [`MAX_BODY_SIZE`] are unencodable and violate an internal
/// invariant, so this panics rather than truncating on the wire.
pub fn put_size_control<B: BufMut>(buf: &mut B, value: usize) {
    assert!(value <= MAX_BODY_SIZE, "size control overflow: {value}");
    if value < 0x80 {
        buf.put_u8(value as u8);
    } else if value <= 0xFF {
        buf.put_u8(0xF9);
        buf.put_u8(value as u8);
    } else if value <= 0xFFFF {
        buf.put_u8(0xFA);
        buf.put_u16(value as u16);
    } else {
        buf.put_u8(0xFB);
        buf.put_u8((value >> 16) as u8);
        buf.put_u16(value as u16);
    }
}

/// Decode a size-control sequence from an in-memory buffer.
pub fn get_size_control<B: Buf>(buf: &mut B) -> Result<usize, DecodeError> {
    if buf.remaining() < 1 {
        return Err(DecodeError::PrematureEof { missing: 1 });
    }
    let first = buf.get_u8();
    match first {
        0x00..=0x7F => Ok(first as usize),
        0xF9..=0xFB => {
            let follow = (first - 0xF8) as usize;
            if buf.remaining() < follow {
                return Err(DecodeError::PrematureEof {
                    missing: follow - buf.remaining(),
                });
            }
            let mut value = 0usize;
            for _ in 0..follow {
                value = value << 8 | buf.get_u8() as usize;
            }
            Ok(value)
        }
        _ => Err(DecodeError::InvalidSizeByte { byte: first }),
    }
}

/// Read a size-control sequence from a socket.
///
/// Returns `Ok(None)` on a clean end of stream before the first byte, so the
/// framing loop can distinguish an orderly close from a truncated frame.
pub async fn read_size_control<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<usize>, DecodeError> {
    let first = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    match first {
        0x00..=0x7F => Ok(Some(first as usize)),
        0xF9 => Ok(Some(reader.read_u8().await? as usize)),
        0xFA => Ok(Some(reader.read_u16().await? as usize)),
        0xFB => {
            let high = reader.read_u8().await? as usize;
            let low = reader.read_u16().await? as usize;
            Ok(Some(high << 16 | low))
        }
        _ => Err(DecodeError::InvalidSizeByte { byte: first }),
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use proptest::prelude::*;

    use super::*;

    fn encode(value: usize) -> Bytes {
        let mut buf = BytesMut::new();
        put_size_control(&mut buf, value);
        buf.freeze()
    }

    #[test]
    fn encoded_widths_match_the_table() {
        assert_eq!(encode(0).len(), 1);
        assert_eq!(encode(0x7F).len(), 1);
        assert_eq!(encode(0x80).len(), 2);
        assert_eq!(encode(0xFF).len(), 2);
        assert_eq!(encode(0x100).len(), 3);
        assert_eq!(encode(0xFFFF).len(), 3);
        assert_eq!(encode(0x1_0000).len(), 4);
        assert_eq!(encode(MAX_BODY_SIZE).len(), 4);
    }

    #[test]
    fn reserved_first_bytes_fail() {
        for byte in [0x80u8, 0xA0, 0xF7, 0xF8, 0xFC, 0xFF] {
            let mut buf = Bytes::copy_from_slice(&[byte, 0, 0, 0]);
            let err = get_size_control(&mut buf).unwrap_err();
            assert!(
                matches!(err, DecodeError::InvalidSizeByte { byte: b } if b == byte),
                "byte {byte:#04x} must be rejected"
            );
        }
    }

    #[test]
    fn truncated_follow_bytes_fail() {
        let mut buf = Bytes::copy_from_slice(&[0xFA, 0x01]);
        assert!(matches!(
            get_size_control(&mut buf),
            Err(DecodeError::PrematureEof { missing: 1 })
        ));
    }

    #[tokio::test]
    async fn async_reader_sees_clean_eof() {
        let mut empty: &[u8] = &[];
        assert!(read_size_control(&mut empty).await.unwrap().is_none());

        let mut truncated: &[u8] = &[0xFB, 0x01];
        assert!(read_size_control(&mut truncated).await.is_err());
    }

    proptest! {
        #[test]
        fn roundtrip(value in 0usize..=MAX_BODY_SIZE) {
            let encoded = encode(value);
            let mut buf = encoded.clone();
            prop_assert_eq!(get_size_control(&mut buf).unwrap(), value);
            prop_assert_eq!(buf.remaining(), 0);
        }

        #[test]
        fn async_roundtrip(value in 0usize..=MAX_BODY_SIZE) {
            let encoded = encode(value);
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let decoded = rt
                .block_on(read_size_control(&mut encoded.as_ref()))
                .unwrap();
            prop_assert_eq!(decoded, Some(value));
        }
    }
}
