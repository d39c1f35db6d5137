//! Fixed-size message header.
//!
//! ```text
//! +-----------------+
//! | magic (2)       |  0xA7 0x5E
//! +-----------------+
//! | type code (1)   |
//! +-----------------+
//! | flags (1)       |  bit 0 = reply flag
//! +-----------------+
//! | body length (4) |  u32 little-endian
//! +-----------------+
//! ```

use crate::error::ProtocolError;

pub const MAGIC: [u8; 2] = [0xA7, 0x5E];
pub const HEADER_LEN: usize = 8;
pub const MAX_BODY_LEN: u32 = 1 << 20;

const REPLY_FLAG: u8 = 0b0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub type_code: u8,
    pub reply: bool,
    pub body_len: u32,
}

impl MessageHeader {
    pub fn new(type_code: u8, reply: bool, body_len: u32) -> Self {
        Self {
            type_code,
            reply,
            body_len,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        out.push(self.type_code);
        out.push(if self.reply { REPLY_FLAG } else { 0 });
        out.extend_from_slice(&self.body_len.to_le_bytes());
    }

    /// Parses a header from the start of `bytes`.
    ///
    /// # Errors
    /// - `ProtocolError::Truncated` if fewer than `HEADER_LEN` bytes are given
    /// - `ProtocolError::BadMagic` if the magic marker doesn't match
    /// - `ProtocolError::BodyTooLarge` if the declared body exceeds `MAX_BODY_LEN`
    pub fn read(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                required: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let actual = [bytes[0], bytes[1]];
        if actual != MAGIC {
            return Err(ProtocolError::BadMagic {
                expected: MAGIC,
                actual,
            });
        }

        let body_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if body_len > MAX_BODY_LEN {
            return Err(ProtocolError::BodyTooLarge {
                declared: body_len,
                limit: MAX_BODY_LEN,
            });
        }

        Ok(Self {
            type_code: bytes[2],
            reply: bytes[3] & REPLY_FLAG != 0,
            body_len,
        })
    }

    /// Total frame length: header plus declared body
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize
    }
}

/// Position of the first magic marker in `bytes`, if any
pub fn find_magic(bytes: &[u8]) -> Option<usize> {
    bytes.windows(MAGIC.len()).position(|window| window == MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut out = Vec::new();
        MessageHeader::new(11, true, 0x0102).write(&mut out);

        assert_eq!(out.len(), HEADER_LEN);
        assert_eq!(&out[0..2], &MAGIC);
        assert_eq!(out[2], 11);
        assert_eq!(out[3], 1);
        assert_eq!(&out[4..8], &[0x02, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_header_read_back() {
        let mut out = Vec::new();
        let header = MessageHeader::new(4, false, 12);
        header.write(&mut out);

        assert_eq!(MessageHeader::read(&out), Ok(header));
        assert_eq!(header.frame_len(), HEADER_LEN + 12);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let bytes = [0x00, 0x5E, 1, 0, 0, 0, 0, 0];
        assert_eq!(
            MessageHeader::read(&bytes),
            Err(ProtocolError::BadMagic {
                expected: MAGIC,
                actual: [0x00, 0x5E],
            })
        );
    }

    #[test]
    fn test_header_rejects_short_input() {
        assert_eq!(
            MessageHeader::read(&MAGIC),
            Err(ProtocolError::Truncated {
                required: HEADER_LEN,
                actual: 2,
            })
        );
    }

    #[test]
    fn test_header_rejects_oversized_body() {
        let mut out = Vec::new();
        MessageHeader::new(1, false, MAX_BODY_LEN + 1).write(&mut out);
        assert!(matches!(
            MessageHeader::read(&out),
            Err(ProtocolError::BodyTooLarge { .. })
        ));
    }

    #[test]
    fn test_find_magic() {
        assert_eq!(find_magic(&[1, 2, 0xA7, 0x5E, 3]), Some(2));
        assert_eq!(find_magic(&[0xA7, 1, 0x5E]), None);
        assert_eq!(find_magic(&[]), None);
    }
}
