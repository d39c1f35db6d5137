//! Frame reassembly for the stream transport and single-frame parsing for
//! datagrams.
//!
//! A stream delivers bytes in arbitrary chunks. [`FrameReader`] buffers them
//! and yields a message once a whole header and the declared body are
//! available. Leftover bytes stay at the front of the buffer for the next
//! frame.
//!
//! # Resynchronization
//!
//! When the buffer does not start with the magic marker the reader reports a
//! single `BadMagic` error and then scans forward byte by byte for the next
//! marker, discarding everything before it. A corrupt header's length field
//! is never used to skip bytes.

use crate::error::ProtocolError;
use crate::protocol::header::{find_magic, MessageHeader, HEADER_LEN, MAGIC};
use crate::protocol::{Message, MessageRegistry};

#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
    resyncing: bool,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete frame, a protocol error, or `None` when
    /// more data is needed.
    pub fn next_message(
        &mut self,
        registry: &MessageRegistry,
    ) -> Option<Result<Message, ProtocolError>> {
        loop {
            if self.buffer.len() < MAGIC.len() {
                return None;
            }

            if self.buffer[..MAGIC.len()] != MAGIC {
                let actual = [self.buffer[0], self.buffer[1]];
                self.skip_to_next_magic();
                if !self.resyncing {
                    self.resyncing = true;
                    return Some(Err(ProtocolError::BadMagic {
                        expected: MAGIC,
                        actual,
                    }));
                }
                continue;
            }

            if self.buffer.len() < HEADER_LEN {
                return None;
            }

            let header = match MessageHeader::read(&self.buffer) {
                Ok(header) => header,
                Err(e) => {
                    // Oversized length: drop the marker so the scan moves past it
                    self.buffer.drain(..MAGIC.len());
                    self.resyncing = true;
                    return Some(Err(e));
                }
            };

            let frame_len = header.frame_len();
            if self.buffer.len() < frame_len {
                return None;
            }

            self.resyncing = false;
            let result = registry.decode(&header, &self.buffer[HEADER_LEN..frame_len]);
            self.buffer.drain(..frame_len);
            return Some(result);
        }
    }

    fn skip_to_next_magic(&mut self) {
        match find_magic(&self.buffer[1..]) {
            Some(position) => {
                self.buffer.drain(..position + 1);
            }
            None => {
                // Keep a trailing first marker byte; its partner may still arrive
                let keep = usize::from(self.buffer.last() == Some(&MAGIC[0]));
                let cut = self.buffer.len() - keep;
                self.buffer.drain(..cut);
            }
        }
    }
}

/// Parses one datagram as exactly one frame.
///
/// # Errors
/// Header errors, `Truncated` if the body is short, `TrailingBytes` if the
/// packet is longer than its frame, and body decoding errors.
pub fn decode_datagram(packet: &[u8], registry: &MessageRegistry) -> Result<Message, ProtocolError> {
    let header = MessageHeader::read(packet)?;
    let frame_len = header.frame_len();

    if packet.len() < frame_len {
        return Err(ProtocolError::Truncated {
            required: frame_len,
            actual: packet.len(),
        });
    }
    if packet.len() > frame_len {
        return Err(ProtocolError::TrailingBytes {
            extra: packet.len() - frame_len,
        });
    }

    registry.decode(&header, &packet[HEADER_LEN..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Close, ObjectUpdate, Ping};

    fn registry() -> MessageRegistry {
        MessageRegistry::standard().unwrap()
    }

    fn sample_stream() -> (Vec<Message>, Vec<u8>) {
        let messages: Vec<Message> = vec![
            Ping {
                timestamp_micros: 42,
            }
            .into(),
            Close {
                reason: "done".to_string(),
            }
            .into(),
            ObjectUpdate {
                object_id: 9,
                frame: 1000,
                state: vec![7; 40],
            }
            .into(),
        ];
        let mut bytes = Vec::new();
        for message in &messages {
            bytes.extend(message.encode().unwrap());
        }
        (messages, bytes)
    }

    fn drain(reader: &mut FrameReader, registry: &MessageRegistry) -> Vec<Result<Message, ProtocolError>> {
        let mut out = Vec::new();
        while let Some(event) = reader.next_message(registry) {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_whole_frames() {
        let registry = registry();
        let (messages, bytes) = sample_stream();
        let mut reader = FrameReader::new();

        reader.extend(&bytes);
        let decoded: Vec<Message> = drain(&mut reader, &registry)
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(decoded, messages);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_frames_split_at_every_boundary() {
        let registry = registry();
        let (messages, bytes) = sample_stream();

        for split in 0..=bytes.len() {
            let mut reader = FrameReader::new();
            let mut decoded = Vec::new();

            reader.extend(&bytes[..split]);
            decoded.extend(drain(&mut reader, &registry));
            reader.extend(&bytes[split..]);
            decoded.extend(drain(&mut reader, &registry));

            let decoded: Vec<Message> = decoded.into_iter().map(|r| r.unwrap()).collect();
            assert_eq!(decoded, messages, "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let registry = registry();
        let (messages, bytes) = sample_stream();
        let mut reader = FrameReader::new();
        let mut decoded = Vec::new();

        for byte in &bytes {
            reader.extend(std::slice::from_ref(byte));
            decoded.extend(drain(&mut reader, &registry));
        }

        let decoded: Vec<Message> = decoded.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(decoded, messages);
    }

    #[test]
    fn test_partial_header_waits() {
        let registry = registry();
        let (_, bytes) = sample_stream();
        let mut reader = FrameReader::new();

        reader.extend(&bytes[..HEADER_LEN - 1]);
        assert!(reader.next_message(&registry).is_none());
        assert_eq!(reader.buffered(), HEADER_LEN - 1);
    }

    #[test]
    fn test_garbage_reports_once_then_resynchronizes() {
        let registry = registry();
        let (messages, bytes) = sample_stream();
        let mut reader = FrameReader::new();

        reader.extend(&[0x01, 0x02, 0xA7, 0x03, 0x04]);
        reader.extend(&bytes);
        let events = drain(&mut reader, &registry);

        assert!(matches!(events[0], Err(ProtocolError::BadMagic { .. })));
        let decoded: Vec<Message> = events[1..].iter().cloned().map(|r| r.unwrap()).collect();
        assert_eq!(decoded, messages);
    }

    #[test]
    fn test_unknown_type_consumes_frame() {
        let registry = registry();
        let mut reader = FrameReader::new();
        let mut bytes = Vec::new();
        MessageHeader::new(200, false, 3).write(&mut bytes);
        bytes.extend_from_slice(&[1, 2, 3]);
        bytes.extend(Message::from(Ping { timestamp_micros: 1 }).encode().unwrap());

        reader.extend(&bytes);
        let events = drain(&mut reader, &registry);

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            Err(ProtocolError::UnknownType {
                type_code: 200,
                reply: false,
            })
        );
        assert_eq!(events[1], Ok(Ping { timestamp_micros: 1 }.into()));
    }

    #[test]
    fn test_trailing_marker_byte_is_kept() {
        let registry = registry();
        let mut reader = FrameReader::new();
        let frame = Message::from(Ping { timestamp_micros: 3 }).encode().unwrap();

        reader.extend(&[0x10, 0x11, frame[0]]);
        assert!(matches!(
            reader.next_message(&registry),
            Some(Err(ProtocolError::BadMagic { .. }))
        ));
        assert_eq!(reader.buffered(), 1);

        reader.extend(&frame[1..]);
        assert_eq!(
            reader.next_message(&registry),
            Some(Ok(Ping { timestamp_micros: 3 }.into()))
        );
    }

    #[test]
    fn test_datagram_decoding() {
        let registry = registry();
        let frame = Message::from(Ping { timestamp_micros: 8 }).encode().unwrap();

        assert_eq!(
            decode_datagram(&frame, &registry),
            Ok(Ping { timestamp_micros: 8 }.into())
        );
        assert!(matches!(
            decode_datagram(&frame[..frame.len() - 1], &registry),
            Err(ProtocolError::Truncated { .. })
        ));

        let mut long = frame.clone();
        long.push(0);
        assert_eq!(
            decode_datagram(&long, &registry),
            Err(ProtocolError::TrailingBytes { extra: 1 })
        );
        assert!(matches!(
            decode_datagram(b"hello world", &registry),
            Err(ProtocolError::BadMagic { .. })
        ));
    }
}
