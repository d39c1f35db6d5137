//! Startup-time registration table mapping (type code, reply flag) pairs to
//! message kinds.

use crate::error::ProtocolError;
use crate::protocol::header::MessageHeader;
use crate::protocol::message::{Message, MessageKind};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    kinds: BTreeMap<(u8, bool), MessageKind>,
}

impl MessageRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding every kind the protocol declares.
    ///
    /// # Errors
    /// `ProtocolError::DuplicateRegistration` if two kinds share a code pair.
    pub fn standard() -> Result<Self, ProtocolError> {
        Self::with_kinds(MessageKind::ALL)
    }

    pub fn with_kinds(kinds: &[MessageKind]) -> Result<Self, ProtocolError> {
        let mut registry = Self::empty();
        for kind in kinds {
            registry.register(*kind)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, kind: MessageKind) -> Result<(), ProtocolError> {
        let key = (kind.type_code(), kind.is_reply());
        if let Some(existing) = self.kinds.get(&key) {
            return Err(ProtocolError::DuplicateRegistration {
                type_code: key.0,
                reply: key.1,
                existing: existing.name(),
                duplicate: kind.name(),
            });
        }
        self.kinds.insert(key, kind);
        Ok(())
    }

    pub fn lookup(&self, type_code: u8, reply: bool) -> Option<MessageKind> {
        self.kinds.get(&(type_code, reply)).copied()
    }

    /// Decodes a body whose header has already been validated
    pub fn decode(&self, header: &MessageHeader, body: &[u8]) -> Result<Message, ProtocolError> {
        let kind = self
            .lookup(header.type_code, header.reply)
            .ok_or(ProtocolError::UnknownType {
                type_code: header.type_code,
                reply: header.reply,
            })?;
        kind.decode_body(body)
    }

    /// Registered kinds ordered by (type code, reply flag)
    pub fn kinds(&self) -> Vec<MessageKind> {
        self.kinds.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_has_every_kind() {
        let registry = MessageRegistry::standard().unwrap();
        assert_eq!(registry.len(), MessageKind::ALL.len());

        for kind in MessageKind::ALL {
            assert_eq!(
                registry.lookup(kind.type_code(), kind.is_reply()),
                Some(*kind)
            );
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = MessageRegistry::empty();
        registry.register(MessageKind::Ping).unwrap();

        let err = registry.register(MessageKind::Ping).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::DuplicateRegistration {
                type_code: 4,
                reply: false,
                existing: "Ping",
                duplicate: "Ping",
            }
        );
    }

    #[test]
    fn test_request_and_reply_share_a_code() {
        let registry =
            MessageRegistry::with_kinds(&[MessageKind::Ping, MessageKind::Pong]).unwrap();
        assert_eq!(registry.lookup(4, false), Some(MessageKind::Ping));
        assert_eq!(registry.lookup(4, true), Some(MessageKind::Pong));
    }

    #[test]
    fn test_unknown_pair_is_protocol_error() {
        let registry = MessageRegistry::standard().unwrap();
        let header = MessageHeader::new(99, false, 0);

        assert_eq!(
            registry.decode(&header, &[]),
            Err(ProtocolError::UnknownType {
                type_code: 99,
                reply: false,
            })
        );
    }

    #[test]
    fn test_kinds_are_ordered_by_code() {
        let registry = MessageRegistry::standard().unwrap();
        let codes: Vec<(u8, bool)> = registry
            .kinds()
            .iter()
            .map(|k| (k.type_code(), k.is_reply()))
            .collect();

        let mut sorted = codes.clone();
        sorted.sort();
        assert_eq!(codes, sorted);
    }
}
