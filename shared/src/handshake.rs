//! Identity and version compatibility check.
//!
//! Both peers build a canonical list of version strings: the protocol
//! version, the simulation tick rate, and one entry per registered message
//! kind. The lists are compared element by element and the first difference
//! is fatal to the connection.

use crate::config::NetworkSettings;
use crate::error::HandshakeError;
use crate::protocol::{MessageRegistry, Transport};

pub const PROTOCOL_VERSION: &str = "arena-netcode/1";

/// Stand-in reported when one list is shorter than the other
pub const MISSING_ENTRY: &str = "<missing>";

pub fn canonical_versions(registry: &MessageRegistry, settings: &NetworkSettings) -> Vec<String> {
    let mut versions = vec![
        format!("protocol={}", PROTOCOL_VERSION),
        format!("tick_rate={}", settings.tick_rate),
    ];

    versions.extend(registry.kinds().into_iter().map(|kind| {
        let transport = match kind.transport() {
            Transport::Stream => "stream",
            Transport::Datagram => "datagram",
        };
        format!(
            "{}={}/{}/{}",
            kind.name(),
            kind.type_code(),
            u8::from(kind.is_reply()),
            transport
        )
    }));
    versions
}

/// Compares the local `expected` list with the peer's `actual` list.
///
/// # Errors
/// `VersionMismatch` naming the first differing index and both values.
pub fn compare_versions(expected: &[String], actual: &[String]) -> Result<(), HandshakeError> {
    let len = expected.len().max(actual.len());

    for index in 0..len {
        let expected = expected.get(index).map_or(MISSING_ENTRY, String::as_str);
        let actual = actual.get(index).map_or(MISSING_ENTRY, String::as_str);

        if expected != actual {
            return Err(HandshakeError::VersionMismatch {
                index,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }
    Ok(())
}
