//! Typed errors for the connection and replication layer.
//!
//! Background tasks never surface these by panicking: stream and datagram
//! loops turn them into strings on a connection's error queue, and the
//! broker reports [`ConnectionError`] values through its result queue.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised while framing or decoding messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Header did not start with the magic marker
    #[error("bad magic marker {actual:02x?}, expected {expected:02x?}")]
    BadMagic { expected: [u8; 2], actual: [u8; 2] },

    /// No message kind is registered for this (type code, reply flag) pair
    #[error("unknown message type code {type_code} (reply: {reply})")]
    UnknownType { type_code: u8, reply: bool },

    /// Two message kinds claimed the same (type code, reply flag) pair
    #[error("message type code {type_code} (reply: {reply}) registered twice: {existing} and {duplicate}")]
    DuplicateRegistration {
        type_code: u8,
        reply: bool,
        existing: &'static str,
        duplicate: &'static str,
    },

    /// Fewer bytes than the header or declared body length require
    #[error("frame too short: required {required} bytes, got {actual}")]
    Truncated { required: usize, actual: usize },

    /// A datagram carried bytes past the end of its declared body
    #[error("datagram has {extra} trailing bytes after its frame")]
    TrailingBytes { extra: usize },

    /// Declared body length exceeds the protocol limit
    #[error("declared body length {declared} exceeds the limit of {limit} bytes")]
    BodyTooLarge { declared: u32, limit: u32 },

    /// Body bytes could not be decoded into the registered message kind
    #[error("failed to decode {kind} body: {reason}")]
    Body { kind: &'static str, reason: String },

    /// Body could not be serialized
    #[error("failed to encode {kind} body: {reason}")]
    Encode { kind: &'static str, reason: String },
}

/// Errors raised while establishing or running connections
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Every connection identifier is in use
    #[error("connection identifier pool exhausted ({capacity} connections open)")]
    PoolExhausted { capacity: usize },

    /// Listening or datagram socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The listening socket failed to accept a peer
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// A datagram-only connection was requested without a bound datagram socket
    #[error("no datagram socket is bound")]
    NoDatagramSocket,

    /// A connect race was started without endpoints
    #[error("no candidate endpoints to connect to")]
    NoCandidates,

    /// Every candidate endpoint refused or failed
    #[error("all {attempts} connect attempts failed (last error: {last_error})")]
    ConnectFailed { attempts: usize, last_error: String },

    /// Underlying socket error
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the identity/version handshake
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// Canonical version lists differ at `index`
    #[error("version mismatch at index {index}: expected '{expected}', got '{actual}'")]
    VersionMismatch {
        index: usize,
        expected: String,
        actual: String,
    },
}

/// Errors raised while reading replicated object state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    /// State bytes ended before the field was complete
    #[error("state ended at byte {offset} while reading {field}")]
    Truncated { field: &'static str, offset: usize },
}
