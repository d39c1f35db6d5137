//! Wire format: header, message kinds and the registration table.

pub mod header;
pub mod message;
pub mod registry;

pub use header::{MessageHeader, HEADER_LEN, MAGIC, MAX_BODY_LEN};
pub use message::*;
pub use registry::MessageRegistry;
