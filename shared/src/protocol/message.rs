//! Message kinds and bodies.
//!
//! Every kind is declared once in the table at the bottom of this file with
//! its type code, reply flag and transport. Structured bodies are encoded
//! with bincode's default fixed-width options; the two event kinds are
//! hand-packed so identifiers and small enumerations share a single byte.

use crate::error::ProtocolError;
use crate::protocol::header::{MessageHeader, HEADER_LEN, MAX_BODY_LEN};
use serde::{Deserialize, Serialize};

/// Channel a message kind travels over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Reliable, ordered stream channel
    Stream,
    /// Unreliable datagram channel
    Datagram,
}

/// Body encoding owned by each concrete message type
pub trait WireBody: Sized {
    fn encode(&self) -> Result<Vec<u8>, ProtocolError>;
    fn decode(body: &[u8]) -> Result<Self, ProtocolError>;
}

/// Typed access to one variant of [`Message`]
pub trait MessageBody: Sized + Into<Message> {
    const KIND: MessageKind;

    fn from_message(message: Message) -> Option<Self>;
}

/// Identity and version announcement sent by a client after connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
    pub versions: Vec<String>,
    pub client_key: u64,
}

/// Server acceptance of a [`Hello`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub connection_id: u8,
    pub datagram_port: u16,
    pub player_object: u16,
    pub frame: u32,
}

/// Human-readable reason sent before a connection is torn down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    pub reason: String,
}

/// Datagram sent by a client so the server can learn its datagram endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatagramProbe {
    pub connection_id: u8,
    pub client_key: u64,
}

/// Stream confirmation that the server has learnt the client's datagram endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatagramConfirmed {
    pub observed_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp_micros: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Timestamp copied from the answered [`Ping`]
    pub timestamp_micros: u64,
    /// Replier's simulation time when answering
    pub sim_time_micros: u64,
    /// Replier's frame number when answering
    pub frame: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaLoad {
    pub arena: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaReady {
    pub arena: String,
}

/// First announcement of an object to a connection, carrying its constant fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCreation {
    pub object_id: u16,
    pub kind: u8,
    pub frame: u32,
    pub constant: Vec<u8>,
    pub varying: Vec<u8>,
}

/// Per-tick varying state of a server object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    pub object_id: u16,
    pub frame: u32,
    pub state: Vec<u8>,
}

/// Per-tick varying state of a client-controlled object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlUpdate {
    pub object_id: u16,
    pub frame: u32,
    pub state: Vec<u8>,
}

/// Game server announcement to a management service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub arena: String,
    pub players: u8,
    pub capacity: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfoAck {
    pub accepted: bool,
}

/// Sound played for collision and deletion events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoundType {
    Silent,
    Light,
    Heavy,
    Explosion,
}

impl SoundType {
    pub fn bits(self) -> u8 {
        match self {
            SoundType::Silent => 0,
            SoundType::Light => 1,
            SoundType::Heavy => 2,
            SoundType::Explosion => 3,
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => SoundType::Silent,
            1 => SoundType::Light,
            2 => SoundType::Heavy,
            _ => SoundType::Explosion,
        }
    }
}

/// Largest area identifier that fits the 2-bit packed field
pub const MAX_AREA: u8 = 3;

/// Packs two area identifiers and a sound into one byte:
/// `area1` in bits 0-1, `area2` in bits 2-3, sound in bits 4-5.
/// Areas above [`MAX_AREA`] are clamped.
pub fn pack_event_byte(area1: u8, area2: u8, sound: SoundType) -> u8 {
    area1.min(MAX_AREA) | (area2.min(MAX_AREA) << 2) | (sound.bits() << 4)
}

pub fn unpack_event_byte(byte: u8) -> (u8, u8, SoundType) {
    (byte & 0b11, (byte >> 2) & 0b11, SoundType::from_bits(byte >> 4))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCollision {
    pub object1: u16,
    pub object2: u16,
    pub area1: u8,
    pub area2: u8,
    pub sound: SoundType,
}

impl ObjectCollision {
    pub fn new(object1: u16, object2: u16, area1: u8, area2: u8, sound: SoundType) -> Self {
        Self {
            object1,
            object2,
            area1: area1.min(MAX_AREA),
            area2: area2.min(MAX_AREA),
            sound,
        }
    }
}

impl WireBody for ObjectCollision {
    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(5);
        out.extend_from_slice(&self.object1.to_le_bytes());
        out.extend_from_slice(&self.object2.to_le_bytes());
        out.push(pack_event_byte(self.area1, self.area2, self.sound));
        Ok(out)
    }

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 5 {
            return Err(ProtocolError::Truncated {
                required: 5,
                actual: body.len(),
            });
        }
        let (area1, area2, sound) = unpack_event_byte(body[4]);
        Ok(Self {
            object1: u16::from_le_bytes([body[0], body[1]]),
            object2: u16::from_le_bytes([body[2], body[3]]),
            area1,
            area2,
            sound,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDeletion {
    pub object_id: u16,
    pub sound: SoundType,
}

impl WireBody for ObjectDeletion {
    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(3);
        out.extend_from_slice(&self.object_id.to_le_bytes());
        out.push(pack_event_byte(0, 0, self.sound));
        Ok(out)
    }

    fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 3 {
            return Err(ProtocolError::Truncated {
                required: 3,
                actual: body.len(),
            });
        }
        let (_, _, sound) = unpack_event_byte(body[2]);
        Ok(Self {
            object_id: u16::from_le_bytes([body[0], body[1]]),
            sound,
        })
    }
}

macro_rules! bincode_bodies {
    ($($body:ident),* $(,)?) => {$(
        impl WireBody for $body {
            fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
                bincode::serialize(self).map_err(|e| ProtocolError::Encode {
                    kind: stringify!($body),
                    reason: e.to_string(),
                })
            }

            fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
                bincode::deserialize(body).map_err(|e| ProtocolError::Body {
                    kind: stringify!($body),
                    reason: e.to_string(),
                })
            }
        }
    )*};
}

bincode_bodies!(
    Hello,
    Welcome,
    Close,
    DatagramProbe,
    DatagramConfirmed,
    Ping,
    Pong,
    ArenaLoad,
    ArenaReady,
    ObjectCreation,
    ObjectUpdate,
    ControlUpdate,
    ServerInfo,
    ServerInfoAck,
);

macro_rules! message_table {
    ($($kind:ident => $code:literal, $reply:literal, $transport:ident;)*) => {
        /// Discriminant of every message the protocol knows
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageKind {
            $($kind,)*
        }

        impl MessageKind {
            pub const ALL: &'static [MessageKind] = &[$(MessageKind::$kind,)*];

            pub fn type_code(self) -> u8 {
                match self {
                    $(MessageKind::$kind => $code,)*
                }
            }

            pub fn is_reply(self) -> bool {
                match self {
                    $(MessageKind::$kind => $reply,)*
                }
            }

            pub fn transport(self) -> Transport {
                match self {
                    $(MessageKind::$kind => Transport::$transport,)*
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(MessageKind::$kind => stringify!($kind),)*
                }
            }

            pub(crate) fn decode_body(self, body: &[u8]) -> Result<Message, ProtocolError> {
                match self {
                    $(MessageKind::$kind => $kind::decode(body).map(Message::$kind),)*
                }
            }
        }

        #[derive(Debug, Clone, PartialEq)]
        pub enum Message {
            $($kind($kind),)*
        }

        impl Message {
            pub fn kind(&self) -> MessageKind {
                match self {
                    $(Message::$kind(_) => MessageKind::$kind,)*
                }
            }

            fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
                match self {
                    $(Message::$kind(body) => body.encode(),)*
                }
            }
        }

        $(
            impl MessageBody for $kind {
                const KIND: MessageKind = MessageKind::$kind;

                fn from_message(message: Message) -> Option<Self> {
                    match message {
                        Message::$kind(body) => Some(body),
                        _ => None,
                    }
                }
            }

            impl From<$kind> for Message {
                fn from(body: $kind) -> Self {
                    Message::$kind(body)
                }
            }
        )*
    };
}

message_table! {
    Hello => 1, false, Stream;
    Welcome => 1, true, Stream;
    Close => 2, false, Stream;
    DatagramProbe => 3, false, Datagram;
    DatagramConfirmed => 3, true, Stream;
    Ping => 4, false, Datagram;
    Pong => 4, true, Datagram;
    ArenaLoad => 5, false, Stream;
    ArenaReady => 5, true, Stream;
    ObjectCreation => 10, false, Stream;
    ObjectUpdate => 11, false, Datagram;
    ObjectCollision => 12, false, Datagram;
    ObjectDeletion => 13, false, Stream;
    ControlUpdate => 14, false, Datagram;
    ServerInfo => 20, false, Stream;
    ServerInfoAck => 20, true, Stream;
}

impl Message {
    pub fn transport(&self) -> Transport {
        self.kind().transport()
    }

    /// Sender frame number for per-tick state messages
    pub fn frame(&self) -> Option<u32> {
        match self {
            Message::ObjectCreation(body) => Some(body.frame),
            Message::ObjectUpdate(body) => Some(body.frame),
            Message::ControlUpdate(body) => Some(body.frame),
            _ => None,
        }
    }

    /// Serializes header and body into one frame
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = self.encode_body()?;
        if body.len() > MAX_BODY_LEN as usize {
            return Err(ProtocolError::BodyTooLarge {
                declared: u32::try_from(body.len()).unwrap_or(u32::MAX),
                limit: MAX_BODY_LEN,
            });
        }

        let kind = self.kind();
        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        MessageHeader::new(kind.type_code(), kind.is_reply(), body.len() as u32).write(&mut frame);
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}
