//! Connection management and state replication shared by server and client.
//!
//! The layer is driven from one main task per process. Sockets run their own
//! receive loops and hand everything they produce to queues that the main
//! task drains once per tick:
//!
//! - [`broker::ConnectionBroker`] accepts and connects stream sockets and
//!   wraps them in [`connection::LogicalConnection`]s
//! - [`connection_set::ConnectionSet`] owns the open connections, routes
//!   datagrams, runs pings and reaps dead connections
//! - [`dispatcher::MessageDispatcher`] hands queued messages to typed handlers
//! - [`replication::ReplicationEngine`] sends and applies replicated object
//!   state

pub mod broker;
pub mod clock;
pub mod config;
pub mod connection;
pub mod connection_set;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod objects;
pub mod ping;
pub mod protocol;
pub mod queue;
pub mod replication;
pub mod socket;

pub use broker::ConnectionBroker;
pub use clock::{ManualClock, SimulationClock, TickClock};
pub use config::NetworkSettings;
pub use connection::{
    ConnectionContext, ConnectionId, ConnectionIdPool, ConnectionRole, ConnectionState,
    ConnectionStatus, LogicalConnection,
};
pub use connection_set::{ConnectionSet, DroppedConnection};
pub use dispatcher::{DeliveryInfo, HandlerHandle, MessageDispatcher};
pub use error::{ConnectionError, FieldError, HandshakeError, ProtocolError};
pub use objects::{ControlState, Ship, ShipRegistry};
pub use ping::PingClock;
pub use protocol::{Message, MessageKind, MessageRegistry, Transport};
pub use replication::{ApplyOutcome, ObjectId, ObjectRegistry, ReplicationEngine, SerializationScope};
pub use socket::DatagramSocket;
