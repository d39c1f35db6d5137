//! # Arena Server Library
//!
//! Authoritative server for the arena game. It accepts client connections,
//! runs the identity and datagram handshake, simulates every ship and
//! replicates the result back to the clients each tick.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! Ship physics and collisions are decided here. Clients only send their
//! control state; positions, velocities and health flow from the server.
//!
//! ### Connection Lifecycle
//! New stream connections arrive through the shared connection broker.
//! A client must present a matching canonical version list in its hello;
//! a mismatch is answered with a close reason naming the first differing
//! entry. Accepted clients get a ship, learn the datagram port and are told
//! which arena to load.
//!
//! ### Replication
//! Clients that report the arena loaded receive an object creation for
//! every ship they have not seen yet and a varying-state update for the
//! rest, every tick. Collisions and ship deletions are announced as events.
//!
//! ## Architecture Design
//!
//! ### Single Main Task
//! One task owns the connections, the world and the handler table. Socket
//! receive loops only fill queues that the tick drains, so game state is
//! never touched from a background task.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Sessions, ship ownership and parked ships awaiting a reconnect.
//!
//! ### Game Module (`game`)
//! The authoritative world: spawning, substepped physics, collision events
//! and respawns.
//!
//! ### Network Module (`network`)
//! Server configuration, message handlers and the tick loop.

pub mod client_manager;
pub mod game;
pub mod network;

pub use network::{Server, ServerConfig};
