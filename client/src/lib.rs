//! # Arena Client Library
//!
//! Headless client for the arena game. It connects to a server, completes
//! the identity and datagram handshake, loads the announced arena and then
//! pilots its ship with a scripted bot while mirroring the replicated world.
//!
//! ## Connection Flow
//!
//! 1. Connect attempts race against every configured server endpoint; the
//!    first stream to open wins.
//! 2. A hello carries the player name, the canonical version list and the
//!    client key. The server answers with a welcome naming the connection
//!    identifier, the datagram port and the piloted ship.
//! 3. Datagram probes are sent until the server confirms the endpoint.
//! 4. An arena load request is acknowledged once the arena is "loaded",
//!    after which object replication starts.
//!
//! A close from the server ends the session with its reason. A connection
//! dropped for any other reason is reported as lost.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! The replicated world: creations, updates, deletions, collision events
//! and local prediction between updates.
//!
//! ### Input Module (`input`)
//! The scripted pilot producing control state each tick.
//!
//! ### Network Module (`network`)
//! Client configuration, message handlers and the tick loop.
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::network::{Client, ClientConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = Client::new(ClientConfig {
//!     servers: vec!["127.0.0.1:8080".parse()?],
//!     name: "pilot".to_string(),
//!     ..ClientConfig::default()
//! })
//! .await?;
//! client.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod game;
pub mod input;
pub mod network;

pub use network::{Client, ClientConfig, ClientState};
