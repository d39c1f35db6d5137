//! Player sessions and ship ownership for the game server
//!
//! This module tracks which connection pilots which ship, including:
//! - Session creation once a client's hello is accepted
//! - Ownership checks for inbound control updates
//! - Parking a disconnected player's ship under their client key
//! - Handing a parked ship back when the same key reconnects
//!
//! Parked ships stay in the world until they are reclaimed or the parking
//! timeout expires.

use log::info;
use shared::{ConnectionId, ObjectId};
use std::collections::HashMap;
use std::time::Duration;

/// A client whose hello has been accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection: ConnectionId,
    pub name: String,
    /// Opaque key the client presents again when it reconnects
    pub client_key: u64,
    /// Ship the client controls
    pub ship: ObjectId,
    /// Simulation time the session started
    pub joined_at: Duration,
}

#[derive(Debug, Clone, Copy)]
struct ParkedShip {
    ship: ObjectId,
    since: Duration,
}

/// Manages sessions and parked ships
#[derive(Debug)]
pub struct ClientManager {
    sessions: HashMap<ConnectionId, Session>,
    parked: HashMap<u64, ParkedShip>,
    parking_timeout: Duration,
}

impl ClientManager {
    pub fn new(parking_timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            parked: HashMap::new(),
            parking_timeout,
        }
    }

    /// Takes the ship parked under `client_key`, if any
    pub fn reclaim(&mut self, client_key: u64) -> Option<ObjectId> {
        let parked = self.parked.remove(&client_key)?;
        info!("Ship {} reclaimed by returning client", parked.ship);
        Some(parked.ship)
    }

    /// True if a live session already uses `client_key`
    pub fn key_in_use(&self, client_key: u64) -> bool {
        self.sessions
            .values()
            .any(|session| session.client_key == client_key)
    }

    pub fn add_session(&mut self, session: Session) {
        info!(
            "Client {} ({}) pilots ship {}",
            session.connection, session.name, session.ship
        );
        self.sessions.insert(session.connection, session);
    }

    pub fn session(&self, connection: ConnectionId) -> Option<&Session> {
        self.sessions.get(&connection)
    }

    /// True if `connection` pilots `ship`
    pub fn controls(&self, connection: ConnectionId, ship: ObjectId) -> bool {
        self.sessions
            .get(&connection)
            .is_some_and(|session| session.ship == ship)
    }

    /// Points the session or parking slot holding `old` at `new`, e.g.
    /// after a respawn. Returns the connection that pilots it.
    pub fn replace_ship(&mut self, old: ObjectId, new: ObjectId) -> Option<ConnectionId> {
        if let Some(parked) = self.parked.values_mut().find(|parked| parked.ship == old) {
            parked.ship = new;
            return None;
        }

        let session = self.sessions.values_mut().find(|session| session.ship == old)?;
        session.ship = new;
        Some(session.connection)
    }

    /// Ends the session of `connection` and parks its ship. Returns the
    /// parked ship.
    pub fn end_session(&mut self, connection: ConnectionId, now: Duration) -> Option<ObjectId> {
        let session = self.sessions.remove(&connection)?;
        info!(
            "Client {} ({}) left, parking ship {}",
            session.connection, session.name, session.ship
        );
        self.parked.insert(
            session.client_key,
            ParkedShip {
                ship: session.ship,
                since: now,
            },
        );
        Some(session.ship)
    }

    /// Drops ships parked longer than the parking timeout and returns them
    pub fn expire_parked(&mut self, now: Duration) -> Vec<ObjectId> {
        let timeout = self.parking_timeout;
        let mut expired = Vec::new();
        self.parked.retain(|_, parked| {
            let keep = now.saturating_sub(parked.since) < timeout;
            if !keep {
                expired.push(parked.ship);
            }
            keep
        });
        expired.sort_unstable();
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(connection: u8, client_key: u64, ship: ObjectId) -> Session {
        Session {
            connection: ConnectionId::new(connection),
            name: format!("player{}", connection),
            client_key,
            ship,
            joined_at: Duration::ZERO,
        }
    }

    #[test]
    fn test_session_lifecycle() {
        let mut manager = ClientManager::new(Duration::from_secs(30));
        assert!(manager.is_empty());

        manager.add_session(session(1, 0xAA, 5));
        assert_eq!(manager.len(), 1);
        assert!(manager.key_in_use(0xAA));
        assert_eq!(manager.session(ConnectionId::new(1)).unwrap().ship, 5);

        assert_eq!(manager.end_session(ConnectionId::new(1), Duration::from_secs(3)), Some(5));
        assert!(manager.is_empty());
        assert!(!manager.key_in_use(0xAA));
        assert_eq!(manager.parked_len(), 1);
        assert_eq!(manager.end_session(ConnectionId::new(1), Duration::from_secs(3)), None);
    }

    #[test]
    fn test_ownership_check() {
        let mut manager = ClientManager::new(Duration::from_secs(30));
        manager.add_session(session(1, 1, 10));
        manager.add_session(session(2, 2, 20));

        assert!(manager.controls(ConnectionId::new(1), 10));
        assert!(!manager.controls(ConnectionId::new(1), 20));
        assert!(!manager.controls(ConnectionId::new(3), 10));
    }

    #[test]
    fn test_reconnect_reclaims_parked_ship() {
        let mut manager = ClientManager::new(Duration::from_secs(30));
        manager.add_session(session(1, 0xBEEF, 7));
        manager.end_session(ConnectionId::new(1), Duration::from_secs(1));

        assert_eq!(manager.reclaim(0xDEAD), None);
        assert_eq!(manager.reclaim(0xBEEF), Some(7));
        assert_eq!(manager.reclaim(0xBEEF), None);
        assert_eq!(manager.parked_len(), 0);
    }

    #[test]
    fn test_parked_ships_expire() {
        let mut manager = ClientManager::new(Duration::from_secs(10));
        manager.add_session(session(1, 1, 3));
        manager.add_session(session(2, 2, 4));
        manager.end_session(ConnectionId::new(1), Duration::from_secs(0));
        manager.end_session(ConnectionId::new(2), Duration::from_secs(5));

        assert!(manager.expire_parked(Duration::from_secs(9)).is_empty());
        assert_eq!(manager.expire_parked(Duration::from_secs(12)), vec![3]);
        assert_eq!(manager.expire_parked(Duration::from_secs(20)), vec![4]);
        assert_eq!(manager.parked_len(), 0);
    }

    #[test]
    fn test_replace_ship_after_respawn() {
        let mut manager = ClientManager::new(Duration::from_secs(10));
        manager.add_session(session(4, 9, 11));

        assert_eq!(manager.replace_ship(11, 12), Some(ConnectionId::new(4)));
        assert!(manager.controls(ConnectionId::new(4), 12));
        assert_eq!(manager.replace_ship(11, 13), None);

        manager.end_session(ConnectionId::new(4), Duration::ZERO);
        assert_eq!(manager.replace_ship(12, 14), None);
        assert_eq!(manager.reclaim(9), Some(14));
    }
}
