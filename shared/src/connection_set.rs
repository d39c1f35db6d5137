//! Main-task collection of open connections.
//!
//! Besides lookup by identifier and role it routes datagrams from the
//! process-wide datagram socket to the connection they belong to, and reaps
//! connections that failed or stopped answering pings.

use crate::clock::SimulationClock;
use crate::connection::{
    ConnectionId, ConnectionRole, ConnectionState, ConnectionStatus, LogicalConnection,
};
use crate::protocol::{DatagramConfirmed, DatagramProbe, Message};
use crate::socket::ReceivedDatagram;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// A connection removed from the set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedConnection {
    pub id: ConnectionId,
    pub name: String,
    pub with_error: bool,
    pub status: ConnectionStatus,
}

impl DroppedConnection {
    fn from_connection(connection: &LogicalConnection) -> Self {
        Self {
            id: connection.id(),
            name: connection.name().to_string(),
            with_error: connection.was_disposed_with_error(),
            status: connection.status().clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionSet {
    connections: BTreeMap<ConnectionId, LogicalConnection>,
    dropped: Vec<DroppedConnection>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `connection`. A disposed connection still holding the same
    /// identifier is moved out and reported by the next [`reap`](Self::reap).
    pub fn insert(&mut self, connection: LogicalConnection) -> ConnectionId {
        let id = connection.id();
        if let Some(previous) = self.connections.insert(id, connection) {
            previous.dispose(false);
            self.dropped.push(DroppedConnection::from_connection(&previous));
        }
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&LogicalConnection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut LogicalConnection> {
        self.connections.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<LogicalConnection> {
        self.connections.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogicalConnection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LogicalConnection> {
        self.connections.values_mut()
    }

    /// Open connections whose peer has `role`
    pub fn with_role(&self, role: ConnectionRole) -> impl Iterator<Item = &LogicalConnection> {
        self.connections
            .values()
            .filter(move |connection| connection.role() == role && !connection.is_disposed())
    }

    pub fn ids_with_role(&self, role: ConnectionRole) -> Vec<ConnectionId> {
        self.with_role(role).map(LogicalConnection::id).collect()
    }

    /// Sends a copy of `message` to every open connection with `role`
    pub fn send_to_role(&self, role: ConnectionRole, message: impl Into<Message>) -> usize {
        let message = message.into();
        let mut sent = 0;
        for connection in self.with_role(role) {
            connection.send(message.clone());
            sent += 1;
        }
        sent
    }

    pub fn update_pings<C: SimulationClock + ?Sized>(&mut self, clock: &C) {
        for connection in self.connections.values_mut() {
            connection.update_ping(clock);
        }
    }

    /// Drops unhandled messages older than `max_age` on every connection
    pub fn discard_stale(&self, max_age: Duration) -> usize {
        self.connections
            .values()
            .map(|connection| connection.discard_stale(max_age))
            .sum()
    }

    /// Hands a datagram to the connection it belongs to, returning that
    /// connection's identifier.
    ///
    /// Matching order: a `DatagramProbe` naming the connection and its client
    /// key from the stream peer's host; a known datagram endpoint; and, when
    /// `allow_nat_probe` is set, the first ping from the only handshaking
    /// client on that host. Binding an endpoint by either route, or a probe
    /// from the already bound endpoint, is answered with `DatagramConfirmed`.
    pub fn route_datagram(
        &self,
        datagram: ReceivedDatagram,
        allow_nat_probe: bool,
    ) -> Option<ConnectionId> {
        let from = datagram.from;

        if let Message::DatagramProbe(probe) = &datagram.message.message {
            return self.route_probe(probe, from);
        }

        if let Some(connection) = self
            .connections
            .values()
            .find(|c| !c.is_disposed() && c.remote_datagram_addr() == Some(from))
        {
            connection.enqueue(datagram.message);
            return Some(connection.id());
        }

        if allow_nat_probe && matches!(datagram.message.message, Message::Ping(_)) {
            let mut candidates = self.connections.values().filter(|c| {
                c.role() == ConnectionRole::Client
                    && c.state() == ConnectionState::Handshaking
                    && same_host(c, from)
            });
            let connection = candidates.next()?;
            if candidates.next().is_some() {
                debug!(
                    "Ping from {} matches several handshaking clients, waiting for a probe",
                    from
                );
                return None;
            }

            info!(
                "Connection {} datagram endpoint inferred from first ping at {}",
                connection.id(),
                from
            );
            bind_endpoint(connection, from);
            connection.enqueue(datagram.message);
            return Some(connection.id());
        }

        debug!(
            "Dropping {} datagram from unknown endpoint {}",
            datagram.message.message.kind().name(),
            from
        );
        None
    }

    fn route_probe(&self, probe: &DatagramProbe, from: SocketAddr) -> Option<ConnectionId> {
        let connection = self
            .connections
            .get(&ConnectionId::new(probe.connection_id))
            .filter(|c| !c.is_disposed() && same_host(c, from))
            .filter(|c| {
                c.status()
                    .client_key
                    .map_or(true, |key| key == probe.client_key)
            });
        let Some(connection) = connection else {
            debug!("Dropping probe from {} naming no matching connection", from);
            return None;
        };

        match connection.remote_datagram_addr() {
            None => bind_endpoint(connection, from),
            Some(bound) if bound == from => confirm_endpoint(connection, from),
            Some(bound) => {
                warn!(
                    "Connection {} already bound to {}, ignoring probe from {}",
                    connection.id(),
                    bound,
                    from
                );
                return None;
            }
        }
        Some(connection.id())
    }

    /// Handles queued errors, disposes connections that stopped answering
    /// pings, and removes every disposed connection.
    pub fn reap(&mut self, now: Duration) -> Vec<DroppedConnection> {
        for connection in self.connections.values() {
            if connection.handle_errors() || connection.is_disposed() {
                continue;
            }
            if connection.is_missing_replies(now) {
                warn!(
                    "Connection {} ({}) stopped answering pings",
                    connection.id(),
                    connection.name()
                );
                connection.dispose(true);
            }
        }

        let disposed: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.is_disposed())
            .map(|(id, _)| *id)
            .collect();

        let mut dropped = std::mem::take(&mut self.dropped);
        for id in disposed {
            if let Some(connection) = self.connections.remove(&id) {
                dropped.push(DroppedConnection::from_connection(&connection));
            }
        }
        dropped
    }
}

/// Stream peer of `connection` is on the host `from` belongs to
fn same_host(connection: &LogicalConnection, from: SocketAddr) -> bool {
    connection
        .remote_stream_addr()
        .is_some_and(|addr| addr.ip() == from.ip())
}

fn bind_endpoint(connection: &LogicalConnection, from: SocketAddr) {
    if connection.set_datagram_endpoint(from) {
        confirm_endpoint(connection, from);
    }
}

fn confirm_endpoint(connection: &LogicalConnection, from: SocketAddr) {
    connection.send(DatagramConfirmed {
        observed_port: from.port(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkSettings;
    use crate::clock::ManualClock;
    use crate::connection::{ConnectionContext, ConnectionIdPool};
    use crate::protocol::{DatagramProbe, MessageRegistry, Ping};
    use crate::framing::FrameReader;
    use crate::socket::{DatagramSocket, InboundMessage};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    struct Fixture {
        context: ConnectionContext,
        _socket: DatagramSocket,
        peers: Vec<TcpStream>,
    }

    impl Fixture {
        async fn new() -> Self {
            let registry = Arc::new(MessageRegistry::standard().unwrap());
            let socket = DatagramSocket::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&registry))
                .await
                .unwrap();
            Self {
                context: ConnectionContext {
                    registry,
                    pool: Arc::new(ConnectionIdPool::new(8)),
                    settings: NetworkSettings::default(),
                    datagram: Some(socket.sender()),
                },
                _socket: socket,
                peers: Vec::new(),
            }
        }

        async fn connection(&mut self, role: ConnectionRole) -> LogicalConnection {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
            self.peers.push(client.unwrap());
            LogicalConnection::from_stream(accepted.unwrap().0, role, "peer", &self.context).unwrap()
        }
    }

    fn datagram(from: SocketAddr, message: impl Into<Message>) -> ReceivedDatagram {
        ReceivedDatagram {
            from,
            message: InboundMessage::new(message.into()),
        }
    }

    /// Next message the connection wrote to its stream peer
    async fn read_message(stream: &mut TcpStream) -> Message {
        let registry = MessageRegistry::standard().unwrap();
        let mut reader = FrameReader::new();
        let mut buffer = [0u8; 1024];
        loop {
            if let Some(message) = reader.next_message(&registry) {
                return message.unwrap();
            }
            let len = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buffer))
                .await
                .unwrap()
                .unwrap();
            assert!(len > 0, "stream closed before a message arrived");
            reader.extend(&buffer[..len]);
        }
    }

    #[tokio::test]
    async fn test_role_filtering() {
        let mut fixture = Fixture::new().await;
        let mut set = ConnectionSet::new();
        let client = set.insert(fixture.connection(ConnectionRole::Client).await);
        set.insert(fixture.connection(ConnectionRole::Management).await);

        assert_eq!(set.len(), 2);
        assert_eq!(set.ids_with_role(ConnectionRole::Client), vec![client]);
        assert_eq!(set.send_to_role(ConnectionRole::Server, Ping { timestamp_micros: 0 }), 0);
    }

    #[tokio::test]
    async fn test_probe_sets_endpoint() {
        let mut fixture = Fixture::new().await;
        let mut set = ConnectionSet::new();
        let id = set.insert(fixture.connection(ConnectionRole::Client).await);
        set.get_mut(id).unwrap().status_mut().client_key = Some(99);

        let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let wrong_key = DatagramProbe {
            connection_id: id.get(),
            client_key: 1,
        };
        assert_eq!(set.route_datagram(datagram(from, wrong_key), false), None);
        assert!(!set.get(id).unwrap().is_handshaken());

        let probe = DatagramProbe {
            connection_id: id.get(),
            client_key: 99,
        };
        assert_eq!(set.route_datagram(datagram(from, probe.clone()), false), Some(id));
        assert_eq!(set.get(id).unwrap().remote_datagram_addr(), Some(from));

        // Repeated probes are absorbed rather than queued
        assert_eq!(set.route_datagram(datagram(from, probe), false), Some(id));
        assert_eq!(set.get(id).unwrap().pending_messages(), 0);
    }

    #[tokio::test]
    async fn test_datagrams_from_known_endpoint_are_queued() {
        let mut fixture = Fixture::new().await;
        let mut set = ConnectionSet::new();
        let id = set.insert(fixture.connection(ConnectionRole::Client).await);
        let from: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        set.get(id).unwrap().set_datagram_endpoint(from);

        assert_eq!(
            set.route_datagram(datagram(from, Ping { timestamp_micros: 5 }), false),
            Some(id)
        );
        assert_eq!(set.get(id).unwrap().pending_messages(), 1);

        let stranger: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        assert_eq!(
            set.route_datagram(datagram(stranger, Ping { timestamp_micros: 6 }), false),
            None
        );
    }

    #[tokio::test]
    async fn test_nat_heuristic_uses_first_ping_from_handshaking_client() {
        let mut fixture = Fixture::new().await;
        let mut set = ConnectionSet::new();
        let id = set.insert(fixture.connection(ConnectionRole::Client).await);
        let from: SocketAddr = "127.0.0.1:40003".parse().unwrap();

        // Not handshaking yet, and the heuristic must be enabled
        assert_eq!(set.route_datagram(datagram(from, Ping { timestamp_micros: 1 }), true), None);
        set.get(id).unwrap().begin_handshake();
        assert_eq!(set.route_datagram(datagram(from, Ping { timestamp_micros: 1 }), false), None);

        assert_eq!(
            set.route_datagram(datagram(from, Ping { timestamp_micros: 2 }), true),
            Some(id)
        );
        let connection = set.get(id).unwrap();
        assert_eq!(connection.state(), ConnectionState::Handshaken);
        assert_eq!(connection.remote_datagram_addr(), Some(from));
        assert_eq!(connection.pending_messages(), 1);
    }

    #[tokio::test]
    async fn test_reap_removes_failed_connections() {
        let mut fixture = Fixture::new().await;
        let mut set = ConnectionSet::new();
        let failed = set.insert(fixture.connection(ConnectionRole::Client).await);
        let healthy = set.insert(fixture.connection(ConnectionRole::Client).await);

        set.get(failed).unwrap().report_error("stream receive failed: reset");
        let dropped = set.reap(Duration::ZERO);

        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, failed);
        assert!(dropped[0].with_error);
        assert!(set.get(failed).is_none());
        assert!(set.get(healthy).is_some());
        assert_eq!(fixture.context.pool.available(), 7);
    }

    #[tokio::test]
    async fn test_reap_drops_connections_missing_ping_replies() {
        let mut fixture = Fixture::new().await;
        let mut set = ConnectionSet::new();
        let id = set.insert(fixture.connection(ConnectionRole::Client).await);
        set.get(id)
            .unwrap()
            .set_datagram_endpoint("127.0.0.1:40004".parse().unwrap());

        let mut clock = ManualClock::new(Duration::from_millis(10));
        set.update_pings(&clock);
        assert!(set.reap(Duration::from_secs(5)).is_empty());

        clock.time = Duration::from_secs(11);
        let dropped = set.reap(clock.time);
        assert_eq!(dropped.len(), 1);
        assert!(dropped[0].with_error);
    }

    #[tokio::test]
    async fn test_nat_heuristic_waits_when_host_is_ambiguous() {
        let mut fixture = Fixture::new().await;
        let mut set = ConnectionSet::new();
        let first = set.insert(fixture.connection(ConnectionRole::Client).await);
        let second = set.insert(fixture.connection(ConnectionRole::Client).await);
        for (id, key) in [(first, 10), (second, 20)] {
            let connection = set.get_mut(id).unwrap();
            connection.status_mut().client_key = Some(key);
            connection.begin_handshake();
        }

        let first_addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let second_addr: SocketAddr = "127.0.0.1:50001".parse().unwrap();

        // Two handshaking clients share the host, so a ping cannot be placed
        assert_eq!(
            set.route_datagram(datagram(second_addr, Ping { timestamp_micros: 1 }), true),
            None
        );
        assert_eq!(set.get(first).unwrap().remote_datagram_addr(), None);
        assert_eq!(set.get(second).unwrap().remote_datagram_addr(), None);

        let probe = DatagramProbe {
            connection_id: second.get(),
            client_key: 20,
        };
        assert_eq!(set.route_datagram(datagram(second_addr, probe), true), Some(second));
        assert_eq!(set.get(second).unwrap().remote_datagram_addr(), Some(second_addr));

        // The remaining handshaking client is now the only candidate
        assert_eq!(
            set.route_datagram(datagram(first_addr, Ping { timestamp_micros: 2 }), true),
            Some(first)
        );
        assert_eq!(set.get(first).unwrap().remote_datagram_addr(), Some(first_addr));
        assert_eq!(
            set.route_datagram(datagram(second_addr, Ping { timestamp_micros: 3 }), true),
            Some(second)
        );
    }

    #[tokio::test]
    async fn test_probe_does_not_rebind_another_endpoint() {
        let mut fixture = Fixture::new().await;
        let mut set = ConnectionSet::new();
        let id = set.insert(fixture.connection(ConnectionRole::Client).await);
        let bound: SocketAddr = "127.0.0.1:50002".parse().unwrap();
        set.get(id).unwrap().set_datagram_endpoint(bound);

        let probe = DatagramProbe {
            connection_id: id.get(),
            client_key: 0,
        };
        let elsewhere: SocketAddr = "127.0.0.1:50003".parse().unwrap();
        assert_eq!(set.route_datagram(datagram(elsewhere, probe), false), None);
        assert_eq!(set.get(id).unwrap().remote_datagram_addr(), Some(bound));
    }

    #[tokio::test]
    async fn test_inferred_endpoint_is_confirmed() {
        let mut fixture = Fixture::new().await;
        let mut set = ConnectionSet::new();
        let id = set.insert(fixture.connection(ConnectionRole::Client).await);
        set.get(id).unwrap().begin_handshake();

        let from: SocketAddr = "127.0.0.1:50004".parse().unwrap();
        assert_eq!(
            set.route_datagram(datagram(from, Ping { timestamp_micros: 1 }), true),
            Some(id)
        );
        match read_message(&mut fixture.peers[0]).await {
            Message::DatagramConfirmed(confirmed) => assert_eq!(confirmed.observed_port, 50004),
            other => panic!("expected confirmation, got {:?}", other),
        }

        // A probe that lost the race to the ping is still answered
        let probe = DatagramProbe {
            connection_id: id.get(),
            client_key: 0,
        };
        assert_eq!(set.route_datagram(datagram(from, probe), true), Some(id));
        match read_message(&mut fixture.peers[0]).await {
            Message::DatagramConfirmed(confirmed) => assert_eq!(confirmed.observed_port, 50004),
            other => panic!("expected confirmation, got {:?}", other),
        }
    }
}
