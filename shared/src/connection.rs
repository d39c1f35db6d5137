//! Logical connections and the identifier pool they draw from.
//!
//! A [`LogicalConnection`] pairs one stream channel with the remote datagram
//! endpoint of the same peer. It is created by the broker, owned by the main
//! task, and disposed exactly once; disposal shuts the stream down and hands
//! its identifier back to the [`ConnectionIdPool`].

use crate::clock::SimulationClock;
use crate::config::NetworkSettings;
use crate::error::ConnectionError;
use crate::ping::PingClock;
use crate::protocol::{Close, Message, MessageBody, MessageKind, MessageRegistry, Ping, Pong, Transport};
use crate::queue::SharedQueue;
use crate::socket::{DatagramSender, InboundMessage, StreamChannel};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Small identifier unique among the currently open connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u8);

impl ConnectionId {
    pub fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Bounded pool of connection identifiers, lowest free identifier first
#[derive(Debug)]
pub struct ConnectionIdPool {
    capacity: usize,
    free: Mutex<BTreeSet<u8>>,
}

impl ConnectionIdPool {
    /// Capacity is capped at 256, the number of distinct identifiers
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(usize::from(u8::MAX) + 1);
        let free = (0..capacity).map(|id| id as u8).collect();

        Self {
            capacity,
            free: Mutex::new(free),
        }
    }

    fn with_free<R>(&self, f: impl FnOnce(&mut BTreeSet<u8>) -> R) -> R {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut free)
    }

    pub fn acquire(&self) -> Result<ConnectionId, ConnectionError> {
        self.with_free(|free| free.pop_first())
            .map(ConnectionId)
            .ok_or(ConnectionError::PoolExhausted {
                capacity: self.capacity,
            })
    }

    /// Returns `id` to the pool. False if it was not taken from this pool or
    /// is already free.
    pub fn release(&self, id: ConnectionId) -> bool {
        if usize::from(id.0) >= self.capacity {
            return false;
        }
        self.with_free(|free| free.insert(id.0))
    }

    pub fn available(&self) -> usize {
        self.with_free(|free| free.len())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// What the peer on the other end of a connection is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// A game client; messages on it are client-originated
    Client,
    /// The game server
    Server,
    /// A management service the server registers with
    Management,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Stream connected, nothing exchanged yet
    Created,
    /// Identity exchange in progress
    Handshaking,
    /// Remote datagram endpoint known
    Handshaken,
    /// Terminal
    Disposed,
}

/// Per-connection record read by game logic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub role: ConnectionRole,
    /// Arena the peer was last told to load
    pub arena: Option<String>,
    /// Peer has loaded the arena and may receive replication
    pub ready: bool,
    /// Dispose the connection on the first protocol error
    pub drop_on_error: bool,
    /// Opaque key supplied by a client to correlate reconnects
    pub client_key: Option<u64>,
}

impl ConnectionStatus {
    pub fn new(role: ConnectionRole) -> Self {
        Self {
            role,
            arena: None,
            ready: false,
            drop_on_error: true,
            client_key: None,
        }
    }
}

/// A dequeued message body and its arrival time
#[derive(Debug, Clone, PartialEq)]
pub struct Received<T> {
    pub body: T,
    pub received_at: Instant,
}

/// Shared pieces every new connection is built from
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub registry: Arc<MessageRegistry>,
    pub pool: Arc<ConnectionIdPool>,
    pub settings: NetworkSettings,
    /// Process-wide datagram socket, if one is bound
    pub datagram: Option<DatagramSender>,
}

pub struct LogicalConnection {
    id: ConnectionId,
    name: String,
    pool: Arc<ConnectionIdPool>,
    remote_stream: Option<SocketAddr>,
    remote_datagram: OnceLock<SocketAddr>,
    stream: Mutex<Option<StreamChannel>>,
    datagram: Option<DatagramSender>,
    inbox: SharedQueue<InboundMessage>,
    errors: SharedQueue<String>,
    handshaking: AtomicBool,
    disposed: AtomicBool,
    disposed_with_error: AtomicBool,
    ping: PingClock,
    extra_latency: Duration,
    status: ConnectionStatus,
}

impl LogicalConnection {
    /// Wraps an already connected stream and starts its receive loop.
    ///
    /// # Errors
    /// `PoolExhausted` when no identifier is free, `Io` when the peer address
    /// cannot be read.
    pub fn from_stream(
        stream: TcpStream,
        role: ConnectionRole,
        name: impl Into<String>,
        context: &ConnectionContext,
    ) -> Result<Self, ConnectionError> {
        let remote = stream.peer_addr()?;
        let id = context.pool.acquire()?;

        let mut connection = Self::unconnected(id, name.into(), role, context);
        connection.remote_stream = Some(remote);
        let channel = StreamChannel::start(
            stream,
            Arc::clone(&context.registry),
            connection.inbox.clone(),
            connection.errors.clone(),
        );
        connection.stream = Mutex::new(Some(channel));

        info!(
            "Connection {} ({}) opened to {:?} peer at {}",
            id, connection.name, role, remote
        );
        Ok(connection)
    }

    /// Connection to a peer known only by its datagram address. It is
    /// handshaken from the start.
    pub fn datagram_only(
        remote: SocketAddr,
        role: ConnectionRole,
        name: impl Into<String>,
        context: &ConnectionContext,
    ) -> Result<Self, ConnectionError> {
        if context.datagram.is_none() {
            return Err(ConnectionError::NoDatagramSocket);
        }
        let id = context.pool.acquire()?;

        let connection = Self::unconnected(id, name.into(), role, context);
        let _ = connection.remote_datagram.set(remote);
        info!(
            "Connection {} ({}) tracks datagram peer at {}",
            id, connection.name, remote
        );
        Ok(connection)
    }

    fn unconnected(
        id: ConnectionId,
        name: String,
        role: ConnectionRole,
        context: &ConnectionContext,
    ) -> Self {
        let settings = &context.settings;
        Self {
            id,
            name,
            pool: Arc::clone(&context.pool),
            remote_stream: None,
            remote_datagram: OnceLock::new(),
            stream: Mutex::new(None),
            datagram: context.datagram.clone(),
            inbox: SharedQueue::new(),
            errors: SharedQueue::new(),
            handshaking: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            disposed_with_error: AtomicBool::new(false),
            ping: PingClock::new(settings.ping_interval, settings.reply_timeout_factor),
            extra_latency: settings.extra_latency,
            status: ConnectionStatus::new(role),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn role(&self) -> ConnectionRole {
        self.status.role
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut ConnectionStatus {
        &mut self.status
    }

    pub fn remote_stream_addr(&self) -> Option<SocketAddr> {
        self.remote_stream
    }

    pub fn remote_datagram_addr(&self) -> Option<SocketAddr> {
        self.remote_datagram.get().copied()
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_disposed() {
            ConnectionState::Disposed
        } else if self.remote_datagram.get().is_some() {
            ConnectionState::Handshaken
        } else if self.handshaking.load(Ordering::Acquire) {
            ConnectionState::Handshaking
        } else {
            ConnectionState::Created
        }
    }

    pub fn is_handshaken(&self) -> bool {
        self.state() == ConnectionState::Handshaken
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn was_disposed_with_error(&self) -> bool {
        self.disposed_with_error.load(Ordering::Acquire)
    }

    /// True while the stream receive loop is running
    pub fn is_receiving(&self) -> bool {
        self.lock_stream()
            .as_ref()
            .is_some_and(|channel| channel.is_receiving())
    }

    pub fn begin_handshake(&self) {
        self.handshaking.store(true, Ordering::Release);
    }

    /// Publishes the peer's datagram endpoint, completing the handshake.
    /// Only the first call has any effect.
    pub fn set_datagram_endpoint(&self, addr: SocketAddr) -> bool {
        if self.remote_datagram.set(addr).is_err() {
            return false;
        }
        info!(
            "Connection {} ({}) handshaken, datagram endpoint {}",
            self.id, self.name, addr
        );
        true
    }

    fn lock_stream(&self) -> MutexGuard<'_, Option<StreamChannel>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes `message` to the channel its kind declares. Datagrams before
    /// the handshake and anything after disposal are dropped silently.
    pub fn send(&self, message: impl Into<Message>) {
        if self.is_disposed() {
            return;
        }

        let message = message.into();
        match message.transport() {
            Transport::Stream => {
                let kind = message.kind();
                let sent = self
                    .lock_stream()
                    .as_ref()
                    .is_some_and(|channel| channel.send(message));
                if !sent {
                    debug!(
                        "Connection {} has no open stream, dropping {}",
                        self.id,
                        kind.name()
                    );
                }
            }
            Transport::Datagram => {
                if let (Some(sender), Some(addr)) = (&self.datagram, self.remote_datagram.get()) {
                    sender.send_to(message, *addr);
                }
            }
        }
    }

    /// Adds a message received outside the stream channel, e.g. a routed
    /// datagram
    pub fn enqueue(&self, message: InboundMessage) {
        if !self.is_disposed() {
            self.inbox.push(message);
        }
    }

    /// Oldest due message of type `T`
    pub fn try_dequeue<T: MessageBody>(&self) -> Option<Received<T>> {
        let inbound = self.try_dequeue_kind(T::KIND)?;
        let received_at = inbound.received_at;
        T::from_message(inbound.message).map(|body| Received { body, received_at })
    }

    /// Oldest message of `kind` that has waited at least the extra-latency
    /// floor
    pub fn try_dequeue_kind(&self, kind: MessageKind) -> Option<InboundMessage> {
        let now = Instant::now();
        let floor = self.extra_latency;
        self.inbox.take_first(|inbound| {
            inbound.message.kind() == kind
                && now.saturating_duration_since(inbound.received_at) >= floor
        })
    }

    pub fn has_pending(&self, kind: MessageKind) -> bool {
        self.inbox
            .with(|queue| queue.iter().any(|inbound| inbound.message.kind() == kind))
    }

    pub fn pending_messages(&self) -> usize {
        self.inbox.len()
    }

    /// Drops unhandled messages older than `max_age`, returning how many
    pub fn discard_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        self.inbox
            .discard(|inbound| now.saturating_duration_since(inbound.received_at) > max_age)
    }

    /// Queues an error to be handled on the next [`handle_errors`](Self::handle_errors)
    pub fn report_error(&self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Logs every queued error and disposes the connection with the error
    /// flag if there were any. A connection whose status clears
    /// `drop_on_error` survives errors while its stream still receives.
    /// Returns true if it disposed.
    pub fn handle_errors(&self) -> bool {
        if self.is_disposed() || self.errors.is_empty() {
            return false;
        }
        // A close reason the peer sent ahead of the failure is handled first
        if self.has_pending(MessageKind::Close) {
            return false;
        }

        for error in self.errors.drain() {
            warn!("Connection {} ({}): {}", self.id, self.name, error);
        }
        // Without drop-on-error only a dead stream is fatal
        if !self.status.drop_on_error && self.is_receiving() {
            return false;
        }
        self.dispose(true)
    }

    /// Tears the connection down. Runs once; later calls return false.
    pub fn dispose(&self, with_error: bool) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.disposed_with_error.store(with_error, Ordering::Release);
        if let Some(channel) = self.lock_stream().take() {
            channel.shutdown();
        }
        self.pool.release(self.id);

        if with_error {
            warn!("Connection {} ({}) dropped after an error", self.id, self.name);
        } else {
            info!("Connection {} ({}) closed", self.id, self.name);
        }
        true
    }

    /// Sends a human-readable close reason over the stream, then disposes
    pub fn close(&self, reason: &str, with_error: bool) {
        if self.is_disposed() {
            return;
        }

        info!("Closing connection {} ({}): {}", self.id, self.name, reason);
        self.send(Close {
            reason: reason.to_string(),
        });
        self.dispose(with_error);
    }

    /// Answers queued pings, records queued pongs and sends a new ping when
    /// the interval has elapsed. Does nothing before the handshake.
    pub fn update_ping<C: SimulationClock + ?Sized>(&mut self, clock: &C) {
        if !self.is_handshaken() {
            return;
        }

        let now = clock.time();
        let frame = clock.frame();

        while let Some(ping) = self.try_dequeue::<Ping>() {
            let pong = self.ping.reply(&ping.body, now, frame);
            self.send(pong);
        }

        while let Some(pong) = self.try_dequeue::<Pong>() {
            if let Some(rtt) =
                self.ping
                    .record_pong(&pong.body, now, frame, clock.frame_duration())
            {
                debug!("Connection {} round trip {:?}", self.id, rtt);
            }
        }

        if let Some(ping) = self.ping.poll(now) {
            self.send(ping);
        }
    }

    pub fn ping_clock(&self) -> &PingClock {
        &self.ping
    }

    pub fn ping_time(&self) -> Option<Duration> {
        self.ping.ping_time()
    }

    /// Extends the missing-reply deadline, e.g. while the peer loads an arena
    pub fn relax_ping_deadline(&mut self, now: Duration, extra: Duration) {
        self.ping.relax(now, extra);
    }

    pub fn is_missing_replies(&self, now: Duration) -> bool {
        self.is_handshaken() && self.ping.is_missing_replies(now)
    }

    /// Local ticks elapsed since the peer produced state at `remote_frame`.
    /// `None` until a ping round trip has completed; negative ages clamp to 0.
    pub fn frames_ago(&self, remote_frame: u32, local_frame: u32) -> Option<u32> {
        if !self.ping.has_round_trip() {
            return None;
        }

        let offset = self.ping.frame_offset()?;
        let ago = i64::from(local_frame) - (i64::from(remote_frame) + offset);
        Some(ago.clamp(0, i64::from(u32::MAX)) as u32)
    }
}

impl fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("role", &self.status.role)
            .field("state", &self.state())
            .field("remote_stream", &self.remote_stream)
            .field("remote_datagram", &self.remote_datagram.get())
            .finish()
    }
}

impl Drop for LogicalConnection {
    fn drop(&mut self) {
        self.dispose(false);
    }
}
