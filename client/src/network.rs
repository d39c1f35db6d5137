use crate::game::ClientWorld;
use crate::input::BotInput;
use log::{debug, error, info, warn};
use shared::config::NetworkSettings;
use shared::handshake::canonical_versions;
use shared::protocol::{
    ArenaLoad, ArenaReady, Close, DatagramConfirmed, DatagramProbe, Hello, ObjectCollision,
    ObjectCreation, ObjectDeletion, ObjectUpdate, Welcome,
};
use shared::{
    ApplyOutcome, ConnectionBroker, ConnectionContext, ConnectionId, ConnectionIdPool,
    ConnectionRole, ConnectionSet, DatagramSocket, DeliveryInfo, DroppedConnection,
    LogicalConnection, MessageDispatcher, MessageRegistry, SimulationClock, TickClock,
};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

pub const CONNECTION_LOST: &str = "connection to server lost";

/// Ticks between datagram probes until the server confirms the endpoint
const PROBE_INTERVAL: u32 = 10;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Candidate server endpoints; the first to accept wins
    pub servers: Vec<SocketAddr>,
    pub name: String,
    /// Presented on every connect so a reconnect regains the same ship
    pub client_key: u64,
    pub settings: NetworkSettings,
    /// Local datagram socket address
    pub datagram_addr: SocketAddr,
    /// Seed for the scripted pilot; random when unset
    pub bot_seed: Option<u64>,
    /// Version list sent in hello; the canonical list when unset
    pub versions: Option<Vec<String>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec![SocketAddr::from(([127, 0, 0, 1], 8080))],
            name: "player".to_string(),
            client_key: 0,
            settings: NetworkSettings::default(),
            datagram_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            bot_seed: None,
            versions: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Handshaking,
    InGame,
    /// Server connection dropped after an error
    Lost,
    /// Closed, with the reason given
    Closed(String),
    /// No candidate endpoint could be reached
    Failed(String),
}

impl ClientState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ClientState::Lost | ClientState::Closed(_) | ClientState::Failed(_)
        )
    }
}

/// State the message handlers operate on
#[derive(Debug)]
pub struct ClientSession {
    pub world: ClientWorld,
    state: ClientState,
    connection_id: Option<u8>,
    datagram_confirmed: bool,
    arena: Option<String>,
    arena_load_grace: Duration,
    frame: u32,
    now: Duration,
}

impl ClientSession {
    pub fn state(&self) -> &ClientState {
        &self.state
    }

    /// Identifier the server assigned in its welcome
    pub fn connection_id(&self) -> Option<u8> {
        self.connection_id
    }

    pub fn is_datagram_confirmed(&self) -> bool {
        self.datagram_confirmed
    }

    pub fn arena(&self) -> Option<&str> {
        self.arena.as_deref()
    }
}

pub struct Client {
    config: ClientConfig,
    broker: ConnectionBroker,
    datagram: DatagramSocket,
    connections: ConnectionSet,
    dispatcher: MessageDispatcher<ClientSession>,
    session: ClientSession,
    clock: TickClock,
    input: BotInput,
    versions: Vec<String>,
    server: Option<ConnectionId>,
}

impl Client {
    /// Binds the local datagram socket and starts racing connects to the
    /// configured servers
    pub async fn new(config: ClientConfig) -> Result<Self, Box<dyn Error>> {
        let registry = Arc::new(MessageRegistry::standard()?);
        let datagram = DatagramSocket::bind(config.datagram_addr, Arc::clone(&registry)).await?;

        let context = ConnectionContext {
            registry: Arc::clone(&registry),
            pool: Arc::new(ConnectionIdPool::new(1)),
            settings: config.settings.clone(),
            datagram: Some(datagram.sender()),
        };
        let mut broker = ConnectionBroker::new(context);
        broker.connect(&config.servers, ConnectionRole::Server, "server");

        let versions = config
            .versions
            .clone()
            .unwrap_or_else(|| canonical_versions(&registry, &config.settings));
        let input = match config.bot_seed {
            Some(seed) => BotInput::new(seed),
            None => BotInput::from_entropy(),
        };

        let mut dispatcher = MessageDispatcher::new();
        register_handlers(&mut dispatcher);

        Ok(Self {
            session: ClientSession {
                world: ClientWorld::new(config.settings.frame_duration()),
                state: ClientState::Connecting,
                connection_id: None,
                datagram_confirmed: false,
                arena: None,
                arena_load_grace: config.settings.arena_load_grace,
                frame: 0,
                now: Duration::ZERO,
            },
            clock: TickClock::new(config.settings.tick_rate),
            config,
            broker,
            datagram,
            connections: ConnectionSet::new(),
            dispatcher,
            input,
            versions,
            server: None,
        })
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn state(&self) -> &ClientState {
        &self.session.state
    }

    pub fn world(&self) -> &ClientWorld {
        &self.session.world
    }

    pub fn local_datagram_addr(&self) -> SocketAddr {
        self.datagram.local_addr()
    }

    /// The open server connection, if any
    pub fn server_connection(&self) -> Option<&LogicalConnection> {
        self.server.and_then(|id| self.connections.get(id))
    }

    pub fn frame(&self) -> u32 {
        self.clock.frame()
    }

    /// Runs one client tick: connect results, datagrams, pings, handlers,
    /// probes and control replication, local prediction and reaping
    pub fn tick(&mut self) {
        let now = self.clock.time();
        let frame = self.clock.frame();
        self.session.now = now;
        self.session.frame = frame;

        self.poll_connect();
        for datagram in self.datagram.drain() {
            self.connections.route_datagram(datagram, false);
        }
        self.datagram.drain_errors();

        self.connections.update_pings(&self.clock);
        self.dispatcher
            .handle_messages(&mut self.connections, &mut self.session, frame);

        self.send_probe(frame);
        self.send_controls(frame);
        self.session
            .world
            .step(self.clock.frame_duration().as_secs_f32());

        for dropped in self.connections.reap(now) {
            self.on_dropped(dropped);
        }
        self.connections
            .discard_stale(self.config.settings.max_message_age);
        self.clock.advance();
    }

    fn poll_connect(&mut self) {
        for result in self.broker.poll_results() {
            match result {
                Ok(connection) => {
                    connection.begin_handshake();
                    connection.send(Hello {
                        name: self.config.name.clone(),
                        versions: self.versions.clone(),
                        client_key: self.config.client_key,
                    });
                    self.server = Some(self.connections.insert(connection));
                    self.session.state = ClientState::Handshaking;
                }
                Err(e) => {
                    error!("Could not connect: {}", e);
                    self.session.state = ClientState::Failed(e.to_string());
                }
            }
        }
    }

    fn send_probe(&self, frame: u32) {
        if self.session.datagram_confirmed || frame % PROBE_INTERVAL != 0 {
            return;
        }
        let (Some(connection), Some(connection_id)) =
            (self.server_connection(), self.session.connection_id)
        else {
            return;
        };

        connection.send(DatagramProbe {
            connection_id,
            client_key: self.config.client_key,
        });
    }

    fn send_controls(&mut self, frame: u32) {
        if self.session.state != ClientState::InGame {
            return;
        }

        let controls = self.input.update();
        let world = &mut self.session.world;
        if !world.set_controls(controls) {
            return;
        }

        let Some(connection) = self.server.and_then(|id| self.connections.get(id)) else {
            return;
        };
        if let (Some(id), Some(ship)) = (world.player(), world.player_ship()) {
            world.engine().replicate_control(connection, id, ship, frame);
        }
    }

    fn on_dropped(&mut self, dropped: DroppedConnection) {
        if Some(dropped.id) == self.server {
            self.server = None;
        }
        if self.session.state.is_finished() {
            return;
        }

        if dropped.with_error {
            error!("{}", CONNECTION_LOST);
            eprintln!("{}", CONNECTION_LOST);
            self.session.state = ClientState::Lost;
        } else {
            self.session.state = ClientState::Closed("connection closed".to_string());
        }
    }

    /// Closes the server connection with `reason`
    pub fn disconnect(&mut self, reason: &str) {
        self.broker.cancel_connect();
        if let Some(connection) = self.server_connection() {
            connection.close(reason, false);
        }
        for dropped in self.connections.reap(self.clock.time()) {
            debug!("Dropped {} on disconnect", dropped.name);
        }
        self.server = None;
        if !self.session.state.is_finished() {
            self.session.state = ClientState::Closed(reason.to_string());
        }
    }

    /// Main client loop ticking until the session ends or Ctrl+C
    pub async fn run(&mut self) -> Result<(), Box<dyn Error>> {
        let mut tick_interval = interval(self.clock.frame_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.tick();
                    if self.session.state.is_finished() {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, disconnecting");
                    self.disconnect("client quit");
                    break;
                }
            }
        }

        match &self.session.state {
            ClientState::Failed(reason) => Err(reason.clone().into()),
            _ => Ok(()),
        }
    }
}

fn register_handlers(dispatcher: &mut MessageDispatcher<ClientSession>) {
    dispatcher.on::<Close, _>(ConnectionRole::Server, handle_close);
    dispatcher.on::<Welcome, _>(ConnectionRole::Server, handle_welcome);
    dispatcher.on::<DatagramConfirmed, _>(ConnectionRole::Server, handle_datagram_confirmed);
    dispatcher.on::<ArenaLoad, _>(ConnectionRole::Server, handle_arena_load);
    dispatcher.on::<ObjectCreation, _>(ConnectionRole::Server, handle_object_creation);
    dispatcher.on::<ObjectUpdate, _>(ConnectionRole::Server, handle_object_update);
    dispatcher.on::<ObjectCollision, _>(ConnectionRole::Server, handle_object_collision);
    dispatcher.on::<ObjectDeletion, _>(ConnectionRole::Server, handle_object_deletion);
}

fn handle_close(
    session: &mut ClientSession,
    connection: &mut LogicalConnection,
    close: Close,
    _info: DeliveryInfo,
) {
    warn!("Server closed the connection: {}", close.reason);
    eprintln!("{}", close.reason);
    session.state = ClientState::Closed(close.reason);
    connection.dispose(false);
}

/// Learns the server's datagram endpoint and the piloted ship
fn handle_welcome(
    session: &mut ClientSession,
    connection: &mut LogicalConnection,
    welcome: Welcome,
    _info: DeliveryInfo,
) {
    let Some(server) = connection.remote_stream_addr() else {
        return;
    };

    info!(
        "Welcomed as client #{} piloting ship {}",
        welcome.connection_id, welcome.player_object
    );
    connection.set_datagram_endpoint(SocketAddr::new(server.ip(), welcome.datagram_port));
    session.connection_id = Some(welcome.connection_id);
    session
        .world
        .set_player(welcome.connection_id, welcome.player_object);
}

fn handle_datagram_confirmed(
    session: &mut ClientSession,
    _connection: &mut LogicalConnection,
    confirmed: DatagramConfirmed,
    _info: DeliveryInfo,
) {
    info!(
        "Server confirmed datagram endpoint (observed port {})",
        confirmed.observed_port
    );
    session.datagram_confirmed = true;
}

fn handle_arena_load(
    session: &mut ClientSession,
    connection: &mut LogicalConnection,
    load: ArenaLoad,
    _info: DeliveryInfo,
) {
    info!("Loading arena {}", load.arena);
    connection.relax_ping_deadline(session.now, session.arena_load_grace);

    let status = connection.status_mut();
    status.arena = Some(load.arena.clone());
    status.ready = true;
    connection.send(ArenaReady {
        arena: load.arena.clone(),
    });

    session.arena = Some(load.arena);
    session.state = ClientState::InGame;
}

fn handle_object_creation(
    session: &mut ClientSession,
    _connection: &mut LogicalConnection,
    creation: ObjectCreation,
    info: DeliveryInfo,
) {
    let outcome = session
        .world
        .apply_creation(&creation, info.frames_ago, session.frame);
    if let ApplyOutcome::Malformed(e) = outcome {
        warn!("Malformed creation of object {}: {}", creation.object_id, e);
    }
}

fn handle_object_update(
    session: &mut ClientSession,
    _connection: &mut LogicalConnection,
    update: ObjectUpdate,
    info: DeliveryInfo,
) {
    match session
        .world
        .apply_update(&update, info.frames_ago, session.frame)
    {
        ApplyOutcome::Malformed(e) => {
            warn!("Malformed update of object {}: {}", update.object_id, e)
        }
        ApplyOutcome::Applied { clamped } if clamped > 0 => {
            debug!("Clamped {} fields of object {}", clamped, update.object_id)
        }
        _ => {}
    }
}

fn handle_object_collision(
    session: &mut ClientSession,
    _connection: &mut LogicalConnection,
    collision: ObjectCollision,
    _info: DeliveryInfo,
) {
    session.world.record_collision(&collision);
}

fn handle_object_deletion(
    session: &mut ClientSession,
    _connection: &mut LogicalConnection,
    deletion: ObjectDeletion,
    _info: DeliveryInfo,
) {
    session.world.apply_deletion(&deletion);
}
