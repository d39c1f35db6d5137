//! Server network layer handling connections, handshakes and the game loop

use crate::client_manager::{ClientManager, Session};
use crate::game::ServerWorld;
use log::{debug, info, warn};
use shared::config::NetworkSettings;
use shared::handshake::{canonical_versions, compare_versions};
use shared::protocol::{
    ArenaLoad, ArenaReady, Close, ControlUpdate, Hello, ServerInfo, ServerInfoAck, SoundType,
    Welcome,
};
use shared::{
    ApplyOutcome, ConnectionBroker, ConnectionContext, ConnectionIdPool, ConnectionRole,
    ConnectionSet, ConnectionState, ControlState, DatagramSocket, DeliveryInfo, LogicalConnection,
    MessageDispatcher, MessageRegistry, ReplicationEngine, SerializationScope, SimulationClock,
    TickClock,
};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

pub const DEFAULT_ARENA: &str = "asteroid-belt";

/// Everything needed to start a server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub arena: String,
    /// Address clients connect their stream to
    pub stream_addr: SocketAddr,
    /// Address of the datagram socket shared by all connections
    pub datagram_addr: SocketAddr,
    /// Candidate endpoints of a management service; empty to run standalone
    pub management: Vec<SocketAddr>,
    pub settings: NetworkSettings,
    /// How long a disconnected player's ship waits for them
    pub parking_timeout: Duration,
    /// Time between ServerInfo announcements to the management service
    pub server_info_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "arena".to_string(),
            arena: DEFAULT_ARENA.to_string(),
            stream_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            datagram_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            management: Vec::new(),
            settings: NetworkSettings::default(),
            parking_timeout: Duration::from_secs(30),
            server_info_interval: Duration::from_secs(5),
        }
    }
}

/// Game state the message handlers operate on
#[derive(Debug)]
pub struct ServerState {
    pub world: ServerWorld,
    pub clients: ClientManager,
    pub engine: ReplicationEngine,
    versions: Vec<String>,
    arena: String,
    datagram_port: u16,
    frame: u32,
    now: Duration,
    management_accepted: Option<bool>,
}

impl ServerState {
    /// Whether the management service accepted the last announcement
    pub fn management_accepted(&self) -> Option<bool> {
        self.management_accepted
    }
}

/// Main server coordinating networking and game simulation
pub struct Server {
    config: ServerConfig,
    broker: ConnectionBroker,
    datagram: DatagramSocket,
    connections: ConnectionSet,
    dispatcher: MessageDispatcher<ServerState>,
    state: ServerState,
    clock: TickClock,
    stream_addr: SocketAddr,
    last_server_info: Option<Duration>,
}

impl Server {
    /// Binds the datagram socket and the stream listener, and starts
    /// connecting to the management service if one is configured
    pub async fn bind(config: ServerConfig) -> Result<Self, Box<dyn Error>> {
        let registry = Arc::new(MessageRegistry::standard()?);
        let datagram = DatagramSocket::bind(config.datagram_addr, Arc::clone(&registry)).await?;

        let context = ConnectionContext {
            registry: Arc::clone(&registry),
            pool: Arc::new(ConnectionIdPool::new(config.settings.max_connections)),
            settings: config.settings.clone(),
            datagram: Some(datagram.sender()),
        };
        let mut broker = ConnectionBroker::new(context);
        let stream_addr = broker.start_listening(config.stream_addr).await?;

        if !config.management.is_empty() {
            broker.connect(&config.management, ConnectionRole::Management, "management");
        }

        let state = ServerState {
            world: ServerWorld::new(),
            clients: ClientManager::new(config.parking_timeout),
            engine: ReplicationEngine::new(config.settings.frame_duration()),
            versions: canonical_versions(&registry, &config.settings),
            arena: config.arena.clone(),
            datagram_port: datagram.local_addr().port(),
            frame: 0,
            now: Duration::ZERO,
            management_accepted: None,
        };

        let mut dispatcher = MessageDispatcher::new();
        register_handlers(&mut dispatcher);

        info!(
            "Server '{}' listening on {} (datagrams on {})",
            config.name,
            stream_addr,
            datagram.local_addr()
        );

        Ok(Self {
            clock: TickClock::new(config.settings.tick_rate),
            config,
            broker,
            datagram,
            connections: ConnectionSet::new(),
            dispatcher,
            state,
            stream_addr,
            last_server_info: None,
        })
    }

    pub fn local_stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    pub fn local_datagram_addr(&self) -> SocketAddr {
        self.datagram.local_addr()
    }

    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn frame(&self) -> u32 {
        self.clock.frame()
    }

    /// Runs one simulation tick: new connections, routed datagrams, pings,
    /// message handlers, physics, replication and connection reaping
    pub fn tick(&mut self) {
        let now = self.clock.time();
        let frame = self.clock.frame();
        self.state.now = now;
        self.state.frame = frame;

        self.accept_connections();
        for datagram in self.datagram.drain() {
            self.connections.route_datagram(datagram, true);
        }
        let dropped_datagrams = self.datagram.drain_errors().len();
        if dropped_datagrams > 0 {
            debug!("Dropped {} malformed datagrams", dropped_datagrams);
        }

        self.connections.update_pings(&self.clock);
        self.dispatcher
            .handle_messages(&mut self.connections, &mut self.state, frame);

        let events = self
            .state
            .world
            .step(self.clock.frame_duration().as_secs_f32());
        for collision in &events.collisions {
            self.state.engine.announce_collision(&self.connections, collision);
        }
        for respawn in &events.respawns {
            self.state
                .engine
                .announce_deletion(&self.connections, respawn.destroyed, SoundType::Explosion);
            self.state
                .clients
                .replace_ship(respawn.destroyed, respawn.replacement);
        }

        let stats = self
            .state
            .engine
            .replicate_to_clients(&self.state.world.ships, &self.connections, frame);

        self.reap_connections(now);
        for ship in self.state.clients.expire_parked(now) {
            self.state
                .engine
                .announce_deletion(&self.connections, ship, SoundType::Silent);
            self.state.world.remove_ship(ship);
        }

        let discarded = self
            .connections
            .discard_stale(self.config.settings.max_message_age);
        if discarded > 0 {
            debug!("Discarded {} unhandled messages", discarded);
        }
        self.announce_to_management(now);

        if frame % 300 == 0 && !self.state.clients.is_empty() {
            debug!(
                "Tick {}: {} clients, {} ships, {} creations, {} updates",
                frame,
                self.state.clients.len(),
                self.state.world.ship_count(),
                stats.creations,
                stats.updates
            );
        }
        self.clock.advance();
    }

    fn accept_connections(&mut self) {
        for result in self.broker.poll_results() {
            match result {
                Ok(mut connection) => {
                    if connection.role() == ConnectionRole::Management {
                        info!("Connected to management service");
                        connection.status_mut().drop_on_error = false;
                        connection.begin_handshake();
                        self.last_server_info = None;
                    }
                    self.connections.insert(connection);
                }
                Err(e) => warn!("Connection attempt failed: {}", e),
            }
        }
    }

    fn reap_connections(&mut self, now: Duration) {
        for dropped in self.connections.reap(now) {
            self.state.engine.forget_connection(dropped.id);

            match dropped.status.role {
                ConnectionRole::Client => {
                    if let Some(ship) = self.state.clients.end_session(dropped.id, now) {
                        if let Some(ship) = self.state.world.ships.get_mut(ship) {
                            ship.controls = ControlState::default();
                        }
                    }
                }
                ConnectionRole::Management => warn!("Lost connection to management service"),
                ConnectionRole::Server => {}
            }

            if dropped.with_error {
                warn!("Connection {} ({}) dropped", dropped.id, dropped.name);
            } else {
                info!("Connection {} ({}) left", dropped.id, dropped.name);
            }
        }
    }

    fn announce_to_management(&mut self, now: Duration) {
        let due = self.last_server_info.map_or(true, |last| {
            now.saturating_sub(last) >= self.config.server_info_interval
        });
        if !due {
            return;
        }

        let info = ServerInfo {
            name: self.config.name.clone(),
            arena: self.config.arena.clone(),
            players: u8::try_from(self.state.clients.len()).unwrap_or(u8::MAX),
            capacity: u8::try_from(self.config.settings.max_connections).unwrap_or(u8::MAX),
        };
        if self.connections.send_to_role(ConnectionRole::Management, info) > 0 {
            self.last_server_info = Some(now);
        }
    }

    /// Closes every connection and stops accepting new ones
    pub fn shutdown(&mut self) {
        self.broker.stop_listening();
        self.broker.cancel_connect();
        for connection in self.connections.iter() {
            connection.close("server shutting down", false);
        }
        self.reap_connections(self.clock.time());
    }

    /// Main server loop ticking at the configured rate until Ctrl+C
    pub async fn run(&mut self) -> Result<(), Box<dyn Error>> {
        let mut tick_interval = interval(self.clock.frame_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Server started successfully");

        loop {
            tokio::select! {
                _ = tick_interval.tick() => self.tick(),
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }
}

fn register_handlers(dispatcher: &mut MessageDispatcher<ServerState>) {
    dispatcher.on::<Hello, _>(ConnectionRole::Client, handle_hello);
    dispatcher.on::<ArenaReady, _>(ConnectionRole::Client, handle_arena_ready);
    dispatcher.on_one_at_a_time::<ControlUpdate, _>(ConnectionRole::Client, handle_control_update);
    dispatcher.on::<Close, _>(ConnectionRole::Client, handle_close);
    dispatcher.on::<Close, _>(ConnectionRole::Management, handle_close);
    dispatcher.on::<ServerInfoAck, _>(ConnectionRole::Management, handle_server_info_ack);
}

/// Checks versions, assigns a ship and starts the datagram handshake
fn handle_hello(
    state: &mut ServerState,
    connection: &mut LogicalConnection,
    hello: Hello,
    _info: DeliveryInfo,
) {
    if connection.state() != ConnectionState::Created {
        connection.report_error("hello received twice");
        return;
    }

    if let Err(e) = compare_versions(&state.versions, &hello.versions) {
        warn!("Rejecting {} ({}): {}", hello.name, connection.name(), e);
        connection.close(&e.to_string(), true);
        return;
    }
    if state.clients.key_in_use(hello.client_key) {
        warn!("Rejecting {}: client key already connected", hello.name);
        connection.close("client key already in use", true);
        return;
    }

    let owner = connection.id().get();
    let ship = match state.clients.reclaim(hello.client_key) {
        Some(ship) if state.world.claim_ship(ship, owner) => ship,
        _ => state.world.spawn_player(owner),
    };

    connection.set_name(hello.name.clone());
    let status = connection.status_mut();
    status.client_key = Some(hello.client_key);
    status.arena = Some(state.arena.clone());
    connection.begin_handshake();

    connection.send(Welcome {
        connection_id: owner,
        datagram_port: state.datagram_port,
        player_object: ship,
        frame: state.frame,
    });
    connection.send(ArenaLoad {
        arena: state.arena.clone(),
    });

    state.clients.add_session(Session {
        connection: connection.id(),
        name: hello.name,
        client_key: hello.client_key,
        ship,
        joined_at: state.now,
    });
}

fn handle_arena_ready(
    _state: &mut ServerState,
    connection: &mut LogicalConnection,
    ready: ArenaReady,
    _info: DeliveryInfo,
) {
    if connection.status().arena.as_deref() != Some(ready.arena.as_str()) {
        warn!(
            "Client {} reported ready for unexpected arena '{}'",
            connection.name(),
            ready.arena
        );
        return;
    }

    info!("Client {} loaded arena {}", connection.name(), ready.arena);
    connection.status_mut().ready = true;
}

fn handle_control_update(
    state: &mut ServerState,
    connection: &mut LogicalConnection,
    update: ControlUpdate,
    info: DeliveryInfo,
) {
    if !state.clients.controls(connection.id(), update.object_id) {
        connection.report_error(format!(
            "control update for ship {} it does not pilot",
            update.object_id
        ));
        return;
    }

    let outcome = state.engine.apply_update(
        &mut state.world.ships,
        SerializationScope::VARYING_FROM_CLIENT,
        update.object_id,
        &update.state,
        info.frames_ago,
        state.frame,
    );
    match outcome {
        ApplyOutcome::Applied { clamped } if clamped > 0 => {
            debug!("Clamped {} control fields from {}", clamped, connection.name())
        }
        ApplyOutcome::Malformed(e) => {
            warn!("Malformed control update from {}: {}", connection.name(), e)
        }
        _ => {}
    }
}

fn handle_close(
    _state: &mut ServerState,
    connection: &mut LogicalConnection,
    close: Close,
    _info: DeliveryInfo,
) {
    info!("{} closed the connection: {}", connection.name(), close.reason);
    connection.dispose(false);
}

fn handle_server_info_ack(
    state: &mut ServerState,
    _connection: &mut LogicalConnection,
    ack: ServerInfoAck,
    _info: DeliveryInfo,
) {
    if !ack.accepted {
        warn!("Management service rejected this server");
    }
    state.management_accepted = Some(ack.accepted);
}
