use clap::Parser;
use log::info;
use server::network::{Server, ServerConfig, DEFAULT_ARENA};
use shared::config::{NetworkSettings, DEFAULT_MAX_CONNECTIONS, DEFAULT_TICK_RATE};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Stream port clients connect to
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Datagram port; 0 picks a free one
    #[arg(short, long, default_value = "8081")]
    datagram_port: u16,

    /// Server name announced to the management service
    #[arg(short, long, default_value = "arena")]
    name: String,

    /// Arena clients are asked to load
    #[arg(short, long, default_value = DEFAULT_ARENA)]
    arena: String,

    /// Simulation ticks per second
    #[arg(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,

    /// Maximum simultaneous connections
    #[arg(short, long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_clients: usize,

    /// Management service endpoint; repeat to race several
    #[arg(long)]
    management: Vec<SocketAddr>,

    /// Seconds a disconnected player's ship is kept for a reconnect
    #[arg(long, default_value = "30")]
    parking_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServerConfig {
        name: args.name,
        arena: args.arena,
        stream_addr: format!("{}:{}", args.host, args.port).parse()?,
        datagram_addr: format!("{}:{}", args.host, args.datagram_port).parse()?,
        management: args.management,
        settings: NetworkSettings {
            tick_rate: args.tick_rate,
            max_connections: args.max_clients,
            ..NetworkSettings::default()
        },
        parking_timeout: Duration::from_secs(args.parking_timeout),
        ..ServerConfig::default()
    };

    info!("Starting server...");
    info!("Tick rate: {}Hz", config.settings.tick_rate);
    info!("Max clients: {}", config.settings.max_connections);
    if !config.management.is_empty() {
        info!("Registering with management service at {:?}", config.management);
    }

    let mut server = Server::bind(config).await?;
    server.run().await?;

    Ok(())
}
