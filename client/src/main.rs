use clap::Parser;
use client::network::{Client, ClientConfig, ClientState};
use log::info;
use shared::config::{NetworkSettings, DEFAULT_TICK_RATE};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to; repeat to race several
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: Vec<SocketAddr>,

    /// Player name shown to the server
    #[arg(short, long, default_value = "player")]
    name: String,

    /// Key presented on every connect to regain the same ship
    #[arg(short, long)]
    key: Option<u64>,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Seed for the scripted pilot
    #[arg(long)]
    seed: Option<u64>,

    /// Simulation ticks per second; must match the server
    #[arg(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {:?}", args.server);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let config = ClientConfig {
        servers: args.server,
        name: args.name,
        client_key: args.key.unwrap_or_else(rand::random),
        settings: NetworkSettings {
            tick_rate: args.tick_rate,
            extra_latency: Duration::from_millis(args.fake_ping),
            ..NetworkSettings::default()
        },
        bot_seed: args.seed,
        ..ClientConfig::default()
    };
    info!("Client key: {}", config.client_key);

    let mut client = Client::new(config).await?;
    client.run().await?;

    if let ClientState::Closed(reason) = client.state() {
        info!("Session ended: {}", reason);
    }

    Ok(())
}
