use clap::Parser;
use duet::Config;
use duet::health;
use duet::signaling::{CoordinatorHandle, RoomRegistry, SignalingServer};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = match Config::parse().validate() {
        Ok(config) => config,
        Err(e) => e.exit(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("   Duet Signaling Server");
    println!("   WebSocket on {}", config.signaling_addr());
    println!("   Health on http://{}/health", config.health_addr());
    println!("   Press Ctrl+C to stop\n");

    let handle = CoordinatorHandle::spawn(RoomRegistry::new(), config.command_buffer.get());
    let server = SignalingServer::bind(&config.signaling_addr(), handle)
        .await?
        .with_keepalive(config.keepalive());
    let health_listener = TcpListener::bind(config.health_addr()).await?;

    tokio::select! {
        res = server.run() => res?,
        res = health::serve(health_listener) => res?,
        _ = tokio::signal::ctrl_c() => warn!("Received shutdown signal"),
    }

    info!("Shutdown complete");
    Ok(())
}
