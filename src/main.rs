//! line-echo: a line-oriented TCP echo server
//!
//! Every line a client sends is written straight back to it. Clients are
//! served one at a time; SIGINT or SIGTERM stops the server once the current
//! client is done.
//!
//! Configuration via CLI arguments or TOML file.

use line_echo::{signal, Config, EchoServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        accept_timeout_ms = config.accept_timeout.as_millis() as u64,
        read_timeout_ms = config.read_timeout.map_or(0, |d| d.as_millis() as u64),
        line_ending = ?config.line_ending,
        "Starting line-echo server"
    );

    let server = EchoServer::with_config(config);
    signal::spawn_watcher(server.stop_handle())?;

    server.start()?;
    Ok(())
}
