//! line-echo: a line-oriented TCP echo server
//!
//! Accepts TCP clients one at a time and writes every line a client sends
//! back to it, until the client closes its side of the connection.
//!
//! - `server`: listener, accept loop and start/stop lifecycle
//! - `connection`: per-connection echo loop
//! - `framing`: line splitting and output terminators
//! - `config`: CLI arguments and TOML configuration
//! - `signal`: SIGINT/SIGTERM to cooperative stop

pub mod config;
pub mod connection;
pub mod framing;
pub mod server;
pub mod signal;

pub use config::{Config, ConfigError};
pub use connection::{handle_connection, CloseReason, ConnState, Connection, ConnectionSettings};
pub use framing::LineEnding;
pub use server::{EchoServer, ServerError, StopHandle};
