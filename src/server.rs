//! TCP listener and start/stop lifecycle.
//!
//! `start()` binds the listening socket and runs the accept loop on the
//! calling thread. Each accepted connection is served to completion before
//! the next one is accepted. The wait for new connections is a `mio::Poll`
//! with a timeout, so a `stop()` from another thread is observed within one
//! accept timeout even when no clients arrive.

use crate::config::Config;
use crate::connection::{handle_connection, ConnectionSettings};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::fmt;
use std::io;
use std::net::{AddrParseError, IpAddr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, trace};

const LISTENER_TOKEN: Token = Token(0);

/// Only the listener is registered, so one slot is enough.
const EVENTS_CAPACITY: usize = 1;

/// Line echo server instance
pub struct EchoServer {
    config: Config,
    running: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Cloneable handle that requests a running server to stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    /// Request the accept loop to exit. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl EchoServer {
    /// Create a server for `port` with default settings for everything else.
    pub fn new(port: u16) -> Self {
        Self::with_config(Config {
            port,
            ..Config::default()
        })
    }

    /// Create a new server instance
    pub fn with_config(config: Config) -> Self {
        EchoServer {
            config,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address of the bound listener, present only while `start()` runs.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Request the accept loop to exit.
    ///
    /// Does not interrupt a connection currently being served; the loop
    /// observes the request before its next accept, at most one accept
    /// timeout later. Calling this before `start()` has no effect.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Bind the listener and serve connections until stopped.
    ///
    /// Blocks the calling thread. Returns `Ok(())` after `stop()` is
    /// observed; bind, poll and accept failures are returned as errors.
    pub fn start(&self) -> Result<(), ServerError> {
        let addr = self.bind_addr()?;
        let listener = create_listener(addr, self.config.backlog)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let mut listener = TcpListener::from_std(listener);
        let bound = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let mut poll = Poll::new().map_err(ServerError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Poll)?;

        let _running = RunningGuard::enter(self, bound);
        info!(
            addr = %bound,
            accept_timeout_ms = self.config.accept_timeout.as_millis() as u64,
            "Server listening"
        );

        let result = self.accept_loop(&listener, &mut poll);
        match &result {
            Ok(()) => info!(addr = %bound, "Server stopped"),
            Err(e) => error!(addr = %bound, error = %e, "Server failed"),
        }

        // Close the socket before the guard clears the running state.
        drop(poll);
        drop(listener);
        result
    }

    fn bind_addr(&self) -> Result<SocketAddr, ServerError> {
        let ip: IpAddr = self
            .config
            .host
            .parse()
            .map_err(|e| ServerError::InvalidAddress(self.config.host.clone(), e))?;
        Ok(SocketAddr::new(ip, self.config.port))
    }

    fn accept_loop(&self, listener: &TcpListener, poll: &mut Poll) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let settings = ConnectionSettings::from(&self.config);

        while self.is_running() {
            match poll.poll(&mut events, Some(self.config.accept_timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::Poll(e)),
            }

            if events.is_empty() {
                trace!("Accept wait elapsed");
                continue;
            }

            self.drain_pending(listener, &settings)?;
        }

        Ok(())
    }

    /// Accept and serve queued connections one at a time until the
    /// listener would block or a stop is requested.
    ///
    /// mio is edge-triggered, so the queue must be drained before polling
    /// again.
    fn drain_pending(
        &self,
        listener: &TcpListener,
        settings: &ConnectionSettings,
    ) -> Result<(), ServerError> {
        while self.is_running() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    let stream = into_std(stream);
                    let reason = handle_connection(stream, peer, settings);
                    debug!(peer = %peer, reason = %reason, "Connection finished");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    trace!(error = %e, "Transient accept error");
                    continue;
                }
                Err(e) => return Err(ServerError::Accept(e)),
            }
        }
        Ok(())
    }
}

/// Marks the server running for the lifetime of a bound listener.
///
/// Clears both the running flag and the bound address on drop, so they stay
/// consistent on every exit path out of `start()`.
struct RunningGuard<'a> {
    server: &'a EchoServer,
}

impl<'a> RunningGuard<'a> {
    fn enter(server: &'a EchoServer, addr: SocketAddr) -> Self {
        server.running.store(true, Ordering::SeqCst);
        *server
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(addr);
        RunningGuard { server }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.server.running.store(false, Ordering::SeqCst);
        *self
            .server
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Create a non-blocking TCP listener.
///
/// `SO_REUSEADDR` lets a restart bind over TIME_WAIT sockets; `SO_REUSEPORT`
/// is left off so a port held by another listener is still an error.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Hand an accepted mio stream over to blocking std I/O.
///
/// `handle_connection` switches the socket back to blocking mode.
#[cfg(unix)]
fn into_std(stream: mio::net::TcpStream) -> TcpStream {
    use std::os::fd::{FromRawFd, IntoRawFd};
    // SAFETY: `into_raw_fd` gives up ownership of a valid, open socket.
    unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) }
}

#[cfg(windows)]
fn into_std(stream: mio::net::TcpStream) -> TcpStream {
    use std::os::windows::io::{FromRawSocket, IntoRawSocket};
    // SAFETY: `into_raw_socket` gives up ownership of a valid, open socket.
    unsafe { TcpStream::from_raw_socket(stream.into_raw_socket()) }
}

/// Fatal server errors returned from `start()`
#[derive(Debug)]
pub enum ServerError {
    /// The configured host is not an IP address.
    InvalidAddress(String, AddrParseError),
    /// Creating, binding or listening on the socket failed.
    Bind { addr: SocketAddr, source: io::Error },
    /// Creating or waiting on the poller failed.
    Poll(io::Error),
    /// Accepting a connection failed.
    Accept(io::Error),
}

impl ServerError {
    /// The underlying I/O error, if any.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            ServerError::InvalidAddress(..) => None,
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Poll(e) | ServerError::Accept(e) => Some(e),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::InvalidAddress(host, e) => {
                write!(f, "Invalid listen address '{}': {}", host, e)
            }
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to bind {}: {}", addr, source)
            }
            ServerError::Poll(e) => write!(f, "Failed to wait for connections: {}", e),
            ServerError::Accept(e) => write!(f, "Failed to accept connection: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::InvalidAddress(_, e) => Some(e),
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Poll(e) | ServerError::Accept(e) => Some(e),
        }
    }
}
