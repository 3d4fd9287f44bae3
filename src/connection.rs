//! Per-connection echo handling.
//!
//! A `Connection` owns its socket for its whole lifetime and is driven to
//! completion by a single call to [`handle_connection`]. Every exit path
//! (end-of-stream, timeout, I/O error) moves it to `Closed`, which drops the
//! socket exactly once; `Drop` covers any path that skips that.

use crate::config::Config;
use crate::framing::{Frame, LineEnding, LineFramer};
use bytes::BytesMut;
use std::fmt;
use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::{debug, trace};

/// Initial capacity for the per-connection line buffers
const LINE_CAPACITY: usize = 256;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the next line from the peer.
    AwaitingLine,
    /// Writing a line back to the peer.
    Echoing,
    /// Terminal; the socket has been released.
    Closed,
}

/// Why a connection stopped being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its sending side.
    EndOfStream,
    /// No data arrived within the read timeout, or a write stalled past the
    /// write timeout.
    TimedOut,
    /// Any other I/O failure on the socket.
    Failed(io::ErrorKind),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::EndOfStream => write!(f, "end of stream"),
            CloseReason::TimedOut => write!(f, "timed out"),
            CloseReason::Failed(kind) => write!(f, "I/O error: {kind}"),
        }
    }
}

impl From<io::Error> for CloseReason {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            // SO_RCVTIMEO/SO_SNDTIMEO expiry surfaces as EAGAIN on unix.
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => CloseReason::TimedOut,
            kind => CloseReason::Failed(kind),
        }
    }
}

/// Socket options applied to every accepted connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub line_ending: LineEnding,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            line_ending: config.line_ending,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings::from(&Config::default())
    }
}

/// A single accepted client.
///
/// The stream lives inside the `BufReader`; writes go through the same
/// socket via `get_mut`, so there is exactly one descriptor to close.
/// Entering [`ConnState::Closed`] takes the reader out and drops it.
pub struct Connection {
    reader: Option<BufReader<TcpStream>>,
    peer: SocketAddr,
    state: ConnState,
    framer: LineFramer,
    line: Vec<u8>,
    out: BytesMut,
    line_ending: LineEnding,
    lines_echoed: u64,
}

impl Connection {
    /// Wrap an accepted stream in the initial `AwaitingLine` state.
    pub fn new(stream: TcpStream, peer: SocketAddr, line_ending: LineEnding) -> Self {
        Self {
            reader: Some(BufReader::new(stream)),
            peer,
            state: ConnState::AwaitingLine,
            framer: LineFramer::new(),
            line: Vec::with_capacity(LINE_CAPACITY),
            out: BytesMut::with_capacity(LINE_CAPACITY),
            line_ending,
            lines_echoed: 0,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn lines_echoed(&self) -> u64 {
        self.lines_echoed
    }

    /// Echo lines until the peer goes away. The connection is `Closed` on
    /// return.
    pub fn run(&mut self) -> CloseReason {
        loop {
            match self.echo_next_line() {
                Ok(Frame::Line) => continue,
                Ok(Frame::EndOfStream) => return CloseReason::EndOfStream,
                Err(e) => {
                    trace!(peer = %self.peer, error = %e, "Connection I/O error");
                    return CloseReason::from(e);
                }
            }
        }
    }

    /// Read one line and write it back, flushing before returning.
    ///
    /// End-of-stream and any error close the connection.
    fn echo_next_line(&mut self) -> io::Result<Frame> {
        let result = self.read_and_echo();
        if !matches!(result, Ok(Frame::Line)) {
            self.close();
        }
        result
    }

    fn read_and_echo(&mut self) -> io::Result<Frame> {
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "connection closed",
                ))
            }
        };

        self.line.clear();
        if self.framer.read_line(reader, &mut self.line)? == Frame::EndOfStream {
            return Ok(Frame::EndOfStream);
        }

        self.state = ConnState::Echoing;

        self.out.clear();
        self.out.extend_from_slice(&self.line);
        self.out.extend_from_slice(self.line_ending.as_bytes());

        let stream = reader.get_mut();
        stream.write_all(&self.out)?;
        stream.flush()?;

        self.lines_echoed += 1;
        self.state = ConnState::AwaitingLine;
        Ok(Frame::Line)
    }

    /// Release the socket and enter `Closed`. Only the first call has an
    /// effect.
    fn close(&mut self) {
        self.state = ConnState::Closed;
        if let Some(reader) = self.reader.take() {
            drop(reader);
            debug!(
                peer = %self.peer,
                lines = self.lines_echoed,
                "Connection closed"
            );
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Serve one accepted client to completion.
///
/// Never returns an error: every failure is folded into the returned
/// [`CloseReason`] and the socket is closed before this returns.
pub fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    settings: &ConnectionSettings,
) -> CloseReason {
    if let Err(e) = configure(&stream, settings) {
        debug!(peer = %peer, error = %e, "Failed to configure connection");
        return CloseReason::from(e);
    }

    let mut conn = Connection::new(stream, peer, settings.line_ending);
    conn.run()
}

fn configure(stream: &TcpStream, settings: &ConnectionSettings) -> io::Result<()> {
    // mio accepts sockets in non-blocking mode.
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(settings.read_timeout)?;
    stream.set_write_timeout(settings.write_timeout)?;
    Ok(())
}
