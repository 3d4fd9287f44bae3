//! Integration tests driving a real echo server over loopback TCP

use line_echo::{Config, EchoServer, ServerError};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_test::assert_ok;

struct RunningServer {
    server: Arc<EchoServer>,
    addr: SocketAddr,
    handle: thread::JoinHandle<Result<(), ServerError>>,
}

impl RunningServer {
    fn start(config: Config) -> Self {
        let server = Arc::new(EchoServer::with_config(config));
        let handle = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.start())
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        let addr = loop {
            if let Some(addr) = server.local_addr() {
                break addr;
            }
            assert!(Instant::now() < deadline, "server did not bind in time");
            thread::sleep(Duration::from_millis(5));
        };

        RunningServer {
            server,
            addr,
            handle,
        }
    }

    fn stop(self) -> Result<(), ServerError> {
        self.server.stop();
        self.handle.join().expect("server thread panicked")
    }
}

fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        accept_timeout: Duration::from_millis(100),
        read_timeout: Some(Duration::from_secs(5)),
        write_timeout: Some(Duration::from_secs(5)),
        ..Config::default()
    }
}

/// Blocking line client, mirroring how a terminal user talks to the server.
struct LineClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl LineClient {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        LineClient {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        }
    }

    fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).unwrap();
        self.writer.write_all(b"\n").unwrap();
    }

    fn recv(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim_end_matches('\n').to_string()
    }
}

#[test]
fn connect_when_server_is_started() {
    let running = RunningServer::start(test_config());

    let socket = TcpStream::connect(running.addr);
    assert!(socket.is_ok());
    drop(socket);

    running.stop().unwrap();
}

#[test]
fn connect_refused_when_server_is_stopped() {
    let running = RunningServer::start(test_config());
    let addr = running.addr;

    let started = Instant::now();
    running.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let err = TcpStream::connect(addr).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
}

#[test]
fn write_single_line_to_server() {
    let running = RunningServer::start(test_config());

    let mut client = LineClient::connect(running.addr);
    client.send("Hello World!");
    assert_eq!(client.recv(), "Hello World!");
    drop(client);

    running.stop().unwrap();
}

#[test]
fn write_multiple_lines_to_server() {
    let running = RunningServer::start(test_config());

    let mut client = LineClient::connect(running.addr);
    client.send("Hello World!");
    client.send("How are you?");
    assert_eq!(client.recv(), "Hello World!");
    assert_eq!(client.recv(), "How are you?");
    drop(client);

    running.stop().unwrap();
}

#[test]
fn crlf_input_echoed_with_server_terminator() {
    let running = RunningServer::start(test_config());

    let mut stream = TcpStream::connect(running.addr).unwrap();
    stream.write_all(b"one\r\ntwo\r\n").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    let mut echoed = String::new();
    stream.read_to_string(&mut echoed).unwrap();
    assert_eq!(echoed, "one\ntwo\n");

    running.stop().unwrap();
}

#[test]
fn end_of_stream_does_not_affect_listener() {
    let running = RunningServer::start(test_config());

    // Half-close with no data at all.
    let mut silent = TcpStream::connect(running.addr).unwrap();
    silent.shutdown(Shutdown::Write).unwrap();
    let mut rest = Vec::new();
    silent.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    let mut client = LineClient::connect(running.addr);
    client.send("still here");
    assert_eq!(client.recv(), "still here");
    drop(client);

    running.stop().unwrap();
}

#[test]
fn idle_connection_times_out_and_next_client_is_served() {
    let running = RunningServer::start(Config {
        read_timeout: Some(Duration::from_millis(200)),
        ..test_config()
    });

    // Occupies the single worker without sending anything.
    let mut idle = TcpStream::connect(running.addr).unwrap();

    let mut client = LineClient::connect(running.addr);
    client.send("after timeout");
    assert_eq!(client.recv(), "after timeout");

    let mut buf = [0u8; 1];
    assert_eq!(idle.read(&mut buf).unwrap(), 0);
    drop(client);

    running.stop().unwrap();
}

#[test]
fn reset_connection_does_not_stop_server() {
    let running = RunningServer::start(test_config());

    {
        let stream = TcpStream::connect(running.addr).unwrap();
        // SO_LINGER 0 makes close send RST instead of FIN.
        let socket = socket2::SockRef::from(&stream);
        socket.set_linger(Some(Duration::ZERO)).unwrap();
        let mut stream = stream;
        stream.write_all(b"partial").unwrap();
    }

    let mut client = LineClient::connect(running.addr);
    client.send("after reset");
    assert_eq!(client.recv(), "after reset");
    drop(client);

    assert!(running.server.is_running());
    running.stop().unwrap();
}

#[test]
fn stop_does_not_interrupt_active_connection() {
    let running = RunningServer::start(test_config());

    let mut client = LineClient::connect(running.addr);
    client.send("before stop");
    assert_eq!(client.recv(), "before stop");

    running.server.stop();
    // Several accept timeouts pass while the client is still being served.
    thread::sleep(Duration::from_millis(300));

    client.send("after stop");
    assert_eq!(client.recv(), "after stop");
    assert!(!running.handle.is_finished());

    drop(client);
    running.handle.join().expect("server thread panicked").unwrap();
}

#[test]
fn bind_conflict_returns_error() {
    let running = RunningServer::start(test_config());

    let second = EchoServer::with_config(Config {
        port: running.addr.port(),
        ..test_config()
    });
    match second.start() {
        Err(ServerError::Bind { source, .. }) => assert_eq!(source.kind(), ErrorKind::AddrInUse),
        other => panic!("unexpected: {:?}", other),
    }

    running.stop().unwrap();
}

/// 1000 clients, each sending one line, all spawned at once.
///
/// Client sockets share the test process's descriptor table with the
/// server, and the usual soft `RLIMIT_NOFILE` is 1024, so at most
/// `MAX_IN_FLIGHT` clients hold an open connection at any moment. The rest
/// wait on the semaphore, then queue in the listen backlog like the others.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_data_from_multiple_clients_to_server() {
    const NUM_CLIENTS: usize = 1000;
    const MAX_IN_FLIGHT: usize = 512;

    let running = RunningServer::start(test_config());
    let addr = running.addr;
    let permits = Arc::new(Semaphore::new(MAX_IN_FLIGHT));

    let mut tasks = Vec::with_capacity(NUM_CLIENTS);
    for id in 0..NUM_CLIENTS {
        let permits = Arc::clone(&permits);
        tasks.push(tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.unwrap();

            let stream = tokio::net::TcpStream::connect(addr).await?;
            let (reader, mut writer) = stream.into_split();
            writer
                .write_all(format!("client-{id} hello!\n").as_bytes())
                .await?;

            let mut reader = tokio::io::BufReader::new(reader);
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            Ok::<_, std::io::Error>(line.trim_end().to_string())
        }));
    }

    for (id, task) in tasks.into_iter().enumerate() {
        let echoed = tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .expect("client timed out")
            .expect("client task panicked");
        let echoed = assert_ok!(echoed);
        assert_eq!(echoed, format!("client-{id} hello!"));
    }

    tokio::task::spawn_blocking(move || running.stop())
        .await
        .unwrap()
        .unwrap();
}
