//! Thread-per-connection TCP server.
//!
//! One blocking accept loop hands each connection to its own named worker
//! thread. Workers share the registry through the [`Dispatcher`] and never
//! touch each other's sockets. The accept loop exits once the stop flag is
//! set; whoever sets the flag opens a throwaway loopback connection so a
//! blocked `accept` returns and observes it.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;
use uafsim_registry::ChunkRegistry;

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::structured_log::{LogEntry, LogLevel, SharedLog};

const WAKE_TIMEOUT: Duration = Duration::from_millis(500);
const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);
const ACCEPT_MAX_CONSECUTIVE_ERRORS: u32 = 32;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("server io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),
    #[error("accept failed {attempts} times in a row, closing listener: {source}")]
    AcceptFailed {
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// What the accept loop does after a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptAction {
    /// The error belongs to one aborted handshake; accept again at once.
    Retry,
    /// Sleep before accepting again. The pending connection stays queued, so
    /// retrying immediately would fail the same way.
    Backoff(Duration),
    /// Give up and close the listener.
    Fatal,
}

/// Exponential backoff across consecutive accept failures.
#[derive(Debug, Clone)]
struct AcceptBackoff {
    start: Duration,
    max: Duration,
    limit: u32,
    consecutive: u32,
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self::new(
            ACCEPT_BACKOFF_START,
            ACCEPT_BACKOFF_MAX,
            ACCEPT_MAX_CONSECUTIVE_ERRORS,
        )
    }
}

impl AcceptBackoff {
    fn new(start: Duration, max: Duration, limit: u32) -> Self {
        Self {
            start,
            max,
            limit: limit.max(1),
            consecutive: 0,
        }
    }

    fn on_success(&mut self) {
        self.consecutive = 0;
    }

    fn on_error(&mut self, err: &io::Error) -> AcceptAction {
        if matches!(
            err.kind(),
            io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
        ) {
            return AcceptAction::Retry;
        }
        self.consecutive += 1;
        if self.consecutive >= self.limit {
            return AcceptAction::Fatal;
        }
        let factor = 1_u32 << (self.consecutive - 1).min(16);
        AcceptAction::Backoff(self.start.saturating_mul(factor).min(self.max))
    }
}

/// A bound, not yet serving, listener.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    read_buffer: usize,
    dispatcher: Dispatcher,
    stop: Arc<AtomicBool>,
    log: SharedLog,
    accept_backoff: AcceptBackoff,
}

impl Server {
    /// Bind the configured address. Port 0 picks an ephemeral port; the real
    /// one is available from [`local_addr`](Self::local_addr) immediately.
    pub fn bind(
        config: &ServerConfig,
        registry: Arc<ChunkRegistry>,
        log: SharedLog,
    ) -> Result<Self, ServerError> {
        let addr = config.bind_address();
        let resolved: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|_| ServerError::InvalidAddress(addr.clone()))?
            .collect();
        if resolved.is_empty() {
            return Err(ServerError::InvalidAddress(addr));
        }
        let listener =
            TcpListener::bind(&resolved[..]).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        Ok(Self {
            listener,
            local_addr,
            read_buffer: config.read_buffer.max(1),
            dispatcher: Dispatcher::new(registry, Arc::clone(&stop)),
            stop,
            log,
            accept_backoff: AcceptBackoff::default(),
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ChunkRegistry> {
        self.dispatcher.registry()
    }

    /// Run the accept loop on the calling thread until a stop is requested.
    ///
    /// Connections that are still open when the loop exits keep their
    /// workers; only new connections are refused. Accept errors that persist
    /// through the backoff close the listener and are returned.
    pub fn serve(self) -> Result<(), ServerError> {
        self.log.record(
            LogEntry::new("", LogLevel::Info, "server_listen").with_details(json!({
                "addr": self.local_addr.to_string(),
                "read_buffer": self.read_buffer,
            })),
        );

        let (connections, result) = self.accept_loop(self.listener.incoming());

        let metrics = self.registry().metrics();
        let reason = if result.is_ok() { "stopped" } else { "accept_failed" };
        self.log.record(
            LogEntry::new("", LogLevel::Info, "server_stopped").with_details(json!({
                "connections": connections,
                "reason": reason,
                "detections": metrics.detections(),
                "metrics": metrics,
            })),
        );
        self.log.flush();
        result
    }

    /// Hand accepted streams to workers until the stop flag is seen or
    /// accepting fails for good. Returns the number of connections served.
    fn accept_loop(
        &self,
        incoming: impl Iterator<Item = io::Result<TcpStream>>,
    ) -> (u64, Result<(), ServerError>) {
        let mut backoff = self.accept_backoff.clone();
        let mut connections: u64 = 0;
        for stream in incoming {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let stream = match stream {
                Ok(stream) => {
                    backoff.on_success();
                    stream
                }
                Err(err) => {
                    let action = backoff.on_error(&err);
                    let (level, retry_ms) = match action {
                        AcceptAction::Retry => (LogLevel::Debug, 0),
                        AcceptAction::Backoff(delay) => {
                            (LogLevel::Warn, u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
                        }
                        AcceptAction::Fatal => (LogLevel::Error, 0),
                    };
                    self.log.record(LogEntry::new("", level, "accept_error").with_details(json!({
                        "error": err.to_string(),
                        "consecutive": backoff.consecutive,
                        "retry_in_ms": retry_ms,
                        "fatal": action == AcceptAction::Fatal,
                    })));
                    match action {
                        AcceptAction::Retry => continue,
                        AcceptAction::Backoff(delay) => {
                            thread::sleep(delay);
                            continue;
                        }
                        AcceptAction::Fatal => {
                            let attempts = backoff.consecutive;
                            return (
                                connections,
                                Err(ServerError::AcceptFailed {
                                    attempts,
                                    source: err,
                                }),
                            );
                        }
                    }
                }
            };
            connections += 1;
            let worker = Worker {
                connection: connections,
                peer: stream
                    .peer_addr()
                    .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string()),
                listen_addr: self.local_addr,
                read_buffer: self.read_buffer,
                dispatcher: self.dispatcher.clone(),
                log: self.log.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("uafsim-conn-{connections}"))
                .spawn(move || worker.run(stream));
            if let Err(err) = spawned {
                self.log.record(
                    LogEntry::new("", LogLevel::Error, "accept_error")
                        .with_details(json!({ "error": format!("worker spawn failed: {err}") })),
                );
            }
        }
        (connections, Ok(()))
    }

    /// Run [`serve`](Self::serve) on a background thread.
    pub fn spawn(self) -> Result<ServerHandle, ServerError> {
        let local_addr = self.local_addr;
        let stop = Arc::clone(&self.stop);
        let registry = Arc::clone(self.registry());
        let join = thread::Builder::new()
            .name("uafsim-accept".to_string())
            .spawn(move || self.serve())?;
        Ok(ServerHandle {
            local_addr,
            stop,
            registry,
            join,
        })
    }
}

/// Control handle for a server running on a background thread.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    registry: Arc<ChunkRegistry>,
    join: JoinHandle<Result<(), ServerError>>,
}

impl ServerHandle {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ChunkRegistry> {
        &self.registry
    }

    /// Whether a stop has been requested, by `SHUTDOWN` or [`stop`](Self::stop).
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Request a stop and wake the accept loop.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        wake_listener(self.local_addr);
    }

    /// Wait for the accept loop to exit.
    pub fn join(self) -> Result<(), ServerError> {
        self.join
            .join()
            .map_err(|_| ServerError::Io(io::Error::other("accept thread panicked")))?
    }
}

/// Per-connection state moved into a worker thread.
struct Worker {
    connection: u64,
    peer: String,
    listen_addr: SocketAddr,
    read_buffer: usize,
    dispatcher: Dispatcher,
    log: SharedLog,
}

impl Worker {
    fn entry(&self, level: LogLevel, event: &str) -> LogEntry {
        LogEntry::new("", level, event).with_peer(self.peer.as_str(), self.connection)
    }

    fn client_error(&self, context: &str, err: &io::Error) {
        self.log.record(
            self.entry(LogLevel::Warn, "client_error")
                .with_details(json!({ "error": format!("{context}: {err}") })),
        );
    }

    fn run(self, mut stream: TcpStream) {
        self.log.record(self.entry(LogLevel::Info, "client_connected"));
        if let Err(err) = stream.set_nodelay(true) {
            self.client_error("set_nodelay", &err);
        }

        let mut frames: u64 = 0;
        let reason = match self.serve_frames(&mut stream, &mut frames) {
            Ok(reason) => reason,
            Err(err) => {
                self.client_error("connection", &err);
                "error"
            }
        };

        self.log.record(
            self.entry(LogLevel::Info, "client_disconnected")
                .with_details(json!({ "frames": frames, "reason": reason })),
        );
    }

    /// Read-dispatch-write until the peer goes away or asks for shutdown.
    fn serve_frames<S: Read + Write>(
        &self,
        stream: &mut S,
        frames: &mut u64,
    ) -> io::Result<&'static str> {
        let mut buf = vec![0u8; self.read_buffer];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => return Ok("eof"),
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            *frames += 1;

            let started = Instant::now();
            let dispatch = self.dispatcher.dispatch_frame(&buf[..n]);
            let reply = dispatch.response.encode();
            let latency = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);

            let level = if dispatch.response.is_detection() {
                LogLevel::Warn
            } else {
                LogLevel::Debug
            };
            let mut entry = self
                .entry(level, "command")
                .with_outcome(dispatch.response.label())
                .with_bytes(n, reply.len())
                .with_latency_ns(latency);
            if let Some(command) = dispatch.command {
                entry = entry.with_command(command.as_str());
            }
            self.log.record(entry);

            if dispatch.ends_connection() {
                // The stop flag is already set; the accept loop must learn of
                // it even if this peer is gone before the reply lands.
                self.log.record(self.entry(LogLevel::Info, "server_shutdown"));
                wake_listener(self.listen_addr);
                stream.write_all(&reply)?;
                return Ok("shutdown");
            }
            stream.write_all(&reply)?;
        }
    }
}

/// Poke the listener so a blocked `accept` returns and sees the stop flag.
fn wake_listener(listen_addr: SocketAddr) {
    let target = match listen_addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listen_addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), listen_addr.port())
        }
        _ => listen_addr,
    };
    // The loop may already be gone; a refused connection is fine.
    let _ = TcpStream::connect_timeout(&target, WAKE_TIMEOUT);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structured_log::LogEmitter;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn bind_reports_ephemeral_port() {
        let server = Server::bind(
            &loopback_config(),
            Arc::new(ChunkRegistry::new()),
            SharedLog::new(LogEmitter::discard()),
        )
        .unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.local_addr().ip().is_loopback());
    }

    #[test]
    fn bind_conflict_is_returned() {
        let first = Server::bind(
            &loopback_config(),
            Arc::new(ChunkRegistry::new()),
            SharedLog::new(LogEmitter::discard()),
        )
        .unwrap();
        let taken = ServerConfig {
            port: first.local_addr().port(),
            ..ServerConfig::default()
        };
        let err = Server::bind(
            &taken,
            Arc::new(ChunkRegistry::new()),
            SharedLog::new(LogEmitter::discard()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ServerError::Bind { .. }), "{err}");
    }

    #[test]
    fn unresolvable_host_is_invalid_address() {
        let cfg = ServerConfig {
            host: "not a host".into(),
            ..loopback_config()
        };
        let err = Server::bind(
            &cfg,
            Arc::new(ChunkRegistry::new()),
            SharedLog::new(LogEmitter::discard()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ServerError::InvalidAddress(_)), "{err}");
    }

    #[test]
    fn stop_wakes_idle_accept_loop() {
        let (emitter, buffer) = LogEmitter::to_buffer("uafsim", "test");
        let server = Server::bind(
            &loopback_config(),
            Arc::new(ChunkRegistry::new()),
            SharedLog::new(emitter),
        )
        .unwrap();
        let handle = server.spawn().unwrap();
        assert!(!handle.is_stopped());
        handle.stop();
        handle.join().unwrap();

        let events: Vec<String> = buffer.entries().into_iter().map(|e| e.event).collect();
        assert_eq!(events.first().map(String::as_str), Some("server_listen"));
        assert_eq!(events.last().map(String::as_str), Some("server_stopped"));
    }

    fn emfile() -> io::Error {
        // EMFILE on Linux and macOS; any non-transient error behaves the same.
        io::Error::from_raw_os_error(24)
    }

    #[test]
    fn accept_backoff_grows_caps_and_gives_up() {
        let mut backoff = AcceptBackoff::new(Duration::from_millis(10), Duration::from_millis(50), 6);
        let actions: Vec<AcceptAction> = (0..6).map(|_| backoff.on_error(&emfile())).collect();
        assert_eq!(
            actions,
            vec![
                AcceptAction::Backoff(Duration::from_millis(10)),
                AcceptAction::Backoff(Duration::from_millis(20)),
                AcceptAction::Backoff(Duration::from_millis(40)),
                AcceptAction::Backoff(Duration::from_millis(50)),
                AcceptAction::Backoff(Duration::from_millis(50)),
                AcceptAction::Fatal,
            ]
        );
    }

    #[test]
    fn accept_backoff_ignores_transient_errors_and_resets_on_success() {
        let mut backoff = AcceptBackoff::default();
        for kind in [
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
        ] {
            assert_eq!(backoff.on_error(&io::Error::from(kind)), AcceptAction::Retry);
        }
        assert_eq!(backoff.consecutive, 0);

        assert!(matches!(backoff.on_error(&emfile()), AcceptAction::Backoff(_)));
        assert!(matches!(backoff.on_error(&emfile()), AcceptAction::Backoff(_)));
        backoff.on_success();
        assert_eq!(
            backoff.on_error(&emfile()),
            AcceptAction::Backoff(ACCEPT_BACKOFF_START)
        );
    }

    #[test]
    fn persistent_accept_errors_are_bounded_then_fatal() {
        let (emitter, buffer) = LogEmitter::to_buffer("uafsim", "test");
        let mut server = Server::bind(
            &loopback_config(),
            Arc::new(ChunkRegistry::new()),
            SharedLog::new(emitter.with_min_level(LogLevel::Debug)),
        )
        .unwrap();
        server.accept_backoff = AcceptBackoff::new(Duration::from_millis(1), Duration::from_millis(2), 5);

        // An endless stream of failures, as accept returns while out of fds.
        let started = Instant::now();
        let (connections, result) = server.accept_loop(std::iter::repeat_with(|| Err(emfile())));
        assert_eq!(connections, 0);
        assert!(
            matches!(result, Err(ServerError::AcceptFailed { attempts: 5, .. })),
            "{result:?}"
        );
        // Four backoff sleeps of 1, 2, 2, 2 ms precede the fatal error.
        assert!(started.elapsed() >= Duration::from_millis(7));

        let errors: Vec<LogEntry> = buffer
            .entries()
            .into_iter()
            .filter(|e| e.event == "accept_error")
            .collect();
        assert_eq!(errors.len(), 5);
        assert_eq!(errors[4].level, LogLevel::Error);
        assert_eq!(errors[4].details.as_ref().unwrap()["fatal"], true);
    }

    #[test]
    fn accept_loop_skips_transient_errors_until_stopped() {
        let server = Server::bind(
            &loopback_config(),
            Arc::new(ChunkRegistry::new()),
            SharedLog::new(LogEmitter::discard()),
        )
        .unwrap();
        let stop = Arc::clone(&server.stop);
        let mut remaining = 100;
        let incoming = std::iter::from_fn(|| {
            remaining -= 1;
            if remaining == 0 {
                stop.store(true, Ordering::SeqCst);
            }
            Some(Err(io::Error::from(io::ErrorKind::ConnectionAborted)))
        });
        let (connections, result) = server.accept_loop(incoming);
        assert_eq!(connections, 0);
        assert!(result.is_ok());
    }

    /// Yields one frame, then fails every write as a reset peer would.
    struct ResetOnWrite {
        frame: Option<Vec<u8>>,
    }

    impl Read for ResetOnWrite {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.frame.take() {
                Some(frame) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(frame.len())
                }
                None => Ok(0),
            }
        }
    }

    impl Write for ResetOnWrite {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::ConnectionReset.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn shutdown_wakes_listener_even_when_reply_write_fails() {
        let server = Server::bind(
            &loopback_config(),
            Arc::new(ChunkRegistry::new()),
            SharedLog::new(LogEmitter::discard()),
        )
        .unwrap();
        let worker = Worker {
            connection: 1,
            peer: "reset-peer".into(),
            listen_addr: server.local_addr(),
            read_buffer: 64,
            dispatcher: server.dispatcher.clone(),
            log: server.log.clone(),
        };
        let handle = server.spawn().unwrap();

        let mut stream = ResetOnWrite {
            frame: Some(b"SHUTDOWN".to_vec()),
        };
        let mut frames = 0;
        let err = worker.serve_frames(&mut stream, &mut frames).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(frames, 1);
        assert!(handle.is_stopped());

        // No other client connects; the accept loop must still exit.
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(handle.join().is_ok());
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
    }

    #[test]
    fn worker_socket_errors_are_logged_as_client_error() {
        let (emitter, buffer) = LogEmitter::to_buffer("uafsim", "test");
        let worker = Worker {
            connection: 3,
            peer: "127.0.0.1:4000".into(),
            listen_addr: "127.0.0.1:9".parse().unwrap(),
            read_buffer: 16,
            dispatcher: Dispatcher::new(
                Arc::new(ChunkRegistry::new()),
                Arc::new(AtomicBool::new(false)),
            ),
            log: SharedLog::new(emitter),
        };
        worker.client_error("set_nodelay", &io::Error::other("not supported"));

        let entries = buffer.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "client_error");
        assert_eq!(entries[0].connection, Some(3));
        assert_eq!(
            entries[0].details.as_ref().unwrap()["error"],
            "set_nodelay: not supported"
        );
    }
}
