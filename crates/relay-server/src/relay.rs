//! Relay startup and graceful shutdown.
//!
//! [`Relay::start`] binds the listening resource, serves the HTTP and
//! WebSocket routes on it and starts the bus listener. The returned
//! [`RunningRelay`] owns every task and tears them down in order.

use crate::config::{Config, ListenTarget};
use crate::handlers::{router, AppState};
use crate::lifecycle::{Lifecycle, LifecycleError, LifecycleState};
use crate::listener::{wait_for_shutdown, SubscriptionListener};
use axum::Router;
use chord_relay_bus::{Bus, BusError, ExponentialBackoff};
use chord_relay_core::{Broadcaster, ConnectionRegistry, DecodeMode};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use tokio::net::UnixListener;

/// Growth factor between reconnect attempts.
const RECONNECT_FACTOR: f64 = 2.0;

/// Startup failures. Each one is fatal.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The listening resource could not be bound.
    #[error("Failed to listen on {target}")]
    Bind {
        target: String,
        #[source]
        source: io::Error,
    },

    /// The bus could not be reached or rejected the subscription.
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Address the relay is serving on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Removes a Unix socket file when dropped.
#[derive(Debug)]
struct SocketFile {
    path: PathBuf,
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove socket file"),
        }
    }
}

enum BoundListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// A configured relay that has not started yet.
pub struct Relay {
    config: Config,
    bus: Arc<dyn Bus>,
    lifecycle: Lifecycle,
    registry: Arc<ConnectionRegistry>,
}

impl Relay {
    #[must_use]
    pub fn new(config: Config, bus: Arc<dyn Bus>) -> Self {
        Self {
            config,
            bus,
            lifecycle: Lifecycle::new(),
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Bind, serve and subscribe.
    ///
    /// If the bus subscription fails, the server is stopped and the
    /// listening resource released before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Bind`] if the listening resource cannot be
    /// bound and [`StartupError::Bus`] if the bus subscription fails.
    pub async fn start(self) -> Result<RunningRelay, StartupError> {
        self.lifecycle.advance(LifecycleState::Starting)?;

        let (bound, local_addr, socket_file) = bind(&self.config.host, &self.config.listen_on).await?;
        info!(addr = %local_addr, "Listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = Arc::new(AppState::new(&self.config, Arc::clone(&self.registry)));
        let app = router(&self.config, state);
        let server = spawn_server(bound, app, shutdown_rx.clone());

        let mode = DecodeMode::from_json_flag(self.config.json_messages);
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&self.registry), mode));
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(self.config.bus.reconnect_initial_ms),
            Duration::from_millis(self.config.bus.reconnect_max_ms),
            RECONNECT_FACTOR,
        );
        let listener = SubscriptionListener::new(
            Arc::clone(&self.bus),
            self.config.bus.pattern.clone(),
            broadcaster,
            backoff,
        );

        let listener = match listener.start(shutdown_rx).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Bus subscription failed, releasing listener");
                let _ = shutdown_tx.send(true);
                if let Err(join) = server.await {
                    warn!(error = %join, "Server task failed");
                }
                drop(socket_file);
                return Err(e.into());
            }
        };

        self.lifecycle.advance(LifecycleState::Running)?;
        info!(
            service_info = %self.config.service_info_path(),
            socket = %self.config.socket_path(),
            "Relay running"
        );

        Ok(RunningRelay {
            lifecycle: self.lifecycle,
            registry: self.registry,
            local_addr,
            shutdown: shutdown_tx,
            listener,
            server,
            socket_file,
            grace: self.config.shutdown_grace(),
        })
    }
}

/// A relay that is serving clients.
pub struct RunningRelay {
    lifecycle: Lifecycle,
    registry: Arc<ConnectionRegistry>,
    local_addr: LocalAddr,
    shutdown: watch::Sender<bool>,
    listener: JoinHandle<()>,
    server: JoinHandle<io::Result<()>>,
    socket_file: Option<SocketFile>,
    grace: Duration,
}

impl RunningRelay {
    #[must_use]
    pub fn local_addr(&self) -> &LocalAddr {
        &self.local_addr
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Wait for SIGINT or SIGTERM, then shut down.
    ///
    /// # Errors
    ///
    /// See [`RunningRelay::shutdown`].
    pub async fn run_until_signal(self) -> Result<(), LifecycleError> {
        shutdown_signal().await;
        self.shutdown().await
    }

    /// Stop accepting connections, stop the listener, close every session
    /// and release the listening resource.
    ///
    /// Sessions get up to the configured grace period to flush their queues.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay is not running.
    pub async fn shutdown(self) -> Result<(), LifecycleError> {
        self.lifecycle.advance(LifecycleState::ShuttingDown)?;
        info!("Shutting down");

        let _ = self.shutdown.send(true);

        if let Err(e) = self.listener.await {
            warn!(error = %e, "Listener task failed");
        }

        let closed = self.registry.close_all();
        if timeout(self.grace, self.registry.wait_idle()).await.is_err() {
            warn!(
                closed,
                remaining = self.registry.outstanding_leases(),
                grace_ms = self.grace.as_millis() as u64,
                "Sessions still open after grace period"
            );
        }

        let mut server = self.server;
        match timeout(self.grace, &mut server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "Server exited with error"),
            Ok(Err(e)) => warn!(error = %e, "Server task failed"),
            Err(_) => {
                warn!("Server did not stop within grace period, aborting");
                server.abort();
            }
        }

        drop(self.socket_file);

        self.lifecycle.advance(LifecycleState::Stopped)?;
        info!("Relay stopped");
        Ok(())
    }
}

async fn bind(
    host: &str,
    target: &ListenTarget,
) -> Result<(BoundListener, LocalAddr, Option<SocketFile>), StartupError> {
    match target {
        ListenTarget::Port(port) => {
            let addr = format!("{host}:{port}");
            let bind_error = |source: io::Error| StartupError::Bind {
                target: addr.clone(),
                source,
            };

            let listener = TcpListener::bind(&addr).await.map_err(bind_error)?;
            let local = listener.local_addr().map_err(bind_error)?;
            Ok((BoundListener::Tcp(listener), LocalAddr::Tcp(local), None))
        }
        ListenTarget::Socket(path) => bind_unix(path),
    }
}

#[cfg(unix)]
fn bind_unix(
    path: &Path,
) -> Result<(BoundListener, LocalAddr, Option<SocketFile>), StartupError> {
    let bind_error = |source: io::Error| StartupError::Bind {
        target: path.display().to_string(),
        source,
    };

    clear_stale_socket(path).map_err(bind_error)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(bind_error)?;
    }

    let listener = UnixListener::bind(path).map_err(bind_error)?;
    let socket_file = SocketFile {
        path: path.to_path_buf(),
    };

    Ok((
        BoundListener::Unix(listener),
        LocalAddr::Unix(path.to_path_buf()),
        Some(socket_file),
    ))
}

/// Remove a leftover socket file at `path`.
///
/// Refuses anything that is not a socket, and sockets that still accept
/// connections.
#[cfg(unix)]
fn clear_stale_socket(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a socket",
        ));
    }

    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "socket is still accepting connections",
        ));
    }

    std::fs::remove_file(path)?;
    info!(path = %path.display(), "Removed stale socket file");
    Ok(())
}

#[cfg(not(unix))]
fn bind_unix(
    path: &Path,
) -> Result<(BoundListener, LocalAddr, Option<SocketFile>), StartupError> {
    Err(StartupError::Bind {
        target: path.display().to_string(),
        source: io::Error::new(
            io::ErrorKind::Unsupported,
            "Unix sockets are not supported on this platform",
        ),
    })
}

fn spawn_server(
    bound: BoundListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<io::Result<()>> {
    let signal = async move { wait_for_shutdown(&mut shutdown).await };

    match bound {
        BoundListener::Tcp(listener) => tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
        }),
        #[cfg(unix)]
        BoundListener::Unix(listener) => tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
        }),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chord_relay_bus::MemoryBus;
    use futures_util::StreamExt;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const STRUCTURED: &str = r#"{"event":"events","data":{"message":{"id":42},"channel":"chord.experiment.created"}}"#;
    const PASSTHROUGH: &str = r#"{"event":"events","data":{"message":"{\"id\":42}","channel":"chord.experiment.created"}}"#;

    fn test_config(json_messages: bool) -> Config {
        let mut config = Config::default();
        config.host = "127.0.0.1".to_string();
        config.listen_on = ListenTarget::Port(0);
        config.json_messages = json_messages;
        config.shutdown_grace_ms = 1000;
        config.validate().unwrap();
        config
    }

    async fn start(config: Config, bus: &MemoryBus) -> (RunningRelay, SocketAddr) {
        let relay = Relay::new(config, Arc::new(bus.clone()))
            .start()
            .await
            .unwrap();
        let LocalAddr::Tcp(addr) = relay.local_addr().clone() else {
            panic!("expected a TCP address");
        };
        (relay, addr)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = connect_async(format!("ws://{addr}/socket.io"))
            .await
            .unwrap();
        client
    }

    async fn wait_for_sessions(registry: &ConnectionRegistry, count: usize) {
        timeout(Duration::from_secs(2), async {
            while registry.len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sessions did not register");
    }

    async fn next_text(client: &mut Client) -> String {
        loop {
            let message = timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            match message {
                WsMessage::Text(text) => return text.as_str().to_owned(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_structured_scenario() {
        let bus = MemoryBus::new();
        let (relay, addr) = start(test_config(true), &bus).await;

        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        wait_for_sessions(relay.registry(), 2).await;

        bus.publish("chord.experiment.created", r#"{"id":42}"#);

        assert_eq!(next_text(&mut a).await, STRUCTURED);
        assert_eq!(next_text(&mut b).await, STRUCTURED);

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_passthrough_scenario() {
        let bus = MemoryBus::new();
        let (relay, addr) = start(test_config(false), &bus).await;

        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        wait_for_sessions(relay.registry(), 2).await;

        bus.publish("chord.experiment.created", r#"{"id":42}"#);

        assert_eq!(next_text(&mut a).await, PASSTHROUGH);
        assert_eq!(next_text(&mut b).await, PASSTHROUGH);

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_message_is_skipped() {
        let bus = MemoryBus::new();
        let (relay, addr) = start(test_config(true), &bus).await;

        let mut a = connect(addr).await;
        wait_for_sessions(relay.registry(), 1).await;

        bus.publish("chord.experiment.created", "{not json");
        bus.publish("chord.experiment.created", r#"{"id":42}"#);

        assert_eq!(next_text(&mut a).await, STRUCTURED);

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_client_does_not_affect_others() {
        let bus = MemoryBus::new();
        let (relay, addr) = start(test_config(true), &bus).await;

        let a = connect(addr).await;
        let mut b = connect(addr).await;
        wait_for_sessions(relay.registry(), 2).await;

        drop(a);
        bus.publish("chord.experiment.created", r#"{"id":42}"#);

        assert_eq!(next_text(&mut b).await, STRUCTURED);

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let bus = MemoryBus::new();
        let mut config = test_config(true);
        config.limits.max_connections = 1;
        let (relay, addr) = start(config, &bus).await;

        let _a = connect(addr).await;
        wait_for_sessions(relay.registry(), 1).await;

        assert!(connect_async(format!("ws://{addr}/socket.io")).await.is_err());

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_listener() {
        let bus = MemoryBus::new();
        let (relay, addr) = start(test_config(true), &bus).await;
        let registry = Arc::clone(relay.registry());

        let mut a = connect(addr).await;
        wait_for_sessions(&registry, 1).await;

        relay.shutdown().await.unwrap();

        assert!(registry.is_empty());
        assert_eq!(registry.outstanding_leases(), 0);
        assert_eq!(bus.subscriber_count(), 0);

        let closed = timeout(Duration::from_secs(2), async {
            loop {
                match a.next().await {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok());

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let mut config = test_config(true);
        config.listen_on = ListenTarget::Port(port);

        let result = Relay::new(config, Arc::new(MemoryBus::new())).start().await;
        assert!(matches!(result, Err(StartupError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_bus_failure_releases_listener() {
        let bus = MemoryBus::new();
        bus.set_available(false);

        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = placeholder.local_addr().unwrap().port();
        drop(placeholder);

        let mut config = test_config(true);
        config.listen_on = ListenTarget::Port(port);

        let result = Relay::new(config, Arc::new(bus)).start().await;
        assert!(matches!(result, Err(StartupError::Bus(BusError::Connect(_)))));

        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_states() {
        let bus = MemoryBus::new();
        let relay = Relay::new(test_config(true), Arc::new(bus.clone()));
        assert_eq!(relay.state(), LifecycleState::Created);

        let running = relay.start().await.unwrap();
        assert_eq!(running.state(), LifecycleState::Running);
        assert_eq!(bus.subscriber_count(), 1);

        running.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::UnixStream;

        fn socket_config(path: &Path) -> Config {
            let mut config = test_config(true);
            config.listen_on = ListenTarget::Socket(path.to_path_buf());
            config
        }

        #[tokio::test]
        async fn test_serves_and_removes_socket() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("run").join("relay.sock");

            let relay = Relay::new(socket_config(&path), Arc::new(MemoryBus::new()))
                .start()
                .await
                .unwrap();
            assert_eq!(relay.local_addr(), &LocalAddr::Unix(path.clone()));
            assert!(path.exists());

            let mut stream = UnixStream::connect(&path).await.unwrap();
            stream
                .write_all(b"GET /service-info HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with("HTTP/1.1 200"), "{response}");
            assert!(response.contains(r#""id":"ca.c3g.chord:event-relay""#));

            relay.shutdown().await.unwrap();
            assert!(!path.exists());
        }

        #[tokio::test]
        async fn test_refuses_regular_file() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("relay.sock");
            std::fs::write(&path, b"keep me").unwrap();

            let result = Relay::new(socket_config(&path), Arc::new(MemoryBus::new()))
                .start()
                .await;
            assert!(matches!(result, Err(StartupError::Bind { .. })));
            assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
        }

        #[tokio::test]
        async fn test_refuses_live_socket() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("relay.sock");
            let _owner = std::os::unix::net::UnixListener::bind(&path).unwrap();

            let result = Relay::new(socket_config(&path), Arc::new(MemoryBus::new()))
                .start()
                .await;
            assert!(matches!(result, Err(StartupError::Bind { .. })));
            assert!(path.exists());
        }

        #[tokio::test]
        async fn test_replaces_stale_socket_file() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("relay.sock");
            drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
            assert!(path.exists());

            let relay = Relay::new(socket_config(&path), Arc::new(MemoryBus::new()))
                .start()
                .await
                .unwrap();
            assert!(UnixStream::connect(&path).await.is_ok());

            relay.shutdown().await.unwrap();
            assert!(!path.exists());
        }

        #[tokio::test]
        async fn test_bus_failure_removes_socket() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("relay.sock");

            let bus = MemoryBus::new();
            bus.set_available(false);

            let result = Relay::new(socket_config(&path), Arc::new(bus)).start().await;
            assert!(matches!(result, Err(StartupError::Bus(_))));
            assert!(!path.exists());
        }
    }
}
