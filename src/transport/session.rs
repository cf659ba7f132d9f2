//! # Session Manager
//!
//! Owns the TLS listener and the lifecycle of every operator session.
//!
//! ## Lifecycle
//! ```text
//! Idle -> Listening -> (accepting, spawning sessions) -> Draining -> Stopped
//! ```
//!
//! Each accepted socket is handshaken in its own task. With mutual
//! authentication enabled the operator certificate must chain to the
//! configured CA and carry the expected name; otherwise the socket is
//! dropped and the [`ConnectionHandler`] is never invoked. The listener keeps
//! running after any single connection fails.
//!
//! Shutdown is cooperative: [`SessionManager::stop`] flips an atomic flag and
//! wakes the accept loop and every session through a watch channel. Sessions
//! get `shutdown_timeout` to finish before the manager reports `Stopped`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::error::{GatewayError, Result};
use crate::transport::tls::{self, TlsServerConfig};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{with_timeout_error, DRAIN_POLL_INTERVAL};

/// Back-off after a failed `accept` so a persistent error does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Listener state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    Draining,
    Stopped,
}

/// Process-wide shutdown flag
///
/// Monotonic: once triggered it never resets. Waiters are woken through a
/// watch channel so no one has to poll the flag.
#[derive(Debug)]
pub struct ShutdownSignal {
    flag: AtomicBool,
    notify: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            flag: AtomicBool::new(false),
            notify,
        }
    }

    /// Set the flag; returns true only for the call that flipped it
    pub fn trigger(&self) -> bool {
        let first = !self.flag.swap(true, Ordering::SeqCst);
        if first {
            self.notify.send_replace(true);
        }
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.notify.subscribe()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once shutdown has been requested (or the signal is gone)
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let triggered = *rx.borrow_and_update();
        if triggered {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// An accepted, authenticated operator connection
pub struct Session {
    pub id: u64,
    pub peer: SocketAddr,
    /// Verified certificate identity; `None` without mutual authentication
    pub peer_identity: Option<String>,
    pub stream: TlsStream<TcpStream>,
    /// Fires when the gateway is shutting down
    pub shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("peer_identity", &self.peer_identity)
            .finish_non_exhaustive()
    }
}

/// Capability invoked with each authenticated session
///
/// The returned future owns the session and runs in its own task; the
/// session ends when the future completes.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, session: Session) -> BoxFuture<'static, ()>;
}

/// Holds one of the `max_connections` slots from accept until the
/// connection task ends, handshake included
struct OpenConnection {
    open: Arc<AtomicUsize>,
}

impl OpenConnection {
    fn acquire(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self {
            open: Arc::clone(open),
        }
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decrements the active session count however the session task ends
struct ActiveSession {
    active: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.metrics.session_closed();
    }
}

/// TLS listener and session lifecycle owner
pub struct SessionManager {
    server: ServerConfig,
    tls: TlsServerConfig,
    shutdown: ShutdownSignal,
    state: watch::Sender<ServerState>,
    local_addr: OnceLock<SocketAddr>,
    open: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl SessionManager {
    pub fn new(server: ServerConfig, tls: TlsServerConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        let (state, _) = watch::channel(ServerState::Idle);
        Arc::new(Self {
            server,
            tls,
            shutdown: ShutdownSignal::new(),
            state,
            local_addr: OnceLock::new(),
            open: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
            metrics,
        })
    }

    /// Load TLS material, bind the listener and spawn the accept loop
    ///
    /// Errors here are configuration or resource failures and are meant to be
    /// fatal to the caller.
    pub async fn start<H: ConnectionHandler>(self: &Arc<Self>, handler: H) -> Result<SocketAddr> {
        if self.state() != ServerState::Idle || !self.is_running() {
            return Err(GatewayError::Config(
                "Session manager already started or stopped".into(),
            ));
        }

        let acceptor = tls::acceptor(&self.tls)?;
        let listener = bind_listener(&self.server.address, self.server.backlog)?;
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);

        self.state.send_replace(ServerState::Listening);
        info!(
            address = %local_addr,
            mutual_auth = self.tls.requires_client_auth(),
            expected_peer = ?self.tls.expected_peer_name(),
            "TLS server listening"
        );

        let manager = Arc::clone(self);
        tokio::spawn(manager.accept_loop(listener, acceptor, Arc::new(handler)));

        Ok(local_addr)
    }

    /// True until shutdown has been requested
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_triggered()
    }

    /// Request shutdown; safe to call any number of times
    pub fn stop(&self) {
        if self.shutdown.trigger() {
            info!("Shutdown requested");
            if self.state() == ServerState::Idle {
                self.state.send_replace(ServerState::Stopped);
            }
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Wait until the manager has reached `Stopped`
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current == ServerState::Stopped {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop on Ctrl-C or SIGTERM
    ///
    /// Meant to run as its own task. Returns early if the manager is stopped
    /// by other means.
    pub async fn wait_for_shutdown_signal(&self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::select! {
            _ = shutdown_requested(&mut shutdown_rx) => return,
            signal = termination_signal() => match signal {
                Ok(name) => info!(signal = name, "Received shutdown signal"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signals"),
            },
        }
        self.stop();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accepted connections, still handshaking or established
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    async fn accept_loop<H: ConnectionHandler>(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: TlsAcceptor,
        handler: Arc<H>,
    ) {
        let mut shutdown_rx = self.shutdown.subscribe();

        while self.is_running() {
            let accepted = tokio::select! {
                _ = shutdown_requested(&mut shutdown_rx) => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Received connection");
                    if self.open_connections() >= self.server.max_connections {
                        warn!(%peer, max = self.server.max_connections, "Connection limit reached; refusing");
                        self.metrics.connection_refused();
                        continue;
                    }
                    let slot = OpenConnection::acquire(&self.open);
                    let manager = Arc::clone(&self);
                    tokio::spawn(manager.establish(
                        stream,
                        peer,
                        slot,
                        acceptor.clone(),
                        Arc::clone(&handler),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        drop(listener);
        self.drain().await;
    }

    async fn drain(&self) {
        self.state.send_replace(ServerState::Draining);
        info!(sessions = self.active_sessions(), "Shutting down server. Waiting for sessions to close...");

        let deadline = Instant::now() + self.server.shutdown_timeout;
        while self.active_sessions() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let remaining = self.active_sessions();
        if remaining > 0 {
            warn!(sessions = remaining, "Shutdown timeout reached with sessions still open");
        } else {
            info!("All sessions closed");
        }

        self.state.send_replace(ServerState::Stopped);
        self.metrics.log_summary();
    }

    /// Handshake, verify and hand one connection to the handler
    #[instrument(skip_all, fields(peer = %peer))]
    async fn establish<H: ConnectionHandler>(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        _slot: OpenConnection,
        acceptor: TlsAcceptor,
        handler: Arc<H>,
    ) {
        let tls_stream = match handshake(&acceptor, stream, self.server.handshake_timeout).await {
            Ok(tls_stream) => tls_stream,
            Err(e) => {
                self.metrics.handshake_failed();
                warn!(error = %e, "TLS handshake failed");
                return;
            }
        };

        let peer_identity = if self.tls.requires_client_auth() {
            let (_, connection) = tls_stream.get_ref();
            match tls::verify_peer(connection.peer_certificates(), self.tls.expected_peer_name()) {
                Ok(identity) => {
                    info!(identity = %identity, "Client certificate is valid");
                    Some(identity)
                }
                Err(e) => {
                    self.metrics.verification_failed();
                    warn!(error = %e, "Certificate error; refusing connection");
                    return;
                }
            }
        } else {
            None
        };

        if !self.is_running() {
            debug!("Shutdown in progress; dropping handshaken connection");
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        self.metrics.session_opened();
        let _guard = ActiveSession {
            active: Arc::clone(&self.active),
            metrics: Arc::clone(&self.metrics),
        };

        info!(session = id, identity = ?peer_identity, "Session established");
        let session = Session {
            id,
            peer,
            peer_identity,
            stream: tls_stream,
            shutdown: self.shutdown.subscribe(),
        };

        handler.handle(session).await;
        info!(session = id, "Session ended");
    }
}

/// Server side of the TLS handshake, bounded by `limit`
async fn handshake(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    limit: Duration,
) -> Result<TlsStream<TcpStream>> {
    let accept = async { acceptor.accept(stream).await.map_err(GatewayError::from) };
    match with_timeout_error(accept, limit).await {
        Err(GatewayError::Timeout) => Err(GatewayError::HandshakeTimeout),
        other => other,
    }
}

#[cfg(unix)]
async fn termination_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "Ctrl-C")
}

/// Bind with SO_REUSEADDR and an explicit backlog
fn bind_listener(address: &str, backlog: u32) -> Result<TcpListener> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| GatewayError::Config(format!("Invalid listen address {address}: {e}")))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}
