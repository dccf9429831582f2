//! Session gateway.
//!
//! A client asks the well-known port for a session port, receives one from the
//! pool, and reconnects on it. The gateway then either relays that connection
//! to a backend storage server or serves the backup session itself. The port
//! returns to the pool once the session ends, whatever the reason.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use stash_netproto::{
    op::{Operation, Status},
    stream::{FrameReader, FrameWriter},
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backup::BackupService;
use crate::config::GatewayConfig;
use crate::error::{ErrorClass, SessionError};
use crate::net::port_pool::{PortLease, PortPool};
use crate::net::tunnel::{TunnelConfig, run_tunnel};
use crate::storage::serve_backup_connection;

/// Unique session identifier assigned by the gateway.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Port handed out; waiting for the client to connect to it.
    AwaitingReconnect,
    /// Relaying to the backend.
    Tunnelling,
    /// Served by the gateway's own backup service.
    Serving,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub username: String,
    /// Address the port request came from.
    pub requester: SocketAddr,
    pub phase: SessionPhase,
    pub opened: Instant,
}

/// Where reconnected sessions go.
#[derive(Debug, Clone)]
pub enum Upstream {
    /// Relay to a storage server.
    Backend(SocketAddr),
    /// Run the backup state machine in-process.
    Local(Arc<BackupService>),
}

#[derive(Debug, Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    pool: Arc<PortPool>,
    sessions: Arc<DashMap<u16, SessionInfo>>,
    upstream: Upstream,
}

/// Keeps a session visible in the registry for as long as it is alive.
struct Registration {
    sessions: Arc<DashMap<u16, SessionInfo>>,
    port: u16,
}

impl Registration {
    fn set_phase(&self, phase: SessionPhase) {
        if let Some(mut info) = self.sessions.get_mut(&self.port) {
            info.phase = phase;
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.sessions.remove(&self.port);
    }
}

impl Gateway {
    pub fn new(config: GatewayConfig, upstream: Upstream) -> Self {
        let pool = Arc::new(PortPool::new(config.port_range.clone()));
        Self {
            config: Arc::new(config),
            pool,
            sessions: Arc::new(DashMap::new()),
            upstream,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    /// Snapshot of live sessions, ordered by port.
    pub fn active_sessions(&self) -> Vec<(u16, SessionInfo)> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        sessions.sort_by_key(|(port, _)| *port);
        sessions
    }

    /// Accept port requests on `listener` until it fails.
    pub async fn run(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            ports = ?self.config.port_range,
            "Gateway listening"
        );
        loop {
            let (stream, peer) = listener.accept().await?;
            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream, peer).await {
                    match e.class() {
                        ErrorClass::ApplicationError | ErrorClass::ResourceExhausted => {
                            info!(%peer, error = %e, "Session refused")
                        }
                        _ => warn!(%peer, error = %e, class = ?e.class(), "Session aborted"),
                    }
                }
            });
        }
    }

    async fn handle_connection(
        self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), SessionError> {
        let _ = stream.set_nodelay(true);
        let limits = self.config.limits;
        let (rd, wr) = stream.into_split();
        let mut reader = FrameReader::new(rd, limits.rx_buffer);

        let request = match timeout(self.config.reconnect_timeout, reader.next_frame()).await {
            Err(_) => return Err(SessionError::Timeout("port request")),
            Ok(next) => next?
                .ok_or_else(|| SessionError::Transport(io::ErrorKind::UnexpectedEof.into()))?,
        };
        let username = request.frame.username.clone();
        let mut writer = FrameWriter::new(wr, username.clone(), limits.max_payload);

        if request.frame.op() != Some(Operation::PortRequest) {
            let op = request.frame.op().unwrap_or(Operation::PortRequest);
            writer
                .send(op, Status::BadRequest, 0, b"expected a port request")
                .await?;
            let _ = writer.shutdown().await;
            return Err(SessionError::application(
                Status::BadRequest,
                format!("unexpected op {} on gateway port", request.frame.operation),
            ));
        }

        let (lease, listener) = match self.bind_session_port().await {
            Ok(bound) => bound,
            Err(e) => {
                writer
                    .send(
                        Operation::PortRequest,
                        Status::NoPortsAvailable,
                        0,
                        b"no ports available",
                    )
                    .await?;
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };
        let port = lease.port();
        let id = next_session_id();
        let registration = self.register(port, id, &username, peer);

        writer
            .send(Operation::PortRequest, Status::Final, 0, port.to_string().as_bytes())
            .await?;
        writer.shutdown().await?;
        drop((reader, writer));
        info!(session = id, port, username = %username, %peer, "Session port assigned");

        let result = self.serve_session(listener, &registration, &username).await;
        drop(registration);
        drop(lease);
        debug!(session = id, port, "Session port released");
        result
    }

    /// Reserve a pool port and bind it. Ports that cannot be bound are held
    /// until a bindable one is found, then all released together.
    async fn bind_session_port(&self) -> Result<(PortLease, TcpListener), SessionError> {
        let mut unbindable = Vec::new();
        loop {
            let lease = self
                .pool
                .lease()
                .map_err(|_| SessionError::ResourceExhausted)?;
            let addr = SocketAddr::new(self.config.ephemeral_host, lease.port());
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok((lease, listener)),
                Err(e) => {
                    warn!(port = lease.port(), error = %e, "Session port unavailable, skipping");
                    unbindable.push(lease);
                }
            }
        }
    }

    fn register(
        &self,
        port: u16,
        id: SessionId,
        username: &str,
        requester: SocketAddr,
    ) -> Registration {
        self.sessions.insert(
            port,
            SessionInfo {
                id,
                username: username.to_string(),
                requester,
                phase: SessionPhase::AwaitingReconnect,
                opened: Instant::now(),
            },
        );
        Registration {
            sessions: Arc::clone(&self.sessions),
            port,
        }
    }

    async fn serve_session(
        &self,
        listener: TcpListener,
        registration: &Registration,
        username: &str,
    ) -> Result<(), SessionError> {
        let accepted = timeout(self.config.reconnect_timeout, listener.accept()).await;
        drop(listener);
        let (client, peer) = match accepted {
            Err(_) => return Err(SessionError::Timeout("client reconnect")),
            Ok(accepted) => accepted?,
        };
        let _ = client.set_nodelay(true);
        debug!(port = registration.port, %peer, "Client reconnected");

        match &self.upstream {
            Upstream::Backend(addr) => {
                let connect = TcpStream::connect(addr);
                let backend = match timeout(self.config.connect_timeout, connect).await {
                    Err(_) => return Err(SessionError::Timeout("backend connect")),
                    Ok(connected) => connected?,
                };
                let _ = backend.set_nodelay(true);
                registration.set_phase(SessionPhase::Tunnelling);

                let report = run_tunnel(
                    client.into_split(),
                    backend.into_split(),
                    username,
                    TunnelConfig {
                        idle_timeout: self.config.idle_timeout,
                        rx_buffer: self.config.limits.rx_buffer,
                    },
                )
                .await;
                info!(
                    port = registration.port,
                    upstream = %report.upstream,
                    downstream = %report.downstream,
                    frames_up = report.frames_up,
                    frames_down = report.frames_down,
                    "Tunnel closed"
                );
                Ok(())
            }
            Upstream::Local(service) => {
                registration.set_phase(SessionPhase::Serving);
                let (rd, wr) = client.into_split();
                serve_backup_connection(rd, wr, Arc::clone(service)).await
            }
        }
    }
}

/// Bind the gateway's well-known port and run until the listener fails.
pub async fn run_gateway(config: GatewayConfig, upstream: Upstream) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen).await?;
    Gateway::new(config, upstream).run(listener).await
}
