//! Connection registry -- owns every socket the node holds.
//!
//! One authority connection, one peer listener, and a map of peer node
//! code -> connection. Locks guard only the slot/map mutation; I/O runs on
//! a cloned connection handle outside them.
//!
//! Transport failures on a connection close it and evict it (if it is still
//! the registered one). Rebuilding the authority link is the coordinator's job.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use matchfabric_protocol::{NodeId, HEADER_SIZE};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::port_policy::PortPolicy;
use crate::transport::{Connection, ConnectionId, SharedConnection, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("authority not connected")]
    AuthorityNotConnected,
    #[error("authority unreachable after {attempts} attempts: {source}")]
    AuthorityAttemptsExhausted {
        attempts: u32,
        source: std::io::Error,
    },
    #[error("connect aborted on non-transient error: {0}")]
    Aborted(std::io::Error),
    #[error("already listening on {0}")]
    AlreadyListening(SocketAddr),
    #[error("not listening for peers")]
    NotListening,
    #[error("no first message from {0} in time")]
    FirstMessageTimeout(SocketAddr),
    #[error("peer {0} already registered")]
    DuplicatePeer(NodeId),
    #[error("peer {0} not registered")]
    PeerNotFound(NodeId),
    #[error("no listening port for node {0}")]
    NoPortForNode(NodeId),
    #[error("invalid peer address {0:?}")]
    InvalidAddress(String),
    #[error("message of {size} bytes is smaller than the {min}-byte header")]
    UndersizedMessage { size: usize, min: usize },
    #[error("registry shut down")]
    ShutDown,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// An accepted peer connection and the first message it sent, not yet
/// registered under any node code.
#[derive(Debug)]
pub struct InboundPeer {
    pub remote: SocketAddr,
    pub connection: SharedConnection,
    pub first_message: BytesMut,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Address the peer listener binds to.
    pub bind_ip: IpAddr,
    pub max_message_size: usize,
    pub port_policy: Arc<dyn PortPolicy>,
}

struct PeerListener {
    socket: TcpListener,
    local_addr: SocketAddr,
}

struct RegistryInner {
    settings: RegistrySettings,
    authority: Mutex<Option<SharedConnection>>,
    listener: Mutex<Option<Arc<PeerListener>>>,
    peers: RwLock<HashMap<NodeId, SharedConnection>>,
    shutdown: CancellationToken,
}

/// Shared connection registry. Cloning shares the same sockets.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                settings,
                authority: Mutex::new(None),
                listener: Mutex::new(None),
                peers: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    // ========================================================================
    // Authority
    // ========================================================================

    /// Connect to the authority, trying up to `attempts` times (0 = no limit)
    /// with `retry_delay` between tries.
    pub async fn connect_authority(
        &self,
        endpoint: SocketAddr,
        attempts: u32,
        retry_delay: Duration,
    ) -> Result<(), RegistryError> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match self.dial(endpoint).await? {
                Ok(stream) => {
                    self.install_authority(stream).await?;
                    tracing::info!(%endpoint, attempt, "registry: authority connected");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(%endpoint, attempt, "registry: authority connect failed: {e}");
                    if attempts != 0 && attempt >= attempts {
                        return Err(RegistryError::AuthorityAttemptsExhausted {
                            attempts,
                            source: e,
                        });
                    }
                    self.pause(retry_delay).await?;
                }
            }
        }
    }

    /// Reconnect to the authority without an attempt limit, waiting `backoff`
    /// after each transient failure. Non-transient errors abort at once.
    pub async fn connect_authority_background(
        &self,
        endpoint: SocketAddr,
        backoff: Duration,
    ) -> Result<(), RegistryError> {
        let mut failures: u64 = 0;
        loop {
            match self.dial(endpoint).await? {
                Ok(stream) => {
                    self.install_authority(stream).await?;
                    tracing::info!(%endpoint, failures, "registry: authority reconnected");
                    return Ok(());
                }
                Err(e) if is_transient(&e) => {
                    failures += 1;
                    tracing::warn!(
                        %endpoint,
                        failures,
                        retry_in_ms = backoff.as_millis() as u64,
                        "registry: authority reconnect failed: {e}"
                    );
                    self.pause(backoff).await?;
                }
                Err(e) => {
                    tracing::error!(%endpoint, "registry: authority reconnect aborted: {e}");
                    return Err(RegistryError::Aborted(e));
                }
            }
        }
    }

    async fn install_authority(&self, stream: TcpStream) -> Result<(), RegistryError> {
        let conn = Arc::new(Connection::new(stream, self.inner.settings.max_message_size)?);
        if self.is_shut_down() {
            conn.close().await;
            return Err(RegistryError::ShutDown);
        }
        let previous = self.inner.authority.lock().await.replace(conn);
        if let Some(old) = previous {
            tracing::warn!(conn = old.id(), "registry: replacing live authority connection");
            old.close().await;
        }
        Ok(())
    }

    async fn authority(&self) -> Result<SharedConnection, RegistryError> {
        self.inner
            .authority
            .lock()
            .await
            .clone()
            .ok_or(RegistryError::AuthorityNotConnected)
    }

    pub async fn is_authority_connected(&self) -> bool {
        self.inner.authority.lock().await.is_some()
    }

    pub async fn send_authority(&self, message: Bytes) -> Result<(), RegistryError> {
        check_size(&message)?;
        let conn = self.authority().await?;
        if let Err(e) = conn.send(message).await {
            tracing::warn!(conn = conn.id(), "registry: authority send failed: {e}");
            self.drop_authority(&conn).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn receive_authority(&self) -> Result<BytesMut, RegistryError> {
        let conn = self.authority().await?;
        match conn.receive().await {
            Ok(frame) => Ok(frame),
            Err(e) => {
                tracing::warn!(conn = conn.id(), "registry: authority receive failed: {e}");
                self.drop_authority(&conn).await;
                Err(e.into())
            }
        }
    }

    /// Close the authority connection, if any.
    pub async fn disconnect_authority(&self) {
        let taken = self.inner.authority.lock().await.take();
        if let Some(conn) = taken {
            conn.close().await;
            tracing::info!(conn = conn.id(), "registry: authority disconnected");
        }
    }

    async fn drop_authority(&self, conn: &SharedConnection) {
        {
            let mut slot = self.inner.authority.lock().await;
            if slot.as_ref().is_some_and(|c| c.id() == conn.id()) {
                slot.take();
            }
        }
        conn.close().await;
    }

    // ========================================================================
    // Peer listener
    // ========================================================================

    /// Bind the peer listener on the port the policy assigns to `local_id`.
    pub async fn listen_for_peers(&self, local_id: NodeId) -> Result<SocketAddr, RegistryError> {
        if let Some(existing) = self.listen_addr().await {
            return Err(RegistryError::AlreadyListening(existing));
        }
        let port = self
            .inner
            .settings
            .port_policy
            .port_for(local_id)
            .ok_or(RegistryError::NoPortForNode(local_id))?;

        let socket = TcpListener::bind((self.inner.settings.bind_ip, port)).await?;
        let local_addr = socket.local_addr()?;

        let mut slot = self.inner.listener.lock().await;
        if let Some(existing) = slot.as_ref() {
            return Err(RegistryError::AlreadyListening(existing.local_addr));
        }
        *slot = Some(Arc::new(PeerListener { socket, local_addr }));
        tracing::info!(%local_addr, local_id, "registry: listening for peers");
        Ok(local_addr)
    }

    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .lock()
            .await
            .as_ref()
            .map(|l| l.local_addr)
    }

    /// Wait for the next inbound peer and read its first message. The
    /// connection is not registered; the caller decides under which code.
    pub async fn accept_peer(
        &self,
        first_message_timeout: Duration,
    ) -> Result<InboundPeer, RegistryError> {
        let listener = self
            .inner
            .listener
            .lock()
            .await
            .clone()
            .ok_or(RegistryError::NotListening)?;

        let (stream, remote) = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(RegistryError::ShutDown),
            accepted = listener.socket.accept() => accepted?,
        };
        let connection = Arc::new(Connection::new(stream, self.inner.settings.max_message_size)?);
        tracing::debug!(%remote, conn = connection.id(), "registry: inbound connection");

        let first = tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(RegistryError::ShutDown),
            received = tokio::time::timeout(first_message_timeout, connection.receive()) => {
                match received {
                    Ok(Ok(frame)) => Ok(frame),
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(RegistryError::FirstMessageTimeout(remote)),
                }
            }
        };
        match first {
            Ok(first_message) => Ok(InboundPeer {
                remote,
                connection,
                first_message,
            }),
            Err(e) => {
                connection.close().await;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Register a connection under `peer_id`. An existing entry is never replaced.
    pub async fn register_peer(
        &self,
        peer_id: NodeId,
        connection: SharedConnection,
    ) -> Result<(), RegistryError> {
        if self.is_shut_down() {
            return Err(RegistryError::ShutDown);
        }
        let mut peers = self.inner.peers.write().await;
        match peers.entry(peer_id) {
            Entry::Occupied(_) => Err(RegistryError::DuplicatePeer(peer_id)),
            Entry::Vacant(slot) => {
                let conn_id = connection.id();
                let remote = connection.remote();
                slot.insert(connection);
                tracing::info!(
                    peer = peer_id,
                    conn = conn_id,
                    %remote,
                    peers = peers.len(),
                    "registry: peer registered"
                );
                Ok(())
            }
        }
    }

    /// Dial a peer at `ip` on the port its code maps to, and register it.
    pub async fn connect_peer(
        &self,
        peer_id: NodeId,
        ip: &str,
    ) -> Result<SharedConnection, RegistryError> {
        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| RegistryError::InvalidAddress(ip.to_string()))?;
        let port = self
            .inner
            .settings
            .port_policy
            .port_for(peer_id)
            .ok_or(RegistryError::NoPortForNode(peer_id))?;
        let addr = SocketAddr::new(ip, port);

        let started = Instant::now();
        let stream = self.dial(addr).await??;
        let rtt = started.elapsed();

        let connection = Arc::new(
            Connection::new(stream, self.inner.settings.max_message_size)?.with_connect_rtt(rtt),
        );
        if let Err(e) = self.register_peer(peer_id, connection.clone()).await {
            connection.close().await;
            return Err(e);
        }
        tracing::info!(peer = peer_id, %addr, rtt_ms = rtt.as_millis() as u64, "registry: peer connected");
        Ok(connection)
    }

    pub async fn peer(&self, peer_id: NodeId) -> Option<SharedConnection> {
        self.inner.peers.read().await.get(&peer_id).cloned()
    }

    pub async fn has_peer(&self, peer_id: NodeId) -> bool {
        self.inner.peers.read().await.contains_key(&peer_id)
    }

    pub async fn peer_connection_id(&self, peer_id: NodeId) -> Option<ConnectionId> {
        self.inner.peers.read().await.get(&peer_id).map(|c| c.id())
    }

    pub async fn peer_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.inner.peers.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn send_peer(&self, peer_id: NodeId, message: Bytes) -> Result<(), RegistryError> {
        check_size(&message)?;
        let conn = self
            .peer(peer_id)
            .await
            .ok_or(RegistryError::PeerNotFound(peer_id))?;
        if let Err(e) = conn.send(message).await {
            tracing::warn!(peer = peer_id, conn = conn.id(), "registry: peer send failed: {e}");
            self.evict_peer(peer_id, &conn).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn receive_peer(&self, peer_id: NodeId) -> Result<BytesMut, RegistryError> {
        let conn = self
            .peer(peer_id)
            .await
            .ok_or(RegistryError::PeerNotFound(peer_id))?;
        self.receive_from(peer_id, conn).await
    }

    /// [`Self::receive_peer`], but only while `peer_id` is still served by
    /// connection `conn_id`. A replaced connection reads as not found.
    pub async fn receive_peer_on(
        &self,
        peer_id: NodeId,
        conn_id: ConnectionId,
    ) -> Result<BytesMut, RegistryError> {
        let conn = self
            .peer(peer_id)
            .await
            .filter(|c| c.id() == conn_id)
            .ok_or(RegistryError::PeerNotFound(peer_id))?;
        self.receive_from(peer_id, conn).await
    }

    async fn receive_from(
        &self,
        peer_id: NodeId,
        conn: SharedConnection,
    ) -> Result<BytesMut, RegistryError> {
        match conn.receive().await {
            Ok(frame) => Ok(frame),
            Err(e) => {
                tracing::warn!(peer = peer_id, conn = conn.id(), "registry: peer receive failed: {e}");
                self.evict_peer(peer_id, &conn).await;
                Err(e.into())
            }
        }
    }

    /// Send to every registered peer. Peers that fail are evicted.
    /// Returns how many sends succeeded.
    pub async fn broadcast_peers(&self, message: Bytes) -> Result<usize, RegistryError> {
        check_size(&message)?;
        let targets: Vec<(NodeId, SharedConnection)> = self
            .inner
            .peers
            .read()
            .await
            .iter()
            .map(|(id, conn)| (*id, conn.clone()))
            .collect();

        let mut delivered = 0;
        for (peer_id, conn) in targets {
            match conn.send(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(peer = peer_id, "registry: broadcast send failed: {e}");
                    self.evict_peer(peer_id, &conn).await;
                }
            }
        }
        Ok(delivered)
    }

    /// Remove and close a peer's connection. Absent peers are a no-op.
    pub async fn disconnect_peer(&self, peer_id: NodeId) -> bool {
        let removed = self.inner.peers.write().await.remove(&peer_id);
        match removed {
            Some(conn) => {
                conn.close().await;
                tracing::info!(peer = peer_id, conn = conn.id(), "registry: peer disconnected");
                true
            }
            None => false,
        }
    }

    /// [`Self::disconnect_peer`], but only while `peer_id` is still served
    /// by connection `conn_id`.
    pub async fn disconnect_peer_on(&self, peer_id: NodeId, conn_id: ConnectionId) -> bool {
        let removed = {
            let mut peers = self.inner.peers.write().await;
            if peers.get(&peer_id).is_some_and(|c| c.id() == conn_id) {
                peers.remove(&peer_id)
            } else {
                None
            }
        };
        match removed {
            Some(conn) => {
                conn.close().await;
                tracing::info!(peer = peer_id, conn = conn_id, "registry: peer disconnected");
                true
            }
            None => false,
        }
    }

    /// Remove `peer_id` only while it still maps to `conn`, then close `conn`.
    async fn evict_peer(&self, peer_id: NodeId, conn: &SharedConnection) {
        let evicted = {
            let mut peers = self.inner.peers.write().await;
            let current = peers.get(&peer_id).is_some_and(|c| c.id() == conn.id());
            if current {
                peers.remove(&peer_id);
            }
            current
        };
        conn.close().await;
        if evicted {
            tracing::info!(peer = peer_id, conn = conn.id(), "registry: peer evicted");
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Close every connection and the listener. Later operations fail with
    /// [`RegistryError::ShutDown`] or find nothing registered.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        self.disconnect_authority().await;

        if let Some(listener) = self.inner.listener.lock().await.take() {
            tracing::info!(addr = %listener.local_addr, "registry: listener closed");
        }

        let peers: Vec<(NodeId, SharedConnection)> =
            self.inner.peers.write().await.drain().collect();
        let count = peers.len();
        for (_, conn) in peers {
            conn.close().await;
        }
        tracing::info!(peers = count, "registry: shut down");
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Connect, giving up early if the registry shuts down. The outer error
    /// is shutdown, the inner one the socket outcome.
    async fn dial(
        &self,
        addr: SocketAddr,
    ) -> Result<std::io::Result<TcpStream>, RegistryError> {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(RegistryError::ShutDown),
            result = TcpStream::connect(addr) => Ok(result),
        }
    }

    async fn pause(&self, delay: Duration) -> Result<(), RegistryError> {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(RegistryError::ShutDown),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn check_size(message: &[u8]) -> Result<(), RegistryError> {
    if message.len() < HEADER_SIZE {
        return Err(RegistryError::UndersizedMessage {
            size: message.len(),
            min: HEADER_SIZE,
        });
    }
    Ok(())
}

/// Socket errors worth retrying. Anything that signals a local setup
/// problem rather than an unreachable authority is not.
fn is_transient(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    !matches!(
        e.kind(),
        ErrorKind::PermissionDenied
            | ErrorKind::InvalidInput
            | ErrorKind::InvalidData
            | ErrorKind::Unsupported
            | ErrorKind::AddrInUse
    )
}
