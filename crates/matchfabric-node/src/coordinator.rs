//! Node coordinator -- startup, registration and the shared loop context.
//!
//! Startup: resolve endpoints -> connect to the authority -> register for a
//! node code -> seed the waiting room -> bind the peer listener -> spawn the
//! authority loop and the listening loop. Peer loops are spawned on demand
//! by those two.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use matchfabric_protocol::{
    pack, unpack, Command, Header, NodeId, Packet, ProtocolError, Status, UNASSIGNED_NODE,
};
use matchfabric_waiting_room::{WaitingRoom, WaitingRoomError};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{ConfigError, ConfigSource, Tuning, AUTHORITY_ENDPOINT, PEER_ENDPOINT};
use crate::port_policy::{OffsetPortPolicy, PortPolicy};
use crate::registry::{ConnectionRegistry, RegistryError, RegistrySettings};
use crate::listener_task::PendingVerification;
use crate::{authority_task, listener_task, peer_task};

/// How long shutdown waits for each loop task to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    ConnectingToAuthority,
    Registering,
    Operational,
    ReconnectingToAuthority,
    ShuttingDown,
}

/// Code assigned by the authority. Fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub code: NodeId,
    pub code_string: String,
}

impl NodeIdentity {
    fn new(code: NodeId) -> Self {
        Self {
            code,
            code_string: code.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("waiting room error: {0}")]
    WaitingRoom(#[from] WaitingRoomError),
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("registration failed after {0} attempts")]
    RegistrationExhausted(u32),
}

/// State shared by every loop of a running node.
pub(crate) struct NodeContext {
    pub identity: NodeIdentity,
    pub registry: ConnectionRegistry,
    pub room: WaitingRoom,
    pub config: Arc<dyn ConfigSource>,
    pub tuning: Tuning,
    /// Inbound peers awaiting an IdVerifyResponse, keyed by claimed code.
    pub pending_verifications: Mutex<HashMap<NodeId, PendingVerification>>,
    pub state: watch::Sender<NodeState>,
    pub shutdown: broadcast::Sender<()>,
}

impl NodeContext {
    pub fn local_id(&self) -> NodeId {
        self.identity.code
    }

    /// Publish a state change. `ShuttingDown` is terminal.
    pub fn set_state(&self, next: NodeState) {
        set_state(&self.state, next);
    }

    pub async fn send_to_authority(
        &self,
        cmd: Command,
        status: Status,
        data1: &str,
        data2: &str,
    ) -> Result<(), NodeError> {
        let message = pack(Header::to_authority(self.local_id()), cmd, status, data1, data2)?;
        tracing::debug!(command = ?cmd, ?status, data1, data2, "coordinator: -> authority");
        self.registry.send_authority(message).await?;
        Ok(())
    }

    pub async fn send_to_peer(
        &self,
        peer_id: NodeId,
        cmd: Command,
        status: Status,
        data1: &str,
        data2: &str,
    ) -> Result<(), NodeError> {
        let message = pack(Header::to_peer(self.local_id(), peer_id), cmd, status, data1, data2)?;
        tracing::debug!(peer = peer_id, command = ?cmd, ?status, data1, data2, "coordinator: -> peer");
        self.registry.send_peer(peer_id, message).await?;
        Ok(())
    }

    /// Start the receive loop for a registered peer.
    pub fn spawn_peer_loop(self: &Arc<Self>, peer_id: NodeId) {
        let ctx = self.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            peer_task::run_peer_loop(ctx, peer_id, shutdown).await;
        });
    }
}

fn set_state(state: &watch::Sender<NodeState>, next: NodeState) {
    state.send_if_modified(|current| {
        if *current == NodeState::ShuttingDown || *current == next {
            return false;
        }
        tracing::info!(from = ?*current, to = ?next, "coordinator: state change");
        *current = next;
        true
    });
}

/// Log every decoded field of an inbound packet.
pub(crate) fn log_packet(channel: &str, packet: &Packet) {
    tracing::debug!(
        channel,
        length = packet.header.length,
        src_type = ?packet.header.src_type,
        src_code = packet.header.src_code,
        dst_type = ?packet.header.dst_type,
        dst_code = packet.header.dst_code,
        command = ?packet.body.cmd,
        status = ?packet.body.status,
        data1 = %packet.body.data1,
        data2 = %packet.body.data2,
        "coordinator: <- packet"
    );
}

/// Builds and starts a node.
pub struct Coordinator {
    config: Arc<dyn ConfigSource>,
    port_policy: Option<Arc<dyn PortPolicy>>,
}

impl Coordinator {
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self {
            config,
            port_policy: None,
        }
    }

    /// Replace the default `base_port + node_id` mapping.
    pub fn with_port_policy(mut self, policy: Arc<dyn PortPolicy>) -> Self {
        self.port_policy = Some(policy);
        self
    }

    /// Connect, register and bring the node to `Operational`.
    pub async fn start(self) -> Result<NodeHandle, NodeError> {
        let (state_tx, _) = watch::channel(NodeState::Uninitialized);

        let tuning = Tuning::resolve(self.config.as_ref())?;
        let authority = self.config.resolve(AUTHORITY_ENDPOINT)?;
        let peer_endpoint = self.config.resolve(PEER_ENDPOINT)?;
        let port_policy = self
            .port_policy
            .unwrap_or_else(|| Arc::new(OffsetPortPolicy::new(peer_endpoint.port())));

        let registry = ConnectionRegistry::new(RegistrySettings {
            bind_ip: peer_endpoint.ip(),
            max_message_size: tuning.max_message_size,
            port_policy,
        });

        let identity = match register_with_authority(&registry, authority, &tuning, &state_tx).await
        {
            Ok(identity) => identity,
            Err(e) => {
                registry.shutdown().await;
                return Err(e);
            }
        };
        tracing::info!(code = identity.code, "coordinator: registered with authority");

        let room = WaitingRoom::new(identity.code)?;

        let listen_addr = match registry.listen_for_peers(identity.code).await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(code = identity.code, "coordinator: peer listener failed: {e}");
                registry.shutdown().await;
                return Err(e.into());
            }
        };

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let ctx = Arc::new(NodeContext {
            identity,
            registry,
            room,
            config: self.config,
            tuning,
            pending_verifications: Mutex::new(HashMap::new()),
            state: state_tx,
            shutdown: shutdown_tx,
        });

        ctx.set_state(NodeState::Operational);

        let authority_loop = {
            let ctx = ctx.clone();
            let shutdown = ctx.shutdown.subscribe();
            tokio::spawn(async move {
                authority_task::run_authority_loop(ctx, shutdown).await;
            })
        };
        let listen_loop = {
            let ctx = ctx.clone();
            let shutdown = ctx.shutdown.subscribe();
            tokio::spawn(async move {
                listener_task::run_listen_loop(ctx, shutdown).await;
            })
        };

        tracing::info!(
            code = ctx.local_id(),
            %listen_addr,
            %authority,
            "coordinator: node operational"
        );

        Ok(NodeHandle {
            ctx,
            listen_addr,
            tasks: Mutex::new(vec![authority_loop, listen_loop]),
        })
    }
}

/// Connect-and-register rounds until an identity is assigned.
async fn register_with_authority(
    registry: &ConnectionRegistry,
    authority: SocketAddr,
    tuning: &Tuning,
    state: &watch::Sender<NodeState>,
) -> Result<NodeIdentity, NodeError> {
    let mut round: u32 = 0;
    loop {
        round = round.saturating_add(1);

        set_state(state, NodeState::ConnectingToAuthority);
        registry
            .connect_authority(authority, tuning.connect_attempts, tuning.connect_retry_delay)
            .await?;

        set_state(state, NodeState::Registering);
        match register(registry, tuning.registration_timeout).await {
            Ok(identity) => return Ok(identity),
            Err(e) => {
                tracing::warn!(round, "coordinator: registration failed: {e}");
                registry.disconnect_authority().await;
                if tuning.registration_attempts != 0 && round >= tuning.registration_attempts {
                    return Err(NodeError::RegistrationExhausted(round));
                }
                tokio::time::sleep(tuning.connect_retry_delay).await;
            }
        }
    }
}

/// One IdRequest/IdResponse exchange. Health checks that arrive first are
/// answered; anything else is dropped.
async fn register(
    registry: &ConnectionRegistry,
    timeout: Duration,
) -> Result<NodeIdentity, NodeError> {
    let request = pack(
        Header::to_authority(UNASSIGNED_NODE),
        Command::IdRequest,
        Status::None,
        "",
        "",
    )?;
    registry.send_authority(request).await?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline, registry.receive_authority())
            .await
            .map_err(|_| NodeError::Registration("timed out waiting for id response".into()))??;

        let packet = match unpack(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("coordinator: dropping malformed authority message: {e}");
                continue;
            }
        };
        log_packet("authority", &packet);

        match packet.command() {
            Command::HealthCheckRequest => {
                let reply = pack(
                    Header::to_authority(UNASSIGNED_NODE),
                    Command::HealthCheckResponse,
                    Status::Success,
                    "",
                    "",
                )?;
                registry.send_authority(reply).await?;
            }
            Command::IdResponse => {
                if packet.status() == Status::Fail {
                    return Err(NodeError::Registration("authority refused id request".into()));
                }
                return match packet.data1_node_id() {
                    Some(code) if code > 0 => Ok(NodeIdentity::new(code)),
                    _ => Err(NodeError::Registration(format!(
                        "unusable node id {:?}",
                        packet.body.data1
                    ))),
                };
            }
            other => {
                tracing::debug!(command = ?other, "coordinator: dropped while registering");
            }
        }
    }
}

/// A running node.
pub struct NodeHandle {
    ctx: Arc<NodeContext>,
    listen_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeHandle {
    pub fn identity(&self) -> &NodeIdentity {
        &self.ctx.identity
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.ctx.registry
    }

    pub fn waiting_room(&self) -> &WaitingRoom {
        &self.ctx.room
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn state(&self) -> NodeState {
        *self.ctx.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NodeState> {
        self.ctx.state.subscribe()
    }

    /// Stop every loop and close every connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        if tasks.is_empty() {
            return;
        }
        tracing::info!(code = self.ctx.local_id(), "coordinator: shutting down");

        self.ctx.set_state(NodeState::ShuttingDown);
        let _ = self.ctx.shutdown.send(());
        self.ctx.registry.shutdown().await;
        for (_, pending) in self.ctx.pending_verifications.lock().await.drain() {
            pending.settle();
        }
        self.ctx.room.remove_local_node().await;

        for task in tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("coordinator: loop task failed: {e}"),
                Err(_) => tracing::warn!("coordinator: loop task did not stop in time"),
            }
        }
        tracing::info!("coordinator: shut down");
    }
}
