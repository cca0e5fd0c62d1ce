//! Peer listening loop and the inbound verification handshake.
//!
//! peer -> us: first message, claimed code in `src_code`
//! us -> authority: IdVerify(data1 = claimed code)
//! authority -> us: IdVerifyResponse(data1 = claimed code, status)
//! us -> peer: IdTransmitResponse(status), then serve or close
//!
//! The three steps run in different tasks and meet through
//! `NodeContext::pending_verifications`, keyed by the claimed code. Until
//! the verdict arrives the accepting task keeps reading the connection, so
//! a peer that drops or outlives `verification_timeout_ms` is removed.
//! Whoever takes the pending entry out of the map owns the outcome.

use std::sync::Arc;
use std::time::Duration;

use matchfabric_protocol::{unpack, Command, NodeId, Status};
use matchfabric_waiting_room::WaitingRoomError;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::coordinator::{log_packet, NodeContext};
use crate::registry::{InboundPeer, RegistryError};
use crate::transport::ConnectionId;

/// How long an accepted peer has to send its first message.
const FIRST_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// An inbound peer awaiting the authority's verdict.
pub(crate) struct PendingVerification {
    conn_id: ConnectionId,
    settled: CancellationToken,
}

impl PendingVerification {
    /// Release the task watching the connection.
    pub(crate) fn settle(&self) {
        self.settled.cancel();
    }
}

/// Accept inbound peers until shutdown.
pub(crate) async fn run_listen_loop(ctx: Arc<NodeContext>, mut shutdown: broadcast::Receiver<()>) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("listener: loop shutting down");
                return;
            }
            result = ctx.registry.accept_peer(FIRST_MESSAGE_TIMEOUT) => result,
        };

        match accepted {
            Ok(inbound) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    begin_verification(ctx, inbound).await;
                });
            }
            Err(RegistryError::ShutDown | RegistryError::NotListening) => {
                tracing::info!("listener: listener closed, loop stopped");
                return;
            }
            Err(e) => {
                tracing::warn!("listener: accept failed: {e}");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Register an inbound connection under its claimed code, ask the
/// authority to vouch for it, then watch it until the verdict arrives.
async fn begin_verification(ctx: Arc<NodeContext>, inbound: InboundPeer) {
    let InboundPeer {
        remote,
        connection,
        first_message,
    } = inbound;

    let packet = match unpack(&first_message) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!(%remote, "listener: malformed first message, closing: {e}");
            connection.close().await;
            return;
        }
    };
    log_packet("inbound", &packet);

    let claimed = packet.sender();
    if claimed <= 0 || claimed == ctx.local_id() {
        tracing::warn!(%remote, claimed, "listener: invalid claimed code, closing");
        connection.close().await;
        return;
    }

    if let Err(e) = ctx.registry.register_peer(claimed, connection.clone()).await {
        let replaced = match &e {
            RegistryError::DuplicatePeer(_) if claimed < ctx.local_id() => {
                yield_crossed_dial(&ctx, claimed).await
                    && ctx.registry.register_peer(claimed, connection.clone()).await.is_ok()
            }
            _ => false,
        };
        if !replaced {
            tracing::warn!(peer = claimed, %remote, "listener: inbound peer rejected: {e}");
            connection.close().await;
            return;
        }
        tracing::info!(peer = claimed, %remote, "listener: crossed connection replaced");
    }

    let conn_id = connection.id();
    let settled = CancellationToken::new();
    ctx.pending_verifications.lock().await.insert(
        claimed,
        PendingVerification {
            conn_id,
            settled: settled.clone(),
        },
    );

    let claimed_str = claimed.to_string();
    if let Err(e) = ctx
        .send_to_authority(Command::IdVerify, Status::None, &claimed_str, "")
        .await
    {
        tracing::warn!(peer = claimed, "listener: verify request failed: {e}");
        abandon_verification(&ctx, claimed, conn_id).await;
        return;
    }
    tracing::info!(peer = claimed, %remote, conn = conn_id, "listener: verification requested");

    watch_pending(&ctx, claimed, conn_id, settled).await;
}

/// Both sides dialled each other and the lower code's outbound connection
/// wins. Gives way only for our own outbound dial the remote has not yet
/// accepted; a verified or seated peer is never displaced.
async fn yield_crossed_dial(ctx: &NodeContext, peer_id: NodeId) -> bool {
    let Some(existing) = ctx.registry.peer(peer_id).await else {
        return true;
    };
    if !existing.is_outbound() || ctx.room.contains_node(peer_id).await {
        return false;
    }
    ctx.registry.disconnect_peer_on(peer_id, existing.id()).await;
    true
}

/// Read the unverified connection until the verdict settles it. EOF, a
/// transport error or the verification deadline drop the peer instead.
async fn watch_pending(
    ctx: &NodeContext,
    peer_id: NodeId,
    conn_id: ConnectionId,
    settled: CancellationToken,
) {
    let deadline = tokio::time::sleep(ctx.tuning.verification_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = settled.cancelled() => return,
            _ = &mut deadline => {
                tracing::warn!(peer = peer_id, conn = conn_id, "listener: verification timed out");
                break;
            }
            received = ctx.registry.receive_peer_on(peer_id, conn_id) => match received {
                Ok(_) => {
                    tracing::debug!(peer = peer_id, "listener: message from unverified peer dropped");
                }
                Err(e) => {
                    tracing::info!(peer = peer_id, conn = conn_id, "listener: unverified peer lost: {e}");
                    break;
                }
            },
        }
    }
    abandon_verification(ctx, peer_id, conn_id).await;
}

/// Drop a pending verification if it still belongs to `conn_id`, together
/// with its connection.
async fn abandon_verification(ctx: &NodeContext, peer_id: NodeId, conn_id: ConnectionId) {
    let pending = {
        let mut pending = ctx.pending_verifications.lock().await;
        if pending.get(&peer_id).is_some_and(|p| p.conn_id == conn_id) {
            pending.remove(&peer_id)
        } else {
            None
        }
    };
    if let Some(pending) = pending {
        pending.settle();
        drop_unverified(ctx, peer_id, conn_id).await;
    }
}

/// Abandon every pending verification. Called when the authority
/// connection is lost, since no verdict can arrive for them any more.
pub(crate) async fn abandon_all_verifications(ctx: &NodeContext) {
    let pending: Vec<(NodeId, PendingVerification)> =
        ctx.pending_verifications.lock().await.drain().collect();
    for (peer_id, pending) in pending {
        pending.settle();
        tracing::info!(peer = peer_id, "listener: verification abandoned with the authority connection");
        drop_unverified(ctx, peer_id, pending.conn_id).await;
    }
}

/// Close an unverified peer's connection and, once nothing serves that code
/// any more, its waiting-room seat.
async fn drop_unverified(ctx: &NodeContext, peer_id: NodeId, conn_id: ConnectionId) {
    ctx.registry.disconnect_peer_on(peer_id, conn_id).await;
    if !ctx.registry.has_peer(peer_id).await {
        ctx.room.remove_node(peer_id).await;
    }
}

/// Apply the authority's verdict on a pending inbound peer.
pub(crate) async fn complete_verification(ctx: Arc<NodeContext>, peer_id: NodeId, status: Status) {
    let Some(pending) = ctx.pending_verifications.lock().await.remove(&peer_id) else {
        tracing::warn!(peer = peer_id, ?status, "listener: verify response with no pending request");
        return;
    };
    pending.settle();

    if ctx.registry.peer_connection_id(peer_id).await != Some(pending.conn_id) {
        tracing::debug!(peer = peer_id, conn = pending.conn_id, "listener: verified connection already gone");
        return;
    }

    if status != Status::Success {
        tracing::info!(peer = peer_id, ?status, "listener: peer failed verification");
        if let Err(e) = ctx
            .send_to_peer(peer_id, Command::IdTransmitResponse, Status::Fail, "", "")
            .await
        {
            tracing::debug!(peer = peer_id, "listener: deny message not delivered: {e}");
        }
        drop_unverified(&ctx, peer_id, pending.conn_id).await;
        return;
    }

    if let Err(e) = ctx
        .send_to_peer(peer_id, Command::IdTransmitResponse, Status::Success, "", "")
        .await
    {
        tracing::warn!(peer = peer_id, "listener: confirm message failed: {e}");
        return;
    }
    match ctx.room.add_node(peer_id, 0.0).await {
        Ok(()) | Err(WaitingRoomError::DuplicateNode(_)) => {}
        Err(e) => tracing::warn!(peer = peer_id, "listener: waiting room add failed: {e}"),
    }
    tracing::info!(peer = peer_id, "listener: peer verified");
    ctx.spawn_peer_loop(peer_id);
}
