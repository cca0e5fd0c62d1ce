//! Authority loop -- list request, then dispatch every authority message.
//!
//! A receive failure drops into the reconnect path: abandon inbound
//! verifications still waiting on the lost connection, re-resolve the
//! endpoint, reconnect in the background without an attempt limit, then
//! serve again. Only a resolve failure, a non-transient connect error or
//! shutdown end the loop.

use std::sync::Arc;

use matchfabric_protocol::{unpack, Command, NodeId, Packet, Status};
use tokio::sync::broadcast;

use crate::config::{ConfigSource, AUTHORITY_ENDPOINT};
use crate::coordinator::{log_packet, NodeContext, NodeError, NodeState};
use crate::{listener_task, peer_task};

/// Run the authority loop until shutdown or an unrecoverable reconnect failure.
pub(crate) async fn run_authority_loop(
    ctx: Arc<NodeContext>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let served = tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("authority: loop shutting down");
                return;
            }
            result = serve_authority(&ctx) => result,
        };
        if let Err(e) = served {
            tracing::warn!("authority: connection lost: {e}");
        }
        if ctx.registry.is_shut_down() {
            return;
        }
        listener_task::abandon_all_verifications(&ctx).await;

        ctx.set_state(NodeState::ReconnectingToAuthority);
        let endpoint = match ctx.config.resolve(AUTHORITY_ENDPOINT) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::error!("authority: cannot resolve endpoint, loop stopped: {e}");
                return;
            }
        };

        let reconnected = tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("authority: loop shutting down");
                return;
            }
            result = ctx.registry.connect_authority_background(endpoint, ctx.tuning.reconnect_backoff) => result,
        };
        if let Err(e) = reconnected {
            tracing::error!(%endpoint, "authority: reconnect failed, loop stopped: {e}");
            return;
        }
        ctx.set_state(NodeState::Operational);
    }
}

/// Ask for the peer list, then handle authority messages until the
/// connection fails.
async fn serve_authority(ctx: &Arc<NodeContext>) -> Result<(), NodeError> {
    ctx.send_to_authority(Command::ListRequest, Status::None, "", "")
        .await?;

    loop {
        let frame = ctx.registry.receive_authority().await?;
        let packet = match unpack(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("authority: dropping malformed message: {e}");
                continue;
            }
        };
        log_packet("authority", &packet);
        dispatch(ctx, packet).await?;
    }
}

async fn dispatch(ctx: &Arc<NodeContext>, packet: Packet) -> Result<(), NodeError> {
    match packet.command() {
        Command::HealthCheckRequest => {
            ctx.send_to_authority(Command::HealthCheckResponse, Status::Success, "", "")
                .await?;
        }
        Command::ListResponse => handle_list_response(ctx, &packet).await,
        Command::IdVerifyResponse => {
            let Some(peer_id) = packet.data1_node_id() else {
                tracing::warn!(data1 = %packet.body.data1, "authority: verify response without peer id");
                return Ok(());
            };
            let ctx = ctx.clone();
            let status = packet.status();
            tokio::spawn(async move {
                listener_task::complete_verification(ctx, peer_id, status).await;
            });
        }
        other => {
            tracing::debug!(command = ?other, "authority: unhandled command dropped");
        }
    }
    Ok(())
}

/// Dial the advertised peer in the background.
async fn handle_list_response(ctx: &Arc<NodeContext>, packet: &Packet) {
    let Some(peer_id) = packet.data1_node_id().filter(|id| *id > 0) else {
        tracing::warn!(data1 = %packet.body.data1, "authority: list response without peer id");
        return;
    };
    if should_skip_peer(ctx, peer_id).await {
        return;
    }
    let ip = packet.body.data2.trim().to_string();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        peer_task::connect_to_peer(ctx, peer_id, ip).await;
    });
}

async fn should_skip_peer(ctx: &NodeContext, peer_id: NodeId) -> bool {
    if peer_id == ctx.local_id() {
        tracing::debug!("authority: list response names this node, ignored");
        return true;
    }
    if ctx.registry.has_peer(peer_id).await {
        tracing::debug!(peer = peer_id, "authority: peer already connected, ignored");
        return true;
    }
    false
}
