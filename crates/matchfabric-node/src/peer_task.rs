//! Outbound peer dial and the per-peer receive loop.

use std::ops::ControlFlow;
use std::sync::Arc;

use matchfabric_protocol::{unpack, Command, NodeId, Packet, Status};
use matchfabric_waiting_room::WaitingRoomError;
use tokio::sync::broadcast;

use crate::coordinator::{log_packet, NodeContext};
use crate::transport::ConnectionId;

/// Dial a peer advertised by the authority, introduce ourselves, and
/// start its receive loop.
pub(crate) async fn connect_to_peer(ctx: Arc<NodeContext>, peer_id: NodeId, ip: String) {
    if let Err(e) = ctx.registry.connect_peer(peer_id, &ip).await {
        tracing::warn!(peer = peer_id, ip = %ip, "peer: connect failed: {e}");
        return;
    }
    let local = ctx.identity.code_string.clone();
    if let Err(e) = ctx
        .send_to_peer(peer_id, Command::IdTransmit, Status::None, &local, "")
        .await
    {
        tracing::warn!(peer = peer_id, "peer: id transmit failed: {e}");
        return;
    }
    tracing::info!(peer = peer_id, ip = %ip, "peer: outbound connection established");
    ctx.spawn_peer_loop(peer_id);
}

/// Serve one peer connection until it fails, is replaced, or the node
/// shuts down.
pub(crate) async fn run_peer_loop(
    ctx: Arc<NodeContext>,
    peer_id: NodeId,
    mut shutdown: broadcast::Receiver<()>,
) {
    let Some(conn_id) = ctx.registry.peer_connection_id(peer_id).await else {
        tracing::debug!(peer = peer_id, "peer: gone before loop start");
        return;
    };
    tracing::debug!(peer = peer_id, conn = conn_id, "peer: loop started");

    loop {
        let received = tokio::select! {
            _ = shutdown.recv() => break,
            result = ctx.registry.receive_peer_on(peer_id, conn_id) => result,
        };
        let frame = match received {
            Ok(frame) => frame,
            Err(e) => {
                tracing::info!(peer = peer_id, conn = conn_id, "peer: loop ended: {e}");
                break;
            }
        };
        let packet = match unpack(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(peer = peer_id, "peer: dropping malformed message: {e}");
                continue;
            }
        };
        log_packet("peer", &packet);
        if handle_packet(&ctx, peer_id, conn_id, packet).await.is_break() {
            break;
        }
    }

    if !ctx.registry.has_peer(peer_id).await {
        ctx.room.remove_node(peer_id).await;
    }
}

async fn handle_packet(
    ctx: &NodeContext,
    peer_id: NodeId,
    conn_id: ConnectionId,
    packet: Packet,
) -> ControlFlow<()> {
    match packet.command() {
        Command::HealthCheckRequest => {
            if let Err(e) = ctx
                .send_to_peer(peer_id, Command::HealthCheckResponse, Status::Success, "", "")
                .await
            {
                tracing::warn!(peer = peer_id, "peer: health check reply failed: {e}");
                return ControlFlow::Break(());
            }
        }
        Command::IdTransmitResponse if packet.status() == Status::Success => {
            confirm_outbound(ctx, peer_id, conn_id).await;
        }
        Command::IdTransmitResponse => {
            tracing::info!(peer = peer_id, status = ?packet.status(), "peer: rejected by remote");
            ctx.registry.disconnect_peer(peer_id).await;
            return ControlFlow::Break(());
        }
        other => {
            tracing::debug!(peer = peer_id, command = ?other, "peer: unhandled command dropped");
        }
    }
    ControlFlow::Continue(())
}

/// The remote accepted our IdTransmit; seed the waiting room using the
/// connect round-trip as the latency score.
async fn confirm_outbound(ctx: &NodeContext, peer_id: NodeId, conn_id: ConnectionId) {
    let latency_ms = match ctx.registry.peer(peer_id).await {
        Some(conn) if conn.id() == conn_id => conn
            .connect_rtt()
            .map(|rtt| rtt.as_secs_f64() * 1000.0)
            .unwrap_or(0.0),
        _ => return,
    };
    match ctx.room.add_node(peer_id, latency_ms).await {
        Ok(()) => tracing::info!(peer = peer_id, latency_ms, "peer: confirmed by remote"),
        Err(WaitingRoomError::DuplicateNode(_)) => {
            if let Err(e) = ctx.room.set_latency(peer_id, latency_ms).await {
                tracing::debug!(peer = peer_id, "peer: latency update failed: {e}");
            }
        }
        Err(e) => tracing::warn!(peer = peer_id, "peer: waiting room add failed: {e}"),
    }
}
