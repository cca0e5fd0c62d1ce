//! Matchfabric Waiting Room -- per-node queues of players awaiting a match.
//!
//! One entry per known matching server (the local one included), each
//! holding an insertion-ordered player queue and a latency score. Every
//! read and mutation goes through a single lock.

mod queue;

pub use queue::PlayerQueue;

use matchfabric_protocol::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Player identifier, unique within the node that owns the player.
pub type PlayerId = String;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WaitingRoomError {
    #[error("invalid node id {0}: must be greater than 0")]
    InvalidNodeId(NodeId),
    #[error("invalid latency {0}: must be finite and >= 0")]
    InvalidLatency(f64),
    #[error("node {0} already present in waiting room")]
    DuplicateNode(NodeId),
    #[error("node {0} not present in waiting room")]
    UnknownNode(NodeId),
    #[error("player {player_id} already queued on node {node_id}")]
    DuplicatePlayer { node_id: NodeId, player_id: PlayerId },
    #[error("player {player_id} not queued on node {node_id}")]
    UnknownPlayer { node_id: NodeId, player_id: PlayerId },
}

pub type Result<T> = std::result::Result<T, WaitingRoomError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerIdentification {
    /// Matching server the player is connected through.
    pub node_id: NodeId,
    pub player_id: PlayerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MatchState {
    #[default]
    Unset,
    Unmatched,
    MatchedUnconfirmed,
    ConfirmedWithAuthority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub identification: PlayerIdentification,
    pub state: MatchState,
    /// Matching metric (rating or similar); larger is not necessarily better.
    pub metric: f64,
}

impl PlayerInfo {
    pub fn new(node_id: NodeId, player_id: impl Into<PlayerId>, metric: f64) -> Self {
        Self {
            identification: PlayerIdentification {
                node_id,
                player_id: player_id.into(),
            },
            state: MatchState::Unmatched,
            metric,
        }
    }

    pub fn player_id(&self) -> &str {
        &self.identification.player_id
    }
}

/// Waiting-room entry for one matching server.
#[derive(Debug, Clone, Default)]
pub struct NodeEntry {
    pub players: PlayerQueue,
    pub latency: f64,
}

impl NodeEntry {
    fn new(latency: f64) -> Self {
        Self {
            players: PlayerQueue::new(),
            latency,
        }
    }
}

/// Read-only copy of one node's entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub latency: f64,
    pub queue_len: usize,
    pub players: Vec<PlayerInfo>,
}

/// Read-only copy of the whole table, nodes ordered by ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub nodes: Vec<NodeSnapshot>,
}

impl Snapshot {
    pub fn node(&self, node_id: NodeId) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id).collect()
    }
}

/// Shared waiting room. Cloning shares the same table.
#[derive(Clone)]
pub struct WaitingRoom {
    local_node_id: NodeId,
    inner: Arc<Mutex<HashMap<NodeId, NodeEntry>>>,
}

impl WaitingRoom {
    /// Create the table with an empty entry (latency 0) for the local node.
    pub fn new(local_node_id: NodeId) -> Result<Self> {
        check_node_id(local_node_id)?;

        let mut table = HashMap::new();
        table.insert(local_node_id, NodeEntry::new(0.0));
        tracing::info!(local_node_id, "waiting room: initialised");

        Ok(Self {
            local_node_id,
            inner: Arc::new(Mutex::new(table)),
        })
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// Insert an empty entry for a peer node. Existing entries are never overwritten.
    pub async fn add_node(&self, node_id: NodeId, initial_latency: f64) -> Result<()> {
        check_node_id(node_id)?;
        check_latency(initial_latency)?;

        let mut table = self.inner.lock().await;
        if table.contains_key(&node_id) {
            return Err(WaitingRoomError::DuplicateNode(node_id));
        }
        table.insert(node_id, NodeEntry::new(initial_latency));
        tracing::info!(
            node_id,
            latency = initial_latency,
            nodes = table.len(),
            "waiting room: node added"
        );
        log_diagnostic(&table);
        Ok(())
    }

    /// Drop a peer node and every player queued on it. Returns whether an
    /// entry was removed; absent IDs are a no-op. The local node is only
    /// removed through [`WaitingRoom::remove_local_node`].
    pub async fn remove_node(&self, node_id: NodeId) -> bool {
        if node_id == self.local_node_id {
            tracing::warn!(node_id, "waiting room: refusing to remove local node as a peer");
            return false;
        }
        self.remove_entry(node_id).await
    }

    /// Drop the local node's entry. Only for shutdown or when this node can
    /// no longer take part in matching.
    pub async fn remove_local_node(&self) -> bool {
        self.remove_entry(self.local_node_id).await
    }

    async fn remove_entry(&self, node_id: NodeId) -> bool {
        let mut table = self.inner.lock().await;
        let Some(mut entry) = table.remove(&node_id) else {
            tracing::debug!(node_id, "waiting room: remove of absent node ignored");
            return false;
        };
        let released = entry.players.len();
        entry.players.clear();
        tracing::info!(
            node_id,
            released,
            nodes = table.len(),
            "waiting room: node removed"
        );
        log_diagnostic(&table);
        true
    }

    pub async fn contains_node(&self, node_id: NodeId) -> bool {
        self.inner.lock().await.contains_key(&node_id)
    }

    pub async fn node_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn set_latency(&self, node_id: NodeId, latency: f64) -> Result<()> {
        check_latency(latency)?;
        let mut table = self.inner.lock().await;
        let entry = table
            .get_mut(&node_id)
            .ok_or(WaitingRoomError::UnknownNode(node_id))?;
        entry.latency = latency;
        Ok(())
    }

    /// Append a player to the tail of a node's queue.
    pub async fn enqueue_player(&self, node_id: NodeId, player: PlayerInfo) -> Result<()> {
        let mut table = self.inner.lock().await;
        let entry = table
            .get_mut(&node_id)
            .ok_or(WaitingRoomError::UnknownNode(node_id))?;
        entry
            .players
            .push_back(player)
            .map_err(|rejected| WaitingRoomError::DuplicatePlayer {
                node_id,
                player_id: rejected.identification.player_id,
            })?;
        tracing::debug!(node_id, queued = entry.players.len(), "waiting room: player enqueued");
        Ok(())
    }

    /// Pop the longest-waiting player from a node's queue.
    pub async fn dequeue_player(&self, node_id: NodeId) -> Result<Option<PlayerInfo>> {
        let mut table = self.inner.lock().await;
        let entry = table
            .get_mut(&node_id)
            .ok_or(WaitingRoomError::UnknownNode(node_id))?;
        Ok(entry.players.pop_front())
    }

    pub async fn remove_player(&self, node_id: NodeId, player_id: &str) -> Result<PlayerInfo> {
        let mut table = self.inner.lock().await;
        let entry = table
            .get_mut(&node_id)
            .ok_or(WaitingRoomError::UnknownNode(node_id))?;
        entry
            .players
            .remove(player_id)
            .ok_or_else(|| WaitingRoomError::UnknownPlayer {
                node_id,
                player_id: player_id.to_owned(),
            })
    }

    pub async fn set_player_state(
        &self,
        node_id: NodeId,
        player_id: &str,
        state: MatchState,
    ) -> Result<()> {
        let mut table = self.inner.lock().await;
        let entry = table
            .get_mut(&node_id)
            .ok_or(WaitingRoomError::UnknownNode(node_id))?;
        let player = entry
            .players
            .get_mut(player_id)
            .ok_or_else(|| WaitingRoomError::UnknownPlayer {
                node_id,
                player_id: player_id.to_owned(),
            })?;
        player.state = state;
        Ok(())
    }

    /// Consistent copy of the whole table. Never mutates.
    pub async fn snapshot(&self) -> Snapshot {
        let table = self.inner.lock().await;
        snapshot_of(&table)
    }
}

fn check_node_id(node_id: NodeId) -> Result<()> {
    if node_id <= 0 {
        return Err(WaitingRoomError::InvalidNodeId(node_id));
    }
    Ok(())
}

fn check_latency(latency: f64) -> Result<()> {
    if !latency.is_finite() || latency < 0.0 {
        return Err(WaitingRoomError::InvalidLatency(latency));
    }
    Ok(())
}

fn snapshot_of(table: &HashMap<NodeId, NodeEntry>) -> Snapshot {
    let mut nodes: Vec<NodeSnapshot> = table
        .iter()
        .map(|(node_id, entry)| NodeSnapshot {
            node_id: *node_id,
            latency: entry.latency,
            queue_len: entry.players.len(),
            players: entry.players.iter().cloned().collect(),
        })
        .collect();
    nodes.sort_by_key(|n| n.node_id);
    Snapshot { nodes }
}

fn log_diagnostic(table: &HashMap<NodeId, NodeEntry>) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    let snapshot = snapshot_of(table);
    tracing::debug!(nodes = snapshot.nodes.len(), "waiting room: diagnostic");
    for node in &snapshot.nodes {
        tracing::debug!(
            node_id = node.node_id,
            latency = node.latency,
            queued = node.queue_len,
            "waiting room:   node"
        );
        for player in &node.players {
            tracing::debug!(
                node_id = node.node_id,
                player = player.player_id(),
                metric = player.metric,
                state = ?player.state,
                "waiting room:     player"
            );
        }
    }
}
