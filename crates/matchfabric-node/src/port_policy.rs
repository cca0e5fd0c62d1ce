//! Mapping from node code to the TCP port that node listens on for peers.

use matchfabric_protocol::NodeId;

/// Decides which port a matching server listens on. The same policy is used
/// to bind our own listener and to dial peers, so every node in a mesh must
/// agree on it.
pub trait PortPolicy: Send + Sync + std::fmt::Debug {
    /// `None` when the node has no valid port under this policy.
    fn port_for(&self, node_id: NodeId) -> Option<u16>;
}

/// `base_port + node_id`. Node codes double as port offsets, so they must
/// stay small and positive.
#[derive(Debug, Clone, Copy)]
pub struct OffsetPortPolicy {
    pub base_port: u16,
}

impl OffsetPortPolicy {
    pub fn new(base_port: u16) -> Self {
        Self { base_port }
    }
}

impl PortPolicy for OffsetPortPolicy {
    fn port_for(&self, node_id: NodeId) -> Option<u16> {
        if node_id <= 0 {
            return None;
        }
        let offset = u16::try_from(node_id).ok()?;
        self.base_port.checked_add(offset)
    }
}
