//! Matchfabric Node -- library crate for the matching server node.
//!
//! Re-exports the coordinator, registry and config types so the binary and
//! the integration tests drive the node the same way.

pub mod config;
pub mod coordinator;
pub mod port_policy;
pub mod registry;
pub mod transport;

mod authority_task;
mod listener_task;
mod peer_task;

pub use config::{ConfigError, ConfigSource, NodeConfig, Tuning};
pub use coordinator::{Coordinator, NodeError, NodeHandle, NodeIdentity, NodeState};
pub use port_policy::{OffsetPortPolicy, PortPolicy};
pub use registry::{ConnectionRegistry, InboundPeer, RegistryError, RegistrySettings};
pub use transport::{Connection, ConnectionId, SharedConnection, TransportError};
