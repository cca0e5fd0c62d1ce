//! Test harness for in-process matchfabric-node integration tests.
//!
//! Provides FakeAuthority (scripted config server on loopback), Wire (one
//! framed test-side connection), TestPorts (port policy the test controls),
//! and TestNode (a registered node plus its authority session).

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use matchfabric_node::config::{self, NodeConfig};
use matchfabric_node::{Coordinator, NodeError, NodeHandle, PortPolicy};
use matchfabric_protocol::{
    pack, unpack, Command, FrameCodec, Header, NodeId, Packet, Status, TerminalType,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

/// Default wait for anything the node is expected to do.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `check` every 20ms until it holds, or panic after `timeout`.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================================
// Port policy
// ============================================================================

/// Explicit node code -> port table. Unknown codes have no port.
#[derive(Debug, Default)]
pub struct TestPorts {
    ports: std::sync::Mutex<HashMap<NodeId, u16>>,
}

impl TestPorts {
    pub fn set(&self, node_id: NodeId, port: u16) {
        self.ports.lock().unwrap().insert(node_id, port);
    }
}

impl PortPolicy for TestPorts {
    fn port_for(&self, node_id: NodeId) -> Option<u16> {
        self.ports.lock().unwrap().get(&node_id).copied()
    }
}

// ============================================================================
// Wire
// ============================================================================

/// Test side of one framed connection, speaking as `src_type`/`src_code`.
pub struct Wire {
    framed: Framed<TcpStream, FrameCodec>,
    pub src_type: TerminalType,
    pub src_code: NodeId,
    pub dst_code: NodeId,
}

#[allow(dead_code)]
impl Wire {
    pub fn new(stream: TcpStream, src_type: TerminalType, src_code: NodeId) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::default()),
            src_type,
            src_code,
            dst_code: 0,
        }
    }

    /// Connect to a node's peer listener as matching server `src_code`.
    pub async fn connect_peer(addr: SocketAddr, src_code: NodeId) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self::new(stream, TerminalType::MatchingServer, src_code)
    }

    pub async fn send(&mut self, cmd: Command, status: Status, data1: &str, data2: &str) {
        let header = Header::new(
            self.src_type,
            self.src_code,
            TerminalType::MatchingServer,
            self.dst_code,
        );
        let message = pack(header, cmd, status, data1, data2).unwrap();
        self.framed.send(message).await.unwrap();
    }

    pub async fn recv(&mut self) -> Packet {
        let frame = tokio::time::timeout(STEP_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a packet")
            .expect("connection closed")
            .expect("frame error");
        unpack(&frame).unwrap()
    }

    /// Next packet carrying `cmd`; anything else is skipped.
    pub async fn expect(&mut self, cmd: Command) -> Packet {
        loop {
            let packet = self.recv().await;
            if packet.command() == cmd {
                return packet;
            }
        }
    }

    /// The node closed this connection (EOF or reset), skipping any packets
    /// still in flight.
    pub async fn expect_closed(&mut self) {
        let closed = tokio::time::timeout(STEP_TIMEOUT, async {
            loop {
                match self.framed.next().await {
                    None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "connection still open");
    }
}

// ============================================================================
// Fake authority
// ============================================================================

pub struct FakeAuthority {
    listener: TcpListener,
    addr: SocketAddr,
}

impl FakeAuthority {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    /// Rebind on a previously used address.
    pub async fn rebind(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        Self { listener, addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn accept(&self) -> Wire {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("node never connected to authority")
            .unwrap();
        Wire::new(stream, TerminalType::ConfigServer, 0)
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// Node config pointed at `authority` with short test timings.
pub fn test_config(authority: SocketAddr) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.set_endpoint(config::AUTHORITY_ENDPOINT, authority);
    cfg.set_endpoint(config::PEER_ENDPOINT, "127.0.0.1:0".parse().unwrap());
    cfg.tuning.connect_attempts = 20;
    cfg.tuning.connect_retry_delay_ms = 20;
    cfg.tuning.reconnect_backoff_ms = 50;
    cfg.tuning.registration_timeout_ms = 2_000;
    cfg.tuning.registration_attempts = 3;
    cfg
}

/// Start a node against `authority` in the background.
pub fn spawn_start(
    cfg: NodeConfig,
    ports: Arc<TestPorts>,
) -> tokio::task::JoinHandle<Result<NodeHandle, NodeError>> {
    tokio::spawn(
        Coordinator::new(Arc::new(cfg))
            .with_port_policy(ports)
            .start(),
    )
}

/// A registered node, its authority and the live authority session.
pub struct TestNode {
    pub node: NodeHandle,
    pub authority: FakeAuthority,
    pub session: Wire,
    pub ports: Arc<TestPorts>,
}

impl TestNode {
    /// Start a node and answer its IdRequest with `code`. The node's own
    /// listener gets an OS-assigned port.
    pub async fn start(code: NodeId) -> Self {
        Self::start_with(code, |_| {}).await
    }

    /// [`Self::start`] with `tweak` applied to the test config first.
    pub async fn start_with(code: NodeId, tweak: impl FnOnce(&mut NodeConfig)) -> Self {
        let authority = FakeAuthority::bind().await;
        let ports = Arc::new(TestPorts::default());
        ports.set(code, 0);

        let mut cfg = test_config(authority.addr());
        tweak(&mut cfg);
        let starting = spawn_start(cfg, ports.clone());

        let mut session = authority.accept().await;
        let request = session.expect(Command::IdRequest).await;
        assert_eq!(request.sender(), 0, "id request must come from an unassigned node");
        session
            .send(Command::IdResponse, Status::Success, &code.to_string(), "")
            .await;

        let node = starting.await.unwrap().unwrap();
        session.dst_code = code;
        Self {
            node,
            authority,
            session,
            ports,
        }
    }

    pub fn code(&self) -> NodeId {
        self.node.identity().code
    }

    pub async fn shutdown(self) {
        self.node.shutdown().await;
    }
}
