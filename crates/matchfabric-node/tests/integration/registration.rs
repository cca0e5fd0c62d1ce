//! Startup: connect, register, reach Operational.

use std::net::SocketAddr;
use std::sync::Arc;

use matchfabric_node::config::{ConfigError, ConfigSource};
use matchfabric_node::{Coordinator, NodeError, NodeState};
use matchfabric_protocol::{Command, Status};

use crate::harness::{spawn_start, test_config, FakeAuthority, TestNode, TestPorts};

#[tokio::test]
async fn test_registers_and_requests_peer_list() {
    let mut t = TestNode::start(7).await;

    assert_eq!(t.node.identity().code, 7);
    assert_eq!(t.node.identity().code_string, "7");
    assert_eq!(t.node.state(), NodeState::Operational);
    assert!(t.node.registry().is_authority_connected().await);

    let list = t.session.expect(Command::ListRequest).await;
    assert_eq!(list.sender(), 7);

    let snap = t.node.waiting_room().snapshot().await;
    assert_eq!(snap.node_ids(), vec![7]);
    assert_eq!(snap.node(7).unwrap().latency, 0.0);

    t.shutdown().await;
}

#[tokio::test]
async fn test_health_check_answered_on_authority_channel() {
    let mut t = TestNode::start(3).await;
    t.session.expect(Command::ListRequest).await;

    t.session
        .send(Command::HealthCheckRequest, Status::None, "", "")
        .await;
    let reply = t.session.expect(Command::HealthCheckResponse).await;
    assert_eq!(reply.sender(), 3);

    t.shutdown().await;
}

#[tokio::test]
async fn test_health_check_answered_while_registering() {
    let authority = FakeAuthority::bind().await;
    let ports = Arc::new(TestPorts::default());
    ports.set(5, 0);
    let starting = spawn_start(test_config(authority.addr()), ports);

    let mut session = authority.accept().await;
    session.expect(Command::IdRequest).await;
    session
        .send(Command::HealthCheckRequest, Status::None, "", "")
        .await;
    session.expect(Command::HealthCheckResponse).await;
    session
        .send(Command::IdResponse, Status::Success, "5", "")
        .await;

    let node = starting.await.unwrap().unwrap();
    assert_eq!(node.identity().code, 5);
    node.shutdown().await;
}

#[tokio::test]
async fn test_unusable_id_restarts_registration() {
    let authority = FakeAuthority::bind().await;
    let ports = Arc::new(TestPorts::default());
    ports.set(9, 0);
    let starting = spawn_start(test_config(authority.addr()), ports);

    let mut first = authority.accept().await;
    first.expect(Command::IdRequest).await;
    first
        .send(Command::IdResponse, Status::Success, "nine", "")
        .await;
    // the failed round drops the authority connection
    first.expect_closed().await;

    let mut second = authority.accept().await;
    second.expect(Command::IdRequest).await;
    second
        .send(Command::IdResponse, Status::Success, "9", "")
        .await;

    let node = starting.await.unwrap().unwrap();
    assert_eq!(node.identity().code, 9);
    node.shutdown().await;
}

#[tokio::test]
async fn test_registration_gives_up_after_attempts() {
    let authority = FakeAuthority::bind().await;
    let mut cfg = test_config(authority.addr());
    cfg.tuning.registration_attempts = 2;
    let starting = spawn_start(cfg, Arc::new(TestPorts::default()));

    for reply in ["-4", ""] {
        let mut session = authority.accept().await;
        session.expect(Command::IdRequest).await;
        session
            .send(Command::IdResponse, Status::Success, reply, "")
            .await;
        session.expect_closed().await;
    }

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(NodeError::RegistrationExhausted(2))));
}

#[tokio::test]
async fn test_unreachable_authority_is_fatal() {
    let addr = {
        let authority = FakeAuthority::bind().await;
        authority.addr()
    };
    let mut cfg = test_config(addr);
    cfg.tuning.connect_attempts = 2;

    let result = spawn_start(cfg, Arc::new(TestPorts::default()))
        .await
        .unwrap();
    assert!(matches!(result, Err(NodeError::Registry(_))));
}

/// Knows no endpoints at all.
struct EmptyConfig;

impl ConfigSource for EmptyConfig {
    fn resolve(&self, name: &str) -> Result<SocketAddr, ConfigError> {
        Err(ConfigError::UnknownEndpoint(name.to_string()))
    }

    fn resolve_int(&self, _name: &str) -> Result<i64, ConfigError> {
        Ok(1_000)
    }
}

#[tokio::test]
async fn test_unresolvable_endpoint_is_fatal() {
    let result = Coordinator::new(Arc::new(EmptyConfig)).start().await;
    assert!(matches!(
        result,
        Err(NodeError::Config(ConfigError::UnknownEndpoint(_)))
    ));
}
