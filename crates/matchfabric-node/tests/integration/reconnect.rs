//! Authority connection loss and background reconnect.

use std::time::Duration;

use matchfabric_node::NodeState;
use matchfabric_protocol::{Command, Status};

use crate::harness::{FakeAuthority, TestNode, STEP_TIMEOUT};

#[tokio::test]
async fn test_reconnects_after_authority_restart() {
    let t = TestNode::start(4).await;
    let TestNode {
        node,
        authority,
        mut session,
        ..
    } = t;
    session.expect(Command::ListRequest).await;

    let mut states = node.subscribe_state();
    let addr = authority.addr();

    // authority goes away entirely: connection and listener
    drop(session);
    drop(authority);

    tokio::time::timeout(
        STEP_TIMEOUT,
        states.wait_for(|s| *s == NodeState::ReconnectingToAuthority),
    )
    .await
    .expect("node never noticed the lost authority")
    .unwrap();

    // let a few 50ms back-offs fail against the closed port
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node.state(), NodeState::ReconnectingToAuthority);
    assert!(!node.registry().is_authority_connected().await);

    let authority = FakeAuthority::rebind(addr).await;
    let mut session = authority.accept().await;
    session.dst_code = 4;

    // the loop resumes: fresh list request, then normal dispatch
    let list = session.expect(Command::ListRequest).await;
    assert_eq!(list.sender(), 4);
    session
        .send(Command::HealthCheckRequest, Status::None, "", "")
        .await;
    session.expect(Command::HealthCheckResponse).await;

    tokio::time::timeout(
        STEP_TIMEOUT,
        states.wait_for(|s| *s == NodeState::Operational),
    )
    .await
    .expect("node never returned to operational")
    .unwrap();
    assert!(node.registry().is_authority_connected().await);

    // identity survives the reconnect
    assert_eq!(node.identity().code, 4);

    node.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_interrupts_reconnect() {
    let t = TestNode::start(6).await;
    let TestNode {
        node,
        authority,
        session,
        ..
    } = t;
    let mut states = node.subscribe_state();

    drop(session);
    drop(authority);
    tokio::time::timeout(
        STEP_TIMEOUT,
        states.wait_for(|s| *s == NodeState::ReconnectingToAuthority),
    )
    .await
    .unwrap()
    .unwrap();

    tokio::time::timeout(STEP_TIMEOUT, node.shutdown())
        .await
        .expect("shutdown hung while reconnecting");
    assert_eq!(node.state(), NodeState::ShuttingDown);

    // second call is a no-op
    node.shutdown().await;
}
