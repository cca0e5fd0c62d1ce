//! Inbound peers: the three-party verification handshake.

use std::time::Duration;

use matchfabric_protocol::{Command, Status};

use crate::harness::{wait_until, FakeAuthority, TestNode, Wire, STEP_TIMEOUT};

#[tokio::test]
async fn test_rejected_peer_is_closed_and_not_seated() {
    let mut t = TestNode::start(7).await;
    t.session.expect(Command::ListRequest).await;

    let mut peer = Wire::connect_peer(t.node.listen_addr(), 42).await;
    peer.dst_code = 7;
    peer.send(Command::IdTransmit, Status::None, "42", "").await;

    let verify = t.session.expect(Command::IdVerify).await;
    assert_eq!(verify.body.data1, "42");
    assert_eq!(verify.sender(), 7);
    assert!(t.node.registry().has_peer(42).await);

    t.session
        .send(Command::IdVerifyResponse, Status::Fail, "42", "")
        .await;

    let denied = peer.expect(Command::IdTransmitResponse).await;
    assert_eq!(denied.status(), Status::Fail);
    peer.expect_closed().await;

    let registry = t.node.registry().clone();
    wait_until("peer 42 removed", STEP_TIMEOUT, || {
        let registry = registry.clone();
        async move { !registry.has_peer(42).await }
    })
    .await;
    assert!(!t.node.waiting_room().contains_node(42).await);

    t.shutdown().await;
}

#[tokio::test]
async fn test_verified_peer_is_served_and_dropped_on_disconnect() {
    let mut t = TestNode::start(7).await;
    t.session.expect(Command::ListRequest).await;

    let mut peer = Wire::connect_peer(t.node.listen_addr(), 3).await;
    peer.dst_code = 7;
    peer.send(Command::IdTransmit, Status::None, "3", "").await;

    t.session.expect(Command::IdVerify).await;
    t.session
        .send(Command::IdVerifyResponse, Status::Success, "3", "")
        .await;

    let confirmed = peer.expect(Command::IdTransmitResponse).await;
    assert_eq!(confirmed.status(), Status::Success);

    let room = t.node.waiting_room().clone();
    wait_until("peer 3 seated", STEP_TIMEOUT, || {
        let room = room.clone();
        async move { room.contains_node(3).await }
    })
    .await;
    assert_eq!(room.snapshot().await.node(3).unwrap().latency, 0.0);

    peer.send(Command::HealthCheckRequest, Status::None, "", "")
        .await;
    let reply = peer.expect(Command::HealthCheckResponse).await;
    assert_eq!(reply.sender(), 7);
    assert_eq!(reply.header.dst_code, 3);

    // peer drops: registry entry and waiting-room seat both go
    drop(peer);
    let registry = t.node.registry().clone();
    wait_until("peer 3 removed", STEP_TIMEOUT, || {
        let registry = registry.clone();
        let room = room.clone();
        async move { !registry.has_peer(3).await && !room.contains_node(3).await }
    })
    .await;
    assert!(room.contains_node(7).await);

    t.shutdown().await;
}

#[tokio::test]
async fn test_peer_claiming_local_code_is_refused() {
    let mut t = TestNode::start(7).await;
    t.session.expect(Command::ListRequest).await;

    let mut impostor = Wire::connect_peer(t.node.listen_addr(), 7).await;
    impostor
        .send(Command::IdTransmit, Status::None, "7", "")
        .await;
    impostor.expect_closed().await;
    assert!(t.node.registry().peer_ids().await.is_empty());

    t.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_inbound_from_higher_code_is_refused() {
    let mut t = TestNode::start(2).await;
    t.session.expect(Command::ListRequest).await;

    let mut first = Wire::connect_peer(t.node.listen_addr(), 8).await;
    first.send(Command::IdTransmit, Status::None, "8", "").await;
    t.session.expect(Command::IdVerify).await;
    let original = t.node.registry().peer_connection_id(8).await;
    assert!(original.is_some());

    let mut second = Wire::connect_peer(t.node.listen_addr(), 8).await;
    second.send(Command::IdTransmit, Status::None, "8", "").await;
    second.expect_closed().await;
    assert_eq!(t.node.registry().peer_connection_id(8).await, original);

    t.shutdown().await;
}

#[tokio::test]
async fn test_unsolicited_verify_response_ignored() {
    let mut t = TestNode::start(7).await;
    t.session.expect(Command::ListRequest).await;

    t.session
        .send(Command::IdVerifyResponse, Status::Success, "99", "")
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!t.node.waiting_room().contains_node(99).await);

    // loop still serving
    t.session
        .send(Command::HealthCheckRequest, Status::None, "", "")
        .await;
    t.session.expect(Command::HealthCheckResponse).await;

    t.shutdown().await;
}

#[tokio::test]
async fn test_verified_peer_not_displaced_by_later_claim() {
    let mut t = TestNode::start(7).await;
    t.session.expect(Command::ListRequest).await;

    let mut peer = Wire::connect_peer(t.node.listen_addr(), 3).await;
    peer.dst_code = 7;
    peer.send(Command::IdTransmit, Status::None, "3", "").await;
    t.session.expect(Command::IdVerify).await;
    t.session
        .send(Command::IdVerifyResponse, Status::Success, "3", "")
        .await;
    peer.expect(Command::IdTransmitResponse).await;
    let room = t.node.waiting_room().clone();
    wait_until("peer 3 seated", STEP_TIMEOUT, || {
        let room = room.clone();
        async move { room.contains_node(3).await }
    })
    .await;
    let verified = t.node.registry().peer_connection_id(3).await;

    // 3 < 7, but the existing entry is an accepted peer, not our own dial
    let mut impostor = Wire::connect_peer(t.node.listen_addr(), 3).await;
    impostor
        .send(Command::IdTransmit, Status::None, "3", "")
        .await;
    impostor.expect_closed().await;

    // a late Fail verdict for 3 must not touch the verified peer
    t.session
        .send(Command::IdVerifyResponse, Status::Fail, "3", "")
        .await;
    t.session
        .send(Command::HealthCheckRequest, Status::None, "", "")
        .await;
    t.session.expect(Command::HealthCheckResponse).await;

    assert_eq!(t.node.registry().peer_connection_id(3).await, verified);
    assert!(room.contains_node(3).await);
    peer.send(Command::HealthCheckRequest, Status::None, "", "")
        .await;
    peer.expect(Command::HealthCheckResponse).await;

    t.shutdown().await;
}

#[tokio::test]
async fn test_peer_dropping_during_verification_frees_its_code() {
    let mut t = TestNode::start(2).await;
    t.session.expect(Command::ListRequest).await;

    let mut first = Wire::connect_peer(t.node.listen_addr(), 8).await;
    first.send(Command::IdTransmit, Status::None, "8", "").await;
    t.session.expect(Command::IdVerify).await;
    assert!(t.node.registry().has_peer(8).await);

    drop(first);
    let registry = t.node.registry().clone();
    wait_until("unverified peer 8 removed", STEP_TIMEOUT, || {
        let registry = registry.clone();
        async move { !registry.has_peer(8).await }
    })
    .await;

    // same code comes back and gets a fresh verification
    let mut second = Wire::connect_peer(t.node.listen_addr(), 8).await;
    second.dst_code = 2;
    second.send(Command::IdTransmit, Status::None, "8", "").await;
    let verify = t.session.expect(Command::IdVerify).await;
    assert_eq!(verify.body.data1, "8");

    t.session
        .send(Command::IdVerifyResponse, Status::Success, "8", "")
        .await;
    let confirmed = second.expect(Command::IdTransmitResponse).await;
    assert_eq!(confirmed.status(), Status::Success);

    t.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_verification_times_out() {
    let mut t = TestNode::start_with(7, |cfg| cfg.tuning.verification_timeout_ms = 200).await;
    t.session.expect(Command::ListRequest).await;

    let mut peer = Wire::connect_peer(t.node.listen_addr(), 5).await;
    peer.send(Command::IdTransmit, Status::None, "5", "").await;
    t.session.expect(Command::IdVerify).await;

    peer.expect_closed().await;
    assert!(!t.node.registry().has_peer(5).await);

    // the verdict arriving after the deadline is ignored
    t.session
        .send(Command::IdVerifyResponse, Status::Success, "5", "")
        .await;
    t.session
        .send(Command::HealthCheckRequest, Status::None, "", "")
        .await;
    t.session.expect(Command::HealthCheckResponse).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!t.node.waiting_room().contains_node(5).await);
    assert!(!t.node.registry().has_peer(5).await);

    t.shutdown().await;
}

#[tokio::test]
async fn test_authority_loss_abandons_pending_verification() {
    let t = TestNode::start(5).await;
    let TestNode {
        node,
        authority,
        mut session,
        ..
    } = t;
    session.expect(Command::ListRequest).await;

    let mut peer = Wire::connect_peer(node.listen_addr(), 9).await;
    peer.send(Command::IdTransmit, Status::None, "9", "").await;
    session.expect(Command::IdVerify).await;

    // the verdict for 9 can no longer arrive
    let addr = authority.addr();
    drop(session);
    drop(authority);
    peer.expect_closed().await;
    let registry = node.registry().clone();
    wait_until("unverified peer 9 removed", STEP_TIMEOUT, || {
        let registry = registry.clone();
        async move { !registry.has_peer(9).await }
    })
    .await;

    let authority = FakeAuthority::rebind(addr).await;
    let mut session = authority.accept().await;
    session.dst_code = 5;
    session.expect(Command::ListRequest).await;

    // stale verdict from the new session finds nothing pending
    session
        .send(Command::IdVerifyResponse, Status::Success, "9", "")
        .await;
    session
        .send(Command::HealthCheckRequest, Status::None, "", "")
        .await;
    session.expect(Command::HealthCheckResponse).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!node.waiting_room().contains_node(9).await);
    assert!(!node.registry().has_peer(9).await);

    node.shutdown().await;
}
