//! Client protocol integration tests
//!
//! Validates wire-level acceptance and rejection of registrations and
//! updates against a running server.

use integration_tests::{init_test_logging, spawn_server, MockClient, TestConfigBuilder};

use fedlink_common::types::{ClientCapabilities, RejectReason, RoundId, ServerMessage};

/// A registration with a mismatched model dimension is rejected.
#[tokio::test]
async fn test_incompatible_registration_rejected() {
    init_test_logging();

    let config = TestConfigBuilder::new().model_dimension(4).build();
    let fixture = spawn_server(config, false, None).await.expect("spawn");

    let client = MockClient::new("w1", fixture.server_addr).await.expect("client");
    client
        .send_register(ClientCapabilities {
            model_dimension: 99,
            schema_version: 1,
            protocol_version: 1,
            declared_samples: 10,
        })
        .await
        .expect("send");

    match client.recv().await.expect("reply") {
        ServerMessage::RegisterRejected { reason } => {
            assert_eq!(reason, RejectReason::IncompatibleCapability);
        }
        other => panic!("expected RegisterRejected, got {other:?}"),
    }

    fixture.shutdown().await;
}

/// A second update from the same client in one round is refused as a
/// duplicate; the first stays counted.
#[tokio::test]
async fn test_duplicate_update_rejected_on_wire() {
    init_test_logging();

    let config = TestConfigBuilder::new().quorum(2, 3).build();
    let fixture = spawn_server(config, false, None).await.expect("spawn");

    let w1 = MockClient::new("w1", fixture.server_addr).await.expect("client");
    let w2 = MockClient::new("w2", fixture.server_addr).await.expect("client");
    w1.register(4).await.expect("register");
    w2.register(4).await.expect("register");

    let (round_id, _, _) = w1.recv_broadcast().await.expect("broadcast");

    w1.submit_update(round_id, vec![1.0; 4], 10).await.expect("submit");
    assert!(matches!(
        w1.recv().await.expect("reply"),
        ServerMessage::UpdateAccepted { .. }
    ));

    w1.submit_update(round_id, vec![2.0; 4], 10).await.expect("submit");
    match w1.recv().await.expect("reply") {
        ServerMessage::UpdateRejected { reason, .. } => {
            assert_eq!(reason, RejectReason::DuplicateUpdate);
        }
        other => panic!("expected UpdateRejected, got {other:?}"),
    }

    fixture.shutdown().await;
}

/// An update from a client that never registered is refused.
#[tokio::test]
async fn test_unregistered_update_rejected() {
    init_test_logging();

    let config = TestConfigBuilder::new().build();
    let fixture = spawn_server(config, false, None).await.expect("spawn");

    let stranger = MockClient::new("ghost", fixture.server_addr).await.expect("client");
    stranger
        .submit_update(RoundId::new(1), vec![1.0; 4], 10)
        .await
        .expect("submit");

    match stranger.recv().await.expect("reply") {
        ServerMessage::UpdateRejected { reason, .. } => {
            assert_eq!(reason, RejectReason::UnknownClient);
        }
        other => panic!("expected UpdateRejected, got {other:?}"),
    }

    fixture.shutdown().await;
}

/// A malformed update (wrong dimension) is refused without disturbing the
/// round for other clients.
#[tokio::test]
async fn test_wrong_dimension_update_rejected() {
    init_test_logging();

    let config = TestConfigBuilder::new().quorum(2, 3).rounds(1).build();
    let fixture = spawn_server(config, false, None).await.expect("spawn");

    let w1 = MockClient::new("w1", fixture.server_addr).await.expect("client");
    let w2 = MockClient::new("w2", fixture.server_addr).await.expect("client");
    w1.register(4).await.expect("register");
    w2.register(4).await.expect("register");

    let (round_id, _, _) = w1.recv_broadcast().await.expect("broadcast");

    w1.submit_update(round_id, vec![1.0; 2], 10).await.expect("submit");
    match w1.recv().await.expect("reply") {
        ServerMessage::UpdateRejected { reason, .. } => {
            assert_eq!(reason, RejectReason::InvalidUpdate);
        }
        other => panic!("expected UpdateRejected, got {other:?}"),
    }

    // The same client may retry with a valid update.
    w1.submit_update(round_id, vec![1.0; 4], 10).await.expect("submit");
    assert!(matches!(
        w1.recv().await.expect("reply"),
        ServerMessage::UpdateAccepted { .. }
    ));

    fixture.shutdown().await;
}

/// Raw garbage datagrams are dropped and the server keeps serving.
#[tokio::test]
async fn test_garbage_datagram_tolerated() {
    init_test_logging();

    let config = TestConfigBuilder::new().quorum(1, 2).build();
    let fixture = spawn_server(config, false, None).await.expect("spawn");

    let noise = fedlink_common::transport::UdpTransport::bind("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind");
    noise
        .send_to(b"\x00\xffnot a message", fixture.server_addr)
        .await
        .expect("send");

    let w1 = MockClient::new("w1", fixture.server_addr).await.expect("client");
    w1.register(4).await.expect("register despite garbage");

    fixture.shutdown().await;
}
