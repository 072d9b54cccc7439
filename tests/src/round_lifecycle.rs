//! Round lifecycle integration tests
//!
//! Drives the real server tasks over UDP with mock clients: full rounds,
//! quorum aborts, version monotonicity and checkpoint persistence.

use std::time::Duration;

use integration_tests::{
    init_test_logging, spawn_server, wait_for_condition, MockClient, TestConfigBuilder,
    DEFAULT_POLL_INTERVAL, DEFAULT_TEST_TIMEOUT,
};

use fedlink_common::types::{ModelVersion, ServerMessage};

/// Two clients complete a round; the next broadcast carries the averaged
/// model at version 1.
#[tokio::test]
async fn test_full_round_over_udp() {
    init_test_logging();

    let config = TestConfigBuilder::new().quorum(2, 2).rounds(3).build();
    let fixture = spawn_server(config, false, None).await.expect("spawn");

    let w1 = MockClient::new("w1", fixture.server_addr).await.expect("client");
    let w2 = MockClient::new("w2", fixture.server_addr).await.expect("client");
    assert_eq!(w1.register(4).await.expect("register"), ModelVersion::new(0));
    assert_eq!(w2.register(4).await.expect("register"), ModelVersion::new(0));

    let (round_id, version, parameters) = w1.recv_broadcast().await.expect("broadcast");
    assert_eq!(version, ModelVersion::new(0));
    assert_eq!(parameters, vec![0.0; 4]);
    let (round_id2, _, _) = w2.recv_broadcast().await.expect("broadcast");
    assert_eq!(round_id, round_id2);

    w1.ack(round_id).await.expect("ack");
    w2.ack(round_id).await.expect("ack");

    w1.submit_update(round_id, vec![1.0; 4], 10).await.expect("submit");
    assert!(matches!(
        w1.recv().await.expect("reply"),
        ServerMessage::UpdateAccepted { .. }
    ));
    w2.submit_update(round_id, vec![3.0; 4], 10).await.expect("submit");
    assert!(matches!(
        w2.recv().await.expect("reply"),
        ServerMessage::UpdateAccepted { .. }
    ));

    // The next round announces the merged model.
    let (next_round, next_version, merged) = w1.recv_broadcast().await.expect("broadcast");
    assert!(next_round > round_id);
    assert_eq!(next_version, ModelVersion::new(1));
    assert_eq!(merged, vec![2.0; 4]);

    fixture.shutdown().await;
}

/// With only one of two required updates the deadline aborts the round and
/// the model version does not move.
#[tokio::test]
async fn test_quorum_timeout_aborts_round() {
    init_test_logging();

    let config = TestConfigBuilder::new()
        .quorum(2, 2)
        .deadline_secs(1)
        .build();
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

    let (aborted_round, _reason) = w2.recv_abort().await.expect("abort");
    assert_eq!(aborted_round, round_id);

    let status = fixture.status().await.expect("status");
    assert_eq!(status.model_version, ModelVersion::new(0));
    assert_eq!(status.rounds_completed, 0);

    fixture.shutdown().await;
}

/// The round budget stops training; the coordinator reports completion and
/// opens no further rounds.
#[tokio::test]
async fn test_round_budget_exhausts() {
    init_test_logging();

    let config = TestConfigBuilder::new().quorum(2, 2).rounds(1).build();
    let fixture = spawn_server(config, false, None).await.expect("spawn");

    let w1 = MockClient::new("w1", fixture.server_addr).await.expect("client");
    let w2 = MockClient::new("w2", fixture.server_addr).await.expect("client");
    w1.register(4).await.expect("register");
    w2.register(4).await.expect("register");

    let (round_id, _, _) = w1.recv_broadcast().await.expect("broadcast");
    let _ = w2.recv_broadcast().await.expect("broadcast");
    for client in [&w1, &w2] {
        client.submit_update(round_id, vec![1.0; 4], 10).await.expect("submit");
    }

    wait_for_condition(
        || async {
            fixture
                .status()
                .await
                .map(|s| s.rounds_completed == 1)
                .unwrap_or(false)
        },
        DEFAULT_TEST_TIMEOUT,
        DEFAULT_POLL_INTERVAL,
    )
    .await
    .expect("budget should complete");

    let status = fixture.status().await.expect("status");
    assert_eq!(status.model_version, ModelVersion::new(1));

    fixture.shutdown().await;
}

/// Published models land as durable checkpoints before the version moves.
#[tokio::test]
async fn test_checkpoint_written_on_publish() {
    init_test_logging();

    let dir = tempfile::tempdir().expect("tempdir");
    let config = TestConfigBuilder::new()
        .quorum(2, 2)
        .rounds(1)
        .checkpoint_dir(dir.path().to_path_buf())
        .build();
    let checkpoint_path = dir.path().join("checkpoint-r00000001.json");
    let fixture = spawn_server(config, false, Some(dir)).await.expect("spawn");

    let w1 = MockClient::new("w1", fixture.server_addr).await.expect("client");
    let w2 = MockClient::new("w2", fixture.server_addr).await.expect("client");
    w1.register(4).await.expect("register");
    w2.register(4).await.expect("register");

    let (round_id, _, _) = w1.recv_broadcast().await.expect("broadcast");
    for client in [&w1, &w2] {
        client.submit_update(round_id, vec![1.0; 4], 10).await.expect("submit");
    }

    wait_for_condition(
        || async { checkpoint_path.exists() },
        DEFAULT_TEST_TIMEOUT,
        DEFAULT_POLL_INTERVAL,
    )
    .await
    .expect("checkpoint should appear");

    fixture.shutdown().await;
}

/// A stale update for an already-aborted round is refused, and the next
/// round proceeds normally.
#[tokio::test]
async fn test_stale_update_refused_after_abort() {
    init_test_logging();

    let config = TestConfigBuilder::new()
        .quorum(2, 2)
        .deadline_secs(1)
        .build();
    let fixture = spawn_server(config, false, None).await.expect("spawn");

    let w1 = MockClient::new("w1", fixture.server_addr).await.expect("client");
    let w2 = MockClient::new("w2", fixture.server_addr).await.expect("client");
    w1.register(4).await.expect("register");
    w2.register(4).await.expect("register");

    let (round_id, _, _) = w1.recv_broadcast().await.expect("broadcast");
    let (aborted_round, _) = w1.recv_abort().await.expect("abort");
    assert_eq!(aborted_round, round_id);

    // Submit against the dead round.
    w1.submit_update(round_id, vec![1.0; 4], 10).await.expect("submit");
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The round reopens with a fresh id after the backoff.
    let (next_round, version, _) = w1.recv_broadcast().await.expect("broadcast");
    assert!(next_round > round_id);
    assert_eq!(version, ModelVersion::new(0));

    fixture.shutdown().await;
}
