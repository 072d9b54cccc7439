//! Control surface integration tests
//!
//! Exercises the UDP operator command server end to end.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use integration_tests::{init_test_logging, spawn_server, MockClient, TestConfigBuilder};

use fedlink_server::{CtlMessage, CtlMessageType, CTL_BUFFER_SIZE};

/// Sends one command and returns the decoded response.
async fn send_command(ctl_addr: SocketAddr, command: &str) -> CtlMessage {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let local = socket.local_addr().expect("addr");

    let msg = CtlMessage::command(command.to_string(), local);
    socket.send_to(&msg.encode(), ctl_addr).await.expect("send");

    let mut buffer = [0u8; CTL_BUFFER_SIZE];
    let (size, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buffer))
        .await
        .expect("response expected")
        .expect("recv");
    CtlMessage::decode(&buffer[..size], ctl_addr).expect("decode")
}

#[tokio::test]
async fn test_status_command_returns_json() {
    init_test_logging();

    let config = TestConfigBuilder::new().build();
    let fixture = spawn_server(config, true, None).await.expect("spawn");
    let ctl_addr = fixture.ctl_addr.expect("ctl enabled");

    let response = send_command(ctl_addr, "status").await;
    assert_eq!(response.msg_type, CtlMessageType::Result);

    let json: serde_json::Value = serde_json::from_str(&response.value).expect("json");
    assert_eq!(json["rounds_completed"], 0);
    assert!(json["state"].is_string());

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_clients_command_lists_registered() {
    init_test_logging();

    let config = TestConfigBuilder::new().build();
    let fixture = spawn_server(config, true, None).await.expect("spawn");
    let ctl_addr = fixture.ctl_addr.expect("ctl enabled");

    let client = MockClient::new("worker-7", fixture.server_addr).await.expect("client");
    client.register(4).await.expect("register");

    let response = send_command(ctl_addr, "clients").await;
    assert_eq!(response.msg_type, CtlMessageType::Result);
    assert!(response.value.contains("worker-7"));

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_unknown_command_is_error() {
    init_test_logging();

    let config = TestConfigBuilder::new().build();
    let fixture = spawn_server(config, true, None).await.expect("spawn");
    let ctl_addr = fixture.ctl_addr.expect("ctl enabled");

    let response = send_command(ctl_addr, "frobnicate").await;
    assert_eq!(response.msg_type, CtlMessageType::Error);
    assert!(response.value.contains("unknown command"));

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_trigger_round_refused_while_round_open() {
    init_test_logging();

    let config = TestConfigBuilder::new().quorum(1, 2).build();
    let fixture = spawn_server(config, true, None).await.expect("spawn");
    let ctl_addr = fixture.ctl_addr.expect("ctl enabled");

    let client = MockClient::new("w1", fixture.server_addr).await.expect("client");
    client.register(4).await.expect("register");
    let _ = client.recv_broadcast().await.expect("round open");

    let response = send_command(ctl_addr, "trigger-round").await;
    assert_eq!(response.msg_type, CtlMessageType::Error);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_model_command_returns_current_model() {
    init_test_logging();

    let config = TestConfigBuilder::new().model_dimension(3).build();
    let fixture = spawn_server(config, true, None).await.expect("spawn");
    let ctl_addr = fixture.ctl_addr.expect("ctl enabled");

    let response = send_command(ctl_addr, "model").await;
    assert_eq!(response.msg_type, CtlMessageType::Result);

    let json: serde_json::Value = serde_json::from_str(&response.value).expect("json");
    assert_eq!(json["parameters"].as_array().map(|a| a.len()), Some(3));

    fixture.shutdown().await;
}
