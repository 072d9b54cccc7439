//! Mock training client for integration tests
//!
//! Speaks the client-facing UDP protocol: registration, heartbeats, round
//! acknowledgements and update submission. Received server messages are
//! returned through timed receive helpers so tests can assert on ordering.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::timeout;

use fedlink_common::transport::UdpTransport;
use fedlink_common::types::{
    ClientCapabilities, ClientId, ClientMessage, ModelVersion, RoundId, ServerMessage,
};

use crate::test_utils::TestResult;

/// Default receive timeout for expected server messages.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A mock training client bound to an ephemeral UDP port.
pub struct MockClient {
    id: ClientId,
    transport: UdpTransport,
    server_addr: SocketAddr,
}

impl MockClient {
    /// Binds a client socket addressed at the given server.
    pub async fn new(id: &str, server_addr: SocketAddr) -> TestResult<Self> {
        let transport = UdpTransport::bind("127.0.0.1:0".parse()?).await?;
        Ok(Self {
            id: ClientId::new(id),
            transport,
            server_addr,
        })
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Sends a registration with the given capabilities.
    pub async fn send_register(&self, capabilities: ClientCapabilities) -> TestResult {
        self.transport
            .send_client_message(
                &ClientMessage::Register {
                    client_id: self.id.clone(),
                    capabilities,
                },
                self.server_addr,
            )
            .await?;
        Ok(())
    }

    /// Registers with matching capabilities and waits for acceptance.
    pub async fn register(&self, model_dimension: usize) -> TestResult<ModelVersion> {
        self.send_register(ClientCapabilities {
            model_dimension,
            schema_version: 1,
            protocol_version: 1,
            declared_samples: 10,
        })
        .await?;

        match self.recv().await? {
            ServerMessage::RegisterAccepted { model_version } => Ok(model_version),
            other => Err(format!("expected RegisterAccepted, got {other:?}").into()),
        }
    }

    pub async fn heartbeat(&self) -> TestResult {
        self.transport
            .send_client_message(
                &ClientMessage::Heartbeat {
                    client_id: self.id.clone(),
                },
                self.server_addr,
            )
            .await?;
        Ok(())
    }

    pub async fn ack(&self, round_id: RoundId) -> TestResult {
        self.transport
            .send_client_message(
                &ClientMessage::Ack {
                    client_id: self.id.clone(),
                    round_id,
                },
                self.server_addr,
            )
            .await?;
        Ok(())
    }

    /// Submits a plain FedAvg-style update.
    pub async fn submit_update(
        &self,
        round_id: RoundId,
        parameters: Vec<f32>,
        sample_count: u64,
    ) -> TestResult {
        self.transport
            .send_client_message(
                &ClientMessage::Update {
                    client_id: self.id.clone(),
                    round_id,
                    parameters,
                    sample_count,
                    control_variate: None,
                    mask_tag: None,
                    loss: 0.5,
                },
                self.server_addr,
            )
            .await?;
        Ok(())
    }

    /// Waits for the next server message.
    pub async fn recv(&self) -> TestResult<ServerMessage> {
        let (msg, _) = timeout(RECV_TIMEOUT, self.transport.recv_server_message()).await??;
        Ok(msg)
    }

    /// Waits for a round announcement, skipping unrelated messages.
    pub async fn recv_broadcast(&self) -> TestResult<(RoundId, ModelVersion, Vec<f32>)> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let (msg, _) = timeout(remaining, self.transport.recv_server_message()).await??;
            if let ServerMessage::ModelBroadcast {
                round_id,
                model_version,
                parameters,
                ..
            } = msg
            {
                return Ok((round_id, model_version, parameters));
            }
        }
    }

    /// Waits for a round abort notification, skipping unrelated messages.
    pub async fn recv_abort(&self) -> TestResult<(RoundId, String)> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let (msg, _) = timeout(remaining, self.transport.recv_server_message()).await??;
            if let ServerMessage::RoundAbort { round_id, reason } = msg {
                return Ok((round_id, reason));
            }
        }
    }
}
