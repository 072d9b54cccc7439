//! Transport task
//!
//! Owns the UDP socket for client traffic. Inbound datagrams are decoded
//! and forwarded to the coordinator task; outbound deliveries arrive as
//! `TransportMessage`s addressed by client id and are resolved through an
//! address table learned from inbound traffic. Malformed datagrams are
//! dropped with a warning; the socket keeps receiving.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fedlink_common::transport::UdpTransport;
use fedlink_common::types::{ClientId, ClientMessage, ServerMessage};
use fedlink_common::Error;

use crate::tasks::{CoordinatorMessage, ServerTaskBase, Task, TaskMessage, TransportMessage};

/// The task bridging the UDP socket and the coordinator.
pub struct TransportTask {
    task_base: ServerTaskBase,
    transport: UdpTransport,
    /// Last known source address per client, refreshed on every inbound
    /// message so clients surviving a NAT rebind stay reachable
    addresses: HashMap<ClientId, SocketAddr>,
}

fn sender_of(message: &ClientMessage) -> &ClientId {
    match message {
        ClientMessage::Register { client_id, .. }
        | ClientMessage::Heartbeat { client_id }
        | ClientMessage::Ack { client_id, .. }
        | ClientMessage::Update { client_id, .. } => client_id,
    }
}

impl TransportTask {
    /// Binds the UDP socket at the configured listen address.
    pub async fn new(task_base: ServerTaskBase) -> Result<Self, Error> {
        let addr = SocketAddr::new(task_base.config.listen_ip, task_base.config.listen_port);
        let transport = UdpTransport::bind(addr).await?;
        info!("listening for clients on {}", transport.local_addr()?);
        Ok(Self {
            task_base,
            transport,
            addresses: HashMap::new(),
        })
    }

    /// Local address of the bound socket.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.transport.local_addr()
    }

    async fn handle_inbound(&mut self, message: ClientMessage, src: SocketAddr) {
        self.addresses.insert(sender_of(&message).clone(), src);
        if let Err(e) = self
            .task_base
            .coordinator_tx
            .send(CoordinatorMessage::FromClient(message))
            .await
        {
            warn!("failed to forward client message: {}", e);
        }
    }

    async fn deliver(&self, client_id: &ClientId, message: &ServerMessage) {
        match self.addresses.get(client_id) {
            Some(addr) => {
                if let Err(e) = self.transport.send_server_message(message, *addr).await {
                    warn!("send to {} at {} failed: {}", client_id, addr, e);
                }
            }
            None => {
                debug!("no known address for {}, dropping message", client_id);
            }
        }
    }

    async fn handle_outbound(&mut self, message: TransportMessage) {
        match message {
            TransportMessage::SendToClient { client_id, message } => {
                self.deliver(&client_id, &message).await;
            }
            TransportMessage::Broadcast { targets, message } => {
                for client_id in &targets {
                    self.deliver(client_id, &message).await;
                }
            }
            TransportMessage::SendToAddr { addr, message } => {
                if let Err(e) = self.transport.send_server_message(&message, addr).await {
                    warn!("send to {} failed: {}", addr, e);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Task for TransportTask {
    type Message = TransportMessage;

    async fn run(&mut self, mut rx: mpsc::Receiver<TaskMessage<Self::Message>>) {
        info!("transport task starting");

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(TaskMessage::Message(message)) => {
                            self.handle_outbound(message).await;
                        }
                        Some(TaskMessage::Shutdown) | None => {
                            info!("transport task shutting down");
                            break;
                        }
                    }
                }
                inbound = self.transport.recv_client_message() => {
                    match inbound {
                        Ok((message, src)) => {
                            self.handle_inbound(message, src).await;
                        }
                        Err(Error::Codec(e)) => {
                            warn!("dropping malformed datagram: {}", e);
                        }
                        Err(e) => {
                            warn!("socket receive error: {}", e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::DEFAULT_CHANNEL_CAPACITY;
    use fedlink_common::config::ServerConfig;
    use fedlink_common::types::{ClientCapabilities, ModelVersion, RoundId};
    use std::time::Duration;

    fn test_config() -> ServerConfig {
        let yaml = r#"
listen_ip: 127.0.0.1
listen_port: 0
model_dimension: 4
round:
  min_clients: 1
  max_clients: 4
  rounds: 1
  round_deadline_secs: 5
"#;
        serde_yaml::from_str(yaml).expect("valid config")
    }

    #[tokio::test]
    async fn test_inbound_forwarded_to_coordinator() {
        let (base, _app_rx, mut coordinator_rx, transport_rx) =
            ServerTaskBase::new(test_config(), DEFAULT_CHANNEL_CAPACITY);
        let mut task = TransportTask::new(base).await.expect("bind");
        let server_addr = task.local_addr().expect("addr");

        tokio::spawn(async move { task.run(transport_rx).await });

        let client = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind");
        client
            .send_client_message(
                &ClientMessage::Heartbeat {
                    client_id: ClientId::new("c1"),
                },
                server_addr,
            )
            .await
            .expect("send");

        let forwarded = tokio::time::timeout(Duration::from_secs(1), coordinator_rx.recv())
            .await
            .expect("forwarded message expected")
            .expect("channel open");
        match forwarded {
            TaskMessage::Message(CoordinatorMessage::FromClient(ClientMessage::Heartbeat {
                client_id,
            })) => {
                assert_eq!(client_id, ClientId::new("c1"));
            }
            other => panic!("expected forwarded heartbeat, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_outbound_reaches_learned_address() {
        let (base, _app_rx, mut coordinator_rx, transport_rx) =
            ServerTaskBase::new(test_config(), DEFAULT_CHANNEL_CAPACITY);
        let transport_tx = base.transport_tx.clone();
        let mut task = TransportTask::new(base).await.expect("bind");
        let server_addr = task.local_addr().expect("addr");

        tokio::spawn(async move { task.run(transport_rx).await });

        let client = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind");
        client
            .send_client_message(
                &ClientMessage::Register {
                    client_id: ClientId::new("c1"),
                    capabilities: ClientCapabilities {
                        model_dimension: 4,
                        schema_version: 1,
                        protocol_version: 1,
                        declared_samples: 10,
                    },
                },
                server_addr,
            )
            .await
            .expect("send");
        // Wait for the address table entry.
        let _ = tokio::time::timeout(Duration::from_secs(1), coordinator_rx.recv())
            .await
            .expect("registration forwarded");

        transport_tx
            .send(TransportMessage::SendToClient {
                client_id: ClientId::new("c1"),
                message: ServerMessage::RegisterAccepted {
                    model_version: ModelVersion::new(0),
                },
            })
            .await
            .expect("queue send");

        let (reply, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_server_message())
            .await
            .expect("reply expected")
            .expect("decode");
        assert!(matches!(reply, ServerMessage::RegisterAccepted { .. }));
    }

    #[tokio::test]
    async fn test_malformed_datagram_does_not_kill_the_loop() {
        let (base, _app_rx, mut coordinator_rx, transport_rx) =
            ServerTaskBase::new(test_config(), DEFAULT_CHANNEL_CAPACITY);
        let mut task = TransportTask::new(base).await.expect("bind");
        let server_addr = task.local_addr().expect("addr");

        tokio::spawn(async move { task.run(transport_rx).await });

        let client = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind");
        client.send_to(b"garbage", server_addr).await.expect("send");
        client
            .send_client_message(
                &ClientMessage::Ack {
                    client_id: ClientId::new("c1"),
                    round_id: RoundId::new(1),
                },
                server_addr,
            )
            .await
            .expect("send");

        let forwarded = tokio::time::timeout(Duration::from_secs(1), coordinator_rx.recv())
            .await
            .expect("ack expected after dropped garbage")
            .expect("channel open");
        assert!(matches!(
            forwarded,
            TaskMessage::Message(CoordinatorMessage::FromClient(ClientMessage::Ack { .. }))
        ));
    }
}
