//! UDP control server for operator commands.
//!
//! A small line-oriented command protocol over UDP datagrams, used by the
//! `fedlinkcli` helper and by shell scripts via `socat`. Responses carry
//! JSON payloads rendered by the app task.
//!
//! # Protocol
//!
//! - Magic: 2 bytes, `FL`
//! - Version: 1 byte
//! - Type: 1 byte (Command, Result, Error)
//! - Payload length: 4 bytes (big-endian)
//! - Payload: UTF-8 string

use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Control protocol magic bytes.
pub const CTL_MAGIC: [u8; 2] = *b"FL";

/// Control protocol version.
pub const CTL_VERSION: u8 = 1;

/// Maximum control message buffer size.
pub const CTL_BUFFER_SIZE: usize = 16384;

/// Minimum control message length (magic + version + type + payload length).
pub const CTL_MIN_LENGTH: usize = 2 + 1 + 1 + 4;

/// Control message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtlMessageType {
    /// Empty/invalid message
    Empty = 0,
    /// Command request
    Command = 1,
    /// Success result
    Result = 2,
    /// Error response
    Error = 3,
}

impl From<u8> for CtlMessageType {
    fn from(value: u8) -> Self {
        match value {
            1 => CtlMessageType::Command,
            2 => CtlMessageType::Result,
            3 => CtlMessageType::Error,
            _ => CtlMessageType::Empty,
        }
    }
}

/// A control message with its peer address.
#[derive(Debug, Clone)]
pub struct CtlMessage {
    /// Message type
    pub msg_type: CtlMessageType,
    /// Command line or response payload
    pub value: String,
    /// Peer address (for responses)
    pub client_addr: Option<SocketAddr>,
}

impl CtlMessage {
    /// Creates a command request.
    pub fn command(value: String, client_addr: SocketAddr) -> Self {
        Self {
            msg_type: CtlMessageType::Command,
            value,
            client_addr: Some(client_addr),
        }
    }

    /// Creates a result response.
    pub fn result(value: String, client_addr: SocketAddr) -> Self {
        Self {
            msg_type: CtlMessageType::Result,
            value,
            client_addr: Some(client_addr),
        }
    }

    /// Creates an error response.
    pub fn error(value: String, client_addr: SocketAddr) -> Self {
        Self {
            msg_type: CtlMessageType::Error,
            value,
            client_addr: Some(client_addr),
        }
    }

    /// Encodes the message to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.value.as_bytes();
        let mut buffer = Vec::with_capacity(CTL_MIN_LENGTH + payload.len());
        buffer.extend_from_slice(&CTL_MAGIC);
        buffer.push(CTL_VERSION);
        buffer.push(self.msg_type as u8);
        buffer.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buffer.extend_from_slice(payload);
        buffer
    }

    /// Decodes a message from wire bytes.
    pub fn decode(data: &[u8], client_addr: SocketAddr) -> Option<Self> {
        if data.len() < CTL_MIN_LENGTH {
            return None;
        }
        if data[0..2] != CTL_MAGIC || data[2] != CTL_VERSION {
            return None;
        }

        let msg_type = CtlMessageType::from(data[3]);
        if msg_type == CtlMessageType::Empty {
            return None;
        }

        let payload_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if data.len() < CTL_MIN_LENGTH + payload_len {
            return None;
        }
        let value =
            String::from_utf8_lossy(&data[CTL_MIN_LENGTH..CTL_MIN_LENGTH + payload_len]).to_string();

        Some(Self {
            msg_type,
            value,
            client_addr: Some(client_addr),
        })
    }
}

/// Control server error types.
#[derive(Debug, thiserror::Error)]
pub enum CtlServerError {
    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid message
    #[error("Invalid message")]
    InvalidMessage,
}

/// Control server for receiving commands and sending responses.
pub struct CtlServer {
    socket: UdpSocket,
}

impl CtlServer {
    /// Creates a control server bound to the given address.
    ///
    /// Use port 0 for automatic port assignment.
    pub async fn new(bind_addr: SocketAddr) -> Result<Self, CtlServerError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self { socket })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, CtlServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Waits for one control message.
    pub async fn receive(&self) -> Result<CtlMessage, CtlServerError> {
        let mut buffer = [0u8; CTL_BUFFER_SIZE];
        let (size, addr) = self.socket.recv_from(&mut buffer).await?;
        if size < CTL_MIN_LENGTH || size >= CTL_BUFFER_SIZE {
            return Err(CtlServerError::InvalidMessage);
        }
        CtlMessage::decode(&buffer[..size], addr).ok_or(CtlServerError::InvalidMessage)
    }

    /// Tries to receive a control message without blocking.
    pub fn try_receive(&self) -> Result<Option<CtlMessage>, CtlServerError> {
        let mut buffer = [0u8; CTL_BUFFER_SIZE];
        match self.socket.try_recv_from(&mut buffer) {
            Ok((size, addr)) => {
                if size < CTL_MIN_LENGTH || size >= CTL_BUFFER_SIZE {
                    return Err(CtlServerError::InvalidMessage);
                }
                Ok(CtlMessage::decode(&buffer[..size], addr))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(CtlServerError::IoError(e)),
        }
    }

    /// Sends a control message to its destination address.
    pub async fn send(&self, msg: &CtlMessage) -> Result<(), CtlServerError> {
        let addr = msg.client_addr.ok_or_else(|| {
            CtlServerError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no destination address",
            ))
        })?;
        self.socket.send_to(&msg.encode(), addr).await?;
        Ok(())
    }

    /// Sends a result response.
    pub async fn send_result(
        &self,
        value: String,
        client_addr: SocketAddr,
    ) -> Result<(), CtlServerError> {
        self.send(&CtlMessage::result(value, client_addr)).await
    }

    /// Sends an error response.
    pub async fn send_error(
        &self,
        value: String,
        client_addr: SocketAddr,
    ) -> Result<(), CtlServerError> {
        self.send(&CtlMessage::error(value, client_addr)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 12345)
    }

    #[test]
    fn test_ctl_message_type_from_u8() {
        assert_eq!(CtlMessageType::from(0), CtlMessageType::Empty);
        assert_eq!(CtlMessageType::from(1), CtlMessageType::Command);
        assert_eq!(CtlMessageType::from(2), CtlMessageType::Result);
        assert_eq!(CtlMessageType::from(3), CtlMessageType::Error);
        assert_eq!(CtlMessageType::from(255), CtlMessageType::Empty);
    }

    #[test]
    fn test_ctl_message_encode_decode_roundtrip() {
        let original = CtlMessage::command("status".to_string(), test_addr());
        let encoded = original.encode();
        let decoded = CtlMessage::decode(&encoded, test_addr()).unwrap();

        assert_eq!(decoded.msg_type, CtlMessageType::Command);
        assert_eq!(decoded.value, "status");
    }

    #[test]
    fn test_ctl_message_decode_too_short() {
        let data = [0u8; 5];
        assert!(CtlMessage::decode(&data, test_addr()).is_none());
    }

    #[test]
    fn test_ctl_message_decode_wrong_magic() {
        let msg = CtlMessage::command("status".to_string(), test_addr());
        let mut encoded = msg.encode();
        encoded[0] = b'X';
        assert!(CtlMessage::decode(&encoded, test_addr()).is_none());
    }

    #[test]
    fn test_ctl_message_decode_wrong_version() {
        let msg = CtlMessage::command("status".to_string(), test_addr());
        let mut encoded = msg.encode();
        encoded[2] = 99;
        assert!(CtlMessage::decode(&encoded, test_addr()).is_none());
    }

    #[test]
    fn test_ctl_message_decode_invalid_type() {
        let msg = CtlMessage::command("status".to_string(), test_addr());
        let mut encoded = msg.encode();
        encoded[3] = 0;
        assert!(CtlMessage::decode(&encoded, test_addr()).is_none());
    }

    #[test]
    fn test_ctl_message_empty_payload() {
        let msg = CtlMessage::command(String::new(), test_addr());
        let decoded = CtlMessage::decode(&msg.encode(), test_addr()).unwrap();
        assert!(decoded.value.is_empty());
    }

    #[tokio::test]
    async fn test_ctl_server_send_receive() {
        let server = CtlServer::new("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let cmd = CtlMessage::command("clients".to_string(), client_addr);
        client.send_to(&cmd.encode(), server_addr).await.unwrap();

        let received = server.receive().await.unwrap();
        assert_eq!(received.msg_type, CtlMessageType::Command);
        assert_eq!(received.value, "clients");

        server
            .send_result("[]".to_string(), client_addr)
            .await
            .unwrap();

        let mut buffer = [0u8; CTL_BUFFER_SIZE];
        let (size, _) = client.recv_from(&mut buffer).await.unwrap();
        let response = CtlMessage::decode(&buffer[..size], server_addr).unwrap();
        assert_eq!(response.msg_type, CtlMessageType::Result);
        assert_eq!(response.value, "[]");
    }
}
