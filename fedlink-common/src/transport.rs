//! Network transport for client/server messaging
//!
//! Client registration, heartbeats and updates arrive as JSON datagrams
//! over UDP; broadcasts and notifications go back the same way. Delivery
//! ordering is not guaranteed and the engine tolerates out-of-order
//! arrival, so a datagram transport is sufficient.

use std::net::SocketAddr;
use tokio::net::UdpSocket;

use crate::types::{ClientMessage, ServerMessage};
use crate::Error;

/// Maximum UDP datagram size accepted on the wire.
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Async UDP socket wrapper carrying JSON-encoded engine messages.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds a UDP socket to the specified address.
    ///
    /// Use port 0 for automatic port assignment.
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    /// Sends raw bytes to the specified destination address.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), Error> {
        self.socket.send_to(data, addr).await?;
        Ok(())
    }

    /// Receives raw bytes from the socket along with the source address.
    pub async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr), Error> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((buf, addr))
    }

    /// Encodes and sends a server message to a client address.
    pub async fn send_server_message(
        &self,
        msg: &ServerMessage,
        addr: SocketAddr,
    ) -> Result<(), Error> {
        let bytes = serde_json::to_vec(msg)?;
        self.send_to(&bytes, addr).await
    }

    /// Encodes and sends a client message (used by test harnesses and the
    /// reference client).
    pub async fn send_client_message(
        &self,
        msg: &ClientMessage,
        addr: SocketAddr,
    ) -> Result<(), Error> {
        let bytes = serde_json::to_vec(msg)?;
        self.send_to(&bytes, addr).await
    }

    /// Receives and decodes one client message.
    ///
    /// Malformed datagrams surface as `Error::Codec`; callers drop them and
    /// keep receiving.
    pub async fn recv_client_message(&self) -> Result<(ClientMessage, SocketAddr), Error> {
        let (bytes, addr) = self.recv_from().await?;
        let msg = serde_json::from_slice(&bytes)?;
        Ok((msg, addr))
    }

    /// Receives and decodes one server message (client side).
    pub async fn recv_server_message(&self) -> Result<(ServerMessage, SocketAddr), Error> {
        let (bytes, addr) = self.recv_from().await?;
        let msg = serde_json::from_slice(&bytes)?;
        Ok((msg, addr))
    }

    /// Returns the local address this socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }
}
