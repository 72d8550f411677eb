use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use ospa_core::MAX_PDU_SIZE;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("udp: {0}")]
    Io(#[from] io::Error),
    #[error("response came from {got}, expected {expected}")]
    SourceMismatch { expected: SocketAddr, got: SocketAddr },
}

/// One request/response exchange with a server.
///
/// Tests substitute an implementation that never touches the network.
#[async_trait]
pub trait UdpSender: Send + Sync + std::fmt::Debug {
    async fn send_request(
        &self,
        request: &[u8],
        server: SocketAddr,
        timeout: Duration,
    ) -> Result<Vec<u8>, SendError>;
}

/// Sends from a fresh ephemeral socket per attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpSend;

#[async_trait]
impl UdpSender for UdpSend {
    async fn send_request(
        &self,
        request: &[u8],
        server: SocketAddr,
        timeout: Duration,
    ) -> Result<Vec<u8>, SendError> {
        let local: SocketAddr = if server.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.send_to(request, server).await?;

        let mut buf = vec![0u8; MAX_PDU_SIZE];
        let (len, from) = time::timeout(timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| SendError::Timeout(timeout))??;
        if from != server {
            return Err(SendError::SourceMismatch {
                expected: server,
                got: from,
            });
        }
        buf.truncate(len);
        Ok(buf)
    }
}
