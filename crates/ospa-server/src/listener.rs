use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ospa_core::MAX_PDU_SIZE;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::coordinator::{Datagram, Dispatch};
use crate::metrics::ServerMetrics;

/// Sends replies on behalf of request handlers.
#[async_trait]
pub trait UdpResponder: Send + Sync + std::fmt::Debug {
    async fn send_to(&self, data: &[u8], peer: SocketAddr) -> io::Result<()>;
}

/// Replies through the listener's own socket.
#[derive(Debug, Clone)]
pub struct SocketResponder {
    socket: Arc<UdpSocket>,
    metrics: ServerMetrics,
}

impl SocketResponder {
    pub fn new(socket: Arc<UdpSocket>, metrics: ServerMetrics) -> Self {
        Self { socket, metrics }
    }
}

#[async_trait]
impl UdpResponder for SocketResponder {
    async fn send_to(&self, data: &[u8], peer: SocketAddr) -> io::Result<()> {
        let sent = self.socket.send_to(data, peer).await?;
        if sent != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {sent} of {} bytes", data.len()),
            ));
        }
        self.metrics.datagram_sent();
        Ok(())
    }
}

/// Owns the server socket and feeds every datagram to a [`Dispatch`].
#[derive(Debug)]
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    metrics: ServerMetrics,
}

impl UdpListener {
    pub async fn bind(addr: SocketAddr, metrics: ServerMetrics) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            metrics,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn responder(&self) -> SocketResponder {
        SocketResponder::new(Arc::clone(&self.socket), self.metrics.clone())
    }

    /// Receive until `shutdown` changes or its sender is dropped. A full
    /// worker pool blocks the loop, which pushes back on the kernel socket
    /// buffer.
    pub async fn run(&self, dispatch: &Dispatch, mut shutdown: watch::Receiver<bool>) {
        // One spare byte so oversized datagrams reach the pipeline as such.
        let mut buf = vec![0u8; MAX_PDU_SIZE + 1];
        info!(
            target: "openspa::server",
            addr = ?self.socket.local_addr().ok(),
            "udp listener started"
        );

        loop {
            let (len, peer) = tokio::select! {
                _ = shutdown.changed() => break,
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok(received) => received,
                    Err(err) => {
                        debug!(target: "openspa::server", error = %err, "udp receive failed");
                        continue;
                    }
                },
            };

            self.metrics.datagram_received();
            let datagram = Datagram {
                data: buf[..len].to_vec(),
                peer,
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                result = dispatch.dispatch(datagram) => {
                    if let Err(err) = result {
                        warn!(target: "openspa::server", error = %err, "dropping datagram");
                        break;
                    }
                }
            }
        }
        info!(target: "openspa::server", "udp listener stopped");
    }
}
