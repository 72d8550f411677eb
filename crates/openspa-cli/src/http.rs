//! Plain HTTP control surface next to the UDP server: a JSON banner on `/`
//! and the prometheus exposition on `/metrics`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpServer {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    addr: SocketAddr,
}

impl HttpServer {
    pub async fn spawn(addr: SocketAddr, registry: Arc<Registry>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind http listener at {addr}"))?;
        let bound = listener.local_addr()?;
        debug!(target: "openspa::http", requested = %addr, bound = %bound, "http endpoint bound");
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!(target: "openspa::http", "http endpoint received shutdown signal");
                        break;
                    }
                    accept = listener.accept() => match accept {
                        Ok((mut socket, peer)) => {
                            let registry = Arc::clone(&registry);
                            tokio::spawn(async move {
                                if let Err(err) = serve(&mut socket, &registry).await {
                                    warn!(target: "openspa::http", error = %err, peer = %peer, "failed to serve http request");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(target: "openspa::http", error = %err, "http accept failed");
                            time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        });

        Ok(Self {
            shutdown: Some(shutdown_tx),
            join: Some(join),
            addr: bound,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.join.take() {
            time::timeout(SHUTDOWN_TIMEOUT, handle)
                .await
                .map_err(|_| anyhow!("http server did not stop within {SHUTDOWN_TIMEOUT:?}"))?
                .context("http server task failed")?;
        }
        Ok(())
    }
}

struct Reply {
    status: &'static str,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Reply {
    fn json(status: &'static str, value: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
        }
    }
}

async fn serve(socket: &mut TcpStream, registry: &Registry) -> Result<()> {
    let mut buf = [0u8; 1024];
    let len = time::timeout(READ_TIMEOUT, socket.read(&mut buf))
        .await
        .map_err(|_| anyhow!("read timed out"))??;
    let head = String::from_utf8_lossy(&buf[..len]);
    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default();
    let path = request_line.next().unwrap_or_default();

    let reply = route(method, path, registry)?;
    let header = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        reply.status,
        reply.content_type,
        reply.body.len()
    );
    socket.write_all(header.as_bytes()).await?;
    socket.write_all(&reply.body).await?;
    socket.shutdown().await?;
    Ok(())
}

fn route(method: &str, path: &str, registry: &Registry) -> Result<Reply> {
    let path = path.split('?').next().unwrap_or_default();
    Ok(match (method, path) {
        ("GET", "/") => Reply::json(
            "200 OK",
            json!({ "msg": "OpenSPA Server", "version": env!("CARGO_PKG_VERSION") }),
        ),
        ("GET", "/metrics") => {
            static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);
            let mut body = Vec::new();
            ENCODER
                .encode(&registry.gather(), &mut body)
                .map_err(|err| anyhow!("failed to encode metrics: {err}"))?;
            Reply {
                status: "200 OK",
                content_type: "text/plain; version=0.0.4",
                body,
            }
        }
        _ => Reply::json("404 Not Found", json!({ "error": "not found" })),
    })
}

#[cfg(test)]
mod tests {
    use ospa_server::ServerMetrics;

    use super::*;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
            .await
            .expect("write request");
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.expect("read response");
        String::from_utf8_lossy(&buf).into_owned()
    }

    async fn spawn() -> (HttpServer, ServerMetrics) {
        let registry = Arc::new(Registry::new());
        let metrics = ServerMetrics::register(&registry).expect("metrics");
        let server = HttpServer::spawn("127.0.0.1:0".parse().expect("addr"), registry)
            .await
            .expect("spawn");
        (server, metrics)
    }

    #[tokio::test]
    async fn root_serves_banner() {
        let (server, _metrics) = spawn().await;
        let response = get(server.local_addr(), "/").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Content-Type: application/json"));
        let body = response.split("\r\n\r\n").nth(1).expect("body");
        let value: serde_json::Value = serde_json::from_str(body).expect("json");
        assert_eq!(value["msg"], "OpenSPA Server");
        assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
        server.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn metrics_expose_server_registry() {
        let (server, metrics) = spawn().await;
        metrics.datagram_received();
        metrics.dropped("replay-detected");

        let response = get(server.local_addr(), "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("openspa_udp_server_rx 1"));
        assert!(response.contains("reason=\"replay-detected\""));
        server.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn unknown_path_is_json_404() {
        let (server, _metrics) = spawn().await;
        let response = get(server.local_addr(), "/admin").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));
        assert!(response.ends_with(r#"{"error":"not found"}"#));

        let response = get(server.local_addr(), "/?probe=1").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        server.shutdown().await.expect("shutdown");
    }
}
