use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ospa_core::fields::random_transaction_id;
use ospa_core::{
    generate_proof, AdkError, CipherSuite, FieldError, Grant, InternetProtocol, PduError, Request,
    RequestData, Response,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info};

use crate::sender::{SendError, UdpSend, UdpSender};

pub const DEFAULT_RETRY_COUNT: usize = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("pdu: {0}")]
    Pdu(#[from] PduError),
    #[error("response carries no usable grant: {0}")]
    Grant(#[source] FieldError),
    #[error("send request: {0}")]
    Send(#[from] SendError),
    #[error("no response after {attempts} attempt(s)")]
    NoResponse { attempts: usize },
    #[error("transaction id mismatch in response ({expected} != {got})")]
    TransactionMismatch { expected: u8, got: u8 },
    #[error("adk proof: {0}")]
    Adk(#[from] AdkError),
    #[error("resolve server host {host}: {reason}")]
    Resolve { host: String, reason: String },
}

/// What the client asks the server to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub client_uuid: String,
    pub client_ip: IpAddr,
    pub target_protocol: InternetProtocol,
    pub target_ip: IpAddr,
    pub target_port_start: u16,
    pub target_port_end: u16,
}

impl AccessRequest {
    fn request_data(&self, transaction_id: u8) -> RequestData {
        RequestData {
            transaction_id,
            client_uuid: self.client_uuid.clone(),
            client_ip: self.client_ip,
            target_protocol: self.target_protocol,
            target_ip: self.target_ip,
            target_port_start: self.target_port_start,
            target_port_end: self.target_port_end,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Number of send attempts; zero fails without sending.
    pub retry_count: usize,
    /// How long each attempt waits for the response.
    pub timeout: Duration,
    pub adk_secret: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            timeout: DEFAULT_TIMEOUT,
            adk_secret: None,
        }
    }
}

impl ClientConfig {
    pub fn with_retry_count(mut self, retry_count: usize) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_adk_secret(mut self, secret: impl Into<String>) -> Self {
        self.adk_secret = Some(secret.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    cipher: Arc<dyn CipherSuite>,
    sender: Arc<dyn UdpSender>,
    config: ClientConfig,
}

impl Client {
    pub fn new(cipher: Arc<dyn CipherSuite>, config: ClientConfig) -> Self {
        Self {
            cipher,
            sender: Arc::new(UdpSend),
            config,
        }
    }

    pub fn with_sender(mut self, sender: Arc<dyn UdpSender>) -> Self {
        self.sender = sender;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send one access request and return what the server granted.
    ///
    /// Timeouts are retried up to the configured count; any other transport
    /// error aborts immediately.
    pub async fn request(
        &self,
        server: SocketAddr,
        access: &AccessRequest,
    ) -> Result<Grant, ClientError> {
        let transaction_id = random_transaction_id();
        let mut request = Request::new(&access.request_data(transaction_id), Arc::clone(&self.cipher))?;
        if let Some(secret) = self.config.adk_secret.as_deref() {
            request.set_adk_proof(generate_proof(secret, SystemTime::now())?);
        }
        let bytes = request.marshal()?;

        debug!(
            target: "openspa::client",
            server = %server,
            target_ip = %access.target_ip,
            protocol = %access.target_protocol,
            port_start = access.target_port_start,
            port_end = access.target_port_end,
            "sending request"
        );

        let mut reply = None;
        for attempt in 0..self.config.retry_count {
            if attempt > 0 {
                info!(target: "openspa::client", attempt = attempt + 1, "retrying request");
            }
            match self
                .sender
                .send_request(&bytes, server, self.config.timeout)
                .await
            {
                Ok(bytes) => {
                    reply = Some(bytes);
                    break;
                }
                Err(SendError::Timeout(timeout)) => {
                    info!(target: "openspa::client", timeout = ?timeout, "request timed out");
                }
                Err(err) => return Err(err.into()),
            }
        }
        let reply = reply.ok_or(ClientError::NoResponse {
            attempts: self.config.retry_count,
        })?;

        let response = Response::unmarshal(&reply, Arc::clone(&self.cipher))?;
        if response.header.transaction_id != transaction_id {
            return Err(ClientError::TransactionMismatch {
                expected: transaction_id,
                got: response.header.transaction_id,
            });
        }
        let grant = response.grant().map_err(ClientError::Grant)?;

        info!(
            target: "openspa::client",
            target_ip = %grant.target_ip,
            protocol = %grant.target_protocol,
            port_start = grant.target_port_start,
            port_end = grant.target_port_end,
            duration_secs = grant.duration.as_secs(),
            "access granted"
        );
        Ok(grant)
    }

    /// Repeat the request at half of each granted duration until `stop`
    /// flips or a request fails.
    pub async fn auto_mode(
        &self,
        server: SocketAddr,
        access: &AccessRequest,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        loop {
            if *stop.borrow() {
                return Ok(());
            }
            let grant = self.request(server, access).await?;
            let wait = grant.duration / 2;
            debug!(target: "openspa::client", wait = ?wait, "auto mode sleeping");
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                }
                _ = time::sleep(wait) => {}
            }
        }
    }
}

/// Resolve `host:port`, preferring the first address returned.
pub async fn resolve_server(host: &str, port: u16) -> Result<SocketAddr, ClientError> {
    let resolve_err = |reason: String| ClientError::Resolve {
        host: host.to_string(),
        reason,
    };
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|err| resolve_err(err.to_string()))?;
    addrs
        .next()
        .ok_or_else(|| resolve_err("no addresses".to_string()))
}
