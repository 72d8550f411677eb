use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ospa_core::fields::is_ipv6;
use ospa_core::{FirewallRequest, DURATION_MAX_SECS};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::command::{CommandError, CommandExecutor};

/// Grant length of the `none` backend.
pub const ALLOW_ALL_DURATION: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("authorization command: {0}")]
    Command(#[from] CommandError),
    #[error("authorization json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("authorized duration {0}s out of range")]
    DurationOutOfRange(i64),
}

/// Decides how long a client may access the requested target.
/// `Duration::ZERO` denies the request.
#[async_trait]
pub trait AuthorizationStrategy: Send + Sync + std::fmt::Debug {
    async fn request_authorization(
        &self,
        request: &FirewallRequest,
    ) -> Result<Duration, AuthorizationError>;
}

/// Grants the same duration to every authenticated client.
#[derive(Debug, Clone, Copy)]
pub struct SimpleAuthorization {
    duration: Duration,
}

impl SimpleAuthorization {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl AuthorizationStrategy for SimpleAuthorization {
    async fn request_authorization(
        &self,
        _request: &FirewallRequest,
    ) -> Result<Duration, AuthorizationError> {
        Ok(self.duration)
    }
}

/// Used for load measurements only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthorization;

#[async_trait]
impl AuthorizationStrategy for AllowAllAuthorization {
    async fn request_authorization(
        &self,
        _request: &FirewallRequest,
    ) -> Result<Duration, AuthorizationError> {
        Ok(ALLOW_ALL_DURATION)
    }
}

/// Asks an external program. The request is written to its stdin as JSON and
/// `{"duration": <seconds>}` is expected on stdout.
#[derive(Debug)]
pub struct CommandAuthorization {
    cmd: String,
    exec: Arc<dyn CommandExecutor>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeInput<'a> {
    #[serde(rename = "clientUUID")]
    client_uuid: &'a str,
    #[serde(rename = "ipIsIPv6")]
    ip_is_ipv6: bool,
    #[serde(rename = "clientIP")]
    client_ip: IpAddr,
    #[serde(rename = "targetIP")]
    target_ip: IpAddr,
    target_protocol: &'static str,
    target_port_start: u16,
    target_port_end: u16,
}

#[derive(Debug, Deserialize)]
struct AuthorizeOutput {
    duration: i64,
}

impl CommandAuthorization {
    pub fn new(cmd: impl Into<String>, exec: Arc<dyn CommandExecutor>) -> Self {
        Self {
            cmd: cmd.into(),
            exec,
        }
    }
}

#[async_trait]
impl AuthorizationStrategy for CommandAuthorization {
    async fn request_authorization(
        &self,
        request: &FirewallRequest,
    ) -> Result<Duration, AuthorizationError> {
        let input = AuthorizeInput {
            client_uuid: &request.client_uuid,
            ip_is_ipv6: is_ipv6(request.target_ip),
            client_ip: request.client_ip,
            target_ip: request.target_ip,
            target_protocol: request.target_protocol.as_str(),
            target_port_start: request.target_port_start,
            target_port_end: request.target_port_end,
        };
        let stdin = serde_json::to_vec(&input)?;
        let stdout = self.exec.execute(&self.cmd, Some(&stdin), &[]).await?;
        debug!(
            target: "openspa::authorization",
            output = %String::from_utf8_lossy(&stdout),
            "authorization command output"
        );

        let out: AuthorizeOutput = serde_json::from_slice(&stdout)?;
        if !(0..=DURATION_MAX_SECS as i64).contains(&out.duration) {
            return Err(AuthorizationError::DurationOutOfRange(out.duration));
        }
        Ok(Duration::from_secs(out.duration as u64))
    }
}
