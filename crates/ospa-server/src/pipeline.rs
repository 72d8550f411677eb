//! Per-datagram request processing.
//!
//! Every failure drops the request silently: a client without valid
//! credentials must not be able to tell that a server is listening.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ospa_core::{
    body, AdkProver, CipherError, CipherSuite, FieldError, FirewallRequest, HeaderError,
    PduError, Request, Response, ResponseData, TlvError, DURATION_MAX_SECS, HEADER_LEN,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::authorization::{AuthorizationError, AuthorizationStrategy};
use crate::coordinator::{Datagram, DatagramHandler};
use crate::firewall::{FirewallRule, RuleManager, RuleManagerError, RuleMetadata};
use crate::listener::UdpResponder;
use crate::metrics::ServerMetrics;
use crate::replay::{ReplayCache, ReplayStatus, DEFAULT_FRESHNESS};

/// Why a request was dropped without a response.
#[derive(Debug, Error)]
pub enum DropReason {
    #[error("adk proof mismatch")]
    AdkProofMismatch,
    #[error("pdu too large")]
    PduTooLarge,
    #[error("cipher suite required")]
    CipherSuiteRequired,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("no public key for client: {0}")]
    UnknownClient(String),
    #[error("protocol violation: {0}")]
    ProtocolSpecViolation(String),
    #[error("missing entry: {0}")]
    MissingEntry(String),
    #[error("bad input: {0}")]
    BadInput(String),
    #[error("invalid bytes: {0}")]
    InvalidBytes(String),
    #[error("replayed request")]
    ReplayDetected,
    #[error("timestamp {skew_secs}s away from server clock")]
    StaleTimestamp { skew_secs: i64 },
    #[error("authorization denied")]
    AuthorizationDenied,
    #[error("authorization backend: {0}")]
    AuthorizationError(#[from] AuthorizationError),
    #[error("firewall: {0}")]
    FirewallBackendFailure(#[from] RuleManagerError),
    #[error("response encode: {0}")]
    ResponseEncodeFailure(#[source] PduError),
    #[error("response send: {0}")]
    SendFailure(#[source] std::io::Error),
}

impl DropReason {
    /// Metric label for the drop counter.
    pub fn label(&self) -> &'static str {
        match self {
            DropReason::AdkProofMismatch => "adk-proof-mismatch",
            DropReason::PduTooLarge => "pdu-too-large",
            DropReason::CipherSuiteRequired => "cipher-suite-required",
            DropReason::SignatureInvalid => "signature-invalid",
            DropReason::DecryptFailed => "decrypt-failed",
            DropReason::UnknownClient(_) => "unknown-client",
            DropReason::ProtocolSpecViolation(_) => "protocol-spec-violation",
            DropReason::MissingEntry(_) => "missing-entry",
            DropReason::BadInput(_) => "bad-input",
            DropReason::InvalidBytes(_) => "invalid-bytes",
            DropReason::ReplayDetected => "replay-detected",
            DropReason::StaleTimestamp { .. } => "stale-timestamp",
            DropReason::AuthorizationDenied => "authorization-denied",
            DropReason::AuthorizationError(_) => "authorization-error",
            DropReason::FirewallBackendFailure(_) => "firewall-backend-failure",
            DropReason::ResponseEncodeFailure(_) => "response-encode-failure",
            DropReason::SendFailure(_) => "send-failure",
        }
    }
}

impl From<FieldError> for DropReason {
    fn from(err: FieldError) -> Self {
        match err {
            FieldError::InvalidBytes => DropReason::InvalidBytes(err.to_string()),
            FieldError::MissingEntry(what) => DropReason::MissingEntry(what.to_string()),
            FieldError::BadInput(what) => DropReason::BadInput(what.to_string()),
            FieldError::ViolationOfProtocolSpec(what) => {
                DropReason::ProtocolSpecViolation(what.to_string())
            }
        }
    }
}

impl From<CipherError> for DropReason {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::SignatureInvalid => DropReason::SignatureInvalid,
            CipherError::DecryptFailed | CipherError::InvalidSessionKey(_) => {
                DropReason::DecryptFailed
            }
            CipherError::MissingEntry(what) => DropReason::MissingEntry(what.to_string()),
            CipherError::KeyResolution(reason) => DropReason::UnknownClient(reason),
            CipherError::Tlv(tlv) => DropReason::InvalidBytes(tlv.to_string()),
            other => DropReason::ProtocolSpecViolation(other.to_string()),
        }
    }
}

impl From<PduError> for DropReason {
    fn from(err: PduError) -> Self {
        match err {
            PduError::TooLarge(_) => DropReason::PduTooLarge,
            PduError::CipherSuiteRequired => DropReason::CipherSuiteRequired,
            PduError::Cipher(cipher) => cipher.into(),
            PduError::Field(field) => field.into(),
            PduError::TooShort(_)
            | PduError::EmptyBody
            | PduError::Tlv(_)
            | PduError::Header(HeaderError::TooShort(_)) => DropReason::InvalidBytes(err.to_string()),
            PduError::CipherSuiteMismatch { .. }
            | PduError::UnexpectedType(_)
            | PduError::Header(HeaderError::UnsupportedVersion(_)) => {
                DropReason::ProtocolSpecViolation(err.to_string())
            }
        }
    }
}

impl From<TlvError> for DropReason {
    fn from(err: TlvError) -> Self {
        DropReason::InvalidBytes(err.to_string())
    }
}

/// What a successfully processed request produced.
#[derive(Debug, Clone)]
pub struct Granted {
    pub reply: Vec<u8>,
    pub rule: FirewallRule,
    pub duration: Duration,
}

/// Unmarshal, replay check, freshness, authorization, firewall, response.
pub struct RequestPipeline {
    cipher: Arc<dyn CipherSuite>,
    authorization: Arc<dyn AuthorizationStrategy>,
    rules: Arc<RuleManager>,
    replay: ReplayCache,
    freshness: Duration,
    adk: Option<Arc<AdkProver>>,
    metrics: ServerMetrics,
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("cipher", &self.cipher.id())
            .field("authorization", &self.authorization)
            .field("freshness", &self.freshness)
            .field("adk", &self.adk.is_some())
            .finish_non_exhaustive()
    }
}

impl RequestPipeline {
    pub fn new(
        cipher: Arc<dyn CipherSuite>,
        authorization: Arc<dyn AuthorizationStrategy>,
        rules: Arc<RuleManager>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            cipher,
            authorization,
            rules,
            replay: ReplayCache::new(DEFAULT_FRESHNESS),
            freshness: DEFAULT_FRESHNESS,
            adk: None,
            metrics,
        }
    }

    /// Accepted clock skew; replayed datagrams are remembered for as long.
    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self.replay = ReplayCache::new(freshness);
        self
    }

    /// Require a valid ADK proof in the header before any decryption.
    pub fn with_adk(mut self, prover: Arc<AdkProver>) -> Self {
        self.adk = Some(prover);
        self
    }

    pub fn replay_cache(&self) -> &ReplayCache {
        &self.replay
    }

    fn check_adk(&self, data: &[u8]) -> Result<(), DropReason> {
        let Some(prover) = self.adk.as_ref() else {
            return Ok(());
        };
        if data.len() < HEADER_LEN {
            return Err(DropReason::InvalidBytes(format!("{} byte datagram", data.len())));
        }
        let proof = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        prover
            .valid(proof)
            .map_err(|_| DropReason::AdkProofMismatch)
    }

    fn check_freshness(&self, request: &Request) -> Result<(), DropReason> {
        let timestamp = body::timestamp(&request.body)?;
        let skew_secs = (Utc::now() - timestamp).num_seconds();
        if skew_secs.unsigned_abs() > self.freshness.as_secs() {
            return Err(DropReason::StaleTimestamp { skew_secs });
        }
        Ok(())
    }

    async fn authorize(&self, request: &FirewallRequest) -> Result<Duration, DropReason> {
        match self.authorization.request_authorization(request).await {
            Ok(duration) if duration.as_secs() == 0 => {
                self.metrics.authorization("deny");
                info!(
                    target: "openspa::pipeline",
                    client_uuid = %request.client_uuid,
                    client_ip = %request.client_ip,
                    "request not authorized"
                );
                Err(DropReason::AuthorizationDenied)
            }
            Ok(duration) if duration.as_secs() > DURATION_MAX_SECS => {
                self.metrics.authorization("error");
                Err(DropReason::BadInput(format!(
                    "authorized duration {}s exceeds the protocol limit",
                    duration.as_secs()
                )))
            }
            Ok(duration) => {
                self.metrics.authorization("grant");
                Ok(Duration::from_secs(duration.as_secs()))
            }
            Err(err) => {
                self.metrics.authorization("error");
                Err(err.into())
            }
        }
    }

    /// Run one datagram through the pipeline and produce the encoded reply.
    pub async fn process(&self, data: &[u8]) -> Result<Granted, DropReason> {
        self.metrics.stage("received");
        self.check_adk(data)?;

        let request = Request::unmarshal(data, Arc::clone(&self.cipher))?;
        self.metrics.stage("unmarshalled");

        if self.replay.check_and_record(data) == ReplayStatus::Duplicate {
            return Err(DropReason::ReplayDetected);
        }
        self.check_freshness(&request)?;

        let fw = FirewallRequest::from_body(&request.body)?;
        let duration = self.authorize(&fw).await?;
        self.metrics.stage("authorized");

        let rule = FirewallRule::from_request(&fw);
        let meta = RuleMetadata {
            client_uuid: fw.client_uuid.clone(),
            duration,
            ipv6: fw.is_ipv6(),
        };
        self.rules.add(rule.clone(), meta).await?;
        self.metrics.stage("rule_added");

        let data = ResponseData {
            transaction_id: request.header.transaction_id,
            client_uuid: fw.client_uuid,
            target_protocol: fw.target_protocol,
            target_ip: fw.target_ip,
            target_port_start: fw.target_port_start,
            target_port_end: fw.target_port_end,
            duration,
        };
        let reply = Response::new(&data, Arc::clone(&self.cipher))
            .and_then(|response| response.marshal())
            .map_err(DropReason::ResponseEncodeFailure)?;

        Ok(Granted {
            reply,
            rule,
            duration,
        })
    }

    pub fn record_drop(&self, reason: &DropReason, peer: SocketAddr) {
        self.metrics.dropped(reason.label());
        match reason {
            DropReason::AuthorizationDenied => {}
            DropReason::AuthorizationError(_)
            | DropReason::FirewallBackendFailure(_)
            | DropReason::ResponseEncodeFailure(_)
            | DropReason::SendFailure(_) => {
                warn!(target: "openspa::pipeline", client_ip = %peer, kind = reason.label(), error = %reason, "request dropped");
            }
            _ => {
                debug!(target: "openspa::pipeline", client_ip = %peer, kind = reason.label(), error = %reason, "request dropped");
            }
        }
    }
}

/// Runs the pipeline for each datagram and sends the reply to its source.
#[derive(Debug)]
pub struct PipelineHandler {
    pipeline: Arc<RequestPipeline>,
    responder: Arc<dyn UdpResponder>,
}

impl PipelineHandler {
    pub fn new(pipeline: Arc<RequestPipeline>, responder: Arc<dyn UdpResponder>) -> Self {
        Self {
            pipeline,
            responder,
        }
    }
}

#[async_trait]
impl DatagramHandler for PipelineHandler {
    async fn handle(&self, datagram: Datagram) {
        let granted = match self.pipeline.process(&datagram.data).await {
            Ok(granted) => granted,
            Err(reason) => {
                self.pipeline.record_drop(&reason, datagram.peer);
                return;
            }
        };

        if let Err(err) = self.responder.send_to(&granted.reply, datagram.peer).await {
            self.pipeline
                .record_drop(&DropReason::SendFailure(err), datagram.peer);
            return;
        }
        self.pipeline.metrics.stage("responded");
        info!(
            target: "openspa::pipeline",
            client_ip = %datagram.peer,
            rule = %granted.rule,
            duration = ?granted.duration,
            "access granted"
        );
    }
}
