use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ospa_core::{AdkError, AdkProver, CipherSuite, DEFAULT_SERVER_PORT};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::adk::AdkProofSynchronizer;
use crate::authorization::AuthorizationStrategy;
use crate::coordinator::{Dispatch, DEFAULT_REQUEST_HANDLERS};
use crate::firewall::{Firewall, FirewallError, RuleManager, RuleManagerError};
use crate::listener::UdpListener;
use crate::metrics::ServerMetrics;
use crate::pipeline::{PipelineHandler, RequestPipeline};
use crate::replay::DEFAULT_FRESHNESS;
use crate::xdp::{XdpAdk, XdpError, XdpSettings, XdpStats};

/// Upper bound on tearing down the remaining firewall rules at shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Period of the XDP statistics scrape.
pub const XDP_STATS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind udp socket: {0}")]
    Io(#[from] std::io::Error),
    #[error("firewall setup: {0}")]
    Firewall(#[from] FirewallError),
    #[error("adk secret: {0}")]
    Adk(#[from] AdkError),
    #[error(transparent)]
    Xdp(#[from] XdpError),
    #[error("xdp requires an adk secret")]
    XdpWithoutAdk,
}

/// Builder-style server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Zero spawns a task per datagram.
    pub request_handlers: usize,
    pub freshness: Duration,
    pub adk_secret: Option<String>,
    pub xdp: Vec<XdpSettings>,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SERVER_PORT)),
            request_handlers: DEFAULT_REQUEST_HANDLERS,
            freshness: DEFAULT_FRESHNESS,
            adk_secret: None,
            xdp: Vec::new(),
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_request_handlers(mut self, handlers: usize) -> Self {
        self.request_handlers = handlers;
        self
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_adk_secret(mut self, secret: impl Into<String>) -> Self {
        self.adk_secret = Some(secret.into());
        self
    }

    /// Attach the XDP pre-filter to one more interface.
    pub fn with_xdp(mut self, settings: XdpSettings) -> Self {
        self.xdp.push(settings);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Pluggable parts of a server.
#[derive(Debug, Clone)]
pub struct ServerBackends {
    pub cipher: Arc<dyn CipherSuite>,
    pub authorization: Arc<dyn AuthorizationStrategy>,
    pub firewall: Arc<dyn Firewall>,
}

struct StatsTask {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// The assembled OpenSPA server.
pub struct Server {
    config: ServerConfig,
    listener: UdpListener,
    pipeline: Arc<RequestPipeline>,
    rules: Arc<RuleManager>,
    xdp: Vec<Arc<XdpAdk>>,
    synchronizers: Vec<AdkProofSynchronizer>,
    stats: Mutex<Option<StatsTask>>,
    metrics: ServerMetrics,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("addr", &self.listener.local_addr().ok())
            .field("xdp", &self.xdp)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Prepare the firewall, bind the socket and load the optional ADK fast path.
    pub async fn bind(
        config: ServerConfig,
        backends: ServerBackends,
        metrics: ServerMetrics,
    ) -> Result<Self, ServerError> {
        backends.firewall.firewall_setup().await?;

        let prover = config
            .adk_secret
            .as_deref()
            .map(AdkProver::new)
            .transpose()?
            .map(Arc::new);

        let rules = Arc::new(RuleManager::new(backends.firewall, metrics.clone()));
        let mut pipeline = RequestPipeline::new(
            backends.cipher,
            backends.authorization,
            Arc::clone(&rules),
            metrics.clone(),
        )
        .with_freshness(config.freshness);
        if let Some(prover) = prover.as_ref() {
            pipeline = pipeline.with_adk(Arc::clone(prover));
        }

        let listener = UdpListener::bind(config.bind, metrics.clone()).await?;
        let server_port = listener.local_addr()?.port();

        let mut xdp = Vec::new();
        let mut synchronizers = Vec::new();
        if !config.xdp.is_empty() {
            let prover = prover.as_ref().ok_or(ServerError::XdpWithoutAdk)?;
            for settings in &config.xdp {
                let settings = XdpSettings {
                    server_port,
                    ..settings.clone()
                };
                match XdpAdk::load(&settings) {
                    Ok(loaded) => {
                        let loaded = Arc::new(loaded);
                        synchronizers.push(AdkProofSynchronizer::new(
                            Arc::clone(prover),
                            loaded.clone(),
                        ));
                        xdp.push(loaded);
                    }
                    Err(XdpError::NotSupported) => {
                        warn!(
                            target: "openspa::adk",
                            iface = %settings.interface,
                            "xdp is not supported, continuing without the pre-filter"
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        info!(
            target: "openspa::server",
            addr = %listener.local_addr()?,
            request_handlers = config.request_handlers,
            adk = prover.is_some(),
            xdp_interfaces = xdp.len(),
            "openspa server ready"
        );

        Ok(Self {
            config,
            listener,
            pipeline: Arc::new(pipeline),
            rules,
            xdp,
            synchronizers,
            stats: Mutex::new(None),
            metrics,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn rules(&self) -> &Arc<RuleManager> {
        &self.rules
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Serve until `shutdown` flips, then stop the listener, drain the
    /// workers and tear down every active rule within the shutdown timeout.
    /// The ADK fast path keeps running until [`Server::close`].
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        self.rules.start();
        for sync in &self.synchronizers {
            sync.start();
        }
        self.start_stats();

        let handler = PipelineHandler::new(
            Arc::clone(&self.pipeline),
            Arc::new(self.listener.responder()),
        );
        let dispatch = Dispatch::new(self.config.request_handlers, Arc::new(handler));
        self.listener.run(&dispatch, shutdown).await;

        dispatch.stop().await;
        info!(target: "openspa::server", "request workers stopped");

        match time::timeout(self.config.shutdown_timeout, self.rules.stop()).await {
            Ok(Ok(())) => info!(target: "openspa::server", "firewall rules removed"),
            Ok(Err(RuleManagerError::Residual { failures })) => {
                for (rule, err) in failures {
                    error!(
                        target: "openspa::server",
                        rule = %rule,
                        error = %err,
                        "firewall rule left behind"
                    );
                }
            }
            Ok(Err(err)) => {
                error!(target: "openspa::server", error = %err, "rule manager stop failed")
            }
            Err(_) => self.report_stalled_rules(),
        }
        Ok(())
    }

    fn report_stalled_rules(&self) {
        let timeout = self.config.shutdown_timeout;
        let Some(left) = self.rules.try_rules() else {
            error!(
                target: "openspa::server",
                ?timeout,
                "rule manager did not stop in time, rule list is still locked"
            );
            return;
        };
        error!(
            target: "openspa::server",
            ?timeout,
            remaining = left.len(),
            "rule manager did not stop in time, remove the remaining rules by hand"
        );
        for active in left {
            error!(
                target: "openspa::server",
                rule = %active.rule,
                client_uuid = %active.meta.client_uuid,
                "firewall rule left behind"
            );
        }
    }

    /// Stop the ADK synchronizers and the XDP statistics scrape. Dropping the
    /// server afterwards detaches the XDP programs.
    pub async fn close(&self) {
        let task = self.stats.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            let _ = task.join.await;
        }
        for sync in &self.synchronizers {
            sync.stop().await;
        }
    }

    fn start_stats(&self) {
        if self.xdp.is_empty() {
            return;
        }
        let mut slot = self.stats.lock();
        if slot.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let xdp = self.xdp.clone();
        let metrics = self.metrics.clone();
        let mut ticker = time::interval(XDP_STATS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let mut total = XdpStats::default();
                        for program in &xdp {
                            match program.stats() {
                                Ok(stats) => total = total.merge(&stats),
                                Err(err) => {
                                    warn!(
                                        target: "openspa::adk",
                                        iface = program.interface(),
                                        error = %err,
                                        "failed to read xdp stats"
                                    );
                                }
                            }
                        }
                        total.record(&metrics);
                    }
                }
            }
        });
        *slot = Some(StatsTask { shutdown, join });
    }
}

#[cfg(test)]
mod tests {
    use ospa_core::NoSecurity;

    use super::*;
    use crate::authorization::SimpleAuthorization;
    use crate::firewall::testing::RecordingFirewall;
    use crate::firewall::{FirewallRule, RuleMetadata};
    use crate::xdp::XdpMode;

    fn backends() -> ServerBackends {
        ServerBackends {
            cipher: Arc::new(NoSecurity),
            authorization: Arc::new(SimpleAuthorization::new(Duration::from_secs(5))),
            firewall: Arc::new(RecordingFirewall::default()),
        }
    }

    fn loopback() -> ServerConfig {
        ServerConfig::default().with_bind("127.0.0.1:0".parse().expect("addr"))
    }

    #[tokio::test]
    async fn runs_until_shutdown() {
        let server = Server::bind(loopback(), backends(), ServerMetrics::disabled())
            .await
            .expect("bind");
        assert_ne!(server.local_addr().expect("addr").port(), 0);

        let (tx, rx) = watch::channel(false);
        let run = server.run(rx);
        let stop = async {
            tokio::task::yield_now().await;
            tx.send(true).expect("shutdown");
        };
        let (result, ()) = tokio::join!(run, stop);
        result.expect("run");
        server.close().await;
        assert_eq!(server.rules().count().await, 0);
    }

    #[tokio::test]
    async fn stalled_teardown_leaves_rules_reported() {
        let firewall = Arc::new(RecordingFirewall::default());
        let backends = ServerBackends {
            firewall: firewall.clone(),
            ..backends()
        };
        let config = loopback().with_shutdown_timeout(Duration::from_millis(50));
        let server = Server::bind(config, backends, ServerMetrics::disabled())
            .await
            .expect("bind");

        let rule = FirewallRule {
            proto: ospa_core::InternetProtocol::Tcp,
            src_ip: "88.200.23.30".parse().expect("src"),
            dst_ip: "88.200.23.19".parse().expect("dst"),
            dst_port_start: 22,
            dst_port_end: 22,
        };
        let meta = RuleMetadata {
            client_uuid: "c3b7a8e0-1b2c-4d5e-8f90-a1b2c3d4e5f6".to_string(),
            duration: Duration::from_secs(600),
            ipv6: false,
        };
        server.rules().add(rule.clone(), meta).await.expect("add");
        *firewall.hang_remove.lock() = true;

        let (tx, rx) = watch::channel(false);
        tx.send(true).expect("shutdown");
        server.run(rx).await.expect("run");
        server.close().await;

        let left = server.rules().try_rules().expect("rule list");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].rule, rule);
        assert!(firewall.removed().is_empty());
    }

    #[tokio::test]
    async fn invalid_adk_secret_is_rejected() {
        let config = loopback().with_adk_secret("not-a-secret");
        assert!(matches!(
            Server::bind(config, backends(), ServerMetrics::disabled()).await,
            Err(ServerError::Adk(_))
        ));
    }

    #[tokio::test]
    async fn xdp_needs_adk_secret() {
        let config = loopback().with_xdp(XdpSettings {
            interface: "lo".into(),
            mode: XdpMode::Skb,
            object_path: "openspa_adk.o".into(),
            server_port: 0,
            replace_if_loaded: false,
        });
        assert!(matches!(
            Server::bind(config, backends(), ServerMetrics::disabled()).await,
            Err(ServerError::XdpWithoutAdk)
        ));
    }

    #[cfg(not(feature = "xdp"))]
    #[tokio::test]
    async fn unsupported_xdp_degrades_to_userspace_check() {
        let config = loopback()
            .with_adk_secret(ospa_core::generate_secret())
            .with_xdp(XdpSettings {
                interface: "lo".into(),
                mode: XdpMode::Skb,
                object_path: "openspa_adk.o".into(),
                server_port: 0,
                replace_if_loaded: false,
            });
        let server = Server::bind(config, backends(), ServerMetrics::disabled())
            .await
            .expect("bind without xdp");
        assert!(server.xdp.is_empty());
    }
}
