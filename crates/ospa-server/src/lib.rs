//! OpenSPA server.
//!
//! A single task owns the UDP socket and hands every datagram to a fixed
//! pool of workers. Each worker runs the [`RequestPipeline`]: unmarshal,
//! replay and freshness checks, authorization, firewall rule installation
//! and the encrypted response. Any failure drops the datagram without a
//! reply. Installed rules are removed by the [`RuleManager`] once their
//! granted duration elapses.
//!
//! With an ADK secret configured the pipeline first checks the proof in the
//! header; with the `xdp` feature the same check runs in the kernel via
//! [`XdpAdk`], kept current by an [`AdkProofSynchronizer`].

pub mod adk;
pub mod authorization;
pub mod command;
pub mod coordinator;
pub mod firewall;
pub mod listener;
pub mod metrics;
pub mod pipeline;
pub mod replay;
mod server;
pub mod xdp;

pub use adk::{AdkProofSink, AdkProofSynchronizer, AdkSyncError, ADK_SYNC_PERIOD};
pub use authorization::{
    AllowAllAuthorization, AuthorizationError, AuthorizationStrategy, CommandAuthorization,
    SimpleAuthorization, ALLOW_ALL_DURATION,
};
pub use command::{CommandError, CommandExecutor, ProcessExecutor};
pub use coordinator::{
    CoordinatorError, Datagram, DatagramHandler, Dispatch, RequestCoordinator,
    DEFAULT_REQUEST_HANDLERS,
};
pub use firewall::{
    CommandFirewall, Firewall, FirewallError, FirewallRule, IpTables, IpTablesCommands, NoFirewall,
    RuleManager, RuleManagerError, RuleMetadata, CLEANUP_INTERVAL, DEFAULT_CHAIN,
};
pub use listener::{SocketResponder, UdpListener, UdpResponder};
pub use metrics::{ServerMetrics, METRICS_NAMESPACE};
pub use pipeline::{DropReason, Granted, PipelineHandler, RequestPipeline};
pub use replay::{ReplayCache, ReplayStatus, DEFAULT_FRESHNESS};
pub use server::{
    Server, ServerBackends, ServerConfig, ServerError, SHUTDOWN_TIMEOUT, XDP_STATS_INTERVAL,
};
pub use xdp::{xdp_supported, XdpAdk, XdpError, XdpMode, XdpSettings, XdpStats};
