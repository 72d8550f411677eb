//! Firewall abstraction and the rule manager that expires granted rules.

mod command;
mod iptables;
mod manager;
mod none;

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use ospa_core::{FirewallRequest, InternetProtocol};
use thiserror::Error;

use crate::command::CommandError;

pub use self::command::CommandFirewall;
pub use self::iptables::{IpTables, IpTablesCommands, DEFAULT_CHAIN};
pub use self::manager::{ActiveRule, RuleManager, RuleManagerError, CLEANUP_INTERVAL};
pub use self::none::NoFirewall;

/// Allows `src_ip` to reach `dst_ip` on a protocol and destination port range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    pub proto: InternetProtocol,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub dst_port_start: u16,
    pub dst_port_end: u16,
}

impl FirewallRule {
    pub fn from_request(request: &FirewallRequest) -> Self {
        Self {
            proto: request.target_protocol,
            src_ip: request.client_ip,
            dst_ip: request.target_ip,
            dst_port_start: request.target_port_start,
            dst_port_end: request.target_port_end,
        }
    }

    pub fn is_port_range(&self) -> bool {
        self.dst_port_end != 0 && self.dst_port_end != self.dst_port_start
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} {}/{}",
            self.src_ip, self.dst_ip, self.proto, self.dst_port_start
        )?;
        if self.is_port_range() {
            write!(f, "-{}", self.dst_port_end)?;
        }
        Ok(())
    }
}

/// Context passed alongside a rule; backends may ignore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMetadata {
    pub client_uuid: String,
    pub duration: Duration,
    pub ipv6: bool,
}

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("firewall command: {0}")]
    Command(#[from] CommandError),
    #[error("source {src} and destination {dst} are of different ip families")]
    MixedFamilies { src: IpAddr, dst: IpAddr },
    #[error("firewall json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(String),
}

/// Installs and removes allow rules. Implementations must tolerate a rule
/// being added or removed more than once.
#[async_trait]
pub trait Firewall: Send + Sync + fmt::Debug {
    async fn firewall_setup(&self) -> Result<(), FirewallError>;
    async fn rule_add(&self, rule: &FirewallRule, meta: &RuleMetadata) -> Result<(), FirewallError>;
    async fn rule_remove(
        &self,
        rule: &FirewallRule,
        meta: &RuleMetadata,
    ) -> Result<(), FirewallError>;
}
