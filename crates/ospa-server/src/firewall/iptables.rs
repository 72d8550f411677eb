use std::sync::Arc;

use async_trait::async_trait;
use ospa_core::fields::is_ipv6;
use tracing::{debug, info};

use super::{Firewall, FirewallError, FirewallRule, RuleMetadata};
use crate::command::{CommandError, CommandExecutor};

pub const DEFAULT_CHAIN: &str = "OPENSPA-ALLOW";

/// Binaries invoked by [`IpTables`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpTablesCommands {
    pub iptables: String,
    pub ip6tables: String,
    pub conntrack: String,
}

impl Default for IpTablesCommands {
    fn default() -> Self {
        Self {
            iptables: "iptables".to_string(),
            ip6tables: "ip6tables".to_string(),
            conntrack: "conntrack".to_string(),
        }
    }
}

impl IpTablesCommands {
    /// Defaults overridden by `IPTABLES_COMMAND`, `IP6TABLES_COMMAND` and
    /// `CONNTRACK_COMMAND`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str, default: String| std::env::var(name).unwrap_or(default);
        Self {
            iptables: var("IPTABLES_COMMAND", defaults.iptables),
            ip6tables: var("IP6TABLES_COMMAND", defaults.ip6tables),
            conntrack: var("CONNTRACK_COMMAND", defaults.conntrack),
        }
    }
}

/// Appends ACCEPT rules to a dedicated chain. The chain must be jumped to
/// from INPUT/FORWARD by the administrator.
#[derive(Debug)]
pub struct IpTables {
    chain: String,
    commands: IpTablesCommands,
    exec: Arc<dyn CommandExecutor>,
}

impl IpTables {
    pub fn new(chain: impl Into<String>, exec: Arc<dyn CommandExecutor>) -> Self {
        Self {
            chain: chain.into(),
            commands: IpTablesCommands::from_env(),
            exec,
        }
    }

    pub fn with_commands(mut self, commands: IpTablesCommands) -> Self {
        self.commands = commands;
        self
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Probes that every required binary can be executed.
    pub async fn check(&self) -> Result<(), FirewallError> {
        for cmd in [
            &self.commands.iptables,
            &self.commands.ip6tables,
            &self.commands.conntrack,
        ] {
            self.exec.execute(cmd, None, &["-V".to_string()]).await?;
        }
        Ok(())
    }

    async fn flush_or_create(&self, cmd: &str) -> Result<(), CommandError> {
        let flush = ["-F".to_string(), self.chain.clone()];
        if self.exec.execute(cmd, None, &flush).await.is_ok() {
            return Ok(());
        }
        let create = ["--new-chain".to_string(), self.chain.clone()];
        self.exec.execute(cmd, None, &create).await?;
        info!(target: "openspa::firewall", cmd, chain = %self.chain, "created chain");
        Ok(())
    }

    fn binary_for(&self, rule: &FirewallRule) -> Result<&str, FirewallError> {
        match (is_ipv6(rule.src_ip), is_ipv6(rule.dst_ip)) {
            (false, false) => Ok(&self.commands.iptables),
            (true, true) => Ok(&self.commands.ip6tables),
            _ => Err(FirewallError::MixedFamilies {
                src: rule.src_ip,
                dst: rule.dst_ip,
            }),
        }
    }
}

fn port_spec(rule: &FirewallRule) -> String {
    if rule.is_port_range() {
        format!("{}:{}", rule.dst_port_start, rule.dst_port_end)
    } else {
        rule.dst_port_start.to_string()
    }
}

/// `-p <proto> -s <src> -d <dst> [--dport <ports>]`
fn match_args(rule: &FirewallRule) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        rule.proto.as_str().to_ascii_lowercase(),
        "-s".to_string(),
        rule.src_ip.to_string(),
        "-d".to_string(),
        rule.dst_ip.to_string(),
    ];
    if rule.proto.uses_ports() {
        args.push("--dport".to_string());
        args.push(port_spec(rule));
    }
    args
}

fn rule_args(op: &str, chain: &str, rule: &FirewallRule) -> Vec<String> {
    let mut args = vec![op.to_string(), chain.to_string()];
    args.extend(match_args(rule));
    args.push("-j".to_string());
    args.push("ACCEPT".to_string());
    args
}

#[async_trait]
impl Firewall for IpTables {
    async fn firewall_setup(&self) -> Result<(), FirewallError> {
        self.flush_or_create(&self.commands.iptables).await?;
        self.flush_or_create(&self.commands.ip6tables).await?;
        Ok(())
    }

    async fn rule_add(&self, rule: &FirewallRule, _meta: &RuleMetadata) -> Result<(), FirewallError> {
        let cmd = self.binary_for(rule)?;
        self.exec
            .execute(cmd, None, &rule_args("-A", &self.chain, rule))
            .await?;
        Ok(())
    }

    async fn rule_remove(
        &self,
        rule: &FirewallRule,
        _meta: &RuleMetadata,
    ) -> Result<(), FirewallError> {
        let cmd = self.binary_for(rule)?;
        self.exec
            .execute(cmd, None, &rule_args("-D", &self.chain, rule))
            .await?;

        // Drop established state so the flow cannot outlive the rule.
        let mut args = vec!["-D".to_string()];
        args.extend(match_args(rule));
        if let Err(err) = self.exec.execute(&self.commands.conntrack, None, &args).await {
            debug!(target: "openspa::firewall", %rule, error = %err, "conntrack flush failed");
        }
        Ok(())
    }
}
