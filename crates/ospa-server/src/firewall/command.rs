use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ospa_core::fields::is_ipv6;
use serde::Serialize;
use tracing::warn;

use super::{Firewall, FirewallError, FirewallRule, RuleMetadata};
use crate::command::CommandExecutor;

/// Delegates rule management to external programs, passing the rule as JSON
/// on stdin.
#[derive(Debug)]
pub struct CommandFirewall {
    setup_cmd: Option<String>,
    rule_add_cmd: String,
    rule_remove_cmd: String,
    exec: Arc<dyn CommandExecutor>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RuleInput<'a> {
    #[serde(rename = "clientUUID")]
    client_uuid: &'a str,
    #[serde(rename = "ipIsIPv6")]
    ip_is_ipv6: bool,
    #[serde(rename = "clientIP")]
    client_ip: IpAddr,
    #[serde(rename = "targetIP")]
    target_ip: IpAddr,
    target_protocol: &'static str,
    port_start: u16,
    #[serde(skip_serializing_if = "is_zero")]
    port_end: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<u64>,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

impl<'a> RuleInput<'a> {
    fn new(rule: &FirewallRule, meta: &'a RuleMetadata) -> Self {
        Self {
            client_uuid: &meta.client_uuid,
            ip_is_ipv6: is_ipv6(rule.src_ip),
            client_ip: rule.src_ip,
            target_ip: rule.dst_ip,
            target_protocol: rule.proto.as_str(),
            port_start: rule.dst_port_start,
            port_end: rule.dst_port_end,
            duration: None,
        }
    }
}

impl CommandFirewall {
    pub fn new(
        setup_cmd: Option<String>,
        rule_add_cmd: impl Into<String>,
        rule_remove_cmd: impl Into<String>,
        exec: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            setup_cmd,
            rule_add_cmd: rule_add_cmd.into(),
            rule_remove_cmd: rule_remove_cmd.into(),
            exec,
        }
    }

    async fn run(&self, cmd: &str, rule: &FirewallRule, input: &RuleInput<'_>) -> Result<(), FirewallError> {
        let stdin = serde_json::to_vec(input)?;
        if let Err(err) = self.exec.execute(cmd, Some(&stdin), &[]).await {
            let output = err
                .output()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            warn!(
                target: "openspa::firewall",
                %rule,
                cmd,
                error = %err,
                output = %output,
                "firewall command failed"
            );
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Firewall for CommandFirewall {
    async fn firewall_setup(&self) -> Result<(), FirewallError> {
        if let Some(cmd) = self.setup_cmd.as_deref() {
            self.exec.execute(cmd, None, &[]).await?;
        }
        Ok(())
    }

    async fn rule_add(&self, rule: &FirewallRule, meta: &RuleMetadata) -> Result<(), FirewallError> {
        let mut input = RuleInput::new(rule, meta);
        input.duration = Some(meta.duration.as_secs());
        self.run(&self.rule_add_cmd, rule, &input).await
    }

    async fn rule_remove(
        &self,
        rule: &FirewallRule,
        meta: &RuleMetadata,
    ) -> Result<(), FirewallError> {
        self.run(&self.rule_remove_cmd, rule, &RuleInput::new(rule, meta))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ospa_core::InternetProtocol;
    use serde_json::{json, Value};

    use super::*;
    use crate::command::testing::RecordingExecutor;
    use crate::command::CommandError;

    fn rule(end: u16) -> FirewallRule {
        FirewallRule {
            proto: InternetProtocol::Tcp,
            src_ip: "88.200.23.30".parse().expect("src"),
            dst_ip: "88.200.23.19".parse().expect("dst"),
            dst_port_start: 80,
            dst_port_end: end,
        }
    }

    fn meta() -> RuleMetadata {
        RuleMetadata {
            client_uuid: "c3b7a8e0-1b2c-4d5e-8f90-a1b2c3d4e5f6".to_string(),
            duration: Duration::from_secs(3),
            ipv6: false,
        }
    }

    fn stdin_json(exec: &RecordingExecutor, call: usize) -> Value {
        let calls = exec.calls();
        serde_json::from_slice(calls[call].stdin.as_deref().expect("stdin")).expect("json")
    }

    #[tokio::test]
    async fn add_sends_rule_with_duration() {
        let exec = Arc::new(RecordingExecutor::default());
        let fw = CommandFirewall::new(None, "/bin/add", "/bin/remove", exec.clone());
        fw.rule_add(&rule(90), &meta()).await.expect("add");

        assert_eq!(exec.calls()[0].cmd, "/bin/add");
        assert_eq!(
            stdin_json(&exec, 0),
            json!({
                "clientUUID": "c3b7a8e0-1b2c-4d5e-8f90-a1b2c3d4e5f6",
                "ipIsIPv6": false,
                "clientIP": "88.200.23.30",
                "targetIP": "88.200.23.19",
                "targetProtocol": "TCP",
                "portStart": 80,
                "portEnd": 90,
                "duration": 3
            })
        );
    }

    #[tokio::test]
    async fn remove_omits_duration_and_zero_port_end() {
        let exec = Arc::new(RecordingExecutor::default());
        let fw = CommandFirewall::new(None, "/bin/add", "/bin/remove", exec.clone());
        fw.rule_remove(&rule(0), &meta()).await.expect("remove");

        let value = stdin_json(&exec, 0);
        assert_eq!(exec.calls()[0].cmd, "/bin/remove");
        assert!(value.get("duration").is_none());
        assert!(value.get("portEnd").is_none());
        assert_eq!(value["portStart"], 80);
    }

    #[tokio::test]
    async fn command_failure_surfaces() {
        let exec = Arc::new(RecordingExecutor::default());
        exec.push_result(Err(CommandError::Exit {
            cmd: "/bin/add".into(),
            code: Some(2),
            output: b"denied".to_vec(),
        }));
        let fw = CommandFirewall::new(None, "/bin/add", "/bin/remove", exec.clone());
        assert!(matches!(
            fw.rule_add(&rule(0), &meta()).await,
            Err(FirewallError::Command(CommandError::Exit { code: Some(2), .. }))
        ));
    }

    #[tokio::test]
    async fn setup_is_optional() {
        let exec = Arc::new(RecordingExecutor::default());
        CommandFirewall::new(None, "a", "r", exec.clone())
            .firewall_setup()
            .await
            .expect("no setup");
        assert!(exec.calls().is_empty());

        CommandFirewall::new(Some("/bin/setup".into()), "a", "r", exec.clone())
            .firewall_setup()
            .await
            .expect("setup");
        assert_eq!(exec.calls()[0].cmd, "/bin/setup");
    }
}
