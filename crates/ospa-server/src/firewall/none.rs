use async_trait::async_trait;
use tracing::debug;

use super::{Firewall, FirewallError, FirewallRule, RuleMetadata};

/// Accepts every call without touching the host, for load measurements.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFirewall;

#[async_trait]
impl Firewall for NoFirewall {
    async fn firewall_setup(&self) -> Result<(), FirewallError> {
        Ok(())
    }

    async fn rule_add(&self, rule: &FirewallRule, _meta: &RuleMetadata) -> Result<(), FirewallError> {
        debug!(target: "openspa::firewall", %rule, "noop rule add");
        Ok(())
    }

    async fn rule_remove(
        &self,
        rule: &FirewallRule,
        _meta: &RuleMetadata,
    ) -> Result<(), FirewallError> {
        debug!(target: "openspa::firewall", %rule, "noop rule remove");
        Ok(())
    }
}
