use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Firewall, FirewallError, FirewallRule, RuleMetadata};
use crate::metrics::ServerMetrics;

pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RuleManagerError {
    #[error("firewall rule add: {0}")]
    Add(#[from] FirewallError),
    #[error("{} firewall rules could not be removed", .failures.len())]
    Residual {
        failures: Vec<(FirewallRule, FirewallError)>,
    },
}

#[derive(Debug, Clone)]
pub struct ActiveRule {
    pub rule: FirewallRule,
    pub meta: RuleMetadata,
    pub created: Instant,
}

impl ActiveRule {
    pub fn expires_at(&self) -> Instant {
        self.created + self.meta.duration
    }
}

struct CleanupTask {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Owns the set of granted rules and removes each one from the firewall once
/// its duration has elapsed.
pub struct RuleManager {
    firewall: Arc<dyn Firewall>,
    rules: Mutex<Vec<ActiveRule>>,
    metrics: ServerMetrics,
    task: parking_lot::Mutex<Option<CleanupTask>>,
}

impl std::fmt::Debug for RuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleManager")
            .field("firewall", &self.firewall)
            .finish_non_exhaustive()
    }
}

impl RuleManager {
    pub fn new(firewall: Arc<dyn Firewall>, metrics: ServerMetrics) -> Self {
        Self {
            firewall,
            rules: Mutex::new(Vec::new()),
            metrics,
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Spawn the cleanup loop. Calling it again while running has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let mut ticker = time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let manager = Arc::clone(self);

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => manager.cleanup().await,
                }
            }
            debug!(target: "openspa::firewall", "rule cleanup loop stopped");
        });

        *task = Some(CleanupTask { shutdown, join });
    }

    /// Install `rule` and track it for `meta.duration`.
    pub async fn add(&self, rule: FirewallRule, meta: RuleMetadata) -> Result<(), RuleManagerError> {
        let mut rules = self.rules.lock().await;
        self.firewall.rule_add(&rule, &meta).await?;

        info!(
            target: "openspa::firewall",
            %rule,
            client_uuid = %meta.client_uuid,
            duration = ?meta.duration,
            "firewall rule added"
        );
        self.metrics.rule_added();
        rules.push(ActiveRule {
            rule,
            meta,
            created: Instant::now(),
        });
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.rules.lock().await.len()
    }

    pub async fn rules(&self) -> Vec<ActiveRule> {
        self.rules.lock().await.clone()
    }

    /// Remove every expired rule, earliest expiry first. Rules the firewall
    /// refuses to remove stay tracked and are retried on the next pass.
    pub async fn cleanup(&self) {
        let mut rules = self.rules.lock().await;
        let now = Instant::now();

        let mut expired: Vec<usize> = rules
            .iter()
            .enumerate()
            .filter(|(_, active)| active.expires_at() <= now)
            .map(|(idx, _)| idx)
            .collect();
        if expired.is_empty() {
            return;
        }
        expired.sort_by_key(|&idx| rules[idx].expires_at());

        let mut removed = vec![false; rules.len()];
        for idx in expired {
            let active = &rules[idx];
            match self.firewall.rule_remove(&active.rule, &active.meta).await {
                Ok(()) => {
                    info!(target: "openspa::firewall", rule = %active.rule, "firewall rule removed");
                    self.metrics.rule_removed();
                    removed[idx] = true;
                }
                Err(err) => {
                    warn!(
                        target: "openspa::firewall",
                        rule = %active.rule,
                        error = %err,
                        "firewall rule removal failed, retrying next tick"
                    );
                }
            }
        }

        let mut flags = removed.into_iter();
        rules.retain(|_| !flags.next().unwrap_or(false));
    }

    /// Rules currently tracked, or `None` while another call holds the list.
    pub fn try_rules(&self) -> Option<Vec<ActiveRule>> {
        self.rules.try_lock().ok().map(|rules| rules.clone())
    }

    /// Stop the cleanup loop and remove every tracked rule. The list is
    /// cleared even if some removals fail; those are returned. A rule stays
    /// tracked until its removal has completed, so a cancelled stop leaves
    /// the unremoved rules in [`RuleManager::try_rules`].
    pub async fn stop(&self) -> Result<(), RuleManagerError> {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(());
            if let Err(err) = task.join.await {
                error!(
                    target: "openspa::firewall",
                    error = %err,
                    "rule cleanup task failed, removing rules anyway"
                );
            }
        }

        let mut rules = self.rules.lock().await;
        let mut failures = Vec::new();
        while let Some(active) = rules.first().cloned() {
            let result = self.firewall.rule_remove(&active.rule, &active.meta).await;
            rules.remove(0);
            match result {
                Ok(()) => self.metrics.rule_removed(),
                Err(err) => {
                    warn!(
                        target: "openspa::firewall",
                        rule = %active.rule,
                        error = %err,
                        "failed to remove firewall rule on shutdown"
                    );
                    failures.push((active.rule, err));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RuleManagerError::Residual { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use ospa_core::InternetProtocol;

    use super::*;
    use crate::firewall::testing::{Call, RecordingFirewall};

    fn rule(port: u16) -> FirewallRule {
        FirewallRule {
            proto: InternetProtocol::Tcp,
            src_ip: "88.200.23.30".parse().expect("src"),
            dst_ip: "88.200.23.19".parse().expect("dst"),
            dst_port_start: port,
            dst_port_end: port,
        }
    }

    fn meta(secs: u64) -> RuleMetadata {
        RuleMetadata {
            client_uuid: "c3b7a8e0-1b2c-4d5e-8f90-a1b2c3d4e5f6".to_string(),
            duration: Duration::from_secs(secs),
            ipv6: false,
        }
    }

    fn manager() -> (Arc<RecordingFirewall>, Arc<RuleManager>) {
        let firewall = Arc::new(RecordingFirewall::default());
        let manager = Arc::new(RuleManager::new(firewall.clone(), ServerMetrics::disabled()));
        (firewall, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn rule_expires_after_duration() {
        let (firewall, manager) = manager();
        manager.start();

        manager.add(rule(22), meta(1)).await.expect("add");
        assert_eq!(manager.count().await, 1);

        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(manager.count().await, 0);
        assert_eq!(
            firewall.calls(),
            vec![Call::Add(rule(22)), Call::Remove(rule(22))]
        );

        manager.stop().await.expect("stop");
    }

    #[tokio::test(start_paused = true)]
    async fn removal_follows_expiry_order() {
        let (firewall, manager) = manager();
        manager.add(rule(3), meta(3)).await.expect("add");
        manager.add(rule(1), meta(1)).await.expect("add");
        manager.add(rule(2), meta(2)).await.expect("add");
        manager.add(rule(9), meta(60)).await.expect("add");

        time::advance(Duration::from_secs(4)).await;
        manager.cleanup().await;

        assert_eq!(firewall.removed(), vec![rule(1), rule(2), rule(3)]);
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_removal_is_retried() {
        let (firewall, manager) = manager();
        *firewall.fail_remove.lock() = 1;
        manager.start();

        manager.add(rule(22), meta(1)).await.expect("add");
        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(manager.count().await, 1);
        assert!(firewall.removed().is_empty());

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.count().await, 0);
        assert_eq!(firewall.removed(), vec![rule(22)]);
        manager.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn failed_add_is_not_tracked() {
        let (firewall, manager) = manager();
        *firewall.fail_add.lock() = true;
        assert!(matches!(
            manager.add(rule(22), meta(10)).await,
            Err(RuleManagerError::Add(_))
        ));
        assert_eq!(manager.count().await, 0);
    }

    #[tokio::test]
    async fn stop_removes_everything_and_reports_failures() {
        let (firewall, manager) = manager();
        manager.start();
        manager.add(rule(1), meta(600)).await.expect("add");
        manager.add(rule(2), meta(600)).await.expect("add");
        *firewall.fail_remove.lock() = 1;

        match manager.stop().await {
            Err(RuleManagerError::Residual { failures }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, rule(1));
            }
            other => panic!("unexpected stop result {other:?}"),
        }
        assert_eq!(manager.count().await, 0);
        assert_eq!(firewall.removed(), vec![rule(2)]);

        manager.stop().await.expect("second stop is a no-op");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_tears_down_after_cleanup_task_panics() {
        let (firewall, manager) = manager();
        manager.start();
        manager.add(rule(1), meta(1)).await.expect("add");
        manager.add(rule(2), meta(600)).await.expect("add");
        *firewall.panic_remove.lock() = true;

        time::sleep(Duration::from_millis(1500)).await;
        assert!(firewall.removed().is_empty());

        manager.stop().await.expect("stop");
        assert_eq!(manager.count().await, 0);
        assert_eq!(firewall.removed(), vec![rule(1), rule(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_stop_keeps_unremoved_rules() {
        let (firewall, manager) = manager();
        manager.add(rule(1), meta(600)).await.expect("add");
        manager.add(rule(2), meta(600)).await.expect("add");
        *firewall.hang_remove.lock() = true;

        assert!(time::timeout(Duration::from_secs(1), manager.stop())
            .await
            .is_err());

        let left: Vec<FirewallRule> = manager
            .try_rules()
            .expect("list is free after cancellation")
            .into_iter()
            .map(|active| active.rule)
            .collect();
        assert_eq!(left, vec![rule(1), rule(2)]);
    }
}
