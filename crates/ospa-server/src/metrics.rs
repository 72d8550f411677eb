use std::sync::Arc;

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

pub const METRICS_NAMESPACE: &str = "openspa";

/// Counters shared by every server component.
///
/// Components receive a clone of the handle at construction. A disabled
/// handle turns every observation into a no-op, which keeps tests free of
/// registry plumbing.
#[derive(Clone, Default)]
pub struct ServerMetrics {
    inner: Option<Arc<MetricsInner>>,
}

impl std::fmt::Debug for ServerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMetrics")
            .field("enabled", &self.inner.is_some())
            .finish()
    }
}

struct MetricsInner {
    udp_rx: IntCounter,
    udp_tx: IntCounter,
    requests: IntCounterVec,
    dropped: IntCounterVec,
    rules_added: IntCounter,
    rules_removed: IntCounter,
    rules_active: IntGauge,
    authorization: IntCounterVec,
    xdp_packets: IntCounterVec,
    xdp_bytes: IntCounterVec,
    xdp_openspa: IntCounterVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(METRICS_NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help).namespace(METRICS_NAMESPACE), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn advance_to(counter: &IntCounter, total: u64) {
    let seen = counter.get();
    if total > seen {
        counter.inc_by(total - seen);
    }
}

impl ServerMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let rules_active = IntGauge::with_opts(
            Opts::new("fw_rules_active", "Firewall rules currently installed")
                .namespace(METRICS_NAMESPACE),
        )?;
        registry.register(Box::new(rules_active.clone()))?;

        let inner = MetricsInner {
            udp_rx: counter(registry, "udp_server_rx", "Datagrams received")?,
            udp_tx: counter(registry, "udp_server_tx", "Datagrams sent")?,
            requests: counter_vec(
                registry,
                "requests_total",
                "Requests that reached a pipeline stage",
                &["stage"],
            )?,
            dropped: counter_vec(
                registry,
                "requests_dropped_total",
                "Requests dropped without a response, by reason",
                &["reason"],
            )?,
            rules_added: counter(registry, "fw_rules_added", "Firewall rules added")?,
            rules_removed: counter(registry, "fw_rules_removed", "Firewall rules removed")?,
            rules_active,
            authorization: counter_vec(
                registry,
                "authorization_total",
                "Authorization decisions",
                &["decision"],
            )?,
            xdp_packets: counter_vec(
                registry,
                "xdp_packets_total",
                "Packets seen by the XDP program, by action",
                &["action"],
            )?,
            xdp_bytes: counter_vec(
                registry,
                "xdp_bytes_total",
                "Bytes seen by the XDP program, by action",
                &["action"],
            )?,
            xdp_openspa: counter_vec(
                registry,
                "xdp_openspa_packets_total",
                "Packets to the server port classified by the XDP program",
                &["result"],
            )?,
        };

        Ok(Self {
            inner: Some(Arc::new(inner)),
        })
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn datagram_received(&self) {
        if let Some(inner) = self.inner.as_ref() {
            inner.udp_rx.inc();
        }
    }

    pub fn datagram_sent(&self) {
        if let Some(inner) = self.inner.as_ref() {
            inner.udp_tx.inc();
        }
    }

    pub fn stage(&self, stage: &str) {
        if let Some(inner) = self.inner.as_ref() {
            inner.requests.with_label_values(&[stage]).inc();
        }
    }

    pub fn dropped(&self, reason: &str) {
        if let Some(inner) = self.inner.as_ref() {
            inner.dropped.with_label_values(&[reason]).inc();
        }
    }

    pub fn rule_added(&self) {
        if let Some(inner) = self.inner.as_ref() {
            inner.rules_added.inc();
            inner.rules_active.inc();
        }
    }

    pub fn rule_removed(&self) {
        if let Some(inner) = self.inner.as_ref() {
            inner.rules_removed.inc();
            inner.rules_active.dec();
        }
    }

    pub fn authorization(&self, decision: &str) {
        if let Some(inner) = self.inner.as_ref() {
            inner.authorization.with_label_values(&[decision]).inc();
        }
    }

    /// XDP counters are cumulative in the kernel; only the delta is added.
    pub fn xdp_observe(&self, action: &str, packets: u64, bytes: u64) {
        if let Some(inner) = self.inner.as_ref() {
            advance_to(&inner.xdp_packets.with_label_values(&[action]), packets);
            advance_to(&inner.xdp_bytes.with_label_values(&[action]), bytes);
        }
    }

    /// `result` is one of `not-openspa`, `adk-invalid` or `adk-valid`.
    pub fn xdp_openspa_observe(&self, result: &str, packets: u64) {
        if let Some(inner) = self.inner.as_ref() {
            advance_to(&inner.xdp_openspa.with_label_values(&[result]), packets);
        }
    }

    #[cfg(test)]
    pub(crate) fn dropped_count(&self, reason: &str) -> u64 {
        self.inner
            .as_ref()
            .map(|inner| inner.dropped.with_label_values(&[reason]).get())
            .unwrap_or(0)
    }
}
