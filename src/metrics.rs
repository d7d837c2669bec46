//! Per-instance telemetry: atomic counters rendered in Prometheus text
//! exposition format, plus the process health state.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct InstanceMetrics {
    pub requests: AtomicU64,
    pub failures: AtomicU64,
    pub cancelled: AtomicU64,
    pub duration_ms: AtomicU64,
}

impl InstanceMetrics {
    pub fn record_request(&self, duration_ms: u64, ok: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct MetricsRegistry {
    instances: BTreeMap<String, (Arc<InstanceMetrics>, BTreeMap<String, String>)>,
}

impl MetricsRegistry {
    pub fn new(
        instances: impl IntoIterator<Item = (String, BTreeMap<String, String>)>,
    ) -> Self {
        Self {
            instances: instances
                .into_iter()
                .map(|(name, labels)| (name, (Arc::new(InstanceMetrics::default()), labels)))
                .collect(),
        }
    }

    pub fn instance(&self, name: &str) -> Option<Arc<InstanceMetrics>> {
        self.instances.get(name).map(|(metrics, _)| metrics.clone())
    }

    /// Prometheus text exposition. Configured metric labels are attached as
    /// constants per instance.
    pub fn render(&self, strategy_info: &BTreeMap<String, (String, u64)>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# TYPE ai_gateway_requests_total counter");
        for (name, (metrics, labels)) in &self.instances {
            let labels = render_labels(name, labels, &[]);
            let _ = writeln!(
                out,
                "ai_gateway_requests_total{labels} {}",
                metrics.requests.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "# TYPE ai_gateway_request_failures_total counter");
        for (name, (metrics, labels)) in &self.instances {
            let labels = render_labels(name, labels, &[]);
            let _ = writeln!(
                out,
                "ai_gateway_request_failures_total{labels} {}",
                metrics.failures.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "# TYPE ai_gateway_cancelled_total counter");
        for (name, (metrics, labels)) in &self.instances {
            let labels = render_labels(name, labels, &[]);
            let _ = writeln!(
                out,
                "ai_gateway_cancelled_total{labels} {}",
                metrics.cancelled.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "# TYPE ai_gateway_request_duration_ms_total counter");
        for (name, (metrics, labels)) in &self.instances {
            let labels = render_labels(name, labels, &[]);
            let _ = writeln!(
                out,
                "ai_gateway_request_duration_ms_total{labels} {}",
                metrics.duration_ms.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "# TYPE ai_gateway_credential_strategy_epoch gauge");
        for (name, (_, labels)) in &self.instances {
            if let Some((strategy, epoch)) = strategy_info.get(name) {
                let labels = render_labels(name, labels, &[("strategy", strategy)]);
                let _ = writeln!(out, "ai_gateway_credential_strategy_epoch{labels} {epoch}");
            }
        }
        out
    }
}

fn render_labels(
    instance: &str,
    labels: &BTreeMap<String, String>,
    extra: &[(&str, &str)],
) -> String {
    let mut out = format!("{{instance=\"{instance}\"");
    for (key, value) in labels {
        let _ = write!(out, ",{key}=\"{value}\"");
    }
    for (key, value) in extra {
        let _ = write!(out, ",{key}=\"{value}\"");
    }
    out.push('}');
    out
}

/// Rolling process health, fed by the dispatcher.
#[derive(Debug, Default)]
pub struct HealthState {
    successes: AtomicU64,
    errors: AtomicU64,
}

impl HealthState {
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Healthy unless errors dominate a meaningful sample.
    pub fn is_healthy(&self) -> bool {
        let successes = self.successes.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let total = successes + errors;
        total < 10 || errors * 2 < total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_instance_and_custom_labels() {
        let registry = MetricsRegistry::new(vec![(
            "bedrock_us1".to_string(),
            BTreeMap::from([("region".to_string(), "us-east-1".to_string())]),
        )]);
        registry.instance("bedrock_us1").unwrap().record_request(12, true);
        registry.instance("bedrock_us1").unwrap().record_cancelled();

        let strategy_info = BTreeMap::from([(
            "bedrock_us1".to_string(),
            ("kubernetes_secret".to_string(), 2u64),
        )]);
        let rendered = registry.render(&strategy_info);
        assert!(rendered.contains(
            "ai_gateway_requests_total{instance=\"bedrock_us1\",region=\"us-east-1\"} 1"
        ));
        assert!(rendered.contains("ai_gateway_cancelled_total{instance=\"bedrock_us1\",region=\"us-east-1\"} 1"));
        assert!(rendered.contains(
            "ai_gateway_credential_strategy_epoch{instance=\"bedrock_us1\",region=\"us-east-1\",strategy=\"kubernetes_secret\"} 2"
        ));
    }

    #[test]
    fn health_flips_on_error_majority() {
        let health = HealthState::default();
        assert!(health.is_healthy());
        for _ in 0..6 {
            health.record_error();
        }
        for _ in 0..5 {
            health.record_success();
        }
        assert!(!health.is_healthy());
        for _ in 0..10 {
            health.record_success();
        }
        assert!(health.is_healthy());
    }
}
