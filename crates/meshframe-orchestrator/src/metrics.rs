//! Health/metrics surface (spec.md §4.9): the counters, histograms, and
//! gauges every other module updates, plus the alert events the registry's
//! [`crate::registry::HealthObserver`] turns into `system.health.*`
//! publications.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use meshframe_types::AgentId;
use serde::Serialize;

/// Successful plan generations on the first LLM call.
pub static PLANS_GENERATED: AtomicU64 = AtomicU64::new(0);
/// Plans that only validated after a repair-prompt retry.
pub static PLANS_REPAIRED: AtomicU64 = AtomicU64::new(0);
/// Times the fallback manager's degraded-mode strategies were invoked.
pub static FALLBACKS_TRIGGERED: AtomicU64 = AtomicU64::new(0);
/// Sessions that reached `completed`.
pub static SESSIONS_COMPLETED: AtomicU64 = AtomicU64::new(0);
/// Sessions that reached `failed`.
pub static SESSIONS_FAILED: AtomicU64 = AtomicU64::new(0);
/// Requests rejected by the admission bound before a session was created.
pub static SESSIONS_REJECTED: AtomicU64 = AtomicU64::new(0);
/// Events successfully published to the broker.
pub static EVENTS_PUBLISHED: AtomicU64 = AtomicU64::new(0);
/// Events successfully delivered to at least one subscriber.
pub static EVENTS_DELIVERED: AtomicU64 = AtomicU64::new(0);
/// Handler invocations that returned an error or panicked.
pub static DELIVERIES_FAILED: AtomicU64 = AtomicU64::new(0);

/// An alert raised out-of-band from the request/response path, published on
/// `system.health.*` topics by the composition root.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum AlertEvent {
    /// An agent dropped below the health threshold.
    HealthDegraded {
        /// The agent that degraded.
        agent_id: AgentId,
    },
    /// An agent returned to health after a prior degradation.
    HealthRecovered {
        /// The agent that recovered.
        agent_id: AgentId,
    },
    /// A downstream circuit (e.g. the LLM gateway) tripped open.
    CircuitOpened {
        /// Name of the circuit that opened, e.g. the provider name.
        circuit: String,
    },
}

/// A single latency observation recorded against a named histogram.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    /// Milliseconds elapsed.
    pub millis: f64,
}

/// Destination for counters, histograms, and gauges. The default
/// implementation keeps everything in-process; a production deployment
/// would swap in a `metrics`-crate or Prometheus-backed sink without
/// touching call sites.
pub trait MetricsSink: Send + Sync {
    /// Increment a named counter by `delta`.
    fn counter(&self, name: &str, delta: u64);
    /// Record a latency observation against a named histogram.
    fn histogram(&self, name: &str, observation: Observation);
    /// Set a named gauge to an absolute value.
    fn gauge(&self, name: &str, value: i64);
}

/// In-memory [`MetricsSink`] used both as the orchestrator's default and in
/// tests that assert on recorded values.
#[derive(Default)]
pub struct InMemoryMetricsSink {
    counters: Mutex<HashMap<String, u64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
    gauges: Mutex<HashMap<String, i64>>,
}

impl InMemoryMetricsSink {
    /// Construct an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, or 0 if never touched.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    /// Recorded observations for a histogram, in insertion order.
    pub fn histogram_values(&self, name: &str) -> Vec<f64> {
        self.histograms.lock().unwrap().get(name).cloned().unwrap_or_default()
    }

    /// Current value of a gauge, or 0 if never set.
    pub fn gauge_value(&self, name: &str) -> i64 {
        self.gauges.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn counter(&self, name: &str, delta: u64) {
        *self.counters.lock().unwrap().entry(name.to_string()).or_insert(0) += delta;
    }

    fn histogram(&self, name: &str, observation: Observation) {
        self.histograms.lock().unwrap().entry(name.to_string()).or_default().push(observation.millis);
    }

    fn gauge(&self, name: &str, value: i64) {
        self.gauges.lock().unwrap().insert(name.to_string(), value);
    }
}

/// Snapshot the process-global atomics into a sink, for periodic export.
pub fn export_global_counters(sink: &dyn MetricsSink) {
    sink.counter("plans_generated", PLANS_GENERATED.swap(0, Ordering::Relaxed));
    sink.counter("plans_repaired", PLANS_REPAIRED.swap(0, Ordering::Relaxed));
    sink.counter("fallbacks_triggered", FALLBACKS_TRIGGERED.swap(0, Ordering::Relaxed));
    sink.counter("sessions_completed", SESSIONS_COMPLETED.swap(0, Ordering::Relaxed));
    sink.counter("sessions_failed", SESSIONS_FAILED.swap(0, Ordering::Relaxed));
    sink.counter("sessions_rejected", SESSIONS_REJECTED.swap(0, Ordering::Relaxed));
    sink.counter("events_published", EVENTS_PUBLISHED.swap(0, Ordering::Relaxed));
    sink.counter("events_delivered", EVENTS_DELIVERED.swap(0, Ordering::Relaxed));
    sink.counter("deliveries_failed", DELIVERIES_FAILED.swap(0, Ordering::Relaxed));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_calls() {
        let sink = InMemoryMetricsSink::new();
        sink.counter("plans_generated", 1);
        sink.counter("plans_generated", 2);
        assert_eq!(sink.counter_value("plans_generated"), 3);
    }

    #[test]
    fn histogram_keeps_every_observation() {
        let sink = InMemoryMetricsSink::new();
        sink.histogram("plan_latency_ms", Observation { millis: 12.5 });
        sink.histogram("plan_latency_ms", Observation { millis: 40.0 });
        assert_eq!(sink.histogram_values("plan_latency_ms"), vec![12.5, 40.0]);
    }

    #[test]
    fn gauge_holds_last_value() {
        let sink = InMemoryMetricsSink::new();
        sink.gauge("active_sessions", 3);
        sink.gauge("active_sessions", 5);
        assert_eq!(sink.gauge_value("active_sessions"), 5);
    }

    #[test]
    fn export_drains_global_atomics() {
        PLANS_REPAIRED.store(0, Ordering::Relaxed);
        PLANS_REPAIRED.fetch_add(4, Ordering::Relaxed);
        let sink = InMemoryMetricsSink::new();
        export_global_counters(&sink);
        assert_eq!(sink.counter_value("plans_repaired"), 4);
        assert_eq!(PLANS_REPAIRED.load(Ordering::Relaxed), 0);
    }
}
