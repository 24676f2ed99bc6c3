//! Agent descriptors and health reporting types shared between the
//! registry, planner and health/metrics components.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::AgentId;

/// Health as self-reported by an agent, or inferred by the registry's
/// heartbeat sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Responding to heartbeats within the configured grace period.
    Healthy,
    /// Heartbeat overdue, or self-reported degraded.
    Degraded,
}

/// Aggregate counters the registry tracks per agent, surfaced to the
/// health/metrics sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentHealthMetrics {
    /// Tasks dispatched to this agent.
    pub requests_handled: u64,
    /// Tasks that ended in failure or timeout.
    pub errors: u64,
    /// Rolling average response latency in milliseconds.
    pub avg_latency_ms: f64,
}

/// A registered agent and the capabilities it can serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// The agent's stable, self-chosen identifier.
    pub agent_id: AgentId,
    /// A human-readable classification (e.g. `weather`, `travel-planner`).
    pub agent_type: String,
    /// Capabilities this agent can serve, matched against task capability
    /// requirements by the planning engine.
    pub capabilities: HashSet<String>,
    /// Address the orchestrator uses to reach the agent (bus topic or
    /// transport-specific endpoint).
    pub endpoint: String,
    /// Free-form registration metadata.
    pub metadata: Map<String, Value>,
    /// Timestamp of the most recent heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Whether the registry currently considers this agent eligible for
    /// dispatch.
    pub healthy: bool,
    /// Rolling health counters.
    pub metrics: AgentHealthMetrics,
}

impl AgentDescriptor {
    /// Register a new, healthy agent as of now.
    pub fn new(
        agent_id: AgentId,
        agent_type: impl Into<String>,
        capabilities: HashSet<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            agent_id,
            agent_type: agent_type.into(),
            capabilities,
            endpoint: endpoint.into(),
            metadata: Map::new(),
            last_heartbeat: Utc::now(),
            healthy: true,
            metrics: AgentHealthMetrics::default(),
        }
    }

    /// Whether this agent can serve `capability` and is currently healthy.
    pub fn can_serve(&self, capability: &str) -> bool {
        self.healthy && self.capabilities.contains(capability)
    }
}

/// A self-reported health update from an agent, published on
/// `system.health.<agent-id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthData {
    /// Self-reported status.
    pub status: HealthStatus,
    /// Errors observed by the agent since its last report.
    pub error_count: u32,
    /// Free-form metrics the agent wants surfaced.
    pub metrics: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_serve_requires_both_health_and_capability() {
        let mut agent = AgentDescriptor::new(
            AgentId::new("weather-agent-1"),
            "weather",
            ["weather".to_string()].into_iter().collect(),
            "agent.weather-agent-1",
        );
        assert!(agent.can_serve("weather"));
        assert!(!agent.can_serve("travel"));
        agent.healthy = false;
        assert!(!agent.can_serve("weather"));
    }
}
