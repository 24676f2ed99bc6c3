//! Agent registry: tracks live agents, their declared capabilities, and
//! heartbeat-derived health. Reads are non-blocking and serve a
//! copy-on-write snapshot; writes replace the whole snapshot under a
//! single lock, per spec.md §4.6/§5.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use meshframe_types::{AgentDescriptor, AgentId, HealthData, HealthStatus};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// A status-change notification emitted by the heartbeat sweeper or an
/// explicit heartbeat call, so the health/metrics layer can publish
/// `system.health.*` alerts without the registry depending on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HealthTransition {
    /// An agent flipped from healthy to unhealthy.
    Degraded(AgentId),
    /// An agent flipped from unhealthy back to healthy.
    Recovered(AgentId),
}

/// Observes [`HealthTransition`]s as they occur.
pub trait HealthObserver: Send + Sync {
    /// Called once per transition.
    fn observe(&self, transition: HealthTransition);
}

/// A no-op observer for registries that don't need alerting.
pub struct NoopHealthObserver;

impl HealthObserver for NoopHealthObserver {
    fn observe(&self, _transition: HealthTransition) {}
}

type Snapshot = Arc<HashMap<AgentId, AgentDescriptor>>;

/// The live agent directory.
pub struct AgentRegistry {
    snapshot: RwLock<Snapshot>,
    heartbeat_timeout: Duration,
    error_threshold: u32,
    observer: Arc<dyn HealthObserver>,
}

impl AgentRegistry {
    /// Construct an empty registry. Agents are considered unhealthy if no
    /// heartbeat is seen within `heartbeat_timeout`; a heartbeat restores
    /// health only when its self-reported error count is at most
    /// `error_threshold`.
    pub fn new(heartbeat_timeout: Duration, error_threshold: u32) -> Self {
        Self::with_observer(heartbeat_timeout, error_threshold, Arc::new(NoopHealthObserver))
    }

    /// Construct a registry that reports health transitions to `observer`.
    pub fn with_observer(
        heartbeat_timeout: Duration,
        error_threshold: u32,
        observer: Arc<dyn HealthObserver>,
    ) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            heartbeat_timeout,
            error_threshold,
            observer,
        }
    }

    /// Register a new agent, or replace its descriptor if already present.
    pub async fn register(&self, descriptor: AgentDescriptor) {
        let agent_id = descriptor.agent_id.clone();
        let mut guard = self.snapshot.write().await;
        let mut next = (**guard).clone();
        next.insert(agent_id.clone(), descriptor);
        *guard = Arc::new(next);
        info!(agent_id = %agent_id, "agent registered");
    }

    /// Remove an agent from the directory.
    pub async fn unregister(&self, agent_id: &AgentId) {
        let mut guard = self.snapshot.write().await;
        let mut next = (**guard).clone();
        next.remove(agent_id);
        *guard = Arc::new(next);
        info!(agent_id = %agent_id, "agent unregistered");
    }

    /// Record a heartbeat. Health is restored iff `health_data.status ==
    /// Healthy` and `error_count <= threshold`; otherwise the agent is
    /// marked unhealthy.
    pub async fn heartbeat(&self, agent_id: &AgentId, health_data: HealthData) {
        let mut guard = self.snapshot.write().await;
        let mut next = (**guard).clone();
        let Some(descriptor) = next.get_mut(agent_id) else {
            warn!(agent_id = %agent_id, "heartbeat for unknown agent");
            return;
        };
        let was_healthy = descriptor.healthy;
        descriptor.last_heartbeat = Utc::now();
        descriptor.healthy =
            health_data.status == HealthStatus::Healthy && health_data.error_count <= self.error_threshold;
        let now_healthy = descriptor.healthy;
        *guard = Arc::new(next);
        self.emit_transition(agent_id, was_healthy, now_healthy);
    }

    /// Replace an agent's declared capability set.
    pub async fn update_capabilities(&self, agent_id: &AgentId, capabilities: std::collections::HashSet<String>) {
        let mut guard = self.snapshot.write().await;
        let mut next = (**guard).clone();
        if let Some(descriptor) = next.get_mut(agent_id) {
            descriptor.capabilities = capabilities;
        }
        *guard = Arc::new(next);
    }

    /// Agent ids currently healthy and advertising `capability`.
    pub async fn lookup(&self, capability: &str) -> Vec<AgentId> {
        let snapshot = self.snapshot.read().await;
        snapshot
            .values()
            .filter(|descriptor| descriptor.can_serve(capability))
            .map(|descriptor| descriptor.agent_id.clone())
            .collect()
    }

    /// Whether `agent_id` is currently known and healthy.
    pub async fn healthy(&self, agent_id: &AgentId) -> bool {
        self.snapshot.read().await.get(agent_id).map(|d| d.healthy).unwrap_or(false)
    }

    /// A read-only snapshot of every registered agent.
    pub async fn snapshot(&self) -> Vec<AgentDescriptor> {
        self.snapshot.read().await.values().cloned().collect()
    }

    /// The set of capabilities currently served by at least one healthy
    /// agent — the catalogue the planning engine validates plans against.
    pub async fn known_capabilities(&self) -> std::collections::HashSet<String> {
        self.snapshot
            .read()
            .await
            .values()
            .filter(|d| d.healthy)
            .flat_map(|d| d.capabilities.iter().cloned())
            .collect()
    }

    /// Scan for agents whose heartbeat is overdue and mark them unhealthy,
    /// emitting a transition for each. Intended to run on a periodic
    /// sweeper task alongside the correlation manager's cleanup sweep.
    pub async fn sweep_heartbeats(&self) {
        let now = Utc::now();
        let mut guard = self.snapshot.write().await;
        let mut next = (**guard).clone();
        let mut transitions = Vec::new();
        for descriptor in next.values_mut() {
            if descriptor.healthy
                && now.signed_duration_since(descriptor.last_heartbeat).to_std().unwrap_or_default()
                    > self.heartbeat_timeout
            {
                descriptor.healthy = false;
                transitions.push(HealthTransition::Degraded(descriptor.agent_id.clone()));
            }
        }
        *guard = Arc::new(next);
        drop(guard);
        for transition in transitions {
            warn!(?transition, "agent heartbeat overdue");
            self.observer.observe(transition);
        }
    }

    fn emit_transition(&self, agent_id: &AgentId, was_healthy: bool, now_healthy: bool) {
        match (was_healthy, now_healthy) {
            (true, false) => self.observer.observe(HealthTransition::Degraded(agent_id.clone())),
            (false, true) => self.observer.observe(HealthTransition::Recovered(agent_id.clone())),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use chrono::Duration as ChronoDuration;
    use serde_json::Map;

    use super::*;

    struct RecordingObserver {
        transitions: Mutex<Vec<HealthTransition>>,
    }

    impl HealthObserver for RecordingObserver {
        fn observe(&self, transition: HealthTransition) {
            self.transitions.lock().unwrap().push(transition);
        }
    }

    fn descriptor(agent_id: &str, capability: &str) -> AgentDescriptor {
        AgentDescriptor::new(
            AgentId::new(agent_id),
            "test-agent",
            [capability.to_string()].into_iter().collect(),
            format!("agent.{agent_id}"),
        )
    }

    #[tokio::test]
    async fn lookup_returns_only_healthy_matching_agents() {
        let registry = AgentRegistry::new(Duration::from_secs(30), 0);
        registry.register(descriptor("weather-1", "weather.get")).await;
        registry.register(descriptor("travel-1", "travel.plan")).await;

        assert_eq!(registry.lookup("weather.get").await, vec![AgentId::new("weather-1")]);
        assert!(registry.lookup("unknown.capability").await.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_restores_health_only_under_threshold() {
        let registry = AgentRegistry::new(Duration::from_secs(30), 1);
        registry.register(descriptor("weather-1", "weather.get")).await;
        let agent_id = AgentId::new("weather-1");
        registry.unregister(&agent_id).await;
        registry.register(descriptor("weather-1", "weather.get")).await;

        registry
            .heartbeat(
                &agent_id,
                HealthData { status: HealthStatus::Degraded, error_count: 0, metrics: Map::new() },
            )
            .await;
        assert!(!registry.healthy(&agent_id).await);

        registry
            .heartbeat(
                &agent_id,
                HealthData { status: HealthStatus::Healthy, error_count: 2, metrics: Map::new() },
            )
            .await;
        assert!(!registry.healthy(&agent_id).await);

        registry
            .heartbeat(
                &agent_id,
                HealthData { status: HealthStatus::Healthy, error_count: 0, metrics: Map::new() },
            )
            .await;
        assert!(registry.healthy(&agent_id).await);
    }

    #[tokio::test]
    async fn sweep_marks_overdue_agents_unhealthy_and_notifies() {
        let observer = Arc::new(RecordingObserver { transitions: Mutex::new(Vec::new()) });
        let registry = AgentRegistry::with_observer(Duration::from_secs(1), 0, observer.clone());
        let mut stale = descriptor("weather-1", "weather.get");
        stale.last_heartbeat = Utc::now() - ChronoDuration::seconds(10);
        registry.register(stale).await;

        registry.sweep_heartbeats().await;

        assert!(!registry.healthy(&AgentId::new("weather-1")).await);
        assert_eq!(
            observer.transitions.lock().unwrap().as_slice(),
            &[HealthTransition::Degraded(AgentId::new("weather-1"))]
        );
    }

    #[tokio::test]
    async fn update_capabilities_replaces_the_set() {
        let registry = AgentRegistry::new(Duration::from_secs(30), 0);
        registry.register(descriptor("weather-1", "weather.get")).await;
        let agent_id = AgentId::new("weather-1");
        let new_caps: HashSet<String> = ["weather.get", "weather.forecast"].into_iter().map(String::from).collect();
        registry.update_capabilities(&agent_id, new_caps.clone()).await;
        let snapshot = registry.snapshot().await;
        let found = snapshot.iter().find(|d| d.agent_id == agent_id).unwrap();
        assert_eq!(found.capabilities, new_caps);
    }
}
