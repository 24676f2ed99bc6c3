//! Orchestrator agent: the composition root that wires the planner,
//! registry, correlation manager, fallback chain and session manager to a
//! live [`EventBroker`], subscribing to the four topics spec.md §4.1 names
//! as the orchestrator's inbound surface: `user.request`,
//! `task.response.**`, `agent.register` and `agent.heartbeat`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshframe_bus_core::{EventBroker, EventHandler};
use meshframe_types::{AgentDescriptor, AgentId, CorrelationId, Event, HealthData, TopicPattern};
use tracing::warn;

use crate::correlation::CorrelationManager;
use crate::fallback::FallbackManager;
use crate::llm::LlmCompleter;
use crate::planner::PlanningEngine;
use crate::registry::AgentRegistry;
use crate::session::SessionManager;

const USER_REQUEST_TOPIC: &str = "user.request";
const TASK_RESPONSE_PATTERN: &str = "task.response.**";
const AGENT_REGISTER_TOPIC: &str = "agent.register";
const AGENT_HEARTBEAT_TOPIC: &str = "agent.heartbeat";

/// The running orchestrator: owns every collaborator and the subscriptions
/// that feed them.
pub struct OrchestratorAgent {
    registry: Arc<AgentRegistry>,
    correlation: Arc<CorrelationManager>,
    sessions: Arc<SessionManager>,
    broker: Arc<dyn EventBroker>,
    source: String,
    heartbeat_sweep_interval: Duration,
    correlation_sweep_interval: Duration,
}

impl OrchestratorAgent {
    /// Assemble the orchestrator from its collaborators. `broker` must
    /// already be constructed (but need not be started — [`Self::start`]
    /// starts it).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        llm: Arc<dyn LlmCompleter>,
        broker: Arc<dyn EventBroker>,
        source: impl Into<String>,
        task_timeout: Duration,
        correlation_grace: Duration,
        heartbeat_sweep_interval: Duration,
        correlation_sweep_interval: Duration,
        max_concurrent_sessions: usize,
    ) -> Self {
        let source = source.into();
        let fallback = Arc::new(FallbackManager::new(registry.clone(), llm.clone()));
        let planner = Arc::new(PlanningEngine::new(registry.clone(), llm.clone(), fallback.clone()));
        let correlation = Arc::new(CorrelationManager::new(correlation_grace));
        let sessions = Arc::new(SessionManager::new(
            registry.clone(),
            planner,
            fallback,
            correlation.clone(),
            llm,
            broker.clone(),
            source.clone(),
            task_timeout,
            max_concurrent_sessions,
        ));

        Self { registry, correlation, sessions, broker, source, heartbeat_sweep_interval, correlation_sweep_interval }
    }

    /// Start the broker, register every subscription, and spawn the
    /// background sweepers. Idempotent at the broker level; calling twice
    /// re-registers duplicate subscriptions, so callers should call this
    /// exactly once per process.
    pub async fn start(&self) -> Result<(), anyhow::Error> {
        self.broker.start().await?;

        let user_request: Arc<dyn EventHandler> = Arc::new(UserRequestHandler { sessions: self.sessions.clone() });
        self.broker
            .subscribe(&self.source, TopicPattern::new(USER_REQUEST_TOPIC)?, user_request)
            .await?;

        let task_response: Arc<dyn EventHandler> = Arc::new(TaskResponseHandler { sessions: self.sessions.clone() });
        self.broker
            .subscribe(&self.source, TopicPattern::new(TASK_RESPONSE_PATTERN)?, task_response)
            .await?;

        let agent_register: Arc<dyn EventHandler> = Arc::new(AgentRegisterHandler { registry: self.registry.clone() });
        self.broker
            .subscribe(&self.source, TopicPattern::new(AGENT_REGISTER_TOPIC)?, agent_register)
            .await?;

        let agent_heartbeat: Arc<dyn EventHandler> = Arc::new(AgentHeartbeatHandler { registry: self.registry.clone() });
        self.broker
            .subscribe(&self.source, TopicPattern::new(AGENT_HEARTBEAT_TOPIC)?, agent_heartbeat)
            .await?;

        let registry = self.registry.clone();
        let heartbeat_interval = self.heartbeat_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                registry.sweep_heartbeats().await;
            }
        });
        crate::correlation::spawn_sweeper(self.correlation.clone(), self.correlation_sweep_interval);

        Ok(())
    }

    /// Gracefully stop the broker. Background sweepers are left to exit
    /// with the process; they hold no resources worth releasing early.
    pub async fn stop(&self) -> Result<(), anyhow::Error> {
        self.broker.stop().await?;
        Ok(())
    }
}

struct UserRequestHandler {
    sessions: Arc<SessionManager>,
}

#[async_trait]
impl EventHandler for UserRequestHandler {
    async fn handle(&self, event: Event) -> Result<(), anyhow::Error> {
        let data = event.data();
        let query = data
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("user.request event missing 'query' field"))?;
        if let Err(err) = self.sessions.accept(query, CorrelationId::new()).await {
            warn!(error = %err, "user.request rejected");
        }
        Ok(())
    }
}

struct TaskResponseHandler {
    sessions: Arc<SessionManager>,
}

#[async_trait]
impl EventHandler for TaskResponseHandler {
    async fn handle(&self, event: Event) -> Result<(), anyhow::Error> {
        let data = event.data();
        let correlation_id: CorrelationId = data
            .get("correlation_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("task.response event missing 'correlation_id'"))?
            .parse()?;
        let payload = data.get("payload").cloned();
        let error = data.get("error").cloned();
        self.sessions.on_task_response(correlation_id, payload, error).await;
        Ok(())
    }
}

struct AgentRegisterHandler {
    registry: Arc<AgentRegistry>,
}

#[async_trait]
impl EventHandler for AgentRegisterHandler {
    async fn handle(&self, event: Event) -> Result<(), anyhow::Error> {
        let data = event.data();
        let agent_id = data
            .get("agent_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("agent.register event missing 'agent_id'"))?;
        let agent_type = data.get("agent_type").and_then(|v| v.as_str()).unwrap_or("unknown");
        let endpoint = data
            .get("endpoint")
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| event.source());
        let capabilities = data
            .get("capabilities")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        self.registry
            .register(AgentDescriptor::new(AgentId::new(agent_id), agent_type, capabilities, endpoint))
            .await;
        Ok(())
    }
}

struct AgentHeartbeatHandler {
    registry: Arc<AgentRegistry>,
}

#[async_trait]
impl EventHandler for AgentHeartbeatHandler {
    async fn handle(&self, event: Event) -> Result<(), anyhow::Error> {
        let data = event.data();
        let agent_id = data
            .get("agent_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("agent.heartbeat event missing 'agent_id'"))?;
        let health_data: HealthData = match data.get("health") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => {
                warn!(%agent_id, "heartbeat event missing 'health' payload, treating as degraded");
                return Ok(());
            }
        };
        self.registry.heartbeat(&AgentId::new(agent_id), health_data).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use meshframe_bus_core::{BrokerConfig, InMemoryBroker};

    use super::*;
    use crate::llm::test_support::ScriptedCompleter;

    #[tokio::test]
    async fn agent_register_then_heartbeat_makes_it_healthy() {
        let registry = Arc::new(AgentRegistry::new(StdDuration::from_secs(60), 0));
        let llm = Arc::new(ScriptedCompleter::new(vec![]));
        let broker = InMemoryBroker::new("meshframe://test", BrokerConfig::default());
        let orchestrator = OrchestratorAgent::new(
            registry.clone(),
            llm,
            broker.clone() as Arc<dyn EventBroker>,
            "meshframe://orchestrator",
            StdDuration::from_secs(2),
            StdDuration::from_millis(50),
            StdDuration::from_secs(30),
            StdDuration::from_secs(30),
            64,
        );
        orchestrator.start().await.unwrap();

        let register = Event::builder(AGENT_REGISTER_TOPIC, "meshframe://weather-agent-1")
            .data(serde_json::json!({
                "agent_id": "weather-agent-1",
                "agent_type": "weather",
                "capabilities": ["weather.get"],
                "endpoint": "agent.weather-agent-1",
            }))
            .build()
            .unwrap();
        broker.publish(register).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(registry.healthy(&AgentId::new("weather-agent-1")).await);

        let heartbeat = Event::builder(AGENT_HEARTBEAT_TOPIC, "meshframe://weather-agent-1")
            .data(serde_json::json!({
                "agent_id": "weather-agent-1",
                "health": {"status": "degraded", "error_count": 3, "metrics": {}},
            }))
            .build()
            .unwrap();
        broker.publish(heartbeat).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(!registry.healthy(&AgentId::new("weather-agent-1")).await);
    }
}
