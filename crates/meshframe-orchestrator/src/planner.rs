//! Planning engine: turns a normalized free-text query into a validated
//! [`TaskPlan`] by calling the LLM, parsing its JSON output, validating it
//! against the capability catalogue, and repairing it once before handing
//! off to the fallback chain.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use meshframe_types::{AgentId, CorrelationId, PlanError, Task, TaskPlan};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::fallback::FallbackManager;
use crate::llm::LlmCompleter;
use crate::normalizer;
use crate::prompt::{build_planning_prompt, build_repair_prompt, CapabilityCatalogueEntry};
use crate::registry::AgentRegistry;

/// Failure modes of [`PlanningEngine::generate_plan`]. Only raised once the
/// repair retry *and* the fallback manager's plan-construction strategy
/// have both failed (spec.md §4.5).
#[derive(Debug, thiserror::Error)]
pub enum PlanningFailed {
    /// The LLM never returned a parseable, valid plan, and the fallback
    /// manager could not construct a substitute plan either.
    #[error("planning failed after repair and fallback: {0}")]
    Exhausted(String),
}

#[derive(Debug, Deserialize)]
struct RawTask {
    capability: String,
    #[serde(default)]
    params: Map<String, Value>,
    agent: String,
    priority: u32,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// One defect found while validating a freshly parsed plan.
#[derive(Debug)]
enum Defect {
    NotJson(String),
    UnknownCapability(String),
    UnhealthyAgent(String, String),
    PriorityTooLow(String),
    UnknownDependency(String, String),
    Cycle,
    Empty,
}

impl Defect {
    fn describe(&self) -> String {
        match self {
            Defect::NotJson(err) => format!("output was not a JSON array of tasks: {err}"),
            Defect::UnknownCapability(cap) => format!("capability '{cap}' is not in the capability catalogue"),
            Defect::UnhealthyAgent(agent, cap) => {
                format!("agent '{agent}' assigned to capability '{cap}' is not currently healthy")
            }
            Defect::PriorityTooLow(cap) => format!("task for capability '{cap}' has priority < 1"),
            Defect::UnknownDependency(cap, dep) => {
                format!("task for capability '{cap}' depends on '{dep}', which is not a capability in this plan")
            }
            Defect::Cycle => "the dependency graph between tasks contains a cycle".to_string(),
            Defect::Empty => "the plan contained no tasks".to_string(),
        }
    }
}

/// Calls the LLM, parses and validates its plan output, and assigns task
/// ids — the one component in the mesh that talks to the LLM on the
/// critical path of answering a user request.
pub struct PlanningEngine {
    registry: std::sync::Arc<AgentRegistry>,
    llm: std::sync::Arc<dyn LlmCompleter>,
    fallback: std::sync::Arc<FallbackManager>,
}

impl PlanningEngine {
    /// Construct a planner over the shared registry, LLM completer, and
    /// fallback manager.
    pub fn new(
        registry: std::sync::Arc<AgentRegistry>,
        llm: std::sync::Arc<dyn LlmCompleter>,
        fallback: std::sync::Arc<FallbackManager>,
    ) -> Self {
        Self { registry, llm, fallback }
    }

    /// Generate a validated plan for `query`, retrying the LLM once via a
    /// repair prompt before handing off to the fallback manager.
    pub async fn generate_plan(
        &self,
        query: &str,
        correlation_id: CorrelationId,
    ) -> Result<TaskPlan, PlanningFailed> {
        let capabilities = self.registry.known_capabilities().await;
        let catalogue = self.catalogue_entries(&capabilities).await;

        let planning_prompt = build_planning_prompt(query, &catalogue);
        let raw_output = match self.llm.complete(&planning_prompt).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "llm call failed while generating plan; falling back");
                return self.fall_back(query, correlation_id).await;
            }
        };

        match self.parse_and_validate(query, &raw_output, &capabilities, correlation_id).await {
            Ok(plan) => return Ok(plan),
            Err(defect) => {
                debug!(defect = %defect.describe(), "initial plan invalid, issuing repair prompt");
                let repair_prompt = build_repair_prompt(&raw_output, &defect.describe());
                let Ok(repaired) = self.llm.complete(&repair_prompt).await else {
                    return self.fall_back(query, correlation_id).await;
                };
                match self.parse_and_validate(query, &repaired, &capabilities, correlation_id).await {
                    Ok(plan) => {
                        crate::metrics::PLANS_REPAIRED.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        Ok(plan)
                    }
                    Err(_) => self.fall_back(query, correlation_id).await,
                }
            }
        }
    }

    async fn fall_back(&self, query: &str, correlation_id: CorrelationId) -> Result<TaskPlan, PlanningFailed> {
        self.fallback
            .single_agent_plan(query, correlation_id)
            .await
            .map_err(|err| PlanningFailed::Exhausted(err.to_string()))
    }

    async fn catalogue_entries(&self, capabilities: &HashSet<String>) -> Vec<CapabilityCatalogueEntry> {
        capabilities
            .iter()
            .map(|capability| CapabilityCatalogueEntry {
                capability: capability.clone(),
                description: format!("agent-provided capability '{capability}'"),
                example_params: Value::Object(Map::new()),
            })
            .collect()
    }

    async fn parse_and_validate(
        &self,
        query: &str,
        raw_output: &str,
        known_capabilities: &HashSet<String>,
        correlation_id: CorrelationId,
    ) -> Result<TaskPlan, Defect> {
        let raw_tasks: Vec<RawTask> = parse_json_array(raw_output).map_err(Defect::NotJson)?;
        if raw_tasks.is_empty() {
            return Err(Defect::Empty);
        }

        for raw in &raw_tasks {
            if !known_capabilities.contains(&raw.capability) {
                return Err(Defect::UnknownCapability(raw.capability.clone()));
            }
            if !self.registry.healthy(&AgentId::new(raw.agent.clone())).await {
                return Err(Defect::UnhealthyAgent(raw.agent.clone(), raw.capability.clone()));
            }
            if raw.priority < 1 {
                return Err(Defect::PriorityTooLow(raw.capability.clone()));
            }
            for dep in &raw.dependencies {
                if !raw_tasks.iter().any(|t| &t.capability == dep) {
                    return Err(Defect::UnknownDependency(raw.capability.clone(), dep.clone()));
                }
            }
        }

        let mut plan = TaskPlan::new(correlation_id, query);
        let capability_to_task_id: HashMap<String, meshframe_types::TaskId> =
            raw_tasks.iter().map(|raw| (raw.capability.clone(), meshframe_types::TaskId::new())).collect();

        for raw in raw_tasks {
            let task_id = capability_to_task_id[&raw.capability];
            let mut params = raw.params;
            if let Err(err) = normalizer::normalize_params(&mut params) {
                warn!(error = %err, "parameter normalization failed; passing raw value through");
            }
            let dependencies = raw
                .dependencies
                .iter()
                .filter_map(|dep| capability_to_task_id.get(dep).copied())
                .collect();
            let mut task = Task::new(correlation_id, raw.capability);
            task.task_id = task_id;
            task.parameters = params;
            task.dependencies = dependencies;
            task.priority = raw.priority;
            task.timeout = Duration::from_secs(30);
            plan.tasks.push(task);
        }

        match plan.validate(known_capabilities) {
            Ok(()) => Ok(plan),
            Err(PlanError::Cycle(_)) => Err(Defect::Cycle),
            Err(other) => Err(Defect::NotJson(other.to_string())),
        }
    }
}

fn parse_json_array(raw: &str) -> Result<Vec<RawTask>, String> {
    serde_json::from_str(raw.trim()).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use meshframe_types::{AgentDescriptor, HealthData, HealthStatus};

    use super::*;
    use crate::llm::test_support::ScriptedCompleter;

    async fn registry_with_weather_agent() -> Arc<AgentRegistry> {
        let registry = Arc::new(AgentRegistry::new(StdDuration::from_secs(60), 0));
        registry
            .register(AgentDescriptor::new(
                AgentId::new("weather-agent-1"),
                "weather",
                ["weather.get".to_string()].into_iter().collect(),
                "agent.weather-agent-1",
            ))
            .await;
        registry
    }

    #[tokio::test]
    async fn valid_plan_is_parsed_and_normalized_on_first_try() {
        let registry = registry_with_weather_agent().await;
        let llm = Arc::new(ScriptedCompleter::new(vec![Ok(
            r#"[{"capability":"weather.get","agent":"weather-agent-1","params":{"location":"nice, fr"},"priority":1,"dependencies":[]}]"#.to_string(),
        )]));
        let fallback = Arc::new(FallbackManager::new(registry.clone(), llm.clone()));
        let planner = PlanningEngine::new(registry, llm, fallback);

        let plan = planner.generate_plan("weather in nice", CorrelationId::new()).await.unwrap();
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].parameters["location"], "Nice,FR");
    }

    #[tokio::test]
    async fn malformed_output_triggers_repair_then_succeeds() {
        let registry = registry_with_weather_agent().await;
        let llm = Arc::new(ScriptedCompleter::new(vec![
            Ok("sorry, here's the weather for nice".to_string()),
            Ok(r#"[{"capability":"weather.get","agent":"weather-agent-1","params":{"location":"Nice,FR"},"priority":1,"dependencies":[]}]"#.to_string()),
        ]));
        let fallback = Arc::new(FallbackManager::new(registry.clone(), llm.clone()));
        let planner = PlanningEngine::new(registry, llm, fallback);

        let plan = planner.generate_plan("weather in nice", CorrelationId::new()).await.unwrap();
        assert_eq!(plan.tasks.len(), 1);
    }

    #[tokio::test]
    async fn unknown_capability_falls_back_to_single_agent_plan() {
        let registry = registry_with_weather_agent().await;
        let llm = Arc::new(ScriptedCompleter::new(vec![
            Ok(r#"[{"capability":"travel.plan","agent":"weather-agent-1","params":{},"priority":1,"dependencies":[]}]"#.to_string()),
            Ok(r#"[{"capability":"travel.plan","agent":"weather-agent-1","params":{},"priority":1,"dependencies":[]}]"#.to_string()),
        ]));
        let fallback = Arc::new(FallbackManager::new(registry.clone(), llm.clone()));
        let planner = PlanningEngine::new(registry, llm, fallback);

        let plan = planner.generate_plan("weather in nice", CorrelationId::new()).await.unwrap();
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].capability, "weather.get");
    }

    #[tokio::test]
    async fn heartbeat_unhealthy_agent_is_rejected_and_repaired() {
        let registry = registry_with_weather_agent().await;
        registry
            .heartbeat(
                &AgentId::new("weather-agent-1"),
                HealthData { status: HealthStatus::Degraded, error_count: 5, metrics: Map::new() },
            )
            .await;
        let llm = Arc::new(ScriptedCompleter::new(vec![
            Ok(r#"[{"capability":"weather.get","agent":"weather-agent-1","params":{},"priority":1,"dependencies":[]}]"#.to_string()),
        ]));
        let fallback = Arc::new(FallbackManager::new(registry.clone(), llm.clone()));
        let planner = PlanningEngine::new(registry, llm, fallback);

        let result = planner.generate_plan("weather in nice", CorrelationId::new()).await;
        assert!(result.is_err());
    }
}
