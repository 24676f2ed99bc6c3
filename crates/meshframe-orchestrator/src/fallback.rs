//! Fallback manager: the degradation ladder spec.md §4.7 climbs down when
//! the normal planning or execution path fails. Each rung is tried only
//! after the one above it has been exhausted.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use meshframe_types::{AgentId, CorrelationId, Task, TaskPlan};

use crate::llm::LlmCompleter;
use crate::prompt::Prompt;
use crate::registry::AgentRegistry;

/// Strategies 2 (single-agent routing) and 3 (direct answer), plus the
/// deterministic emergency response, all keyed off the live registry and
/// the same LLM completer the planner uses.
pub struct FallbackManager {
    registry: Arc<AgentRegistry>,
    llm: Arc<dyn LlmCompleter>,
}

impl FallbackManager {
    /// Construct a fallback manager over the shared registry and LLM
    /// completer.
    pub fn new(registry: Arc<AgentRegistry>, llm: Arc<dyn LlmCompleter>) -> Self {
        Self { registry, llm }
    }

    /// Strategy 2: keyword-scan the query for the best-fit capability and
    /// produce a one-task plan with the raw query as `params.query`.
    pub async fn single_agent_plan(
        &self,
        query: &str,
        correlation_id: CorrelationId,
    ) -> Result<TaskPlan, anyhow::Error> {
        crate::metrics::FALLBACKS_TRIGGERED.fetch_add(1, Ordering::Relaxed);
        let capabilities = self.registry.known_capabilities().await;
        let lower_query = query.to_lowercase();

        let mut best: Option<&String> = None;
        for capability in &capabilities {
            let keyword = capability.split('.').next().unwrap_or(capability);
            if lower_query.contains(keyword) {
                best = Some(capability);
                break;
            }
        }
        let capability = best
            .or_else(|| capabilities.iter().next())
            .ok_or_else(|| anyhow::anyhow!("no capability available for single-agent fallback routing"))?
            .clone();

        let agents = self.registry.lookup(&capability).await;
        let agent_id = agents
            .first()
            .ok_or_else(|| anyhow::anyhow!("capability '{capability}' has no healthy agent for fallback routing"))?
            .clone();

        let mut task = Task::new(correlation_id, capability);
        task.parameters.insert("query".to_string(), serde_json::Value::String(query.to_string()));
        task.priority = 1;
        let _ = agent_id; // agent selection informs dispatch; the task itself is capability-addressed.

        let mut plan = TaskPlan::new(correlation_id, query);
        plan.tasks.push(task);
        Ok(plan)
    }

    /// Strategy 3: ask the LLM to answer the user's query directly,
    /// bypassing the agent mesh entirely.
    pub async fn direct_answer(&self, query: &str) -> Result<String, anyhow::Error> {
        crate::metrics::FALLBACKS_TRIGGERED.fetch_add(1, Ordering::Relaxed);
        let prompt = Prompt {
            kind: crate::prompt::PromptKind::Synthesis,
            text: format!(
                "The agent mesh is unavailable. ANSWER THE USER DIRECTLY AND CONCISELY using your own \
                 knowledge, noting that live data could not be fetched.\n\n## QUERY\n{query}\n"
            ),
            temperature: 0.6,
            max_tokens: 512,
        };
        self.llm.complete(&prompt).await
    }

    /// Last resort: a deterministic message, preserving `correlation_id` at
    /// the call site (the string itself carries no identifiers, so it can
    /// never leak internal state, per spec.md §7).
    pub fn emergency_response(reason: &str) -> String {
        format!("I could not complete your request because {reason}.")
    }

    /// Attempt to find a healthy agent for `capability` other than
    /// `exclude`, used when a required task's agent fails and the session
    /// wants to retry once before escalating.
    pub async fn alternate_agent(&self, capability: &str, exclude: &AgentId) -> Option<AgentId> {
        self.registry.lookup(capability).await.into_iter().find(|agent_id| agent_id != exclude)
    }

    /// The synthesizer-facing marker for an optional task that never
    /// completed.
    pub fn unavailable_marker(capability: &str) -> String {
        format!("[{capability} unavailable]")
    }
}
