//! Orchestration session: the per-request state machine that turns an
//! accepted user request into exactly one `user.response`, driving the
//! planner, the registry, the correlation manager and the fallback chain
//! along the way (spec.md §4.8).

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use meshframe_bus_core::EventBroker;
use meshframe_types::{CorrelationId, Event, SessionId, TaskId, TaskStatus};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::fallback::FallbackManager;
use crate::llm::LlmCompleter;
use crate::planner::PlanningEngine;
use crate::prompt::{build_synthesis_prompt, TaskResultSummary};
use crate::registry::AgentRegistry;

/// Failure modes for [`SessionManager::accept`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    /// The manager already has `max_concurrent_sessions` sessions in
    /// flight; the request was rejected rather than queued.
    #[error("orchestrator is at capacity ({0} concurrent sessions)")]
    Overloaded(usize),
}

/// Lifecycle states of an [`OrchestrationSession`], per spec.md §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, plan not yet requested.
    Initializing,
    /// Waiting on the planning engine.
    Planning,
    /// Dispatching and awaiting task responses.
    Executing,
    /// Building the final answer from task results.
    Synthesizing,
    /// Reached a terminal success.
    Completed,
    /// Reached a terminal failure.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

/// Mutable state for a single in-flight request. Held behind a per-session
/// `Mutex` so concurrent task responses and an operator cancel never race
/// each other, while unrelated sessions never contend for the same lock.
struct OrchestrationSession {
    session_id: SessionId,
    correlation_id: CorrelationId,
    user_request: String,
    state: SessionState,
    missing_capabilities: Vec<String>,
    response_sent: bool,
}

/// Owns every in-flight [`OrchestrationSession`] and the collaborators
/// needed to drive one to completion.
pub struct SessionManager {
    registry: Arc<AgentRegistry>,
    planner: Arc<PlanningEngine>,
    fallback: Arc<FallbackManager>,
    correlation: Arc<crate::correlation::CorrelationManager>,
    synthesizer: Arc<dyn LlmCompleter>,
    broker: Arc<dyn EventBroker>,
    source: String,
    task_timeout: Duration,
    max_concurrent_sessions: usize,
    sessions: DashMap<SessionId, Arc<Mutex<OrchestrationSession>>>,
}

impl SessionManager {
    /// Construct a session manager over the shared orchestrator
    /// collaborators. `max_concurrent_sessions` bounds the number of
    /// sessions tracked at once (spec.md §5, §7); requests beyond the
    /// bound are rejected by [`Self::accept`] rather than queued.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        planner: Arc<PlanningEngine>,
        fallback: Arc<FallbackManager>,
        correlation: Arc<crate::correlation::CorrelationManager>,
        synthesizer: Arc<dyn LlmCompleter>,
        broker: Arc<dyn EventBroker>,
        source: impl Into<String>,
        task_timeout: Duration,
        max_concurrent_sessions: usize,
    ) -> Self {
        Self {
            registry,
            planner,
            fallback,
            correlation,
            synthesizer,
            broker,
            source: source.into(),
            task_timeout,
            max_concurrent_sessions,
            sessions: DashMap::new(),
        }
    }

    /// Accept a new user request, registering its session and driving it
    /// to completion on a background task. Returns immediately with the
    /// new session's id, or [`SessionError::Overloaded`] if the manager is
    /// already tracking `max_concurrent_sessions` sessions — in which case
    /// a degraded "system busy" `user.response` is published in place of
    /// dispatching the request.
    pub async fn accept(
        self: &Arc<Self>,
        user_request: impl Into<String>,
        correlation_id: CorrelationId,
    ) -> Result<SessionId, SessionError> {
        let user_request = user_request.into();
        if self.sessions.len() >= self.max_concurrent_sessions {
            warn!(
                in_flight = self.sessions.len(),
                max = self.max_concurrent_sessions,
                "rejecting request: orchestrator is at capacity"
            );
            crate::metrics::SESSIONS_REJECTED.fetch_add(1, Ordering::Relaxed);
            self.publish_busy(correlation_id).await;
            return Err(SessionError::Overloaded(self.max_concurrent_sessions));
        }

        let session_id = SessionId::new();
        let session = Arc::new(Mutex::new(OrchestrationSession {
            session_id,
            correlation_id,
            user_request: user_request.clone(),
            state: SessionState::Initializing,
            missing_capabilities: Vec::new(),
            response_sent: false,
        }));
        self.sessions.insert(session_id, session);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run(session_id).await;
        });
        Ok(session_id)
    }

    /// Cancel an in-flight session. A single cancellation response is
    /// still published, honoring the exactly-one-`user.response`
    /// invariant.
    pub async fn cancel(&self, session_id: SessionId) {
        let Some(session) = self.sessions.get(&session_id).map(|e| e.clone()) else {
            warn!(%session_id, "cancel requested for unknown session");
            return;
        };
        let correlation_id = {
            let mut guard = session.lock().await;
            if matches!(guard.state, SessionState::Completed | SessionState::Failed | SessionState::Cancelled) {
                return;
            }
            guard.state = SessionState::Cancelled;
            guard.correlation_id
        };
        self.correlation.cancel(correlation_id).await;
        self.publish_once(&session, "the request was cancelled").await;
        self.sessions.remove(&session_id);
    }

    /// Publish a "system busy" response for a request that never got a
    /// session, because the admission bound was already exhausted.
    async fn publish_busy(&self, correlation_id: CorrelationId) {
        let answer = FallbackManager::emergency_response("the orchestrator is at capacity; please retry shortly");
        let event = match Event::builder("user.response", self.source.clone())
            .data(serde_json::json!({
                "correlation_id": correlation_id.to_string(),
                "answer": answer,
                "degraded": true,
                "missing": Vec::<String>::new(),
            }))
            .build()
        {
            Ok(event) => event,
            Err(err) => {
                error!(error = %err, "failed to build busy user.response event");
                return;
            }
        };
        if let Err(err) = self.broker.publish(event).await {
            error!(error = %err, "failed to publish busy user.response");
        } else {
            crate::metrics::EVENTS_PUBLISHED.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn run(self: Arc<Self>, session_id: SessionId) {
        let Some(session) = self.sessions.get(&session_id).map(|e| e.clone()) else {
            return;
        };
        let (user_request, correlation_id) = {
            let mut guard = session.lock().await;
            guard.state = SessionState::Planning;
            (guard.user_request.clone(), guard.correlation_id)
        };

        let plan = match self.planner.generate_plan(&user_request, correlation_id).await {
            Ok(plan) => plan,
            Err(err) => {
                error!(%session_id, error = %err, "planning failed; sending emergency response");
                crate::metrics::SESSIONS_FAILED.fetch_add(1, Ordering::Relaxed);
                session.lock().await.state = SessionState::Failed;
                self.publish_once(&session, &err.to_string()).await;
                self.sessions.remove(&session_id);
                return;
            }
        };

        {
            let mut guard = session.lock().await;
            if guard.state == SessionState::Cancelled {
                return;
            }
            guard.state = SessionState::Executing;
        }

        let mut plan = plan;
        let mut results: Vec<TaskResultSummary> = Vec::new();

        while !plan.required_tasks_settled() {
            if session.lock().await.state == SessionState::Cancelled {
                return;
            }
            let ready: Vec<TaskId> = plan.ready_tasks().iter().map(|t| t.task_id).collect();
            if ready.is_empty() {
                break;
            }

            // Mesh-chat accumulation (spec.md §4.8 scenario 5): a task that
            // depends on others sees their completed results as
            // `priorMessages` before it is dispatched.
            let prior_by_task = completed_task_messages(&plan);
            let dispatches = ready.iter().map(|&task_id| {
                let task = plan.tasks.iter().find(|t| t.task_id == task_id).unwrap();
                let capability = task.capability.clone();
                let optional = task.optional;
                let mut params = task.parameters.clone();
                if !task.dependencies.is_empty() {
                    let prior_messages: Vec<Value> =
                        task.dependencies.iter().filter_map(|dep| prior_by_task.get(dep).cloned()).collect();
                    if !prior_messages.is_empty() {
                        params.insert("priorMessages".to_string(), Value::Array(prior_messages));
                    }
                }
                self.dispatch_task(task_id, capability, params, optional)
            });

            // Tasks with no unmet dependency dispatch concurrently; only
            // settlement (plan/session mutation) happens one at a time.
            let outcomes = join_all(dispatches).await;
            for (task_id, optional, outcome) in outcomes {
                self.settle_task(&mut plan, task_id, outcome, optional, &session, &mut results).await;
            }
        }

        for task in &plan.tasks {
            if !task.is_terminal() {
                session.lock().await.missing_capabilities.push(task.capability.clone());
                results.push(TaskResultSummary {
                    capability: task.capability.clone(),
                    outcome: Err(FallbackManager::unavailable_marker(&task.capability)),
                });
            }
        }

        {
            let mut guard = session.lock().await;
            if guard.state == SessionState::Cancelled {
                return;
            }
            guard.state = SessionState::Synthesizing;
        }

        let prompt = build_synthesis_prompt(&user_request, &results);
        let answer = match self.synthesizer.complete(&prompt).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(%session_id, error = %err, "synthesis failed; falling back to direct answer");
                match self.fallback.direct_answer(&user_request).await {
                    Ok(answer) => answer,
                    Err(_) => FallbackManager::emergency_response("the synthesis step failed"),
                }
            }
        };

        session.lock().await.state = SessionState::Completed;
        crate::metrics::SESSIONS_COMPLETED.fetch_add(1, Ordering::Relaxed);
        self.publish_once(&session, &answer).await;
        self.sessions.remove(&session_id);
    }

    /// Dispatch a single task and await its outcome, trying one alternate
    /// agent on failure. Takes owned inputs rather than a `&mut TaskPlan`
    /// so a batch of ready tasks can be dispatched concurrently with
    /// [`futures::future::join_all`]; plan/session mutation happens
    /// afterward in [`Self::settle_task`].
    async fn dispatch_task(
        &self,
        task_id: TaskId,
        capability: String,
        params: serde_json::Map<String, Value>,
        optional: bool,
    ) -> (TaskId, bool, Result<Value, String>) {
        let agents = self.registry.lookup(&capability).await;
        let Some(agent_id) = agents.first().cloned() else {
            return (task_id, optional, Err("no healthy agent for capability".to_string()));
        };

        let outcome = match self.dispatch_once(&capability, &params, &agent_id, task_id).await {
            Ok(payload) => Ok(payload),
            Err(reason) => match self.fallback.alternate_agent(&capability, &agent_id).await {
                Some(alternate) => self.dispatch_once(&capability, &params, &alternate, task_id).await,
                None => Err(reason),
            },
        };
        (task_id, optional, outcome)
    }

    async fn dispatch_once(
        &self,
        capability: &str,
        params: &serde_json::Map<String, serde_json::Value>,
        agent_id: &meshframe_types::AgentId,
        task_id: TaskId,
    ) -> Result<serde_json::Value, String> {
        let deadline = Utc::now() + chrono::Duration::from_std(self.task_timeout).unwrap_or_default();
        let dispatch_correlation = self.correlation.create(1, deadline);

        let event = Event::builder(format!("task.request.{capability}"), self.source.clone())
            .data(serde_json::json!({
                "task_id": task_id.to_string(),
                "capability": capability,
                "agent_id": agent_id.to_string(),
                "params": params,
                "correlation_id": dispatch_correlation.to_string(),
            }))
            .build()
            .map_err(|err| err.to_string())?;

        if let Err(err) = self.broker.publish(event).await {
            return Err(err.to_string());
        }
        crate::metrics::EVENTS_PUBLISHED.fetch_add(1, Ordering::Relaxed);

        match self.correlation.await_responses(dispatch_correlation, self.task_timeout).await {
            crate::correlation::AwaitOutcome::Completed(mut responses) => {
                let response = responses.pop().unwrap();
                match response.error {
                    Some(err) => Err(err.to_string()),
                    None => Ok(response.payload.unwrap_or(serde_json::Value::Null)),
                }
            }
            crate::correlation::AwaitOutcome::TimedOut(_) => Err("task timed out".to_string()),
            crate::correlation::AwaitOutcome::Cancelled => Err("task cancelled".to_string()),
            crate::correlation::AwaitOutcome::Unknown => Err("correlation context disappeared".to_string()),
        }
    }

    async fn settle_task(
        &self,
        plan: &mut meshframe_types::TaskPlan,
        task_id: TaskId,
        outcome: Result<serde_json::Value, String>,
        optional: bool,
        session: &Arc<Mutex<OrchestrationSession>>,
        results: &mut Vec<TaskResultSummary>,
    ) {
        let task = plan.tasks.iter_mut().find(|t| t.task_id == task_id).unwrap();
        task.completed_at = Some(Utc::now());
        // Any task that doesn't complete — required or optional — leaves
        // its capability missing from the final answer, so it is recorded
        // regardless of `optional` (spec.md §6, §7 taxonomy #6).
        let reported_outcome = match &outcome {
            Ok(payload) => {
                task.status = TaskStatus::Completed;
                task.result = Some(payload.clone());
                outcome.clone()
            }
            Err(reason) => {
                task.status = if optional { TaskStatus::TimedOut } else { TaskStatus::Failed };
                task.error = Some(meshframe_types::TaskError {
                    code: "dispatch_failed".to_string(),
                    message: reason.clone(),
                    details: None,
                });
                session.lock().await.missing_capabilities.push(task.capability.clone());
                if optional {
                    info!(capability = %task.capability, "optional task unavailable, degrading gracefully");
                    Err(FallbackManager::unavailable_marker(&task.capability))
                } else {
                    error!(capability = %task.capability, reason = %reason, "required task failed");
                    outcome.clone()
                }
            }
        };
        results.push(TaskResultSummary { capability: task.capability.clone(), outcome: reported_outcome });
    }

    async fn publish_once(&self, session: &Arc<Mutex<OrchestrationSession>>, answer: &str) {
        let mut guard = session.lock().await;
        if guard.response_sent {
            return;
        }
        guard.response_sent = true;
        let degraded = !guard.missing_capabilities.is_empty();
        let event = match Event::builder("user.response", self.source.clone())
            .subject(guard.session_id.to_string())
            .data(serde_json::json!({
                "session_id": guard.session_id.to_string(),
                "correlation_id": guard.correlation_id.to_string(),
                "answer": answer,
                "degraded": degraded,
                "missing": guard.missing_capabilities,
            }))
            .build()
        {
            Ok(event) => event,
            Err(err) => {
                error!(error = %err, "failed to build user.response event");
                return;
            }
        };
        drop(guard);
        if let Err(err) = self.broker.publish(event).await {
            error!(error = %err, "failed to publish user.response");
        } else {
            crate::metrics::EVENTS_PUBLISHED.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a task response delivered off the bus, keyed by the
    /// per-dispatch correlation id embedded in the original task request.
    pub async fn on_task_response(
        &self,
        dispatch_correlation_id: CorrelationId,
        payload: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    ) {
        self.correlation.record(dispatch_correlation_id, meshframe_types::CorrelationResponse { payload, error }).await;
    }

    /// Current state of a session, if it is still tracked.
    pub async fn state(&self, session_id: SessionId) -> Option<SessionState> {
        let session = self.sessions.get(&session_id)?.clone();
        Some(session.lock().await.state)
    }
}

/// One `{capability, result}` message per completed task, keyed by task id
/// so a dependent task can look up only the dependencies it actually
/// declared.
fn completed_task_messages(plan: &meshframe_types::TaskPlan) -> HashMap<TaskId, Value> {
    plan.tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Completed)
        .map(|task| {
            let message = serde_json::json!({
                "capability": task.capability,
                "result": task.result.clone().unwrap_or(Value::Null),
            });
            (task.task_id, message)
        })
        .collect()
}
