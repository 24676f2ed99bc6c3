//! Task plans produced by the planning engine and executed by the
//! orchestration session.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{CorrelationId, PlanId, TaskId};

/// Lifecycle states of a single [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies or plan dispatch.
    Pending,
    /// Dispatched to an agent; awaiting a response.
    Running,
    /// Completed successfully.
    Completed,
    /// Failed after exhausting retries/failover.
    Failed,
    /// Cancelled because the owning session was cancelled.
    Cancelled,
    /// Exceeded its timeout without a response.
    TimedOut,
}

/// A structured failure recorded against a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    /// Machine-readable failure code (e.g. `timeout`, `agent_unavailable`).
    pub code: String,
    /// Human-readable detail.
    pub message: String,
    /// Optional structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// A single unit of work within a [`TaskPlan`], routed to an agent by
/// `capability`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique id of this task within its plan.
    pub task_id: TaskId,
    /// Owning orchestration session.
    pub correlation_id: CorrelationId,
    /// Capability required to execute this task, used to look up a healthy
    /// agent in the registry.
    pub capability: String,
    /// Normalized parameters handed to the selected agent.
    pub parameters: Map<String, Value>,
    /// Tasks that must complete before this one may be dispatched.
    pub dependencies: HashSet<TaskId>,
    /// Relative priority among ready tasks; lower dispatches first.
    pub priority: u32,
    /// Maximum time to wait for a response before the task times out.
    pub timeout: Duration,
    /// Whether the plan can still synthesize a response if this task never
    /// completes.
    pub optional: bool,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Result payload once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure detail once failed or timed out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    /// When the task was dispatched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Construct a new, pending task.
    pub fn new(correlation_id: CorrelationId, capability: impl Into<String>) -> Self {
        Self {
            task_id: TaskId::new(),
            correlation_id,
            capability: capability.into(),
            parameters: Map::new(),
            dependencies: HashSet::new(),
            priority: 0,
            timeout: Duration::from_secs(30),
            optional: false,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether this task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::TimedOut
        )
    }
}

/// Failure modes for validating a [`TaskPlan`].
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PlanError {
    /// The plan's dependency graph contains a cycle.
    #[error("task plan {0} contains a dependency cycle")]
    Cycle(PlanId),
    /// A task depends on a task id not present in the plan.
    #[error("task {0} depends on unknown task {1}")]
    UnknownDependency(TaskId, TaskId),
    /// A task requires a capability with no healthy agent in the registry
    /// snapshot used to validate the plan.
    #[error("capability '{0}' has no healthy agent")]
    UnknownCapability(String),
    /// The plan has no tasks.
    #[error("task plan {0} has no tasks")]
    Empty(PlanId),
}

/// An ordered set of tasks produced by the planning engine from a single
/// user request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    /// Unique id of this plan.
    pub plan_id: PlanId,
    /// The session this plan belongs to.
    pub correlation_id: CorrelationId,
    /// The user's original natural-language query, kept for synthesis.
    pub original_query: String,
    /// The tasks to execute.
    pub tasks: Vec<Task>,
}

impl TaskPlan {
    /// Construct an empty plan ready to have tasks appended.
    pub fn new(correlation_id: CorrelationId, original_query: impl Into<String>) -> Self {
        Self {
            plan_id: PlanId::new(),
            correlation_id,
            original_query: original_query.into(),
            tasks: Vec::new(),
        }
    }

    /// Validate that the plan is non-empty, every dependency resolves to a
    /// task in the plan, every required capability is known, and the
    /// dependency graph is acyclic.
    pub fn validate(&self, known_capabilities: &HashSet<String>) -> Result<(), PlanError> {
        if self.tasks.is_empty() {
            return Err(PlanError::Empty(self.plan_id));
        }
        let known_tasks: HashSet<TaskId> = self.tasks.iter().map(|t| t.task_id).collect();
        for task in &self.tasks {
            for dep in &task.dependencies {
                if !known_tasks.contains(dep) {
                    return Err(PlanError::UnknownDependency(task.task_id, *dep));
                }
            }
            if !known_capabilities.contains(&task.capability) {
                return Err(PlanError::UnknownCapability(task.capability.clone()));
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), PlanError> {
        let by_id: HashMap<TaskId, &Task> = self.tasks.iter().map(|t| (t.task_id, t)).collect();
        let mut visiting: HashSet<TaskId> = HashSet::new();
        let mut visited: HashSet<TaskId> = HashSet::new();

        fn visit(
            id: TaskId,
            by_id: &HashMap<TaskId, &Task>,
            visiting: &mut HashSet<TaskId>,
            visited: &mut HashSet<TaskId>,
        ) -> bool {
            if visited.contains(&id) {
                return true;
            }
            if !visiting.insert(id) {
                return false;
            }
            if let Some(task) = by_id.get(&id) {
                for dep in &task.dependencies {
                    if !visit(*dep, by_id, visiting, visited) {
                        return false;
                    }
                }
            }
            visiting.remove(&id);
            visited.insert(id);
            true
        }

        for task in &self.tasks {
            if !visit(task.task_id, &by_id, &mut visiting, &mut visited) {
                return Err(PlanError::Cycle(self.plan_id));
            }
        }
        Ok(())
    }

    /// Tasks whose dependencies have all completed and which have not yet
    /// been dispatched.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let completed: HashSet<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.task_id)
            .collect();
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.dependencies.iter().all(|dep| completed.contains(dep)))
            .collect()
    }

    /// Whether every required (non-optional) task has reached a terminal
    /// state.
    pub fn required_tasks_settled(&self) -> bool {
        self.tasks.iter().filter(|t| !t.optional).all(|t| t.is_terminal())
    }
}
