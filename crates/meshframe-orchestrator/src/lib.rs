#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **meshframe-orchestrator** – Planning engine, correlation manager,
//! agent registry, fallback chain and per-request orchestration sessions
//! for the meshframe agent mesh.
//!
//! This crate has no transport of its own: it is wired to a
//! [`meshframe_bus_core::EventBroker`] and a
//! [`meshframe_llm_gateway::LlmGateway`] by the composition root in
//! [`orchestrator`], which is the only module that actually subscribes to
//! bus topics.

pub mod correlation;
pub mod fallback;
pub mod llm;
pub mod metrics;
pub mod normalizer;
pub mod orchestrator;
pub mod planner;
pub mod prompt;
pub mod registry;
pub mod session;

pub use correlation::{AwaitOutcome, CorrelationManager};
pub use fallback::FallbackManager;
pub use llm::{GatewayCompleter, LlmCompleter};
pub use metrics::{AlertEvent, InMemoryMetricsSink, MetricsSink, Observation};
pub use normalizer::{normalize_params, NormalizationError};
pub use orchestrator::OrchestratorAgent;
pub use planner::{PlanningEngine, PlanningFailed};
pub use prompt::{build_planning_prompt, build_repair_prompt, build_synthesis_prompt, Prompt, PromptKind};
pub use registry::{AgentRegistry, HealthObserver, HealthTransition};
pub use session::{SessionError, SessionManager, SessionState};
