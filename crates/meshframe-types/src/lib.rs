#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **meshframe-types** – Shared data model for the meshframe agent mesh
//! orchestration runtime.
//!
//! This crate has no runtime behavior of its own: it defines the
//! CloudEvents envelope, topic patterns, identifiers, and the plan/task/
//! agent/correlation records that every other `meshframe-*` crate builds
//! on top of.

mod agent;
mod correlation;
mod event;
mod ids;
mod subscription;
mod task;
mod topic;

pub use agent::{AgentDescriptor, AgentHealthMetrics, HealthData, HealthStatus};
pub use correlation::{CorrelationContext, CorrelationResponse, CorrelationState};
pub use event::{
    Event, EventBuilder, EventError, ExtensionValue, DEFAULT_CONTENT_TYPE,
    RESERVED_EXTENSION_PREFIX, SENDER_EXTENSION, SPEC_VERSION, TOPIC_EXTENSION,
};
pub use ids::{AgentId, CorrelationId, PlanId, SessionId, SubscriptionId, TaskId};
pub use subscription::Subscription;
pub use task::{PlanError, Task, TaskError, TaskPlan, TaskStatus};
pub use topic::{Topic, TopicError, TopicPattern};
