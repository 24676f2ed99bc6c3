//! Correlation context: the data the correlation manager tracks per
//! dispatched request while it waits for (and fans in) responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::CorrelationId;

/// Lifecycle state of a [`CorrelationContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationState {
    /// Still waiting on one or more responses.
    Pending,
    /// All expected responses arrived before the deadline.
    Completed,
    /// The deadline elapsed before all responses arrived.
    TimedOut,
    /// Cancelled by the owning session.
    Cancelled,
}

/// A response or error recorded against a correlation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationResponse {
    /// Payload returned by the responder, if successful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error detail, if the responder reported failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Tracks the fan-out of a single dispatched request: how many responses
/// are expected, which have arrived, and when it must resolve by.
///
/// This struct is pure data; the locking, signaling and sweeping behavior
/// around it lives in the correlation manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationContext {
    /// Identifier linking dispatched requests to their responses.
    pub correlation_id: CorrelationId,
    /// When this context was created.
    pub created_at: DateTime<Utc>,
    /// Number of responses required before the context completes.
    pub expected_responses: usize,
    /// Responses received so far, in arrival order.
    pub received_responses: Vec<CorrelationResponse>,
    /// Absolute deadline after which the context times out.
    pub deadline: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: CorrelationState,
}

impl CorrelationContext {
    /// Create a new, pending context expecting `expected_responses` replies
    /// by `deadline`.
    pub fn new(expected_responses: usize, deadline: DateTime<Utc>) -> Self {
        assert!(expected_responses >= 1, "a correlation context must expect at least one response");
        Self {
            correlation_id: CorrelationId::new(),
            created_at: Utc::now(),
            expected_responses,
            received_responses: Vec::new(),
            deadline,
            state: CorrelationState::Pending,
        }
    }

    /// Whether the context has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state != CorrelationState::Pending
    }

    /// Whether enough responses have arrived to complete the fan-out.
    pub fn is_satisfied(&self) -> bool {
        self.received_responses.len() >= self.expected_responses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_context_starts_pending_and_unsatisfied() {
        let ctx = CorrelationContext::new(2, Utc::now() + Duration::seconds(30));
        assert_eq!(ctx.state, CorrelationState::Pending);
        assert!(!ctx.is_satisfied());
        assert!(!ctx.is_terminal());
    }

    #[test]
    fn is_satisfied_once_expected_count_reached() {
        let mut ctx = CorrelationContext::new(1, Utc::now() + Duration::seconds(30));
        ctx.received_responses.push(CorrelationResponse {
            payload: Some(Value::Bool(true)),
            error: None,
        });
        assert!(ctx.is_satisfied());
    }
}
