//! Correlation manager: maps request fingerprints to pending fan-outs,
//! signals awaiters as responses arrive, and times out stale contexts.
//!
//! Each context gets its own lock (spec.md §4.2/§5); the table itself is a
//! `DashMap`, so inserting/removing one context never blocks access to
//! another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use meshframe_types::{CorrelationContext, CorrelationId, CorrelationResponse, CorrelationState};
use tokio::sync::{Mutex, Notify};
use tracing::warn;

struct Entry {
    context: Mutex<CorrelationContext>,
    notify: Notify,
}

/// Outcome of [`CorrelationManager::await_responses`].
#[derive(Debug, Clone)]
pub enum AwaitOutcome {
    /// Every expected response arrived before the deadline.
    Completed(Vec<CorrelationResponse>),
    /// The deadline elapsed first; carries whatever arrived in time.
    TimedOut(Vec<CorrelationResponse>),
    /// The context was cancelled while waiting.
    Cancelled,
    /// No context exists for the given id (already swept, or never created).
    Unknown,
}

/// Tracks in-flight fan-out requests and fans their responses back in.
pub struct CorrelationManager {
    contexts: DashMap<CorrelationId, Arc<Entry>>,
    grace: Duration,
}

impl CorrelationManager {
    /// Construct a manager whose sweeper allows `grace` beyond a context's
    /// deadline before removing it, to give a racing final `record` a
    /// chance to land.
    pub fn new(grace: Duration) -> Self {
        Self { contexts: DashMap::new(), grace }
    }

    /// Open a new correlation context expecting `expected_responses`
    /// replies by `deadline`.
    pub fn create(&self, expected_responses: usize, deadline: DateTime<Utc>) -> CorrelationId {
        let context = CorrelationContext::new(expected_responses, deadline);
        let correlation_id = context.correlation_id;
        self.contexts.insert(correlation_id, Arc::new(Entry { context: Mutex::new(context), notify: Notify::new() }));
        correlation_id
    }

    /// Record a response. Discarded with a warning if the context is
    /// unknown or already terminal (spec.md §4.2 edge cases) — never
    /// mutates a terminal context.
    pub async fn record(&self, correlation_id: CorrelationId, response: CorrelationResponse) {
        let Some(entry) = self.contexts.get(&correlation_id).map(|e| e.clone()) else {
            warn!(%correlation_id, "response for unknown correlation id discarded");
            return;
        };
        let mut context = entry.context.lock().await;
        if context.is_terminal() {
            warn!(%correlation_id, "response for terminal correlation context discarded");
            return;
        }
        context.received_responses.push(response);
        if context.is_satisfied() {
            context.state = CorrelationState::Completed;
        }
        let satisfied = context.is_satisfied();
        drop(context);
        if satisfied {
            entry.notify.notify_waiters();
        }
    }

    /// Block until `correlation_id` is satisfied, times out, or is
    /// cancelled — whichever happens first, bounded by `timeout`.
    pub async fn await_responses(&self, correlation_id: CorrelationId, timeout: Duration) -> AwaitOutcome {
        let Some(entry) = self.contexts.get(&correlation_id).map(|e| e.clone()) else {
            return AwaitOutcome::Unknown;
        };

        loop {
            {
                let context = entry.context.lock().await;
                match context.state {
                    CorrelationState::Completed => return AwaitOutcome::Completed(context.received_responses.clone()),
                    CorrelationState::Cancelled => return AwaitOutcome::Cancelled,
                    CorrelationState::TimedOut => return AwaitOutcome::TimedOut(context.received_responses.clone()),
                    CorrelationState::Pending => {}
                }
            }
            let wait = tokio::time::timeout(timeout, entry.notify.notified()).await;
            if wait.is_err() {
                let mut context = entry.context.lock().await;
                if context.state == CorrelationState::Pending {
                    context.state = CorrelationState::TimedOut;
                    return AwaitOutcome::TimedOut(context.received_responses.clone());
                }
                // Raced with a concurrent completion/cancel; loop once more
                // to observe the now-terminal state.
            }
        }
    }

    /// Mark a context cancelled and wake any awaiter.
    pub async fn cancel(&self, correlation_id: CorrelationId) {
        if let Some(entry) = self.contexts.get(&correlation_id).map(|e| e.clone()) {
            let mut context = entry.context.lock().await;
            if !context.is_terminal() {
                context.state = CorrelationState::Cancelled;
            }
            drop(context);
            entry.notify.notify_waiters();
        }
    }

    /// Remove contexts whose `deadline + grace` has passed, regardless of
    /// state, so long-lived but forgotten contexts don't leak memory.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let mut stale = Vec::new();
        for item in self.contexts.iter() {
            let context = item.value().context.lock().await;
            if now > context.deadline + chrono::Duration::from_std(self.grace).unwrap_or_default() {
                stale.push(*item.key());
            }
        }
        for correlation_id in stale {
            self.contexts.remove(&correlation_id);
        }
    }

    /// Number of contexts currently tracked, for the `active_correlations`
    /// gauge.
    pub fn active_count(&self) -> usize {
        self.contexts.len()
    }
}

/// Spawn a periodic sweeper against `manager`, running every `interval`
/// until the returned handle is dropped or aborted.
pub fn spawn_sweeper(manager: Arc<CorrelationManager>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            manager.sweep().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far_future() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(30)
    }

    #[tokio::test]
    async fn record_completes_once_expected_count_reached() {
        let manager = CorrelationManager::new(Duration::from_secs(1));
        let correlation_id = manager.create(2, far_future());

        manager.record(correlation_id, CorrelationResponse { payload: Some(serde_json::json!(1)), error: None }).await;
        manager.record(correlation_id, CorrelationResponse { payload: Some(serde_json::json!(2)), error: None }).await;

        match manager.await_responses(correlation_id, Duration::from_secs(1)).await {
            AwaitOutcome::Completed(responses) => assert_eq!(responses.len(), 2),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn await_times_out_with_partial_responses() {
        let manager = CorrelationManager::new(Duration::from_secs(1));
        let correlation_id = manager.create(2, Utc::now() + chrono::Duration::milliseconds(20));
        manager.record(correlation_id, CorrelationResponse { payload: Some(serde_json::json!(1)), error: None }).await;

        match manager.await_responses(correlation_id, Duration::from_millis(50)).await {
            AwaitOutcome::TimedOut(responses) => assert_eq!(responses.len(), 1),
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_correlation_id_is_reported_not_panicked() {
        let manager = CorrelationManager::new(Duration::from_secs(1));
        let bogus = CorrelationId::new();
        manager.record(bogus, CorrelationResponse { payload: None, error: Some(serde_json::json!("x")) }).await;
        matches!(manager.await_responses(bogus, Duration::from_millis(10)).await, AwaitOutcome::Unknown);
    }

    #[tokio::test]
    async fn response_after_completion_is_discarded() {
        let manager = CorrelationManager::new(Duration::from_secs(1));
        let correlation_id = manager.create(1, far_future());
        manager.record(correlation_id, CorrelationResponse { payload: Some(serde_json::json!(1)), error: None }).await;
        manager.record(correlation_id, CorrelationResponse { payload: Some(serde_json::json!(2)), error: None }).await;

        match manager.await_responses(correlation_id, Duration::from_secs(1)).await {
            AwaitOutcome::Completed(responses) => assert_eq!(responses.len(), 1),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_wakes_a_pending_awaiter() {
        let manager = Arc::new(CorrelationManager::new(Duration::from_secs(1)));
        let correlation_id = manager.create(1, far_future());
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.await_responses(correlation_id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.cancel(correlation_id).await;
        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, AwaitOutcome::Cancelled));
    }

    #[tokio::test]
    async fn sweep_removes_contexts_past_deadline_plus_grace() {
        let manager = CorrelationManager::new(Duration::from_millis(10));
        let correlation_id = manager.create(1, Utc::now() - chrono::Duration::seconds(1));
        manager.sweep().await;
        assert_eq!(manager.active_count(), 0);
        assert!(matches!(manager.await_responses(correlation_id, Duration::from_millis(10)).await, AwaitOutcome::Unknown));
    }
}
