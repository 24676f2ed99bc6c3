#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **meshframe-bus-core** – the event broker abstraction: hierarchical
//! topic routing over a pluggable transport, with backpressure and
//! dead-letter handling for the in-memory reference implementation.
//!
//! Delivery to a subscriber never runs on the publisher's calling task:
//! `publish` enqueues onto a per-subscriber bounded queue and a
//! broker-owned worker drains it, invoking the subscriber's handler.

mod config;
mod memory;
mod metrics;

pub use config::{BrokerConfig, DropPolicy};
pub use memory::InMemoryBroker;
pub use metrics::BrokerMetrics;

use async_trait::async_trait;
use meshframe_types::{Event, Subscription, TopicPattern};
use thiserror::Error;

/// Failure modes surfaced by [`EventBroker`] methods.
#[derive(Debug, Error)]
pub enum BusError {
    /// A `publish`/`subscribe`/`unsubscribe` call was made before `start`
    /// or after `stop`.
    #[error("broker is not running")]
    NotRunning,
    /// The event failed validation (strict mode).
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    /// The underlying transport rejected the operation.
    #[error("transport error: {0}")]
    TransportError(String),
}

/// Invoked by a broker worker for every event matching a subscription's
/// pattern. Handlers run off the publisher's task; an `Err` is caught,
/// counted, and may trigger a dead-letter publish — it never aborts the
/// broker.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one delivered event.
    async fn handle(&self, event: Event) -> Result<(), anyhow::Error>;
}

/// The abstract event broker contract every transport binding implements.
///
/// Lifecycle: `start` and `stop` are idempotent; `publish`/`subscribe`/
/// `unsubscribe` fail with [`BusError::NotRunning`] outside the started
/// window.
#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Transition the broker into the running state. Idempotent.
    async fn start(&self) -> Result<(), BusError>;

    /// Transition the broker out of the running state, draining worker
    /// tasks. Idempotent.
    async fn stop(&self) -> Result<(), BusError>;

    /// Publish an event. Resolves once the transport has accepted the
    /// event, not once every subscriber has processed it.
    async fn publish(&self, event: Event) -> Result<(), BusError>;

    /// Register a subscription for `subscriber` against `pattern`, with
    /// `handler` invoked for each matching delivery. A duplicate
    /// subscription (same subscriber, pattern, and handler identity) is
    /// not de-duplicated by this trait; callers that need idempotent
    /// re-subscribe should track subscription ids themselves.
    async fn subscribe(
        &self,
        subscriber: &str,
        pattern: TopicPattern,
        handler: std::sync::Arc<dyn EventHandler>,
    ) -> Result<Subscription, BusError>;

    /// Remove a previously registered subscription.
    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), BusError>;

    /// A snapshot of the broker's delivery counters.
    async fn metrics(&self) -> BrokerMetrics;
}
