//! Broker delivery counters, satisfying the `Metrics()` contract.

use std::sync::atomic::{AtomicU64, Ordering};

/// A point-in-time snapshot of broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerMetrics {
    /// Events accepted by `publish`.
    pub published: u64,
    /// Events successfully handed to a subscriber handler.
    pub delivered: u64,
    /// Subscriber handler invocations that returned an error.
    pub failed_deliveries: u64,
    /// Events evicted from a full per-subscriber queue.
    pub dropped: u64,
    /// Currently registered subscriptions.
    pub active_subscriptions: u64,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsInner {
    published: AtomicU64,
    delivered: AtomicU64,
    failed_deliveries: AtomicU64,
    dropped: AtomicU64,
}

impl MetricsInner {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, active_subscriptions: u64) -> BrokerMetrics {
        BrokerMetrics {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            active_subscriptions,
        }
    }
}
