//! In-memory reference implementation of [`EventBroker`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use meshframe_types::{Event, Subscription, SubscriptionId, Topic, TopicPattern};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{BrokerConfig, DropPolicy};
use crate::metrics::{BrokerMetrics, MetricsInner};
use crate::{BusError, EventBroker, EventHandler};

/// A bounded FIFO queue per subscriber, supporting eviction under the
/// configured [`DropPolicy`] instead of the unconditional backpressure a
/// plain `tokio::sync::mpsc` channel would apply.
struct BoundedQueue {
    items: Mutex<VecDeque<Event>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue `event`. Returns `true` if an event was evicted to make
    /// room (either the new event itself, under `DropNewest`, or an
    /// existing one, under `DropOldest`).
    async fn push(&self, event: Event, drop_policy: DropPolicy) -> bool {
        let mut items = self.items.lock().await;
        let mut evicted = false;
        if items.len() >= self.capacity {
            match drop_policy {
                DropPolicy::DropOldest => {
                    items.pop_front();
                    evicted = true;
                    items.push_back(event);
                }
                DropPolicy::DropNewest => {
                    evicted = true;
                }
            }
        } else {
            items.push_back(event);
        }
        drop(items);
        self.notify.notify_one();
        evicted
    }

    async fn pop(&self) -> Option<Event> {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(event) = items.pop_front() {
                    return Some(event);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct SubscriptionEntry {
    subscriber: String,
    pattern: TopicPattern,
    queue: Arc<BoundedQueue>,
    worker: JoinHandle<()>,
}

/// A single-process event broker. Matching is evaluated against every
/// registered pattern on every publish; see `spec.md` §4.1 for why this is
/// an acceptable implementation strategy (indexing by literal prefix is
/// permitted but not required).
pub struct InMemoryBroker {
    config: BrokerConfig,
    running: AtomicBool,
    subscriptions: DashMap<SubscriptionId, SubscriptionEntry>,
    metrics: MetricsInner,
    source: String,
    self_ref: Weak<InMemoryBroker>,
}

impl InMemoryBroker {
    /// Construct a broker identified as `source` in the CloudEvents
    /// envelope of any dead-letter events it emits.
    pub fn new(source: impl Into<String>, config: BrokerConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            running: AtomicBool::new(false),
            subscriptions: DashMap::new(),
            metrics: MetricsInner::default(),
            source: source.into(),
            self_ref: self_ref.clone(),
        })
    }

    fn require_running(&self) -> Result<(), BusError> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BusError::NotRunning)
        }
    }

    fn dead_letter_event(&self, original: &Event, reason: &str) -> Option<Event> {
        let dlq_topic = Topic::new(format!("{}.dlq", original.topic())).ok()?;
        let data = serde_json::json!({
            "original": original,
            "error": reason,
        });
        Event::builder(dlq_topic.as_str(), &self.source)
            .data(data)
            .build()
            .ok()
    }

    async fn deliver_to_matching(&self, event: &Event) {
        for entry in self.subscriptions.iter() {
            if entry.pattern.matches(event.topic()) {
                let evicted = entry.queue.push(event.clone(), self.config.drop_policy).await;
                if evicted {
                    self.metrics.record_dropped();
                    warn!(topic = %event.topic(), "dropped event from full subscriber queue");
                }
            }
        }
    }
}

#[async_trait]
impl EventBroker for InMemoryBroker {
    async fn start(&self) -> Result<(), BusError> {
        self.running.store(true, Ordering::Release);
        debug!("broker started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        self.running.store(false, Ordering::Release);
        for entry in self.subscriptions.iter() {
            entry.queue.close();
        }
        for mut entry in self.subscriptions.iter_mut() {
            entry.worker.abort();
        }
        debug!("broker stopped");
        Ok(())
    }

    async fn publish(&self, event: Event) -> Result<(), BusError> {
        self.require_running()?;
        if self.config.strict_validation {
            if let Err(err) = event.validate() {
                return Err(BusError::InvalidEvent(err.to_string()));
            }
        } else if let Err(err) = event.validate() {
            warn!(error = %err, "published event failed validation (non-strict mode)");
        }
        self.metrics.record_published();
        self.deliver_to_matching(&event).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        subscriber: &str,
        pattern: TopicPattern,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, BusError> {
        self.require_running()?;
        if let Some(existing) = self.subscriptions.iter().find(|entry| {
            entry.pattern.as_str() == pattern.as_str() && entry.subscriber == subscriber
        }) {
            return Ok(Subscription {
                subscription_id: *existing.key(),
                subscriber: subscriber.to_string(),
                pattern,
            });
        }
        let subscription = Subscription::new(subscriber, pattern.clone());
        let queue = Arc::new(BoundedQueue::new(self.config.queue_depth));
        let worker = spawn_worker(
            queue.clone(),
            handler,
            subscriber.to_string(),
            self.self_ref.clone(),
        );
        self.subscriptions.insert(
            subscription.subscription_id,
            SubscriptionEntry { subscriber: subscriber.to_string(), pattern, queue, worker },
        );
        Ok(subscription)
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), BusError> {
        self.require_running()?;
        if let Some((_, entry)) = self.subscriptions.remove(&subscription.subscription_id) {
            entry.queue.close();
            entry.worker.abort();
        }
        Ok(())
    }

    async fn metrics(&self) -> BrokerMetrics {
        self.metrics.snapshot(self.subscriptions.len() as u64)
    }
}

fn spawn_worker(
    queue: Arc<BoundedQueue>,
    handler: Arc<dyn EventHandler>,
    subscriber: String,
    broker: Weak<InMemoryBroker>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = queue.pop().await {
            match handler.handle(event.clone()).await {
                Ok(()) => {
                    if let Some(broker) = broker.upgrade() {
                        broker.metrics.record_delivered();
                    }
                }
                Err(err) => {
                    warn!(subscriber = %subscriber, error = %err, "subscriber handler failed");
                    if let Some(broker) = broker.upgrade() {
                        broker.metrics.record_failed();
                        if broker.config.dlq_enabled {
                            if let Some(dlq_event) = broker.dead_letter_event(&event, &err.to_string()) {
                                let _ = broker.publish(dlq_event).await;
                            }
                        }
                    }
                }
            }
        }
    })
}
