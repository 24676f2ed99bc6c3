//! Broker configuration, loadable from environment variables or a config
//! file via the `config` crate — the same loading style used for the LLM
//! gateway's provider configuration.

use serde::{Deserialize, Serialize};

/// What happens to a per-subscriber queue that is full when a new event
/// would be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued event to make room for the new one.
    DropOldest,
    /// Discard the new event, keeping the queue as-is.
    DropNewest,
}

/// Tunables for [`crate::InMemoryBroker`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Maximum events buffered per subscriber before `drop_policy` kicks
    /// in.
    pub queue_depth: usize,
    /// Eviction policy applied once a subscriber's queue is full.
    pub drop_policy: DropPolicy,
    /// Whether events are fully re-validated against the CloudEvents
    /// invariants as they leave the broker. When `false`, validation
    /// errors are logged but delivery proceeds.
    pub strict_validation: bool,
    /// Whether a subscriber handler failure triggers a dead-letter publish
    /// to `<topic>.dlq`.
    pub dlq_enabled: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            drop_policy: DropPolicy::DropOldest,
            strict_validation: true,
            dlq_enabled: true,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from `AMCP_BROKER_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let defaults = Self::default();
        let built = config::Config::builder()
            .set_default("queue_depth", defaults.queue_depth as i64)?
            .set_default(
                "drop_policy",
                match defaults.drop_policy {
                    DropPolicy::DropOldest => "drop_oldest",
                    DropPolicy::DropNewest => "drop_newest",
                },
            )?
            .set_default("strict_validation", defaults.strict_validation)?
            .set_default("dlq_enabled", defaults.dlq_enabled)?
            .add_source(config::Environment::with_prefix("AMCP_BROKER"))
            .build()?;
        Ok(built.try_deserialize()?)
    }
}
