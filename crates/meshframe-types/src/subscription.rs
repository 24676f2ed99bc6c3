//! Subscription records held by the broker's subscription table.

use serde::{Deserialize, Serialize};

use crate::ids::SubscriptionId;
use crate::topic::TopicPattern;

/// A single subscriber's registration against a topic pattern. A subscriber
/// may hold many subscriptions against distinct patterns, each with its own
/// [`SubscriptionId`]; resubscribing to a pattern already held by the same
/// subscriber is idempotent and returns the existing id (spec.md §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Identifier of this subscription entry.
    pub subscription_id: SubscriptionId,
    /// Stable id of the subscriber (agent id, component name, etc).
    pub subscriber: String,
    /// The pattern matched against incoming event topics.
    #[serde(with = "pattern_as_string")]
    pub pattern: TopicPattern,
}

impl Subscription {
    /// Register a new subscription for `subscriber` against `pattern`.
    pub fn new(subscriber: impl Into<String>, pattern: TopicPattern) -> Self {
        Self {
            subscription_id: SubscriptionId::new(),
            subscriber: subscriber.into(),
            pattern,
        }
    }
}

mod pattern_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TopicPattern;

    pub fn serialize<S>(pattern: &TopicPattern, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(pattern.as_str())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<TopicPattern, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        TopicPattern::new(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_serializes_pattern_as_plain_string() {
        let sub = Subscription::new("weather-agent-1", TopicPattern::new("task.request.*").unwrap());
        let json = serde_json::to_string(&sub).unwrap();
        assert!(json.contains("\"pattern\":\"task.request.*\""));
        let reparsed: Subscription = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed.pattern.as_str(), "task.request.*");
    }
}
