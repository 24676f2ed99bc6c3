//! Stable identifier newtypes shared across the mesh.
//!
//! Keeping these distinct (rather than passing bare `Uuid`/`String` around)
//! means a session id can never be accidentally handed to an API expecting
//! a task id; the compiler rejects the mix-up at the call site.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    SessionId,
    "Identifier of an orchestration session; equal to the correlation id the user sees."
);
uuid_id!(CorrelationId, "Identifier linking a dispatched request to its responses.");
uuid_id!(TaskId, "Identifier of a single task within a plan.");
uuid_id!(PlanId, "Identifier of a task plan.");
uuid_id!(SubscriptionId, "Identifier of a single subscription registered with the broker.");

/// Identifier of a registered agent. Agents are free to pick their own
/// stable name (e.g. `weather-agent-1`), so this wraps a `String` rather
/// than a `Uuid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Wrap an agent-supplied identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_display_and_from_str() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn agent_id_wraps_arbitrary_strings() {
        let id = AgentId::new("weather-agent-1");
        assert_eq!(id.to_string(), "weather-agent-1");
    }
}
