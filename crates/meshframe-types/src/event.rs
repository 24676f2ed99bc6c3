//! CloudEvents 1.0 structured-mode envelope.
//!
//! Every message that crosses the bus is an `Event`. The core attributes
//! follow the CloudEvents spec field names exactly so the envelope can be
//! bridged to external CloudEvents tooling without translation; extension
//! attributes carry AMCP-specific routing metadata (`amcp-topic`,
//! `amcp-sender`) alongside caller-supplied `amcp-meta-*` fields.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::topic::Topic;

/// CloudEvents spec version this envelope implements.
pub const SPEC_VERSION: &str = "1.0";
/// Default `datacontenttype` when the caller doesn't specify one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
/// Extension attributes starting with this prefix are reserved by the
/// CloudEvents spec for future core attributes and may not be set by
/// callers.
pub const RESERVED_EXTENSION_PREFIX: &str = "ce-";
/// Extension carrying the AMCP-native dotted topic for an event whose
/// `type` is not itself the topic (e.g. when bridged from reverse-DNS form).
pub const TOPIC_EXTENSION: &str = "amcptopic";
/// Extension carrying the originating agent or component id.
pub const SENDER_EXTENSION: &str = "amcpsender";

/// Failure modes for constructing or validating an [`Event`].
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum EventError {
    /// `id` was empty.
    #[error("event id must not be empty")]
    MissingId,
    /// `source` was empty.
    #[error("event source must not be empty")]
    MissingSource,
    /// `type` was empty.
    #[error("event type must not be empty")]
    MissingType,
    /// `specversion` is not one this runtime understands.
    #[error("unsupported specversion '{0}'")]
    UnsupportedSpecVersion(String),
    /// An extension attribute used the reserved `ce-` prefix.
    #[error("extension attribute '{0}' uses the reserved 'ce-' prefix")]
    ReservedExtensionPrefix(String),
}

/// A scalar CloudEvents extension attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtensionValue {
    /// String-valued extension.
    String(String),
    /// Boolean-valued extension.
    Bool(bool),
    /// Numeric extension (integer or float).
    Number(serde_json::Number),
}

impl From<&str> for ExtensionValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ExtensionValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for ExtensionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl ExtensionValue {
    /// Borrow the value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// An immutable CloudEvents 1.0 structured-mode envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    specversion: String,
    id: String,
    source: String,
    #[serde(rename = "type")]
    ty: String,
    time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    datacontenttype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dataschema: Option<String>,
    data: Value,
    #[serde(flatten)]
    extensions: BTreeMap<String, ExtensionValue>,
}

impl Event {
    /// Start building an event with the two attributes every event needs:
    /// its `type` and its `source`.
    pub fn builder(ty: impl Into<String>, source: impl Into<String>) -> EventBuilder {
        EventBuilder {
            id: None,
            source: source.into(),
            ty: ty.into(),
            time: None,
            subject: None,
            datacontenttype: DEFAULT_CONTENT_TYPE.to_string(),
            dataschema: None,
            data: Value::Null,
            extensions: BTreeMap::new(),
        }
    }

    /// The CloudEvents spec version, always `"1.0"` for events this runtime
    /// constructs.
    pub fn specversion(&self) -> &str {
        &self.specversion
    }

    /// The unique event id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The producing source (a URI-reference by CloudEvents convention).
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The event type. By construction this is the AMCP-native dotted
    /// topic unless the event was bridged from a reverse-DNS source.
    pub fn ty(&self) -> &str {
        &self.ty
    }

    /// When the event occurred.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// The optional subject further qualifying the event source.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// The content type of `data`.
    pub fn datacontenttype(&self) -> &str {
        &self.datacontenttype
    }

    /// The payload.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Read an extension attribute.
    pub fn extension(&self, name: &str) -> Option<&ExtensionValue> {
        self.extensions.get(name)
    }

    /// The AMCP topic this event routes on: the `amcptopic` extension if
    /// present, otherwise the event `type` itself.
    pub fn topic(&self) -> &str {
        match self.extensions.get(TOPIC_EXTENSION).and_then(|v| v.as_str()) {
            Some(topic) => topic,
            None => &self.ty,
        }
    }

    /// Re-validate the required attributes and extension-prefix rule. Used
    /// by the broker in strict-validation mode after an event has been
    /// deserialized from an untrusted source.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.id.is_empty() {
            return Err(EventError::MissingId);
        }
        if self.source.is_empty() {
            return Err(EventError::MissingSource);
        }
        if self.ty.is_empty() {
            return Err(EventError::MissingType);
        }
        if self.specversion != SPEC_VERSION {
            return Err(EventError::UnsupportedSpecVersion(self.specversion.clone()));
        }
        for key in self.extensions.keys() {
            if key.starts_with(RESERVED_EXTENSION_PREFIX) {
                return Err(EventError::ReservedExtensionPrefix(key.clone()));
            }
        }
        Ok(())
    }

    /// Parse and validate an event received as structured-mode JSON.
    pub fn from_json(raw: &str) -> Result<Self, EventError> {
        let event: Event = serde_json::from_str(raw).map_err(|_| EventError::MissingType)?;
        event.validate()?;
        Ok(event)
    }
}

/// Fluent constructor for [`Event`]; mirrors the builder conventions used
/// elsewhere in this workspace for request/response envelopes.
pub struct EventBuilder {
    id: Option<String>,
    source: String,
    ty: String,
    time: Option<DateTime<Utc>>,
    subject: Option<String>,
    datacontenttype: String,
    dataschema: Option<String>,
    data: Value,
    extensions: BTreeMap<String, ExtensionValue>,
}

impl EventBuilder {
    /// Override the generated event id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the occurrence time; defaults to the construction time.
    pub fn time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Set the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Override `datacontenttype`; defaults to `application/json`.
    pub fn datacontenttype(mut self, datacontenttype: impl Into<String>) -> Self {
        self.datacontenttype = datacontenttype.into();
        self
    }

    /// Set a schema URI for `data`.
    pub fn dataschema(mut self, dataschema: impl Into<String>) -> Self {
        self.dataschema = Some(dataschema.into());
        self
    }

    /// Set the payload.
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Attach the AMCP topic extension explicitly, for events whose `type`
    /// is not itself the routing topic (e.g. a reverse-DNS bridged event).
    pub fn topic(self, topic: &Topic) -> Result<Self, EventError> {
        self.extension(TOPIC_EXTENSION, topic.as_str())
    }

    /// Record the originating agent or component.
    pub fn sender(self, sender: impl Into<String>) -> Result<Self, EventError> {
        self.extension(SENDER_EXTENSION, sender.into())
    }

    /// Attach a caller-supplied extension attribute. Rejects the reserved
    /// `ce-` prefix immediately rather than waiting for `build()`.
    pub fn extension(
        mut self,
        name: impl Into<String>,
        value: impl Into<ExtensionValue>,
    ) -> Result<Self, EventError> {
        let name = name.into();
        if name.starts_with(RESERVED_EXTENSION_PREFIX) {
            return Err(EventError::ReservedExtensionPrefix(name));
        }
        self.extensions.insert(name, value.into());
        Ok(self)
    }

    /// Finalize the event, validating required attributes.
    pub fn build(self) -> Result<Event, EventError> {
        if self.source.is_empty() {
            return Err(EventError::MissingSource);
        }
        if self.ty.is_empty() {
            return Err(EventError::MissingType);
        }
        let id = match self.id {
            Some(id) if !id.is_empty() => id,
            Some(_) => return Err(EventError::MissingId),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let event = Event {
            specversion: SPEC_VERSION.to_string(),
            id,
            source: self.source,
            ty: self.ty,
            time: self.time.unwrap_or_else(Utc::now),
            subject: self.subject,
            datacontenttype: self.datacontenttype,
            dataschema: self.dataschema,
            data: self.data,
            extensions: self.extensions,
        };
        event.validate()?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_a_valid_event_with_defaults() {
        let event = Event::builder("task.request.weather", "meshframe://gateway")
            .build()
            .unwrap();
        assert_eq!(event.specversion(), SPEC_VERSION);
        assert_eq!(event.datacontenttype(), DEFAULT_CONTENT_TYPE);
        assert_eq!(event.topic(), "task.request.weather");
        assert!(!event.id().is_empty());
    }

    #[test]
    fn rejects_reserved_extension_prefix() {
        let err = Event::builder("task.request.weather", "meshframe://gateway")
            .extension("ce-special", "x")
            .unwrap_err();
        assert_eq!(
            err,
            EventError::ReservedExtensionPrefix("ce-special".to_string())
        );
    }

    #[test]
    fn topic_extension_overrides_reverse_dns_type() {
        let topic = Topic::new("task.response.weather").unwrap();
        let event = Event::builder("com.example.task.response.weather", "meshframe://weather-agent-1")
            .topic(&topic)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(event.topic(), "task.response.weather");
        assert_eq!(event.ty(), "com.example.task.response.weather");
    }

    #[test]
    fn serializes_to_structured_mode_json_round_trip() {
        let event = Event::builder("task.request.weather", "meshframe://gateway")
            .subject("session-123")
            .data(serde_json::json!({"city": "Lisbon"}))
            .build()
            .unwrap();
        let json = serde_json::to_string(&event).unwrap();
        let reparsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, reparsed);
    }

    #[test]
    fn rejects_empty_source_and_type() {
        assert!(Event::builder("task.request.weather", "").build().is_err());
        assert!(Event::builder("", "meshframe://gateway").build().is_err());
    }
}
