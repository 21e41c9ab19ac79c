use chrono::{DateTime, Utc};
use common::CorrelationId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EventLogError, Result};

/// Schema version stamped on every envelope emitted by this crate.
pub const SCHEMA_VERSION: &str = "1.0";

/// Namespace for deterministic event ids derived from a lifecycle step.
const DERIVED_EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x8c4e_2b71_5d0a_4f3e_9a61_07c2_d35e_b418);

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Derives a stable event ID from a name (UUID v5).
    ///
    /// The same name always yields the same ID, which lets a consumer
    /// re-emit a downstream event after a crash without creating a second,
    /// distinct event.
    pub fn derived(name: &str) -> Self {
        Self(Uuid::new_v5(&DERIVED_EVENT_NAMESPACE, name.as_bytes()))
    }

    /// Derives the ID of the event a lifecycle emits for one step.
    pub fn for_step(correlation_id: CorrelationId, event_type: EventType) -> Self {
        Self::derived(&format!("{correlation_id}:{}", event_type.as_str()))
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<EventId> for Uuid {
    fn from(id: EventId) -> Self {
        id.0
    }
}

/// The event types that flow through the fulfillment pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    PurchaseConfirmed,
    PurchaseCreated,
    TrainerAllocated,
    SessionsGenerated,
}

impl EventType {
    /// All known event types, in pipeline order.
    pub const ALL: [EventType; 4] = [
        EventType::PurchaseConfirmed,
        EventType::PurchaseCreated,
        EventType::TrainerAllocated,
        EventType::SessionsGenerated,
    ];

    /// Returns the wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PurchaseConfirmed => "PurchaseConfirmed",
            EventType::PurchaseCreated => "PurchaseCreated",
            EventType::TrainerAllocated => "TrainerAllocated",
            EventType::SessionsGenerated => "SessionsGenerated",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = EventLogError;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventLogError::UnknownEventType(s.to_string()))
    }
}

/// The stable JSON envelope shared by every event on the log.
///
/// `event_type` stays a plain string so that events of types this crate
/// does not know can still be carried, inspected, and dead-lettered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// Groups all events of one purchase lifecycle; the partition key.
    pub correlation_id: CorrelationId,

    /// The type of the event (e.g. "PurchaseCreated").
    #[serde(rename = "type")]
    pub event_type: String,

    /// The component that emitted the event.
    pub source: String,

    /// Payload schema version.
    pub version: String,

    /// When the event was emitted.
    pub emitted_at: DateTime<Utc>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Resolves the envelope's type against the known event types.
    pub fn kind(&self) -> Result<EventType> {
        self.event_type.parse()
    }

    /// Deserializes the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    correlation_id: Option<CorrelationId>,
    event_type: Option<String>,
    source: Option<String>,
    version: Option<String>,
    emitted_at: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the correlation ID.
    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the emitting component.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the schema version. Defaults to [`SCHEMA_VERSION`].
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the emission time. If not set, the current time will be used.
    pub fn emitted_at(mut self, emitted_at: DateTime<Utc>) -> Self {
        self.emitted_at = Some(emitted_at);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> std::result::Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the envelope, returning None if required fields are missing.
    ///
    /// Required: correlation ID, event type, source, payload.
    pub fn try_build(self) -> Option<EventEnvelope> {
        Some(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            correlation_id: self.correlation_id?,
            event_type: self.event_type?,
            source: self.source?,
            version: self.version.unwrap_or_else(|| SCHEMA_VERSION.to_string()),
            emitted_at: self.emitted_at.unwrap_or_else(Utc::now),
            payload: self.payload?,
        })
    }

    /// Builds the envelope, reporting the first missing field as an error.
    pub fn build(self) -> Result<EventEnvelope> {
        let missing = if self.correlation_id.is_none() {
            Some("correlation_id")
        } else if self.event_type.is_none() {
            Some("event_type")
        } else if self.source.is_none() {
            Some("source")
        } else if self.payload.is_none() {
            Some("payload")
        } else {
            None
        };

        match missing {
            Some(field) => Err(EventLogError::InvalidEnvelope(format!("{field} is required"))),
            None => self
                .try_build()
                .ok_or_else(|| EventLogError::InvalidEnvelope("incomplete envelope".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EventEnvelope {
        EventEnvelope::builder()
            .correlation_id(CorrelationId::new())
            .event_type(EventType::PurchaseCreated.as_str())
            .source("test")
            .payload_raw(serde_json::json!({"tier": 10}))
            .build()
            .unwrap()
    }

    #[test]
    fn derived_ids_are_stable() {
        let correlation_id = CorrelationId::new();
        let a = EventId::for_step(correlation_id, EventType::PurchaseCreated);
        let b = EventId::for_step(correlation_id, EventType::PurchaseCreated);
        let c = EventId::for_step(correlation_id, EventType::TrainerAllocated);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn envelope_serializes_with_wire_field_names() {
        let envelope = sample();
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["type"], "PurchaseCreated");
        assert_eq!(json["version"], SCHEMA_VERSION);
        assert!(json.get("eventId").is_some());
        assert!(json.get("correlationId").is_some());
        assert!(json.get("emittedAt").is_some());
        assert_eq!(json["payload"]["tier"], 10);
    }

    #[test]
    fn kind_rejects_unknown_types() {
        let mut envelope = sample();
        assert_eq!(envelope.kind().unwrap(), EventType::PurchaseCreated);

        envelope.event_type = "CoursePublished".to_string();
        assert!(matches!(
            envelope.kind(),
            Err(EventLogError::UnknownEventType(t)) if t == "CoursePublished"
        ));
    }

    #[test]
    fn build_reports_missing_fields() {
        let err = EventEnvelope::builder()
            .event_type("PurchaseCreated")
            .source("test")
            .payload_raw(serde_json::json!({}))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("correlation_id"));
        assert!(EventEnvelope::builder().try_build().is_none());
    }

    #[test]
    fn decode_reads_payload() {
        #[derive(Deserialize)]
        struct Tier {
            tier: u32,
        }
        let tier: Tier = sample().decode().unwrap();
        assert_eq!(tier.tier, 10);
    }
}
