//! Payloads of the fulfillment events.
//!
//! Every payload serializes camelCase, matching the envelope. Each one knows
//! its [`EventType`] so it can be wrapped into an [`EventEnvelope`] without
//! the caller spelling the type name.

use common::{AllocationId, CorrelationId, CourseId, PaymentId, PurchaseId, SessionId, StudentId, TutorId};
use event_log::{EventEnvelope, EventId, EventLogError, EventType};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::DomainError;

/// A payload that travels on the log as one specific event type.
pub trait FulfillmentEvent: Serialize + DeserializeOwned {
    /// The event type this payload is published as.
    const EVENT_TYPE: EventType;

    /// Wraps the payload in an envelope.
    fn to_envelope(
        &self,
        event_id: EventId,
        correlation_id: CorrelationId,
        source: &str,
    ) -> Result<EventEnvelope, EventLogError> {
        EventEnvelope::builder()
            .event_id(event_id)
            .correlation_id(correlation_id)
            .event_type(Self::EVENT_TYPE.as_str())
            .source(source)
            .payload(self)?
            .build()
    }

    /// Decodes the payload of an envelope, checking its type first.
    fn from_envelope(envelope: &EventEnvelope) -> Result<Self, DomainError> {
        if envelope.event_type != Self::EVENT_TYPE.as_str() {
            return Err(DomainError::InvalidPayload(format!(
                "expected {} but got {}",
                Self::EVENT_TYPE,
                envelope.event_type
            )));
        }
        envelope
            .decode()
            .map_err(|e| DomainError::InvalidPayload(e.to_string()))
    }
}

/// A payment was confirmed for a course tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseConfirmed {
    pub payment_id: PaymentId,
    pub student_id: StudentId,
    pub course_id: CourseId,
    /// Number of sessions bought.
    pub tier: u32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl PurchaseConfirmed {
    /// Rejects payloads no retry could ever fix.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.tier == 0 {
            return Err(DomainError::InvalidPayload(
                "tier must be at least one session".to_string(),
            ));
        }
        Ok(())
    }
}

impl FulfillmentEvent for PurchaseConfirmed {
    const EVENT_TYPE: EventType = EventType::PurchaseConfirmed;
}

/// A purchase row was materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseCreated {
    pub purchase_id: PurchaseId,
    pub student_id: StudentId,
    pub course_id: CourseId,
    pub tier: u32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl FulfillmentEvent for PurchaseCreated {
    const EVENT_TYPE: EventType = EventType::PurchaseCreated;
}

/// A tutor was allocated to a purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainerAllocated {
    pub allocation_id: AllocationId,
    pub student_id: StudentId,
    pub course_id: CourseId,
    pub tutor_id: TutorId,
    pub session_count: u32,
}

impl FulfillmentEvent for TrainerAllocated {
    const EVENT_TYPE: EventType = EventType::TrainerAllocated;
}

/// New sessions were added to an allocation's window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsGenerated {
    pub allocation_id: AllocationId,
    pub session_ids: Vec<SessionId>,
    /// Absent on events from older producers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<StudentId>,
}

impl SessionsGenerated {
    /// Stable event ID for a batch: same allocation and same sessions give
    /// the same ID regardless of the order the IDs are listed in.
    pub fn batch_event_id(&self) -> EventId {
        let mut ids: Vec<String> = self.session_ids.iter().map(ToString::to_string).collect();
        ids.sort_unstable();
        EventId::derived(&format!(
            "{}:{}:{}",
            self.allocation_id,
            EventType::SessionsGenerated,
            ids.join(",")
        ))
    }
}

impl FulfillmentEvent for SessionsGenerated {
    const EVENT_TYPE: EventType = EventType::SessionsGenerated;
}

/// Student id carried by any of the events the cache invalidator reacts to.
///
/// Returns `Ok(None)` for a `SessionsGenerated` without a student id, so the
/// caller can fall back to the allocation.
pub fn student_of(envelope: &EventEnvelope) -> Result<Option<StudentId>, DomainError> {
    let kind = envelope
        .kind()
        .map_err(|e| DomainError::InvalidPayload(e.to_string()))?;
    match kind {
        EventType::PurchaseConfirmed => Ok(Some(PurchaseConfirmed::from_envelope(envelope)?.student_id)),
        EventType::PurchaseCreated => Ok(Some(PurchaseCreated::from_envelope(envelope)?.student_id)),
        EventType::TrainerAllocated => Ok(Some(TrainerAllocated::from_envelope(envelope)?.student_id)),
        EventType::SessionsGenerated => Ok(SessionsGenerated::from_envelope(envelope)?.student_id),
    }
}
