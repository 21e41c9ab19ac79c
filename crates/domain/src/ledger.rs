//! Processed-events ledger records.

use chrono::{DateTime, Utc};
use common::CorrelationId;
use event_log::{EventEnvelope, EventId, EventType};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The dedup key of the ledger: one business effect per lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub correlation_id: CorrelationId,
    pub event_type: EventType,
}

impl IdempotencyKey {
    pub fn new(correlation_id: CorrelationId, event_type: EventType) -> Self {
        Self {
            correlation_id,
            event_type,
        }
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.correlation_id, self.event_type)
    }
}

/// Receipt written in the same transaction as the effect of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_id: EventId,
    pub event_type: EventType,
    pub correlation_id: CorrelationId,
    /// Snapshot of the payload that was acted on.
    pub payload: serde_json::Value,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedEvent {
    /// Builds the receipt for an envelope of a known type.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, DomainError> {
        let event_type = envelope
            .kind()
            .map_err(|e| DomainError::InvalidPayload(e.to_string()))?;
        Ok(Self {
            event_id: envelope.event_id,
            event_type,
            correlation_id: envelope.correlation_id,
            payload: envelope.payload.clone(),
            processed_at: Utc::now(),
        })
    }

    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.correlation_id, self.event_type)
    }
}
