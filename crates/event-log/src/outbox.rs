use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{EventEnvelope, EventId, Result};

/// A persisted emission intent.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub envelope: EventEnvelope,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// Creates an unpublished entry for an envelope.
    pub fn new(envelope: EventEnvelope) -> Self {
        Self {
            envelope,
            created_at: Utc::now(),
            published_at: None,
            attempts: 0,
            last_error: None,
        }
    }

    /// Returns true once the event has reached the log.
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}

/// Durable store of events that must reach the log.
///
/// An event is written here before it is published, keyed by event id, so
/// a crash between the two steps leaves a record for the republish sweep.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persists an emission intent.
    ///
    /// Returns false, without modifying anything, when the event id is
    /// already present.
    async fn insert(&self, envelope: &EventEnvelope) -> Result<bool>;

    /// Marks an event as published.
    async fn mark_published(&self, event_id: EventId) -> Result<()>;

    /// Records a failed publish attempt.
    async fn record_failure(&self, event_id: EventId, error: &str) -> Result<()>;

    /// Returns unpublished entries created before `before`, oldest first.
    async fn pending(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Looks up a single entry.
    async fn get(&self, event_id: EventId) -> Result<Option<OutboxEntry>>;
}
