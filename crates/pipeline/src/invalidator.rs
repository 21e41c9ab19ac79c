//! Cache invalidator: drops a student's cached read models whenever their
//! fulfillment state changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::StudentId;
use domain::{FulfillmentEvent, SessionsGenerated, student_of};
use event_log::{EventEnvelope, EventType};
use store::FulfillmentStore;

use crate::error::Result;
use crate::handler::{EventHandler, HandleOutcome};
use crate::retry::RetryPolicy;
use crate::services::{CacheStore, student_keys};

/// Stage name and consumer group.
pub const INVALIDATOR_STAGE: &str = "cache-invalidator";

/// Fire-and-forget cache invalidation. Failures are retried on a short
/// budget and then dropped, never dead-lettered.
pub struct CacheInvalidator {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn FulfillmentStore>,
    retry: RetryPolicy,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn CacheStore>, store: Arc<dyn FulfillmentStore>) -> Self {
        Self {
            cache,
            store,
            retry: RetryPolicy::builder()
                .max_attempts(2)
                .initial_delay(Duration::from_millis(50))
                .build(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Deletes every cached view of the student.
    pub async fn invalidate(&self, student_id: StudentId) -> Result<()> {
        for key in student_keys(student_id) {
            self.cache.delete(&key).await?;
        }
        metrics::counter!("fulfillment_cache_invalidations_total").increment(1);
        tracing::debug!(%student_id, "Student cache invalidated");
        Ok(())
    }

    async fn resolve_student(&self, envelope: &EventEnvelope) -> Result<Option<StudentId>> {
        if let Some(student_id) = student_of(envelope)? {
            return Ok(Some(student_id));
        }

        let generated = SessionsGenerated::from_envelope(envelope)?;
        let allocation = self.store.get_allocation(generated.allocation_id).await?;
        Ok(allocation.map(|a| a.student_id))
    }
}

#[async_trait]
impl EventHandler for CacheInvalidator {
    fn stage(&self) -> &'static str {
        INVALIDATOR_STAGE
    }

    fn handles(&self, event_type: EventType) -> bool {
        matches!(
            event_type,
            EventType::PurchaseCreated | EventType::TrainerAllocated | EventType::SessionsGenerated
        )
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn dead_letters(&self) -> bool {
        false
    }

    #[tracing::instrument(skip(self, envelope), fields(event_type = %envelope.event_type))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<HandleOutcome> {
        let Some(student_id) = self.resolve_student(envelope).await? else {
            tracing::warn!("No student found for event, nothing to invalidate");
            return Ok(HandleOutcome::Skipped);
        };

        self.invalidate(student_id).await?;
        Ok(HandleOutcome::Applied)
    }
}
