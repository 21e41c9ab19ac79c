//! Allocation coordinator: `PurchaseCreated` in, `TrainerAllocated` out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::TutorId;
use domain::{
    Allocation, FulfillmentEvent, IdempotencyKey, NewAllocation, ProcessedEvent, PurchaseCreated,
    WriteOutcome,
};
use event_log::{EmitOutcome, EventEnvelope, EventId, EventType, IdempotentEmitter};
use store::FulfillmentStore;

use crate::error::{PipelineError, Result};
use crate::handler::{EventHandler, HandleOutcome};
use crate::retry::RetryPolicy;
use crate::services::{MatchRequest, TutorMatcher};

/// Stage name, consumer group and event source.
pub const ALLOCATOR_STAGE: &str = "allocation-coordinator";

const DEFAULT_MATCHER_TIMEOUT: Duration = Duration::from_secs(5);

/// Assigns a tutor to each new purchase.
///
/// The open-allocation constraint on (student, course) decides races
/// between consumers; the loser adopts the winner's row. The matcher is
/// only consulted when no open allocation exists, and its failure never
/// produces an allocation without a tutor.
pub struct AllocationCoordinator {
    store: Arc<dyn FulfillmentStore>,
    emitter: IdempotentEmitter,
    matcher: Arc<dyn TutorMatcher>,
    matcher_timeout: Duration,
    retry: RetryPolicy,
}

impl AllocationCoordinator {
    pub fn new(
        store: Arc<dyn FulfillmentStore>,
        emitter: IdempotentEmitter,
        matcher: Arc<dyn TutorMatcher>,
    ) -> Self {
        Self {
            store,
            emitter,
            matcher,
            matcher_timeout: DEFAULT_MATCHER_TIMEOUT,
            retry: RetryPolicy::with_attempts(5),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_matcher_timeout(mut self, timeout: Duration) -> Self {
        self.matcher_timeout = timeout;
        self
    }

    async fn select_tutor(&self, created: &PurchaseCreated) -> Result<TutorId> {
        let request = MatchRequest {
            student_id: created.student_id,
            course_id: created.course_id,
            session_count: created.tier,
            criteria: created.metadata.clone(),
        };

        match tokio::time::timeout(self.matcher_timeout, self.matcher.select_tutor(&request)).await
        {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!("fulfillment_matcher_timeouts_total").increment(1);
                Err(PipelineError::CollaboratorTimeout {
                    collaborator: "tutor matcher",
                    after: self.matcher_timeout,
                })
            }
        }
    }

    async fn existing_allocation(
        &self,
        envelope: &EventEnvelope,
        created: &PurchaseCreated,
    ) -> Result<Option<Allocation>> {
        if let Some(allocation) = self
            .store
            .find_allocation_by_correlation(envelope.correlation_id)
            .await?
        {
            return Ok(Some(allocation));
        }
        Ok(self
            .store
            .find_open_allocation(created.student_id, created.course_id)
            .await?)
    }

    async fn announce(&self, allocation: &Allocation) -> Result<EmitOutcome> {
        let event_id = EventId::for_step(allocation.correlation_id, EventType::TrainerAllocated);
        let envelope = allocation.allocated_event().to_envelope(
            event_id,
            allocation.correlation_id,
            ALLOCATOR_STAGE,
        )?;
        Ok(self.emitter.emit(envelope).await?)
    }
}

#[async_trait]
impl EventHandler for AllocationCoordinator {
    fn stage(&self) -> &'static str {
        ALLOCATOR_STAGE
    }

    fn handles(&self, event_type: EventType) -> bool {
        event_type == EventType::PurchaseCreated
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[tracing::instrument(skip(self, envelope), fields(correlation_id = %envelope.correlation_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<HandleOutcome> {
        let created = PurchaseCreated::from_envelope(envelope)?;

        let key = IdempotencyKey::new(envelope.correlation_id, EventType::PurchaseCreated);
        if self.store.has_processed(key).await? {
            if let Some(allocation) = self.existing_allocation(envelope, &created).await? {
                self.announce(&allocation).await?;
            }
            return Ok(HandleOutcome::Duplicate);
        }

        let tutor_id = match self
            .store
            .find_open_allocation(created.student_id, created.course_id)
            .await?
        {
            Some(open) => {
                tracing::debug!(allocation_id = %open.id, "Open allocation exists, skipping matcher");
                open.tutor_id
            }
            None => self.select_tutor(&created).await?,
        };

        let receipt = ProcessedEvent::from_envelope(envelope)?;
        let outcome = self
            .store
            .approve_allocation(
                receipt,
                NewAllocation::for_purchase(envelope.correlation_id, &created, tutor_id),
            )
            .await?;

        let emitted = self.announce(outcome.get()).await?;
        match outcome {
            WriteOutcome::Created(allocation) => {
                tracing::info!(
                    allocation_id = %allocation.id,
                    tutor_id = %allocation.tutor_id,
                    session_count = allocation.session_count,
                    ?emitted,
                    "Tutor allocated"
                );
                Ok(HandleOutcome::Applied)
            }
            WriteOutcome::AlreadyExists(allocation) => {
                tracing::info!(
                    allocation_id = %allocation.id,
                    "Open allocation already exists for student and course"
                );
                Ok(HandleOutcome::Duplicate)
            }
        }
    }
}
