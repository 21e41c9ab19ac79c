//! Purchase materializer: `PurchaseConfirmed` in, `PurchaseCreated` out.

use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    FulfillmentEvent, IdempotencyKey, NewPurchase, ProcessedEvent, Purchase, PurchaseConfirmed,
    WriteOutcome,
};
use event_log::{EmitOutcome, EventEnvelope, EventId, EventType, IdempotentEmitter};
use store::FulfillmentStore;

use crate::error::{PipelineError, Result};
use crate::handler::{EventHandler, HandleOutcome};
use crate::retry::RetryPolicy;

/// Stage name, consumer group and event source.
pub const MATERIALIZER_STAGE: &str = "purchase-materializer";

/// Turns confirmed payments into purchase rows.
///
/// At most one active purchase exists per (student, course); a confirmation
/// for a pair that already has one resolves to the existing row and
/// re-announces it under its original event id.
pub struct PurchaseMaterializer {
    store: Arc<dyn FulfillmentStore>,
    emitter: IdempotentEmitter,
    retry: RetryPolicy,
}

impl PurchaseMaterializer {
    pub fn new(store: Arc<dyn FulfillmentStore>, emitter: IdempotentEmitter) -> Self {
        Self {
            store,
            emitter,
            retry: RetryPolicy::with_attempts(3),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn existing_purchase(
        &self,
        envelope: &EventEnvelope,
        confirmed: &PurchaseConfirmed,
    ) -> Result<Option<Purchase>> {
        if let Some(purchase) = self
            .store
            .find_purchase_by_correlation(envelope.correlation_id)
            .await?
        {
            return Ok(Some(purchase));
        }
        Ok(self
            .store
            .find_active_purchase(confirmed.student_id, confirmed.course_id)
            .await?)
    }

    async fn announce(&self, purchase: &Purchase) -> Result<EmitOutcome> {
        let event_id = EventId::for_step(purchase.correlation_id, EventType::PurchaseCreated);
        let envelope =
            purchase
                .created_event()
                .to_envelope(event_id, purchase.correlation_id, MATERIALIZER_STAGE)?;
        Ok(self.emitter.emit(envelope).await?)
    }
}

#[async_trait]
impl EventHandler for PurchaseMaterializer {
    fn stage(&self) -> &'static str {
        MATERIALIZER_STAGE
    }

    fn handles(&self, event_type: EventType) -> bool {
        event_type == EventType::PurchaseConfirmed
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn claims_unknown_types(&self) -> bool {
        true
    }

    #[tracing::instrument(skip(self, envelope), fields(correlation_id = %envelope.correlation_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<HandleOutcome> {
        let confirmed = PurchaseConfirmed::from_envelope(envelope)?;
        confirmed
            .validate()
            .map_err(|e| PipelineError::Validation(e.to_string()))?;

        let key = IdempotencyKey::new(envelope.correlation_id, EventType::PurchaseConfirmed);
        if self.store.has_processed(key).await? {
            if let Some(purchase) = self.existing_purchase(envelope, &confirmed).await? {
                self.announce(&purchase).await?;
            }
            return Ok(HandleOutcome::Duplicate);
        }

        let receipt = ProcessedEvent::from_envelope(envelope)?;
        let outcome = self
            .store
            .materialize_purchase(
                receipt,
                NewPurchase::from_confirmed(envelope.correlation_id, &confirmed),
            )
            .await?;

        let emitted = self.announce(outcome.get()).await?;
        match outcome {
            WriteOutcome::Created(purchase) => {
                tracing::info!(
                    purchase_id = %purchase.id,
                    student_id = %purchase.student_id,
                    course_id = %purchase.course_id,
                    tier = purchase.tier,
                    ?emitted,
                    "Purchase materialized"
                );
                Ok(HandleOutcome::Applied)
            }
            WriteOutcome::AlreadyExists(purchase) => {
                tracing::info!(
                    purchase_id = %purchase.id,
                    "Active purchase already exists for student and course"
                );
                Ok(HandleOutcome::Duplicate)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CorrelationId, CourseId, PaymentId, StudentId};
    use domain::PurchaseCreated;
    use event_log::{InMemoryEventLog, InMemoryOutbox, LogConfig};
    use store::InMemoryFulfillmentStore;

    struct Fixture {
        materializer: PurchaseMaterializer,
        store: InMemoryFulfillmentStore,
        log: InMemoryEventLog,
    }

    fn fixture() -> Fixture {
        let store = InMemoryFulfillmentStore::new();
        let log = InMemoryEventLog::new(LogConfig::default());
        let emitter = IdempotentEmitter::new(Arc::new(log.clone()), Arc::new(InMemoryOutbox::new()));
        Fixture {
            materializer: PurchaseMaterializer::new(Arc::new(store.clone()), emitter),
            store,
            log,
        }
    }

    fn confirmed(student_id: StudentId, course_id: CourseId, tier: u32) -> EventEnvelope {
        PurchaseConfirmed {
            payment_id: PaymentId::new(),
            student_id,
            course_id,
            tier,
            metadata: serde_json::json!({"schedule": {"weekdays": ["Tue"]}}),
        }
        .to_envelope(EventId::new(), CorrelationId::new(), "payments")
        .unwrap()
    }

    #[tokio::test]
    async fn creates_purchase_and_announces_it() {
        let f = fixture();
        let envelope = confirmed(StudentId::new(), CourseId::new(), 10);

        let outcome = f.materializer.handle(&envelope).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Applied);

        let created = f.log.records_of_type("PurchaseCreated").await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].correlation_id, envelope.correlation_id);
        assert_eq!(created[0].source, MATERIALIZER_STAGE);

        let payload = PurchaseCreated::from_envelope(&created[0]).unwrap();
        assert_eq!(payload.tier, 10);
        assert_eq!(payload.metadata["schedule"]["weekdays"][0], "Tue");
    }

    #[tokio::test]
    async fn redelivery_is_acknowledged_without_second_purchase() {
        let f = fixture();
        let envelope = confirmed(StudentId::new(), CourseId::new(), 10);

        f.materializer.handle(&envelope).await.unwrap();
        let outcome = f.materializer.handle(&envelope).await.unwrap();

        assert_eq!(outcome, HandleOutcome::Duplicate);
        assert_eq!(f.store.purchase_count().await, 1);
        assert_eq!(f.log.records_of_type("PurchaseCreated").await.len(), 1);
    }

    #[tokio::test]
    async fn second_confirmation_for_same_course_resolves_to_existing_purchase() {
        let f = fixture();
        let student_id = StudentId::new();
        let course_id = CourseId::new();

        f.materializer
            .handle(&confirmed(student_id, course_id, 10))
            .await
            .unwrap();
        let outcome = f
            .materializer
            .handle(&confirmed(student_id, course_id, 10))
            .await
            .unwrap();

        assert_eq!(outcome, HandleOutcome::Duplicate);
        assert_eq!(f.store.purchase_count().await, 1);
        assert_eq!(f.log.records_of_type("PurchaseCreated").await.len(), 1);
    }

    #[tokio::test]
    async fn zero_tier_is_a_validation_error() {
        let f = fixture();
        let err = f
            .materializer
            .handle(&confirmed(StudentId::new(), CourseId::new(), 0))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(!err.is_transient());
        assert_eq!(f.store.purchase_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_payload_is_permanent() {
        let f = fixture();
        let envelope = EventEnvelope::builder()
            .correlation_id(CorrelationId::new())
            .event_type("PurchaseConfirmed")
            .source("payments")
            .payload_raw(serde_json::json!({"tier": "ten"}))
            .build()
            .unwrap();

        let err = f.materializer.handle(&envelope).await.unwrap_err();
        assert!(matches!(err, PipelineError::Malformed(_)));
    }

    #[tokio::test]
    async fn store_outage_is_transient() {
        let f = fixture();
        f.store.fail_writes(1).await;

        let err = f
            .materializer
            .handle(&confirmed(StudentId::new(), CourseId::new(), 10))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(f.log.records_of_type("PurchaseCreated").await.is_empty());
    }
}
