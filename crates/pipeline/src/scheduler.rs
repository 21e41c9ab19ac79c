//! Session scheduler: keeps every open allocation's session window filled.
//!
//! `TrainerAllocated` events and the periodic timer both go through
//! [`SessionScheduler::ensure_window_at`], so a window can be refilled from
//! either trigger without creating a slot twice.
//!
//! Sessions are committed before they are announced. Every run therefore
//! re-announces each batch of the allocation under its batch event id; the
//! outbox drops the batches that were already emitted and the ones lost to a
//! failure between commit and emit go out.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use common::{AllocationId, SessionId};
use domain::{
    Allocation, AllocationStatus, FulfillmentEvent, IdempotencyKey, ProcessedEvent, Session,
    SessionsGenerated, TrainerAllocated, WindowPolicy,
};
use event_log::{EmitOutcome, EventEnvelope, EventType, IdempotentEmitter};
use store::{FulfillmentStore, WindowOutcome};

use crate::error::Result;
use crate::handler::{EventHandler, HandleOutcome};
use crate::retry::RetryPolicy;

/// Stage name, consumer group and event source.
pub const SCHEDULER_STAGE: &str = "session-scheduler";

#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub window: WindowPolicy,
    pub retry: RetryPolicy,
}

/// Summary of one sweep over the open allocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopUpReport {
    pub allocations: usize,
    pub sessions_created: usize,
    pub ended: usize,
    pub failed: usize,
}

pub struct SessionScheduler {
    store: Arc<dyn FulfillmentStore>,
    emitter: IdempotentEmitter,
    config: SchedulerConfig,
}

impl SessionScheduler {
    pub fn new(
        store: Arc<dyn FulfillmentStore>,
        emitter: IdempotentEmitter,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            emitter,
            config,
        }
    }

    pub fn window(&self) -> &WindowPolicy {
        &self.config.window
    }

    /// Refills the window of one allocation as of today.
    pub async fn ensure_window(&self, allocation_id: AllocationId) -> Result<WindowOutcome> {
        self.ensure_window_at(allocation_id, Utc::now().date_naive())
            .await
    }

    /// Refills the window of one allocation, scheduling from the day after
    /// `today` at the earliest.
    #[tracing::instrument(skip(self))]
    pub async fn ensure_window_at(
        &self,
        allocation_id: AllocationId,
        today: NaiveDate,
    ) -> Result<WindowOutcome> {
        let outcome = self
            .store
            .top_up_sessions(allocation_id, &self.config.window, today, None)
            .await?;
        record(&outcome);
        self.announce_batches(&outcome.allocation).await?;
        Ok(outcome)
    }

    /// Runs [`Self::ensure_window_at`] for every open allocation.
    ///
    /// A failing allocation is logged and counted; the sweep moves on.
    #[tracing::instrument(skip(self))]
    pub async fn top_up_all(&self) -> Result<TopUpReport> {
        let today = Utc::now().date_naive();
        let allocations = self.store.open_allocations().await?;
        let mut report = TopUpReport {
            allocations: allocations.len(),
            ..TopUpReport::default()
        };

        for allocation in allocations {
            match self.ensure_window_at(allocation.id, today).await {
                Ok(outcome) => {
                    report.sessions_created += outcome.created.len();
                    if outcome.transition == Some(AllocationStatus::Ended) {
                        report.ended += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(allocation_id = %allocation.id, error = %e, "Top-up failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            allocations = report.allocations,
            sessions_created = report.sessions_created,
            ended = report.ended,
            failed = report.failed,
            "Top-up sweep finished"
        );
        Ok(report)
    }

    /// Emits `SessionsGenerated` for every batch of the allocation's
    /// sessions, each under [`SessionsGenerated::batch_event_id`].
    ///
    /// Returns how many batches were new to the outbox.
    async fn announce_batches(&self, allocation: &Allocation) -> Result<usize> {
        let sessions = self.store.sessions_for_allocation(allocation.id).await?;
        let mut announced = 0;

        for session_ids in batches(&sessions) {
            let event = SessionsGenerated {
                allocation_id: allocation.id,
                session_ids,
                student_id: Some(allocation.student_id),
            };
            let envelope = event.to_envelope(
                event.batch_event_id(),
                allocation.correlation_id,
                SCHEDULER_STAGE,
            )?;
            let emitted = self.emitter.emit(envelope).await?;
            if emitted != EmitOutcome::Duplicate {
                announced += 1;
                tracing::info!(
                    allocation_id = %allocation.id,
                    sessions = event.session_ids.len(),
                    ?emitted,
                    "Sessions generated"
                );
            }
        }
        Ok(announced)
    }
}

fn record(outcome: &WindowOutcome) {
    if let Some(status) = outcome.transition {
        tracing::info!(allocation_id = %outcome.allocation.id, %status, "Allocation status changed");
    }
    if !outcome.created.is_empty() {
        metrics::counter!("fulfillment_sessions_created_total")
            .increment(outcome.created.len() as u64);
        tracing::debug!(
            allocation_id = %outcome.allocation.id,
            created = outcome.created.len(),
            scheduled = outcome.counts.scheduled,
            completed = outcome.counts.completed,
            "Window topped up"
        );
    }
}

/// Groups sessions by the top-up that created them. One top-up stamps all
/// of its sessions with the same `created_at`.
fn batches(sessions: &[Session]) -> Vec<Vec<SessionId>> {
    let mut by_run: BTreeMap<DateTime<Utc>, Vec<SessionId>> = BTreeMap::new();
    for session in sessions {
        by_run.entry(session.created_at).or_default().push(session.id);
    }
    by_run.into_values().collect()
}

#[async_trait]
impl EventHandler for SessionScheduler {
    fn stage(&self) -> &'static str {
        SCHEDULER_STAGE
    }

    fn handles(&self, event_type: EventType) -> bool {
        event_type == EventType::TrainerAllocated
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    #[tracing::instrument(skip(self, envelope), fields(correlation_id = %envelope.correlation_id))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<HandleOutcome> {
        let allocated = TrainerAllocated::from_envelope(envelope)?;

        let key = IdempotencyKey::new(envelope.correlation_id, EventType::TrainerAllocated);
        if self.store.has_processed(key).await? {
            if let Some(allocation) = self.store.get_allocation(allocated.allocation_id).await? {
                self.announce_batches(&allocation).await?;
            }
            return Ok(HandleOutcome::Duplicate);
        }

        let receipt = ProcessedEvent::from_envelope(envelope)?;
        let outcome = self
            .store
            .top_up_sessions(
                allocated.allocation_id,
                &self.config.window,
                Utc::now().date_naive(),
                Some(receipt),
            )
            .await?;

        record(&outcome);
        self.announce_batches(&outcome.allocation).await?;
        Ok(HandleOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CorrelationId, CourseId, PurchaseId, StudentId, TutorId};
    use domain::{NewAllocation, PurchaseCreated, SessionStatus};
    use event_log::{
        EventId, EventLogError, InMemoryEventLog, InMemoryOutbox, LogConfig, OutboxEntry,
        OutboxStore,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use store::InMemoryFulfillmentStore;

    /// Outbox whose first `failures` inserts fail.
    struct FlakyOutbox {
        inner: InMemoryOutbox,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl OutboxStore for FlakyOutbox {
        async fn insert(&self, envelope: &EventEnvelope) -> event_log::Result<bool> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EventLogError::Publish("outbox down".into()));
            }
            self.inner.insert(envelope).await
        }

        async fn mark_published(&self, event_id: EventId) -> event_log::Result<()> {
            self.inner.mark_published(event_id).await
        }

        async fn record_failure(&self, event_id: EventId, error: &str) -> event_log::Result<()> {
            self.inner.record_failure(event_id, error).await
        }

        async fn pending(
            &self,
            before: DateTime<Utc>,
            limit: usize,
        ) -> event_log::Result<Vec<OutboxEntry>> {
            self.inner.pending(before, limit).await
        }

        async fn get(&self, event_id: EventId) -> event_log::Result<Option<OutboxEntry>> {
            self.inner.get(event_id).await
        }
    }

    struct Fixture {
        scheduler: SessionScheduler,
        store: InMemoryFulfillmentStore,
        log: InMemoryEventLog,
    }

    fn fixture() -> Fixture {
        fixture_with_outbox(Arc::new(InMemoryOutbox::new()))
    }

    fn fixture_with_outbox(outbox: Arc<dyn OutboxStore>) -> Fixture {
        let store = InMemoryFulfillmentStore::new();
        let log = InMemoryEventLog::new(LogConfig::default());
        let emitter = IdempotentEmitter::new(Arc::new(log.clone()), outbox);
        Fixture {
            scheduler: SessionScheduler::new(
                Arc::new(store.clone()),
                emitter,
                SchedulerConfig::default(),
            ),
            store,
            log,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    async fn allocate(store: &InMemoryFulfillmentStore, tier: u32) -> domain::Allocation {
        let correlation_id = CorrelationId::new();
        let created = PurchaseCreated {
            purchase_id: PurchaseId::new(),
            student_id: StudentId::new(),
            course_id: CourseId::new(),
            tier,
            metadata: serde_json::json!({}),
        };
        let envelope = created
            .to_envelope(EventId::new(), correlation_id, "test")
            .unwrap();
        store
            .approve_allocation(
                ProcessedEvent::from_envelope(&envelope).unwrap(),
                NewAllocation::for_purchase(correlation_id, &created, TutorId::new()),
            )
            .await
            .unwrap()
            .into_inner()
    }

    #[tokio::test]
    async fn trainer_allocated_fills_window_once() {
        let f = fixture();
        let allocation = allocate(&f.store, 10).await;
        let envelope = allocation
            .allocated_event()
            .to_envelope(EventId::new(), allocation.correlation_id, "test")
            .unwrap();

        assert_eq!(
            f.scheduler.handle(&envelope).await.unwrap(),
            HandleOutcome::Applied
        );
        assert_eq!(
            f.scheduler.handle(&envelope).await.unwrap(),
            HandleOutcome::Duplicate
        );

        let sessions = f.store.sessions_for_allocation(allocation.id).await.unwrap();
        assert_eq!(sessions.len(), 7);

        let generated = f.log.records_of_type("SessionsGenerated").await;
        assert_eq!(generated.len(), 1);
        let payload = SessionsGenerated::from_envelope(&generated[0]).unwrap();
        assert_eq!(payload.session_ids.len(), 7);
        assert_eq!(payload.student_id, Some(allocation.student_id));
    }

    #[tokio::test]
    async fn ensure_window_is_a_noop_when_full() {
        let f = fixture();
        let allocation = allocate(&f.store, 10).await;

        let first = f.scheduler.ensure_window_at(allocation.id, today()).await.unwrap();
        assert_eq!(first.created.len(), 7);
        assert_eq!(first.allocation.status, AllocationStatus::Active);

        let second = f.scheduler.ensure_window_at(allocation.id, today()).await.unwrap();
        assert!(second.created.is_empty());
        assert_eq!(f.log.records_of_type("SessionsGenerated").await.len(), 1);
    }

    #[tokio::test]
    async fn rolling_top_up_caps_at_remaining_tier() {
        let f = fixture();
        let allocation = allocate(&f.store, 10).await;
        let first = f.scheduler.ensure_window_at(allocation.id, today()).await.unwrap();

        // 1 completed, 4 cancelled: 2 scheduled remain, below the low water.
        f.store
            .transition_session(first.created[0].id, SessionStatus::Completed)
            .await
            .unwrap();
        for session in &first.created[1..5] {
            f.store
                .transition_session(session.id, SessionStatus::Cancelled)
                .await
                .unwrap();
        }

        let outcome = f.scheduler.ensure_window_at(allocation.id, today()).await.unwrap();
        assert_eq!(outcome.created.len(), 5);
        assert_eq!(outcome.counts.scheduled, 7);
        assert_eq!(f.log.records_of_type("SessionsGenerated").await.len(), 2);
    }

    #[tokio::test]
    async fn top_up_all_sweeps_open_allocations() {
        let f = fixture();
        allocate(&f.store, 10).await;
        allocate(&f.store, 4).await;

        let report = f.scheduler.top_up_all().await.unwrap();
        assert_eq!(
            report,
            TopUpReport {
                allocations: 2,
                sessions_created: 11,
                ended: 0,
                failed: 0,
            }
        );

        let again = f.scheduler.top_up_all().await.unwrap();
        assert_eq!(again.sessions_created, 0);
    }

    fn outbox_failing_once() -> Arc<dyn OutboxStore> {
        Arc::new(FlakyOutbox {
            inner: InMemoryOutbox::new(),
            failures: AtomicUsize::new(1),
        })
    }

    async fn announced_sessions(log: &InMemoryEventLog) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = log
            .records_of_type("SessionsGenerated")
            .await
            .iter()
            .flat_map(|e| SessionsGenerated::from_envelope(e).unwrap().session_ids)
            .collect();
        ids.sort_by_key(ToString::to_string);
        ids
    }

    async fn stored_sessions(store: &InMemoryFulfillmentStore, id: AllocationId) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = store
            .sessions_for_allocation(id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        ids.sort_by_key(ToString::to_string);
        ids
    }

    #[tokio::test]
    async fn redelivery_announces_sessions_lost_between_commit_and_emit() {
        let f = fixture_with_outbox(outbox_failing_once());
        let allocation = allocate(&f.store, 10).await;
        let envelope = allocation
            .allocated_event()
            .to_envelope(EventId::new(), allocation.correlation_id, "test")
            .unwrap();

        assert!(f.scheduler.handle(&envelope).await.is_err());
        assert!(f.log.records_of_type("SessionsGenerated").await.is_empty());

        assert_eq!(
            f.scheduler.handle(&envelope).await.unwrap(),
            HandleOutcome::Duplicate
        );
        let announced = announced_sessions(&f.log).await;
        assert_eq!(announced.len(), 7);
        assert_eq!(announced, stored_sessions(&f.store, allocation.id).await);

        // Later runs do not announce the batch again.
        f.scheduler.handle(&envelope).await.unwrap();
        assert_eq!(f.log.records_of_type("SessionsGenerated").await.len(), 1);
    }

    #[tokio::test]
    async fn timer_sweep_announces_sessions_lost_between_commit_and_emit() {
        let f = fixture_with_outbox(outbox_failing_once());
        let allocation = allocate(&f.store, 10).await;

        assert!(f.scheduler.ensure_window_at(allocation.id, today()).await.is_err());
        assert_eq!(f.store.sessions_for_allocation(allocation.id).await.unwrap().len(), 7);

        let report = f.scheduler.top_up_all().await.unwrap();
        assert_eq!(report.sessions_created, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(
            announced_sessions(&f.log).await,
            stored_sessions(&f.store, allocation.id).await
        );
        assert_eq!(f.log.records_of_type("SessionsGenerated").await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_allocation_is_permanent() {
        let f = fixture();
        let err = f
            .scheduler
            .ensure_window_at(AllocationId::new(), today())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
