use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use common::{
    AllocationId, CorrelationId, CourseId, DeadLetterId, PurchaseId, SessionId, StudentId,
};
use domain::{
    Allocation, AllocationStatus, IdempotencyKey, NewAllocation, NewPurchase, ProcessedEvent,
    Purchase, Session, SessionCounts, SessionStatus, WindowPolicy, WriteOutcome,
};
use event_log::{EventEnvelope, EventId};
use serde::{Deserialize, Serialize};

use crate::Result;

/// An event that exhausted its retries in one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: DeadLetterId,
    pub event_id: EventId,
    pub correlation_id: CorrelationId,
    pub event_type: String,
    /// The consumer group that gave up on the event.
    pub stage: String,
    pub original_event: EventEnvelope,
    pub error: String,
    pub attempt_count: u32,
    pub failed_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetter {
    pub fn is_replayed(&self) -> bool {
        self.replayed_at.is_some()
    }
}

/// A dead letter about to be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeadLetter {
    pub stage: String,
    pub original_event: EventEnvelope,
    pub error: String,
    pub attempt_count: u32,
}

/// Result of one rolling-window top-up.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOutcome {
    /// The allocation after the top-up, including any status change.
    pub allocation: Allocation,

    /// Sessions this call inserted. Empty when the window was already full
    /// or another run created the same slots first.
    pub created: Vec<Session>,

    /// Session counts after the top-up.
    pub counts: SessionCounts,

    /// Status change applied by this call.
    pub transition: Option<AllocationStatus>,
}

/// Durable fulfillment state: purchases, allocations, sessions, the
/// processed-events ledger and dead letters.
///
/// Every write that carries a [`ProcessedEvent`] records it in the same
/// transaction as the business effect. Writes guarded by a uniqueness
/// constraint return [`WriteOutcome::AlreadyExists`] with the winning row
/// instead of failing.
#[async_trait]
pub trait FulfillmentStore: Send + Sync {
    /// Returns true if the ledger already holds the key.
    async fn has_processed(&self, key: IdempotencyKey) -> Result<bool>;

    /// Inserts a purchase unless an active one exists for the same
    /// (student, course), and records the receipt.
    async fn materialize_purchase(
        &self,
        receipt: ProcessedEvent,
        purchase: NewPurchase,
    ) -> Result<WriteOutcome<Purchase>>;

    async fn find_purchase_by_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<Purchase>>;

    async fn find_active_purchase(
        &self,
        student_id: StudentId,
        course_id: CourseId,
    ) -> Result<Option<Purchase>>;

    async fn get_purchase(&self, id: PurchaseId) -> Result<Option<Purchase>>;

    /// Inserts an `approved` allocation unless an open one exists for the
    /// same (student, course), and records the receipt.
    async fn approve_allocation(
        &self,
        receipt: ProcessedEvent,
        allocation: NewAllocation,
    ) -> Result<WriteOutcome<Allocation>>;

    async fn find_open_allocation(
        &self,
        student_id: StudentId,
        course_id: CourseId,
    ) -> Result<Option<Allocation>>;

    async fn find_allocation_by_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<Allocation>>;

    async fn get_allocation(&self, id: AllocationId) -> Result<Option<Allocation>>;

    /// All `approved` and `active` allocations.
    async fn open_allocations(&self) -> Result<Vec<Allocation>>;

    async fn sessions_for_allocation(&self, allocation_id: AllocationId) -> Result<Vec<Session>>;

    /// Refills the allocation's session window.
    ///
    /// Locks the allocation, plans with [`domain::plan_top_up`], inserts the
    /// planned sessions (skipping taken slots), applies the status change
    /// and records the receipt, all in one transaction.
    async fn top_up_sessions(
        &self,
        allocation_id: AllocationId,
        policy: &WindowPolicy,
        today: NaiveDate,
        receipt: Option<ProcessedEvent>,
    ) -> Result<WindowOutcome>;

    /// Moves an allocation along its state machine. The purchase stays
    /// active; only cancellation flows outside the pipeline deactivate it.
    async fn transition_allocation(
        &self,
        id: AllocationId,
        next: AllocationStatus,
    ) -> Result<Allocation>;

    /// Completes or cancels a session.
    async fn transition_session(&self, id: SessionId, next: SessionStatus) -> Result<Session>;

    /// Records a dead letter. A second failure of the same event in the
    /// same stage overwrites the first and clears `replayed_at`.
    async fn record_dead_letter(&self, dead_letter: NewDeadLetter) -> Result<DeadLetter>;

    /// Dead letters, oldest first.
    async fn list_dead_letters(&self, include_replayed: bool) -> Result<Vec<DeadLetter>>;

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetter>>;

    async fn mark_dead_letter_replayed(&self, id: DeadLetterId) -> Result<DeadLetter>;
}
