use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use common::{
    AllocationId, CorrelationId, CourseId, DeadLetterId, PurchaseId, SessionId, StudentId,
};
use domain::{
    Allocation, AllocationStatus, IdempotencyKey, NewAllocation, NewPurchase, ProcessedEvent,
    Purchase, Session, SessionCounts, SessionStatus, WindowPolicy, WriteOutcome, plan_top_up,
};
use tokio::sync::RwLock;

use crate::{
    DeadLetter, FulfillmentStore, NewDeadLetter, Result, StoreError, WindowOutcome,
};

#[derive(Default)]
struct State {
    purchases: HashMap<PurchaseId, Purchase>,
    allocations: HashMap<AllocationId, Allocation>,
    sessions: HashMap<SessionId, Session>,
    ledger: HashMap<IdempotencyKey, ProcessedEvent>,
    dead_letters: HashMap<DeadLetterId, DeadLetter>,
    failing_writes: usize,
}

impl State {
    /// Consumes one injected failure, if any are pending.
    fn take_failure(&mut self) -> Result<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn record(&mut self, receipt: ProcessedEvent) {
        let duplicate_id = self.ledger.values().any(|r| r.event_id == receipt.event_id);
        if !duplicate_id {
            self.ledger.entry(receipt.key()).or_insert(receipt);
        }
    }

    fn sessions_of(&self, allocation_id: AllocationId) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .values()
            .filter(|s| s.allocation_id == allocation_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| (s.slot(), s.id));
        sessions
    }

    fn transition_allocation(
        &mut self,
        id: AllocationId,
        next: AllocationStatus,
        now: DateTime<Utc>,
    ) -> Result<Allocation> {
        let allocation = self
            .allocations
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("allocation", id))?;
        allocation.status = allocation.status.transition_to(next)?;
        allocation.updated_at = now;
        Ok(allocation.clone())
    }
}

/// In-memory fulfillment store for testing.
///
/// One lock guards all state, so every operation is atomic in the same way a
/// PostgreSQL transaction is.
#[derive(Clone, Default)]
pub struct InMemoryFulfillmentStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryFulfillmentStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with a transient database error.
    pub async fn fail_writes(&self, count: usize) {
        self.state.write().await.failing_writes = count;
    }

    pub async fn purchase_count(&self) -> usize {
        self.state.read().await.purchases.len()
    }

    pub async fn allocation_count(&self) -> usize {
        self.state.read().await.allocations.len()
    }

    pub async fn ledger_count(&self) -> usize {
        self.state.read().await.ledger.len()
    }

    /// Inserts a session directly, bypassing the window planner.
    pub async fn insert_session(&self, session: Session) {
        self.state
            .write()
            .await
            .sessions
            .insert(session.id, session);
    }
}

#[async_trait]
impl FulfillmentStore for InMemoryFulfillmentStore {
    async fn has_processed(&self, key: IdempotencyKey) -> Result<bool> {
        Ok(self.state.read().await.ledger.contains_key(&key))
    }

    async fn materialize_purchase(
        &self,
        receipt: ProcessedEvent,
        purchase: NewPurchase,
    ) -> Result<WriteOutcome<Purchase>> {
        let mut state = self.state.write().await;
        state.take_failure()?;

        let existing = state
            .purchases
            .values()
            .find(|p| {
                p.active && p.student_id == purchase.student_id && p.course_id == purchase.course_id
            })
            .cloned();

        let outcome = match existing {
            Some(existing) => WriteOutcome::AlreadyExists(existing),
            None => {
                let row = purchase.into_purchase(Utc::now());
                state.purchases.insert(row.id, row.clone());
                WriteOutcome::Created(row)
            }
        };
        state.record(receipt);
        Ok(outcome)
    }

    async fn find_purchase_by_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<Purchase>> {
        let state = self.state.read().await;
        Ok(state
            .purchases
            .values()
            .filter(|p| p.correlation_id == correlation_id)
            .min_by_key(|p| p.created_at)
            .cloned())
    }

    async fn find_active_purchase(
        &self,
        student_id: StudentId,
        course_id: CourseId,
    ) -> Result<Option<Purchase>> {
        let state = self.state.read().await;
        Ok(state
            .purchases
            .values()
            .find(|p| p.active && p.student_id == student_id && p.course_id == course_id)
            .cloned())
    }

    async fn get_purchase(&self, id: PurchaseId) -> Result<Option<Purchase>> {
        Ok(self.state.read().await.purchases.get(&id).cloned())
    }

    async fn approve_allocation(
        &self,
        receipt: ProcessedEvent,
        allocation: NewAllocation,
    ) -> Result<WriteOutcome<Allocation>> {
        let mut state = self.state.write().await;
        state.take_failure()?;

        let existing = state
            .allocations
            .values()
            .find(|a| {
                a.is_open()
                    && a.student_id == allocation.student_id
                    && a.course_id == allocation.course_id
            })
            .cloned();

        let outcome = match existing {
            Some(existing) => WriteOutcome::AlreadyExists(existing),
            None => {
                let row = allocation.into_allocation(Utc::now());
                state.allocations.insert(row.id, row.clone());
                WriteOutcome::Created(row)
            }
        };
        state.record(receipt);
        Ok(outcome)
    }

    async fn find_open_allocation(
        &self,
        student_id: StudentId,
        course_id: CourseId,
    ) -> Result<Option<Allocation>> {
        let state = self.state.read().await;
        Ok(state
            .allocations
            .values()
            .find(|a| a.is_open() && a.student_id == student_id && a.course_id == course_id)
            .cloned())
    }

    async fn find_allocation_by_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<Allocation>> {
        let state = self.state.read().await;
        Ok(state
            .allocations
            .values()
            .filter(|a| a.correlation_id == correlation_id)
            .min_by_key(|a| a.created_at)
            .cloned())
    }

    async fn get_allocation(&self, id: AllocationId) -> Result<Option<Allocation>> {
        Ok(self.state.read().await.allocations.get(&id).cloned())
    }

    async fn open_allocations(&self) -> Result<Vec<Allocation>> {
        let state = self.state.read().await;
        let mut open: Vec<Allocation> = state
            .allocations
            .values()
            .filter(|a| a.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|a| (a.created_at, a.id));
        Ok(open)
    }

    async fn sessions_for_allocation(&self, allocation_id: AllocationId) -> Result<Vec<Session>> {
        Ok(self.state.read().await.sessions_of(allocation_id))
    }

    async fn top_up_sessions(
        &self,
        allocation_id: AllocationId,
        policy: &WindowPolicy,
        today: NaiveDate,
        receipt: Option<ProcessedEvent>,
    ) -> Result<WindowOutcome> {
        let mut state = self.state.write().await;
        state.take_failure()?;

        let allocation = state
            .allocations
            .get(&allocation_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("allocation", allocation_id))?;
        let existing = state.sessions_of(allocation_id);
        let plan = plan_top_up(&allocation, &existing, policy, today);
        let now = Utc::now();

        let mut created = Vec::with_capacity(plan.slots.len());
        for slot in plan.slots {
            if existing.iter().any(|s| s.slot() == slot) {
                continue;
            }
            let session = Session::scheduled(allocation_id, slot, now);
            state.sessions.insert(session.id, session.clone());
            created.push(session);
        }

        let allocation = match plan.transition {
            Some(next) => state.transition_allocation(allocation_id, next, now)?,
            None => allocation,
        };
        if let Some(receipt) = receipt {
            state.record(receipt);
        }

        let counts = SessionCounts::from_sessions(&state.sessions_of(allocation_id));
        Ok(WindowOutcome {
            allocation,
            created,
            counts,
            transition: plan.transition,
        })
    }

    async fn transition_allocation(
        &self,
        id: AllocationId,
        next: AllocationStatus,
    ) -> Result<Allocation> {
        let mut state = self.state.write().await;
        state.take_failure()?;
        state.transition_allocation(id, next, Utc::now())
    }

    async fn transition_session(&self, id: SessionId, next: SessionStatus) -> Result<Session> {
        let mut state = self.state.write().await;
        state.take_failure()?;

        let session = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("session", id))?;
        session.status = session.status.transition_to(next)?;
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn record_dead_letter(&self, dead_letter: NewDeadLetter) -> Result<DeadLetter> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let event_id = dead_letter.original_event.event_id;

        if let Some(existing) = state
            .dead_letters
            .values_mut()
            .find(|d| d.event_id == event_id && d.stage == dead_letter.stage)
        {
            existing.original_event = dead_letter.original_event;
            existing.error = dead_letter.error;
            existing.attempt_count = dead_letter.attempt_count;
            existing.failed_at = now;
            existing.replayed_at = None;
            return Ok(existing.clone());
        }

        let row = DeadLetter {
            id: DeadLetterId::new(),
            event_id,
            correlation_id: dead_letter.original_event.correlation_id,
            event_type: dead_letter.original_event.event_type.clone(),
            stage: dead_letter.stage,
            original_event: dead_letter.original_event,
            error: dead_letter.error,
            attempt_count: dead_letter.attempt_count,
            failed_at: now,
            replayed_at: None,
        };
        state.dead_letters.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_dead_letters(&self, include_replayed: bool) -> Result<Vec<DeadLetter>> {
        let state = self.state.read().await;
        let mut letters: Vec<DeadLetter> = state
            .dead_letters
            .values()
            .filter(|d| include_replayed || !d.is_replayed())
            .cloned()
            .collect();
        letters.sort_by_key(|d| (d.failed_at, d.id));
        Ok(letters)
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetter>> {
        Ok(self.state.read().await.dead_letters.get(&id).cloned())
    }

    async fn mark_dead_letter_replayed(&self, id: DeadLetterId) -> Result<DeadLetter> {
        let mut state = self.state.write().await;
        let letter = state
            .dead_letters
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("dead letter", id))?;
        letter.replayed_at = Some(Utc::now());
        Ok(letter.clone())
    }
}
