use async_trait::async_trait;
use chrono::NaiveDate;
use common::{
    AllocationId, CorrelationId, CourseId, DeadLetterId, PaymentId, PurchaseId, SessionId,
    StudentId, TutorId,
};
use domain::{
    Allocation, AllocationStatus, IdempotencyKey, NewAllocation, NewPurchase, ProcessedEvent,
    Purchase, Session, SessionCounts, SessionStatus, WindowPolicy, WriteOutcome, plan_top_up,
};
use event_log::EventId;
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{DeadLetter, FulfillmentStore, NewDeadLetter, Result, StoreError, WindowOutcome};

/// PostgreSQL-backed fulfillment store.
///
/// The partial unique indexes of the schema are the only mutual exclusion
/// between workers; every guarded insert uses `ON CONFLICT DO NOTHING` and
/// falls back to reading the row that won.
#[derive(Clone)]
pub struct PostgresFulfillmentStore {
    pool: PgPool,
}

impl PostgresFulfillmentStore {
    /// Creates a new PostgreSQL fulfillment store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_purchase(row: PgRow) -> Result<Purchase> {
        let tier: i32 = row.try_get("tier")?;
        Ok(Purchase {
            id: PurchaseId::from_uuid(row.try_get::<Uuid, _>("id")?),
            payment_id: PaymentId::from_uuid(row.try_get::<Uuid, _>("payment_id")?),
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            student_id: StudentId::from_uuid(row.try_get::<Uuid, _>("student_id")?),
            course_id: CourseId::from_uuid(row.try_get::<Uuid, _>("course_id")?),
            tier: tier.max(0) as u32,
            metadata: row.try_get("metadata")?,
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_allocation(row: PgRow) -> Result<Allocation> {
        let status: String = row.try_get("status")?;
        let session_count: i32 = row.try_get("session_count")?;
        Ok(Allocation {
            id: AllocationId::from_uuid(row.try_get::<Uuid, _>("id")?),
            purchase_id: PurchaseId::from_uuid(row.try_get::<Uuid, _>("purchase_id")?),
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            student_id: StudentId::from_uuid(row.try_get::<Uuid, _>("student_id")?),
            course_id: CourseId::from_uuid(row.try_get::<Uuid, _>("course_id")?),
            tutor_id: TutorId::from_uuid(row.try_get::<Uuid, _>("tutor_id")?),
            status: status.parse()?,
            session_count: session_count.max(0) as u32,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_session(row: PgRow) -> Result<Session> {
        let status: String = row.try_get("status")?;
        Ok(Session {
            id: SessionId::from_uuid(row.try_get::<Uuid, _>("id")?),
            allocation_id: AllocationId::from_uuid(row.try_get::<Uuid, _>("allocation_id")?),
            scheduled_date: row.try_get("scheduled_date")?,
            scheduled_time: row.try_get("scheduled_time")?,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_dead_letter(row: PgRow) -> Result<DeadLetter> {
        let original: serde_json::Value = row.try_get("original_event")?;
        let attempt_count: i32 = row.try_get("attempt_count")?;
        Ok(DeadLetter {
            id: DeadLetterId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            event_type: row.try_get("event_type")?,
            stage: row.try_get("stage")?,
            original_event: serde_json::from_value(original)?,
            error: row.try_get("error")?,
            attempt_count: attempt_count.max(0) as u32,
            failed_at: row.try_get("failed_at")?,
            replayed_at: row.try_get("replayed_at")?,
        })
    }

    async fn insert_receipt(conn: &mut PgConnection, receipt: &ProcessedEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, event_type, correlation_id, payload, processed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(receipt.event_id.as_uuid())
        .bind(receipt.event_type.as_str())
        .bind(receipt.correlation_id.as_uuid())
        .bind(&receipt.payload)
        .bind(receipt.processed_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn sessions_on(conn: &mut PgConnection, allocation_id: AllocationId) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            r#"
            SELECT id, allocation_id, scheduled_date, scheduled_time, status, created_at, updated_at
            FROM sessions
            WHERE allocation_id = $1
            ORDER BY scheduled_date ASC, scheduled_time ASC
            "#,
        )
        .bind(allocation_id.as_uuid())
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter().map(Self::row_to_session).collect()
    }

    async fn lock_allocation(conn: &mut PgConnection, id: AllocationId) -> Result<Allocation> {
        let row = sqlx::query(
            r#"
            SELECT id, purchase_id, correlation_id, student_id, course_id, tutor_id, status,
                   session_count, metadata, created_at, updated_at
            FROM allocations
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found("allocation", id))?;

        Self::row_to_allocation(row)
    }

    /// Applies a validated status change to a locked allocation.
    async fn set_allocation_status(
        conn: &mut PgConnection,
        current: &Allocation,
        next: AllocationStatus,
    ) -> Result<Allocation> {
        current.status.transition_to(next)?;

        let row = sqlx::query(
            r#"
            UPDATE allocations
            SET status = $2, updated_at = now()
            WHERE id = $1
            RETURNING id, purchase_id, correlation_id, student_id, course_id, tutor_id, status,
                      session_count, metadata, created_at, updated_at
            "#,
        )
        .bind(current.id.as_uuid())
        .bind(next.as_str())
        .fetch_one(&mut *conn)
        .await?;

        Self::row_to_allocation(row)
    }

    async fn active_purchase_on(
        conn: &mut PgConnection,
        student_id: StudentId,
        course_id: CourseId,
    ) -> Result<Option<Purchase>> {
        let row = sqlx::query(
            r#"
            SELECT id, payment_id, correlation_id, student_id, course_id, tier, metadata, active,
                   created_at, updated_at
            FROM purchases
            WHERE student_id = $1 AND course_id = $2 AND active
            "#,
        )
        .bind(student_id.as_uuid())
        .bind(course_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(Self::row_to_purchase).transpose()
    }

    async fn open_allocation_on(
        conn: &mut PgConnection,
        student_id: StudentId,
        course_id: CourseId,
    ) -> Result<Option<Allocation>> {
        let row = sqlx::query(
            r#"
            SELECT id, purchase_id, correlation_id, student_id, course_id, tutor_id, status,
                   session_count, metadata, created_at, updated_at
            FROM allocations
            WHERE student_id = $1 AND course_id = $2 AND status IN ('approved', 'active')
            "#,
        )
        .bind(student_id.as_uuid())
        .bind(course_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(Self::row_to_allocation).transpose()
    }
}

#[async_trait]
impl FulfillmentStore for PostgresFulfillmentStore {
    async fn has_processed(&self, key: IdempotencyKey) -> Result<bool> {
        let seen: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM processed_events
                WHERE correlation_id = $1 AND event_type = $2
            )
            "#,
        )
        .bind(key.correlation_id.as_uuid())
        .bind(key.event_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(seen)
    }

    async fn materialize_purchase(
        &self,
        receipt: ProcessedEvent,
        purchase: NewPurchase,
    ) -> Result<WriteOutcome<Purchase>> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO purchases (id, payment_id, correlation_id, student_id, course_id, tier, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            RETURNING id, payment_id, correlation_id, student_id, course_id, tier, metadata, active,
                      created_at, updated_at
            "#,
        )
        .bind(purchase.id.as_uuid())
        .bind(purchase.payment_id.as_uuid())
        .bind(purchase.correlation_id.as_uuid())
        .bind(purchase.student_id.as_uuid())
        .bind(purchase.course_id.as_uuid())
        .bind(purchase.tier as i32)
        .bind(&purchase.metadata)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match inserted {
            Some(row) => WriteOutcome::Created(Self::row_to_purchase(row)?),
            None => {
                let existing =
                    Self::active_purchase_on(&mut tx, purchase.student_id, purchase.course_id)
                        .await?
                        .ok_or_else(|| StoreError::not_found("purchase", purchase.id))?;
                tracing::debug!(
                    purchase_id = %existing.id,
                    student_id = %existing.student_id,
                    course_id = %existing.course_id,
                    "Active purchase already exists"
                );
                WriteOutcome::AlreadyExists(existing)
            }
        };

        Self::insert_receipt(&mut tx, &receipt).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn find_purchase_by_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<Purchase>> {
        let row = sqlx::query(
            r#"
            SELECT id, payment_id, correlation_id, student_id, course_id, tier, metadata, active,
                   created_at, updated_at
            FROM purchases
            WHERE correlation_id = $1
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(correlation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_purchase).transpose()
    }

    async fn find_active_purchase(
        &self,
        student_id: StudentId,
        course_id: CourseId,
    ) -> Result<Option<Purchase>> {
        let mut conn = self.pool.acquire().await?;
        Self::active_purchase_on(&mut conn, student_id, course_id).await
    }

    async fn get_purchase(&self, id: PurchaseId) -> Result<Option<Purchase>> {
        let row = sqlx::query(
            r#"
            SELECT id, payment_id, correlation_id, student_id, course_id, tier, metadata, active,
                   created_at, updated_at
            FROM purchases
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_purchase).transpose()
    }

    async fn approve_allocation(
        &self,
        receipt: ProcessedEvent,
        allocation: NewAllocation,
    ) -> Result<WriteOutcome<Allocation>> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO allocations (id, purchase_id, correlation_id, student_id, course_id,
                                     tutor_id, status, session_count, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, 'approved', $7, $8)
            ON CONFLICT DO NOTHING
            RETURNING id, purchase_id, correlation_id, student_id, course_id, tutor_id, status,
                      session_count, metadata, created_at, updated_at
            "#,
        )
        .bind(allocation.id.as_uuid())
        .bind(allocation.purchase_id.as_uuid())
        .bind(allocation.correlation_id.as_uuid())
        .bind(allocation.student_id.as_uuid())
        .bind(allocation.course_id.as_uuid())
        .bind(allocation.tutor_id.as_uuid())
        .bind(allocation.session_count as i32)
        .bind(&allocation.metadata)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match inserted {
            Some(row) => WriteOutcome::Created(Self::row_to_allocation(row)?),
            None => {
                let existing =
                    Self::open_allocation_on(&mut tx, allocation.student_id, allocation.course_id)
                        .await?
                        .ok_or_else(|| StoreError::not_found("allocation", allocation.id))?;
                tracing::debug!(
                    allocation_id = %existing.id,
                    student_id = %existing.student_id,
                    course_id = %existing.course_id,
                    "Open allocation already exists"
                );
                WriteOutcome::AlreadyExists(existing)
            }
        };

        Self::insert_receipt(&mut tx, &receipt).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn find_open_allocation(
        &self,
        student_id: StudentId,
        course_id: CourseId,
    ) -> Result<Option<Allocation>> {
        let mut conn = self.pool.acquire().await?;
        Self::open_allocation_on(&mut conn, student_id, course_id).await
    }

    async fn find_allocation_by_correlation(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<Allocation>> {
        let row = sqlx::query(
            r#"
            SELECT id, purchase_id, correlation_id, student_id, course_id, tutor_id, status,
                   session_count, metadata, created_at, updated_at
            FROM allocations
            WHERE correlation_id = $1
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(correlation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_allocation).transpose()
    }

    async fn get_allocation(&self, id: AllocationId) -> Result<Option<Allocation>> {
        let row = sqlx::query(
            r#"
            SELECT id, purchase_id, correlation_id, student_id, course_id, tutor_id, status,
                   session_count, metadata, created_at, updated_at
            FROM allocations
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_allocation).transpose()
    }

    async fn open_allocations(&self) -> Result<Vec<Allocation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, purchase_id, correlation_id, student_id, course_id, tutor_id, status,
                   session_count, metadata, created_at, updated_at
            FROM allocations
            WHERE status IN ('approved', 'active')
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_allocation).collect()
    }

    async fn sessions_for_allocation(&self, allocation_id: AllocationId) -> Result<Vec<Session>> {
        let mut conn = self.pool.acquire().await?;
        Self::sessions_on(&mut conn, allocation_id).await
    }

    async fn top_up_sessions(
        &self,
        allocation_id: AllocationId,
        policy: &WindowPolicy,
        today: NaiveDate,
        receipt: Option<ProcessedEvent>,
    ) -> Result<WindowOutcome> {
        let mut tx = self.pool.begin().await?;

        // The row lock serializes concurrent top-ups of one allocation, so
        // the second run plans against the first run's sessions.
        let allocation = Self::lock_allocation(&mut tx, allocation_id).await?;
        let existing = Self::sessions_on(&mut tx, allocation_id).await?;
        let plan = plan_top_up(&allocation, &existing, policy, today);

        let mut created = Vec::with_capacity(plan.slots.len());
        for slot in &plan.slots {
            let row = sqlx::query(
                r#"
                INSERT INTO sessions (id, allocation_id, scheduled_date, scheduled_time, status)
                VALUES ($1, $2, $3, $4, 'scheduled')
                ON CONFLICT (allocation_id, scheduled_date, scheduled_time) DO NOTHING
                RETURNING id, allocation_id, scheduled_date, scheduled_time, status, created_at,
                          updated_at
                "#,
            )
            .bind(SessionId::new().as_uuid())
            .bind(allocation_id.as_uuid())
            .bind(slot.date)
            .bind(slot.time)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = row {
                created.push(Self::row_to_session(row)?);
            }
        }

        let allocation = match plan.transition {
            Some(next) => Self::set_allocation_status(&mut tx, &allocation, next).await?,
            None => allocation,
        };
        if let Some(receipt) = &receipt {
            Self::insert_receipt(&mut tx, receipt).await?;
        }
        let counts = SessionCounts::from_sessions(&Self::sessions_on(&mut tx, allocation_id).await?);

        tx.commit().await?;

        if created.len() < plan.slots.len() {
            tracing::debug!(
                allocation_id = %allocation_id,
                planned = plan.slots.len(),
                created = created.len(),
                "Some planned slots were already taken"
            );
        }
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
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_allocation(&mut tx, id).await?;
        let updated = Self::set_allocation_status(&mut tx, &current, next).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn transition_session(&self, id: SessionId, next: SessionStatus) -> Result<Session> {
        let mut tx = self.pool.begin().await?;

        let status: String =
            sqlx::query_scalar("SELECT status FROM sessions WHERE id = $1 FOR UPDATE")
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::not_found("session", id))?;
        status.parse::<SessionStatus>()?.transition_to(next)?;

        let row = sqlx::query(
            r#"
            UPDATE sessions
            SET status = $2, updated_at = now()
            WHERE id = $1
            RETURNING id, allocation_id, scheduled_date, scheduled_time, status, created_at,
                      updated_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(next.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Self::row_to_session(row)
    }

    async fn record_dead_letter(&self, dead_letter: NewDeadLetter) -> Result<DeadLetter> {
        let envelope = &dead_letter.original_event;
        let json = serde_json::to_value(envelope)?;

        let row = sqlx::query(
            r#"
            INSERT INTO dead_letters (id, event_id, correlation_id, event_type, stage,
                                      original_event, error, attempt_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (event_id, stage) DO UPDATE
            SET original_event = EXCLUDED.original_event,
                error = EXCLUDED.error,
                attempt_count = EXCLUDED.attempt_count,
                failed_at = now(),
                replayed_at = NULL
            RETURNING id, event_id, correlation_id, event_type, stage, original_event, error,
                      attempt_count, failed_at, replayed_at
            "#,
        )
        .bind(DeadLetterId::new().as_uuid())
        .bind(envelope.event_id.as_uuid())
        .bind(envelope.correlation_id.as_uuid())
        .bind(&envelope.event_type)
        .bind(&dead_letter.stage)
        .bind(json)
        .bind(&dead_letter.error)
        .bind(dead_letter.attempt_count as i32)
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_dead_letter(row)
    }

    async fn list_dead_letters(&self, include_replayed: bool) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, correlation_id, event_type, stage, original_event, error,
                   attempt_count, failed_at, replayed_at
            FROM dead_letters
            WHERE $1 OR replayed_at IS NULL
            ORDER BY failed_at ASC, id ASC
            "#,
        )
        .bind(include_replayed)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_dead_letter).collect()
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetter>> {
        let row = sqlx::query(
            r#"
            SELECT id, event_id, correlation_id, event_type, stage, original_event, error,
                   attempt_count, failed_at, replayed_at
            FROM dead_letters
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_dead_letter).transpose()
    }

    async fn mark_dead_letter_replayed(&self, id: DeadLetterId) -> Result<DeadLetter> {
        let row = sqlx::query(
            r#"
            UPDATE dead_letters
            SET replayed_at = now()
            WHERE id = $1
            RETURNING id, event_id, correlation_id, event_type, stage, original_event, error,
                      attempt_count, failed_at, replayed_at
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("dead letter", id))?;

        Self::row_to_dead_letter(row)
    }
}
