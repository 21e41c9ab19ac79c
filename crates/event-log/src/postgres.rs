use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio::time::Instant;

use crate::{
    EventEnvelope, EventId, EventLog, EventLogError, LogConfig, LogPosition, LogRecord,
    OutboxEntry, OutboxStore, Result, partition_for,
};

/// PostgreSQL-backed partitioned event log.
///
/// Offsets are assigned per partition under a row lock on
/// `log_partitions`, so concurrent publishers to one partition serialize
/// while different partitions proceed independently.
#[derive(Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
    config: LogConfig,
}

impl PostgresEventLog {
    /// Creates a new PostgreSQL event log.
    pub fn new(pool: PgPool, config: LogConfig) -> Self {
        Self { pool, config }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn lease_secs(&self) -> f64 {
        self.config.lease_ttl.as_secs_f64()
    }

    fn row_to_record(row: PgRow) -> Result<LogRecord> {
        let partition: i32 = row.try_get("partition")?;
        let offset: i64 = row.try_get("log_offset")?;
        let envelope: serde_json::Value = row.try_get("envelope")?;

        Ok(LogRecord {
            position: LogPosition {
                partition: partition as u32,
                offset: offset as u64,
            },
            envelope: serde_json::from_value(envelope)?,
        })
    }

    /// Renews the member's leases and claims free ones up to the member cap.
    async fn claim(&self, group: &str, member: &str) -> Result<Vec<u32>> {
        let rows = sqlx::query(
            r#"
            SELECT partition, member, expires_at > now() AS live
            FROM partition_leases
            WHERE group_name = $1
            "#,
        )
        .bind(group)
        .fetch_all(&self.pool)
        .await?;

        let mut mine = Vec::new();
        let mut taken = HashSet::new();
        for row in rows {
            let partition: i32 = row.try_get("partition")?;
            let holder: String = row.try_get("member")?;
            let live: bool = row.try_get("live")?;
            if !live {
                continue;
            }
            if holder == member {
                mine.push(partition as u32);
            } else {
                taken.insert(partition as u32);
            }
        }

        let cap = self.config.member_cap() as usize;
        let mut candidates = mine.clone();
        for partition in 0..self.partitions() {
            if candidates.len() >= cap {
                break;
            }
            if !taken.contains(&partition) && !mine.contains(&partition) {
                candidates.push(partition);
            }
        }

        let mut owned = Vec::with_capacity(candidates.len());
        for partition in candidates {
            // Another member may have claimed it since the read above; the
            // WHERE clause only lets the update through for our own or an
            // expired lease.
            let claimed: Option<i32> = sqlx::query_scalar(
                r#"
                INSERT INTO partition_leases (group_name, partition, member, expires_at)
                VALUES ($1, $2, $3, now() + make_interval(secs => $4))
                ON CONFLICT (group_name, partition) DO UPDATE
                SET member = EXCLUDED.member, expires_at = EXCLUDED.expires_at
                WHERE partition_leases.member = EXCLUDED.member
                   OR partition_leases.expires_at <= now()
                RETURNING partition
                "#,
            )
            .bind(group)
            .bind(partition as i32)
            .bind(member)
            .bind(self.lease_secs())
            .fetch_optional(&self.pool)
            .await?;

            if let Some(p) = claimed {
                owned.push(p as u32);
            }
        }

        owned.sort_unstable();
        Ok(owned)
    }

    async fn fetch(&self, group: &str, owned: &[u32], max_records: usize) -> Result<Vec<LogRecord>> {
        let mut records = Vec::new();
        for &partition in owned {
            let remaining = max_records.saturating_sub(records.len());
            if remaining == 0 {
                break;
            }

            let rows = sqlx::query(
                r#"
                SELECT l.partition, l.log_offset, l.envelope
                FROM event_log l
                WHERE l.partition = $2
                  AND l.log_offset >= COALESCE(
                      (SELECT next_offset FROM consumer_offsets
                       WHERE group_name = $1 AND partition = $2),
                      0)
                ORDER BY l.log_offset ASC
                LIMIT $3
                "#,
            )
            .bind(group)
            .bind(partition as i32)
            .bind(remaining as i64)
            .fetch_all(&self.pool)
            .await?;

            for row in rows {
                records.push(Self::row_to_record(row)?);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl EventLog for PostgresEventLog {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<LogPosition> {
        let partition = partition_for(envelope.correlation_id, self.partitions());
        let json = serde_json::to_value(envelope)?;

        let mut tx = self.pool.begin().await?;

        let offset: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO log_partitions (partition, next_offset)
            VALUES ($1, 1)
            ON CONFLICT (partition) DO UPDATE
            SET next_offset = log_partitions.next_offset + 1
            RETURNING next_offset - 1
            "#,
        )
        .bind(partition as i32)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO event_log (partition, log_offset, event_id, correlation_id, event_type, envelope)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(partition as i32)
        .bind(offset)
        .bind(envelope.event_id.as_uuid())
        .bind(envelope.correlation_id.as_uuid())
        .bind(&envelope.event_type)
        .bind(json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(LogPosition {
            partition,
            offset: offset as u64,
        })
    }

    async fn poll(
        &self,
        group: &str,
        member: &str,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<LogRecord>> {
        let deadline = Instant::now() + timeout;

        loop {
            let owned = self.claim(group, member).await?;
            let records = self.fetch(group, &owned, max_records).await?;
            if !records.is_empty() {
                return Ok(records);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep((deadline - now).min(self.config.poll_interval)).await;
        }
    }

    async fn commit(&self, group: &str, member: &str, record: &LogRecord) -> Result<()> {
        let partition = record.position.partition;

        // Renewing the lease and advancing the offset is one statement, so a
        // commit can never land for a lease another member took over.
        let result = sqlx::query(
            r#"
            WITH renewed AS (
                UPDATE partition_leases
                SET expires_at = now() + make_interval(secs => $5)
                WHERE group_name = $1 AND partition = $2 AND member = $4 AND expires_at > now()
                RETURNING partition
            )
            INSERT INTO consumer_offsets (group_name, partition, next_offset)
            SELECT $1, $2, $3
            WHERE EXISTS (SELECT 1 FROM renewed)
            ON CONFLICT (group_name, partition) DO UPDATE
            SET next_offset = GREATEST(consumer_offsets.next_offset, EXCLUDED.next_offset)
            "#,
        )
        .bind(group)
        .bind(partition as i32)
        .bind(record.position.offset as i64 + 1)
        .bind(member)
        .bind(self.lease_secs())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EventLogError::LeaseLost {
                group: group.to_string(),
                partition,
            });
        }
        Ok(())
    }

    async fn release(&self, group: &str, member: &str) -> Result<()> {
        sqlx::query("DELETE FROM partition_leases WHERE group_name = $1 AND member = $2")
            .bind(group)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn partitions(&self) -> u32 {
        self.config.partitions.max(1)
    }
}

/// PostgreSQL-backed outbox.
#[derive(Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    /// Creates a new PostgreSQL outbox.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: PgRow) -> Result<OutboxEntry> {
        let envelope: serde_json::Value = row.try_get("envelope")?;
        let attempts: i32 = row.try_get("attempts")?;

        Ok(OutboxEntry {
            envelope: serde_json::from_value(envelope)?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
            attempts: attempts.max(0) as u32,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutbox {
    async fn insert(&self, envelope: &EventEnvelope) -> Result<bool> {
        let json = serde_json::to_value(envelope)?;

        let result = sqlx::query(
            r#"
            INSERT INTO outbox (event_id, correlation_id, event_type, envelope)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(envelope.event_id.as_uuid())
        .bind(envelope.correlation_id.as_uuid())
        .bind(&envelope.event_type)
        .bind(json)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_published(&self, event_id: EventId) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET published_at = now() WHERE event_id = $1 AND published_at IS NULL",
        )
        .bind(event_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(&self, event_id: EventId, error: &str) -> Result<()> {
        sqlx::query("UPDATE outbox SET attempts = attempts + 1, last_error = $2 WHERE event_id = $1")
            .bind(event_id.as_uuid())
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT envelope, created_at, published_at, attempts, last_error
            FROM outbox
            WHERE published_at IS NULL AND created_at <= $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn get(&self, event_id: EventId) -> Result<Option<OutboxEntry>> {
        let row = sqlx::query(
            r#"
            SELECT envelope, created_at, published_at, attempts, last_error
            FROM outbox
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_entry).transpose()
    }
}
