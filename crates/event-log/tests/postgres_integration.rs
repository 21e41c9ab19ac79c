//! PostgreSQL integration tests for the event log and outbox.
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p event-log --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use common::CorrelationId;
use event_log::{
    EmitOutcome, EventEnvelope, EventLog, EventLogError, EventType, IdempotentEmitter, LogConfig,
    OutboxStore, PostgresEventLog, PostgresOutbox,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/001_create_event_log.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh pool with cleared tables
async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE event_log, log_partitions, consumer_offsets, partition_leases, outbox",
    )
    .execute(&pool)
    .await
    .unwrap();

    pool
}

fn config(partitions: u32) -> LogConfig {
    LogConfig {
        partitions,
        lease_ttl: Duration::from_secs(30),
        max_partitions_per_member: None,
        poll_interval: Duration::from_millis(20),
    }
}

fn envelope(correlation_id: CorrelationId, event_type: EventType) -> EventEnvelope {
    EventEnvelope::builder()
        .correlation_id(correlation_id)
        .event_type(event_type.as_str())
        .source("postgres-test")
        .payload_raw(serde_json::json!({"n": 1}))
        .build()
        .unwrap()
}

const TIMEOUT: Duration = Duration::from_millis(100);

#[tokio::test]
#[serial]
async fn publish_assigns_sequential_offsets_per_partition() {
    let log = PostgresEventLog::new(get_test_pool().await, config(4));
    let correlation_id = CorrelationId::new();

    let a = log
        .publish(&envelope(correlation_id, EventType::PurchaseConfirmed))
        .await
        .unwrap();
    let b = log
        .publish(&envelope(correlation_id, EventType::PurchaseCreated))
        .await
        .unwrap();

    assert_eq!(a.partition, b.partition);
    assert_eq!(a.offset, 0);
    assert_eq!(b.offset, 1);
}

#[tokio::test]
#[serial]
async fn poll_commit_and_redelivery() {
    let log = PostgresEventLog::new(get_test_pool().await, config(1));
    log.publish(&envelope(CorrelationId::new(), EventType::PurchaseConfirmed))
        .await
        .unwrap();
    log.publish(&envelope(CorrelationId::new(), EventType::PurchaseConfirmed))
        .await
        .unwrap();

    let records = log.poll("materializer", "m1", 10, TIMEOUT).await.unwrap();
    assert_eq!(records.len(), 2);

    // Only the first is committed; the second must come back.
    log.commit("materializer", "m1", &records[0]).await.unwrap();
    let again = log.poll("materializer", "m1", 10, TIMEOUT).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].envelope.event_id, records[1].envelope.event_id);
}

#[tokio::test]
#[serial]
async fn lease_excludes_other_members() {
    let log = PostgresEventLog::new(get_test_pool().await, config(1));
    log.publish(&envelope(CorrelationId::new(), EventType::PurchaseCreated))
        .await
        .unwrap();

    let m1 = log.poll("allocator", "m1", 10, TIMEOUT).await.unwrap();
    let m2 = log.poll("allocator", "m2", 10, TIMEOUT).await.unwrap();
    assert_eq!(m1.len(), 1);
    assert!(m2.is_empty());

    let result = log.commit("allocator", "m2", &m1[0]).await;
    assert!(matches!(result, Err(EventLogError::LeaseLost { .. })));

    log.release("allocator", "m1").await.unwrap();
    let m2 = log.poll("allocator", "m2", 10, TIMEOUT).await.unwrap();
    assert_eq!(m2.len(), 1);
}

#[tokio::test]
#[serial]
async fn expired_lease_is_taken_over() {
    let log = PostgresEventLog::new(
        get_test_pool().await,
        LogConfig {
            lease_ttl: Duration::from_millis(200),
            ..config(1)
        },
    );
    log.publish(&envelope(CorrelationId::new(), EventType::PurchaseCreated))
        .await
        .unwrap();

    let m1 = log.poll("allocator", "m1", 10, TIMEOUT).await.unwrap();
    assert_eq!(m1.len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let m2 = log.poll("allocator", "m2", 10, TIMEOUT).await.unwrap();
    assert_eq!(m2.len(), 1);
    assert!(log.commit("allocator", "m1", &m1[0]).await.is_err());
    log.commit("allocator", "m2", &m2[0]).await.unwrap();
}

#[tokio::test]
#[serial]
async fn commit_renews_the_lease() {
    let log = PostgresEventLog::new(
        get_test_pool().await,
        LogConfig {
            lease_ttl: Duration::from_millis(300),
            ..config(1)
        },
    );
    for _ in 0..3 {
        log.publish(&envelope(CorrelationId::new(), EventType::PurchaseCreated))
            .await
            .unwrap();
    }

    let records = log.poll("allocator", "m1", 10, TIMEOUT).await.unwrap();
    assert_eq!(records.len(), 3);
    for record in &records {
        tokio::time::sleep(Duration::from_millis(200)).await;
        log.commit("allocator", "m1", record).await.unwrap();
    }

    let m2 = log.poll("allocator", "m2", 10, TIMEOUT).await.unwrap();
    assert!(m2.is_empty());
}

#[tokio::test]
#[serial]
async fn outbox_and_emitter_round_trip() {
    let pool = get_test_pool().await;
    let log = PostgresEventLog::new(pool.clone(), config(2));
    let outbox = PostgresOutbox::new(pool.clone());
    let emitter = IdempotentEmitter::new(Arc::new(log.clone()), Arc::new(outbox.clone()));

    let event = envelope(CorrelationId::new(), EventType::TrainerAllocated);
    assert_eq!(emitter.emit(event.clone()).await.unwrap(), EmitOutcome::Published);
    assert_eq!(emitter.emit(event.clone()).await.unwrap(), EmitOutcome::Duplicate);

    let entry = outbox.get(event.event_id).await.unwrap().unwrap();
    assert!(entry.is_published());
    assert_eq!(entry.envelope, event);

    let logged: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_log WHERE event_id = $1")
        .bind(event.event_id.as_uuid())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(logged, 1);
}

#[tokio::test]
#[serial]
async fn sweep_publishes_orphaned_outbox_entries() {
    let pool = get_test_pool().await;
    let log = PostgresEventLog::new(pool.clone(), config(2));
    let outbox = PostgresOutbox::new(pool.clone());
    let emitter = IdempotentEmitter::new(Arc::new(log.clone()), Arc::new(outbox.clone()));

    let event = envelope(CorrelationId::new(), EventType::SessionsGenerated);
    assert!(outbox.insert(&event).await.unwrap());

    let report = emitter.republish_pending(Duration::ZERO, 10).await.unwrap();
    assert_eq!(report.republished, 1);

    let records = log.poll("cache", "m1", 10, TIMEOUT).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].envelope.event_id, event.event_id);
}
