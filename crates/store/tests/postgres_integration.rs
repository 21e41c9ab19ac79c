//! PostgreSQL integration tests for the fulfillment store.
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use common::{CorrelationId, CourseId, PaymentId, StudentId, TutorId};
use domain::{
    Allocation, AllocationStatus, IdempotencyKey, NewAllocation, NewPurchase, ProcessedEvent,
    Purchase, PurchaseConfirmed, SessionStatus, WindowPolicy,
};
use event_log::{EventEnvelope, EventType};
use serial_test::serial;
use sqlx::PgPool;
use store::{FulfillmentStore, NewDeadLetter, PostgresFulfillmentStore, StoreError};
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
            for migration in [
                include_str!("../../../migrations/001_create_event_log.sql"),
                include_str!("../../../migrations/002_create_fulfillment_tables.sql"),
            ] {
                sqlx::raw_sql(migration).execute(&temp_pool).await.unwrap();
            }
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with cleared tables
async fn get_test_store() -> PostgresFulfillmentStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE sessions, allocations, purchases, processed_events, dead_letters")
        .execute(&pool)
        .await
        .unwrap();

    PostgresFulfillmentStore::new(pool)
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

fn envelope(correlation_id: CorrelationId, event_type: EventType) -> EventEnvelope {
    EventEnvelope::builder()
        .correlation_id(correlation_id)
        .event_type(event_type.as_str())
        .source("postgres-test")
        .payload_raw(serde_json::json!({}))
        .build()
        .unwrap()
}

fn receipt(correlation_id: CorrelationId, event_type: EventType) -> ProcessedEvent {
    ProcessedEvent::from_envelope(&envelope(correlation_id, event_type)).unwrap()
}

async fn materialize(
    store: &PostgresFulfillmentStore,
    student_id: StudentId,
    course_id: CourseId,
    tier: u32,
) -> (CorrelationId, Purchase) {
    let correlation_id = CorrelationId::new();
    let event = PurchaseConfirmed {
        payment_id: PaymentId::new(),
        student_id,
        course_id,
        tier,
        metadata: serde_json::json!({}),
    };
    let purchase = store
        .materialize_purchase(
            receipt(correlation_id, EventType::PurchaseConfirmed),
            NewPurchase::from_confirmed(correlation_id, &event),
        )
        .await
        .unwrap()
        .into_inner();
    (correlation_id, purchase)
}

async fn allocate(store: &PostgresFulfillmentStore, tier: u32) -> Allocation {
    let (correlation_id, purchase) =
        materialize(store, StudentId::new(), CourseId::new(), tier).await;
    store
        .approve_allocation(
            receipt(correlation_id, EventType::PurchaseCreated),
            NewAllocation::for_purchase(correlation_id, &purchase.created_event(), TutorId::new()),
        )
        .await
        .unwrap()
        .into_inner()
}

#[tokio::test]
#[serial]
async fn materialize_is_idempotent_per_student_course() {
    let store = get_test_store().await;
    let student_id = StudentId::new();
    let course_id = CourseId::new();

    let (correlation_id, first) = materialize(&store, student_id, course_id, 10).await;
    let (_, second) = materialize(&store, student_id, course_id, 10).await;

    assert_eq!(first.id, second.id);
    assert!(
        store
            .has_processed(IdempotencyKey::new(correlation_id, EventType::PurchaseConfirmed))
            .await
            .unwrap()
    );

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM purchases")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
#[serial]
async fn concurrent_allocations_yield_one_open_row() {
    let store = get_test_store().await;
    let (correlation_id, purchase) =
        materialize(&store, StudentId::new(), CourseId::new(), 10).await;
    let created = purchase.created_event();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let created = created.clone();
        handles.push(tokio::spawn(async move {
            store
                .approve_allocation(
                    receipt(correlation_id, EventType::PurchaseCreated),
                    NewAllocation::for_purchase(correlation_id, &created, TutorId::new()),
                )
                .await
                .unwrap()
        }));
    }

    let mut ids = Vec::new();
    let mut created_count = 0;
    for handle in handles {
        let outcome = handle.await.unwrap();
        if outcome.is_created() {
            created_count += 1;
        }
        ids.push(outcome.into_inner().id);
    }

    assert_eq!(created_count, 1);
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
#[serial]
async fn top_up_is_idempotent_and_activates() {
    let store = get_test_store().await;
    let allocation = allocate(&store, 10).await;
    let policy = WindowPolicy::default();

    let first = store
        .top_up_sessions(allocation.id, &policy, today(), None)
        .await
        .unwrap();
    assert_eq!(first.created.len(), 7);
    assert_eq!(first.allocation.status, AllocationStatus::Active);

    let second = store
        .top_up_sessions(allocation.id, &policy, today(), None)
        .await
        .unwrap();
    assert!(second.created.is_empty());
    assert_eq!(second.counts.scheduled, 7);
}

#[tokio::test]
#[serial]
async fn concurrent_top_ups_never_duplicate_slots() {
    let store = get_test_store().await;
    let allocation = allocate(&store, 10).await;

    let mut handles = Vec::new();
    for _ in 0..3 {
        let store = store.clone();
        let id = allocation.id;
        handles.push(tokio::spawn(async move {
            store
                .top_up_sessions(id, &WindowPolicy::default(), today(), None)
                .await
                .unwrap()
        }));
    }
    let mut total_created = 0;
    for handle in handles {
        total_created += handle.await.unwrap().created.len();
    }

    assert_eq!(total_created, 7);
    let sessions = store.sessions_for_allocation(allocation.id).await.unwrap();
    assert_eq!(sessions.len(), 7);
}

#[tokio::test]
#[serial]
async fn rolling_top_up_after_consumption() {
    let store = get_test_store().await;
    let allocation = allocate(&store, 10).await;
    let policy = WindowPolicy::default();

    let first = store
        .top_up_sessions(allocation.id, &policy, today(), None)
        .await
        .unwrap();

    // Complete one, cancel four: 2 scheduled, 1 completed remain counted.
    store
        .transition_session(first.created[0].id, SessionStatus::Completed)
        .await
        .unwrap();
    for session in &first.created[1..5] {
        store
            .transition_session(session.id, SessionStatus::Cancelled)
            .await
            .unwrap();
    }

    let outcome = store
        .top_up_sessions(allocation.id, &policy, today(), None)
        .await
        .unwrap();
    assert_eq!(outcome.created.len(), 5);
    assert_eq!(outcome.counts.scheduled, 7);
    assert_eq!(outcome.counts.completed, 1);
}

#[tokio::test]
#[serial]
async fn ending_allocation_keeps_purchase_active() {
    let store = get_test_store().await;
    let allocation = allocate(&store, 10).await;

    let ended = store
        .transition_allocation(allocation.id, AllocationStatus::Ended)
        .await
        .unwrap();
    assert_eq!(ended.status, AllocationStatus::Ended);

    let purchase = store
        .get_purchase(allocation.purchase_id)
        .await
        .unwrap()
        .unwrap();
    assert!(purchase.active);
    assert!(store.open_allocations().await.unwrap().is_empty());

    let err = store
        .transition_allocation(allocation.id, AllocationStatus::Active)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Domain(_)));
}

#[tokio::test]
#[serial]
async fn dead_letters_upsert_per_event_and_stage() {
    let store = get_test_store().await;
    let event = envelope(CorrelationId::new(), EventType::PurchaseCreated);

    let first = store
        .record_dead_letter(NewDeadLetter {
            stage: "allocator".to_string(),
            original_event: event.clone(),
            error: "matcher timed out".to_string(),
            attempt_count: 5,
        })
        .await
        .unwrap();
    let replayed = store.mark_dead_letter_replayed(first.id).await.unwrap();
    assert!(replayed.replayed_at.is_some());
    assert!(store.list_dead_letters(false).await.unwrap().is_empty());

    let again = store
        .record_dead_letter(NewDeadLetter {
            stage: "allocator".to_string(),
            original_event: event.clone(),
            error: "matcher unavailable".to_string(),
            attempt_count: 5,
        })
        .await
        .unwrap();
    assert_eq!(again.id, first.id);
    assert!(again.replayed_at.is_none());
    assert_eq!(again.original_event, event);

    let listed = store.list_dead_letters(false).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].error, "matcher unavailable");
    assert!(listed[0].failed_at <= Utc::now());
}
