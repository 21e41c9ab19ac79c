//! Background timers: the periodic window top-up and the outbox sweep.

use std::sync::Arc;
use std::time::Duration;

use event_log::IdempotentEmitter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::scheduler::SessionScheduler;

/// Runs [`SessionScheduler::top_up_all`] every `period` until shutdown.
/// The first sweep runs immediately.
pub fn spawn_top_up_timer(
    scheduler: Arc<SessionScheduler>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = scheduler.top_up_all().await {
                tracing::error!(error = %e, "Top-up sweep failed");
            }
        }
        tracing::info!("Top-up timer stopped");
    })
}

/// Republishes outbox entries older than `grace` every `period` until
/// shutdown.
pub fn spawn_republish_timer(
    emitter: IdempotentEmitter,
    period: Duration,
    grace: Duration,
    batch: usize,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = emitter.republish_pending(grace, batch).await {
                tracing::error!(error = %e, "Outbox sweep failed");
            }
        }
        tracing::info!("Outbox sweep stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;
    use common::CorrelationId;
    use event_log::{EventEnvelope, EventType, InMemoryEventLog, InMemoryOutbox, LogConfig};
    use store::InMemoryFulfillmentStore;

    fn emitter(log: &InMemoryEventLog) -> IdempotentEmitter {
        IdempotentEmitter::new(Arc::new(log.clone()), Arc::new(InMemoryOutbox::new()))
    }

    #[tokio::test]
    async fn republish_timer_heals_deferred_emit() {
        let log = InMemoryEventLog::new(LogConfig::default());
        let emitter = emitter(&log);

        log.set_fail_on_publish(true);
        let envelope = EventEnvelope::builder()
            .correlation_id(CorrelationId::new())
            .event_type(EventType::PurchaseCreated.as_str())
            .source("test")
            .payload_raw(serde_json::json!({}))
            .build()
            .unwrap();
        emitter.emit(envelope).await.unwrap();
        log.set_fail_on_publish(false);

        let (tx, rx) = watch::channel(false);
        let handle = spawn_republish_timer(
            emitter,
            Duration::from_millis(10),
            Duration::ZERO,
            10,
            rx,
        );

        for _ in 0..50 {
            if log.record_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(log.record_count().await, 1);
    }

    #[tokio::test]
    async fn top_up_timer_stops_on_shutdown() {
        let log = InMemoryEventLog::new(LogConfig::default());
        let scheduler = Arc::new(SessionScheduler::new(
            Arc::new(InMemoryFulfillmentStore::new()),
            emitter(&log),
            SchedulerConfig::default(),
        ));

        let (tx, rx) = watch::channel(false);
        let handle = spawn_top_up_timer(scheduler, Duration::from_secs(3600), rx);
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
