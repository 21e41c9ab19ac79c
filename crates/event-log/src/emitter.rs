//! Persist-then-publish event emission.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::{EventEnvelope, EventLog, OutboxStore, Result};

/// What happened to an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Persisted and published.
    Published,
    /// Persisted, but publishing failed; the republish sweep will retry.
    Deferred,
    /// The event id was already in the outbox; nothing was done.
    Duplicate,
}

/// Summary of one republish sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub republished: usize,
    pub failed: usize,
}

/// Emits events so that they are durable before any consumer can see them.
///
/// `emit` writes the envelope to the outbox and then publishes it. A crash
/// or publish failure after the outbox write is repaired by
/// [`IdempotentEmitter::republish_pending`]; a second `emit` of the same
/// event id is a no-op.
#[derive(Clone)]
pub struct IdempotentEmitter {
    log: Arc<dyn EventLog>,
    outbox: Arc<dyn OutboxStore>,
}

impl IdempotentEmitter {
    /// Creates an emitter over a log and an outbox.
    pub fn new(log: Arc<dyn EventLog>, outbox: Arc<dyn OutboxStore>) -> Self {
        Self { log, outbox }
    }

    /// Returns the underlying log.
    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Persists and publishes an event.
    ///
    /// Only an outbox failure is an error: once the intent is durable the
    /// event will reach the log eventually, so publish failures are
    /// reported as [`EmitOutcome::Deferred`].
    #[tracing::instrument(
        skip(self, envelope),
        fields(event_id = %envelope.event_id, event_type = %envelope.event_type)
    )]
    pub async fn emit(&self, envelope: EventEnvelope) -> Result<EmitOutcome> {
        if !self.outbox.insert(&envelope).await? {
            tracing::debug!("event already in outbox, skipping publish");
            metrics::counter!("fulfillment_emit_duplicate_total").increment(1);
            return Ok(EmitOutcome::Duplicate);
        }

        match self.log.publish(&envelope).await {
            Ok(position) => {
                if let Err(e) = self.outbox.mark_published(envelope.event_id).await {
                    // The sweep republishes it; consumers dedupe the copy.
                    tracing::warn!(error = %e, "published but failed to mark outbox entry");
                }
                tracing::debug!(%position, "event published");
                metrics::counter!("fulfillment_events_emitted_total", "type" => envelope.event_type.clone())
                    .increment(1);
                Ok(EmitOutcome::Published)
            }
            Err(e) => {
                tracing::warn!(error = %e, "publish failed, deferring to republish sweep");
                metrics::counter!("fulfillment_emit_deferred_total").increment(1);
                if let Err(record_err) = self
                    .outbox
                    .record_failure(envelope.event_id, &e.to_string())
                    .await
                {
                    tracing::warn!(error = %record_err, "failed to record publish failure");
                }
                Ok(EmitOutcome::Deferred)
            }
        }
    }

    /// Publishes outbox entries that never reached the log.
    ///
    /// Only entries older than `grace` are considered, which keeps the sweep
    /// from racing an `emit` that is still between its two steps.
    #[tracing::instrument(skip(self))]
    pub async fn republish_pending(&self, grace: Duration, limit: usize) -> Result<SweepReport> {
        let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        let pending = self.outbox.pending(Utc::now() - grace, limit).await?;
        let mut report = SweepReport::default();

        for entry in pending {
            let event_id = entry.envelope.event_id;
            match self.log.publish(&entry.envelope).await {
                Ok(_) => {
                    self.outbox.mark_published(event_id).await?;
                    report.republished += 1;
                }
                Err(e) => {
                    tracing::warn!(%event_id, attempts = entry.attempts + 1, error = %e, "republish failed");
                    self.outbox.record_failure(event_id, &e.to_string()).await?;
                    report.failed += 1;
                }
            }
        }

        if report.republished > 0 || report.failed > 0 {
            tracing::info!(
                republished = report.republished,
                failed = report.failed,
                "outbox sweep finished"
            );
        }
        metrics::counter!("fulfillment_outbox_republished_total").increment(report.republished as u64);

        Ok(report)
    }
}
