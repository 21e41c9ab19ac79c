//! Stage handlers and the retry / dead-letter dispatch around them.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use event_log::{EventEnvelope, EventType};
use store::{FulfillmentStore, NewDeadLetter};

use crate::error::{PipelineError, Result};
use crate::retry::{RetryFailure, RetryPolicy, retry_with_backoff};

/// What a handler did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The business effect was applied by this call.
    Applied,
    /// The effect already existed; at most the derived event was re-emitted.
    Duplicate,
    /// Nothing to do for this event.
    Skipped,
}

/// One stage of the pipeline.
///
/// Handlers must be idempotent: the log delivers at least once and the
/// dispatcher retries transient failures.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// The stage name, also used as the consumer group.
    fn stage(&self) -> &'static str;

    /// Returns true for the event types this stage consumes.
    fn handles(&self, event_type: EventType) -> bool;

    fn retry_policy(&self) -> &RetryPolicy;

    /// Whether events that exhaust the budget are dead-lettered. When false
    /// they are logged and dropped.
    fn dead_letters(&self) -> bool {
        true
    }

    /// Whether events of unknown type are dead-lettered by this stage.
    /// Only the entry stage claims them, so an unknown event yields one
    /// dead letter instead of one per stage.
    fn claims_unknown_types(&self) -> bool {
        false
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Result<HandleOutcome>;
}

/// How the dispatcher disposed of one event. Every variant means the event
/// may be committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled(HandleOutcome),
    /// The stage does not consume this event type.
    Ignored,
    DeadLettered,
    /// Failed in a stage that never dead-letters.
    Dropped,
}

/// Runs a handler with its retry budget and routes exhausted events to the
/// dead-letter sink.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn EventHandler>,
    store: Arc<dyn FulfillmentStore>,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn EventHandler>, store: Arc<dyn FulfillmentStore>) -> Self {
        Self { handler, store }
    }

    pub fn stage(&self) -> &'static str {
        self.handler.stage()
    }

    /// Processes one event.
    ///
    /// Returns an error only when the event could not be disposed of, in
    /// which case it must not be committed.
    #[tracing::instrument(
        skip(self, envelope),
        fields(
            stage = self.handler.stage(),
            event_id = %envelope.event_id,
            correlation_id = %envelope.correlation_id,
            event_type = %envelope.event_type
        )
    )]
    pub async fn process(&self, envelope: &EventEnvelope) -> Result<Disposition> {
        let stage = self.handler.stage();

        let kind = match envelope.kind() {
            Ok(kind) => kind,
            Err(_) if !self.handler.claims_unknown_types() => return Ok(Disposition::Ignored),
            Err(e) => {
                let failure = RetryFailure {
                    error: PipelineError::Malformed(e.to_string()),
                    attempts: 1,
                };
                return self.give_up(envelope, failure).await;
            }
        };
        if !self.handler.handles(kind) {
            return Ok(Disposition::Ignored);
        }

        let start = Instant::now();
        let result = retry_with_backoff(self.handler.retry_policy(), |attempt| async move {
            if attempt > 1 {
                tracing::debug!(attempt, "Retrying event");
            }
            self.handler.handle(envelope).await
        })
        .await;
        metrics::histogram!("fulfillment_handler_duration_seconds", "stage" => stage)
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                match outcome {
                    HandleOutcome::Applied => {
                        metrics::counter!("fulfillment_events_processed_total", "stage" => stage)
                            .increment(1);
                    }
                    HandleOutcome::Duplicate => {
                        tracing::info!("Event already processed, acknowledged");
                        metrics::counter!("fulfillment_events_duplicate_total", "stage" => stage)
                            .increment(1);
                    }
                    HandleOutcome::Skipped => {}
                }
                Ok(Disposition::Handled(outcome))
            }
            Err(failure) => self.give_up(envelope, failure).await,
        }
    }

    async fn give_up(&self, envelope: &EventEnvelope, failure: RetryFailure) -> Result<Disposition> {
        let stage = self.handler.stage();

        if !self.handler.dead_letters() {
            tracing::warn!(
                attempts = failure.attempts,
                error = %failure.error,
                "Giving up on event"
            );
            metrics::counter!("fulfillment_events_dropped_total", "stage" => stage).increment(1);
            return Ok(Disposition::Dropped);
        }

        tracing::error!(
            attempts = failure.attempts,
            error = %failure.error,
            error_kind = failure.error.kind(),
            "Event failed, sending to dead letters"
        );
        let dead_letter = self
            .store
            .record_dead_letter(NewDeadLetter {
                stage: stage.to_string(),
                original_event: envelope.clone(),
                error: failure.error.to_string(),
                attempt_count: failure.attempts,
            })
            .await?;

        tracing::info!(dead_letter_id = %dead_letter.id, "Dead letter recorded");
        metrics::counter!(
            "fulfillment_dead_letters_total",
            "stage" => stage,
            "error" => failure.error.kind()
        )
        .increment(1);
        Ok(Disposition::DeadLettered)
    }
}
