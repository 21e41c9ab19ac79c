//! Consumer loop that feeds a stage from its consumer group.

use std::sync::Arc;
use std::time::Duration;

use event_log::{EventLog, EventLogError, LogRecord};
use tokio::sync::watch;

use crate::error::Result;
use crate::handler::Dispatcher;

/// Settings of one consumer instance.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Member name inside the consumer group. Must be unique per instance.
    pub member_id: String,
    pub batch_size: usize,
    /// How long a poll waits for records.
    pub poll_timeout: Duration,
    /// Pause after a failed poll or an undisposable event.
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            member_id: format!("consumer-{}", std::process::id()),
            batch_size: 16,
            poll_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// One member of a stage's consumer group.
///
/// Records are committed one by one after the dispatcher disposed of them.
/// A record that could not be disposed of stops the batch and is delivered
/// again from the last committed offset.
pub struct StageConsumer {
    dispatcher: Dispatcher,
    log: Arc<dyn EventLog>,
    config: ConsumerConfig,
}

impl StageConsumer {
    pub fn new(dispatcher: Dispatcher, log: Arc<dyn EventLog>, config: ConsumerConfig) -> Self {
        Self {
            dispatcher,
            log,
            config,
        }
    }

    /// The consumer group, named after the stage.
    pub fn group(&self) -> &'static str {
        self.dispatcher.stage()
    }

    pub fn member_id(&self) -> &str {
        &self.config.member_id
    }

    /// Polls once and processes what came back. Returns the number of
    /// committed records.
    pub async fn poll_once(&self) -> Result<usize> {
        let records = self.poll().await?;
        self.process_batch(&records, || false).await
    }

    /// Runs until `shutdown` turns true, then releases the partitions.
    ///
    /// The event in flight when the signal arrives is finished and
    /// committed; no new event is started afterwards.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let group = self.group();
        tracing::info!(group, member = %self.config.member_id, "Consumer started");

        while !*shutdown.borrow() {
            let polled = tokio::select! {
                polled = self.poll() => polled,
                _ = shutdown.changed() => break,
            };

            let result = match polled {
                Ok(records) => self.process_batch(&records, || *shutdown.borrow()).await,
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                tracing::error!(group, error = %e, "Consumer iteration failed");
                metrics::counter!("fulfillment_consumer_errors_total", "stage" => group)
                    .increment(1);
                tokio::select! {
                    _ = tokio::time::sleep(self.config.error_backoff) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        if let Err(e) = self.log.release(group, &self.config.member_id).await {
            tracing::warn!(group, error = %e, "Failed to release partitions");
        }
        tracing::info!(group, member = %self.config.member_id, "Consumer stopped");
    }

    async fn poll(&self) -> Result<Vec<LogRecord>> {
        let records = self
            .log
            .poll(
                self.group(),
                &self.config.member_id,
                self.config.batch_size,
                self.config.poll_timeout,
            )
            .await?;
        Ok(records)
    }

    async fn process_batch<F>(&self, records: &[LogRecord], stopping: F) -> Result<usize>
    where
        F: Fn() -> bool + Send + Sync,
    {
        let group = self.group();
        let mut committed = 0;

        for record in records {
            if stopping() {
                break;
            }

            self.dispatcher.process(&record.envelope).await?;

            match self
                .log
                .commit(group, &self.config.member_id, record)
                .await
            {
                Ok(()) => committed += 1,
                Err(EventLogError::LeaseLost { partition, .. }) => {
                    // The new owner redelivers from the committed offset.
                    tracing::warn!(group, partition, "Lease lost, abandoning batch");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(committed)
    }
}
