//! Manual recovery of dead-lettered events.

use std::sync::Arc;

use common::DeadLetterId;
use event_log::EventLog;
use store::{DeadLetter, FulfillmentStore, StoreError};

use crate::error::Result;

/// Puts dead-lettered events back on the log.
///
/// The original envelope is published unchanged, so its event id and
/// correlation id still drive deduplication in every stage.
#[derive(Clone)]
pub struct DeadLetterReplayer {
    store: Arc<dyn FulfillmentStore>,
    log: Arc<dyn EventLog>,
}

impl DeadLetterReplayer {
    pub fn new(store: Arc<dyn FulfillmentStore>, log: Arc<dyn EventLog>) -> Self {
        Self { store, log }
    }

    pub async fn list(&self, include_replayed: bool) -> Result<Vec<DeadLetter>> {
        Ok(self.store.list_dead_letters(include_replayed).await?)
    }

    pub async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetter>> {
        Ok(self.store.get_dead_letter(id).await?)
    }

    /// Republishes a dead letter's original event and marks it replayed.
    ///
    /// A dead letter can be replayed more than once; each replay publishes
    /// the same event again.
    #[tracing::instrument(skip(self))]
    pub async fn replay(&self, id: DeadLetterId) -> Result<DeadLetter> {
        let dead_letter = self
            .store
            .get_dead_letter(id)
            .await?
            .ok_or_else(|| StoreError::not_found("dead letter", id))?;

        let position = self.log.publish(&dead_letter.original_event).await?;
        let replayed = self.store.mark_dead_letter_replayed(id).await?;

        tracing::info!(
            event_id = %dead_letter.event_id,
            stage = %dead_letter.stage,
            %position,
            "Dead letter replayed"
        );
        metrics::counter!("fulfillment_dead_letters_replayed_total", "stage" => dead_letter.stage)
            .increment(1);
        Ok(replayed)
    }
}
