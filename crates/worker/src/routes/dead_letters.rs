//! Dead-letter inspection and replay endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use common::DeadLetterId;
use event_log::EventEnvelope;
use pipeline::DeadLetterReplayer;
use serde::{Deserialize, Serialize};
use store::DeadLetter;

use crate::error::ApiError;

/// Shared state of the dead-letter routes.
pub struct AppState {
    pub replayer: DeadLetterReplayer,
}

// -- Request types --

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_replayed: bool,
}

// -- Response types --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterResponse {
    pub id: String,
    pub event_id: String,
    pub correlation_id: String,
    pub event_type: String,
    pub stage: String,
    pub error: String,
    pub attempt_count: u32,
    pub failed_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
    pub original_event: EventEnvelope,
}

impl From<DeadLetter> for DeadLetterResponse {
    fn from(dead_letter: DeadLetter) -> Self {
        Self {
            id: dead_letter.id.to_string(),
            event_id: dead_letter.event_id.to_string(),
            correlation_id: dead_letter.correlation_id.to_string(),
            event_type: dead_letter.event_type,
            stage: dead_letter.stage,
            error: dead_letter.error,
            attempt_count: dead_letter.attempt_count,
            failed_at: dead_letter.failed_at,
            replayed_at: dead_letter.replayed_at,
            original_event: dead_letter.original_event,
        }
    }
}

// -- Handlers --

/// GET /dead-letters?include_replayed=true — list dead letters, oldest first.
#[tracing::instrument(skip(state))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DeadLetterResponse>>, ApiError> {
    let dead_letters = state.replayer.list(query.include_replayed).await?;
    Ok(Json(dead_letters.into_iter().map(Into::into).collect()))
}

/// GET /dead-letters/{id} — load one dead letter.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeadLetterResponse>, ApiError> {
    let dead_letter_id = parse_dead_letter_id(&id)?;
    let dead_letter = state
        .replayer
        .get(dead_letter_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Dead letter {id} not found")))?;
    Ok(Json(dead_letter.into()))
}

/// POST /dead-letters/{id}/replay — republish the original event.
#[tracing::instrument(skip(state))]
pub async fn replay(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeadLetterResponse>, ApiError> {
    let dead_letter_id = parse_dead_letter_id(&id)?;
    let replayed = state.replayer.replay(dead_letter_id).await?;
    Ok(Json(replayed.into()))
}

fn parse_dead_letter_id(id: &str) -> Result<DeadLetterId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid dead letter id: {e}")))
}
