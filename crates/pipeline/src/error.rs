//! Pipeline error types.

use std::time::Duration;

use domain::DomainError;
use event_log::EventLogError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur while a stage handles an event.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Fulfillment store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Event log or outbox error.
    #[error("Event log error: {0}")]
    EventLog(#[from] EventLogError),

    /// The event could not be decoded.
    #[error("Malformed event: {0}")]
    Malformed(String),

    /// The event decoded but breaks a domain rule.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A collaborator did not answer in time.
    #[error("{collaborator} timed out after {after:?}")]
    CollaboratorTimeout {
        collaborator: &'static str,
        after: Duration,
    },

    /// The tutor matcher failed or had no tutor to offer.
    #[error("Tutor matching failed: {0}")]
    Matching(String),

    /// The read-model cache could not be updated.
    #[error("Cache error: {0}")]
    Cache(String),
}

impl PipelineError {
    /// Returns true if handling the same event again may succeed.
    ///
    /// Malformed and invalid events are permanent and skip retries.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Store(e) => e.is_transient(),
            PipelineError::EventLog(e) => e.is_transient(),
            PipelineError::CollaboratorTimeout { .. }
            | PipelineError::Matching(_)
            | PipelineError::Cache(_) => true,
            PipelineError::Malformed(_) | PipelineError::Validation(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Store(_) => "store",
            PipelineError::EventLog(_) => "event_log",
            PipelineError::Malformed(_) => "malformed",
            PipelineError::Validation(_) => "validation",
            PipelineError::CollaboratorTimeout { .. } => "timeout",
            PipelineError::Matching(_) => "matching",
            PipelineError::Cache(_) => "cache",
        }
    }
}

impl From<DomainError> for PipelineError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::InvalidPayload(msg) => PipelineError::Malformed(msg),
            other => PipelineError::Validation(other.to_string()),
        }
    }
}

/// Convenience type alias for pipeline results.
pub type Result<T> = std::result::Result<T, PipelineError>;
