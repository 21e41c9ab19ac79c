use thiserror::Error;

/// Errors that can occur when interacting with the event log or outbox.
#[derive(Debug, Error)]
pub enum EventLogError {
    /// The consumer no longer holds the lease on the partition it tried to
    /// commit. Another member may already be redelivering the record.
    #[error("Lease lost for group {group} on partition {partition}")]
    LeaseLost { group: String, partition: u32 },

    /// Publishing to the log failed.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The envelope carries an event type this pipeline does not know.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The envelope is missing required fields.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventLogError {
    /// Returns true if retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EventLogError::Publish(_) | EventLogError::LeaseLost { .. } => true,
            EventLogError::Database(e) => is_transient_sqlx(e),
            EventLogError::UnknownEventType(_)
            | EventLogError::InvalidEnvelope(_)
            | EventLogError::Migration(_)
            | EventLogError::Serialization(_) => false,
        }
    }
}

/// Classifies a sqlx error as transient (worth retrying) or not.
///
/// Connection-level failures and Postgres serialization, deadlock and
/// lock-timeout codes are transient; everything else is not.
pub fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("40001") | Some("40P01") | Some("55P03") | Some("57014")
        ),
        _ => false,
    }
}

/// Result type for event log operations.
pub type Result<T> = std::result::Result<T, EventLogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        assert!(EventLogError::Publish("broker down".into()).is_transient());
        assert!(EventLogError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!EventLogError::UnknownEventType("X".into()).is_transient());
        assert!(!EventLogError::Database(sqlx::Error::RowNotFound).is_transient());
    }
}
