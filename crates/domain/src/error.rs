//! Domain error types.

use thiserror::Error;

/// Errors raised by domain rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// A status change the state machine does not allow.
    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },

    /// A status string that maps to no known status.
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// An event payload that violates a domain rule.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Rolling-window thresholds that cannot work together.
    #[error("Invalid window policy: low water {low_water}, high water {high_water}")]
    InvalidWindowPolicy { low_water: u32, high_water: u32 },
}
