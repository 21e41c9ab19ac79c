//! Allocation and session state machines.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The state of a tutor allocation.
///
/// State transitions:
/// ```text
/// Approved ──► Active ──► Ended
///     │                     ▲
///     └─────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// Tutor assigned, no session runway yet.
    #[default]
    Approved,

    /// Sessions are being scheduled and consumed.
    Active,

    /// Finished or withdrawn (terminal state).
    Ended,
}

impl AllocationStatus {
    /// Returns true if the allocation counts toward the one-open-allocation
    /// per (student, course) constraint.
    pub fn is_open(&self) -> bool {
        matches!(self, AllocationStatus::Approved | AllocationStatus::Active)
    }

    /// Returns true if the transition is allowed.
    pub fn can_transition_to(&self, next: AllocationStatus) -> bool {
        matches!(
            (self, next),
            (AllocationStatus::Approved, AllocationStatus::Active)
                | (AllocationStatus::Approved, AllocationStatus::Ended)
                | (AllocationStatus::Active, AllocationStatus::Ended)
        )
    }

    /// Validates a transition, returning the new status.
    pub fn transition_to(&self, next: AllocationStatus) -> Result<AllocationStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                entity: "allocation",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }

    /// Returns the status as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Approved => "approved",
            AllocationStatus::Active => "active",
            AllocationStatus::Ended => "ended",
        }
    }
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AllocationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(AllocationStatus::Approved),
            "active" => Ok(AllocationStatus::Active),
            "ended" => Ok(AllocationStatus::Ended),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

/// The state of a single session.
///
/// State transitions:
/// ```text
/// Scheduled ──┬──► Completed
///             └──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Scheduled,
    Completed,
    Cancelled,
}

impl SessionStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    /// Returns true if the transition is allowed.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        *self == SessionStatus::Scheduled && next.is_terminal()
    }

    /// Validates a transition, returning the new status.
    pub fn transition_to(&self, next: SessionStatus) -> Result<SessionStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                entity: "session",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }

    /// Returns the status as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SessionStatus::Scheduled),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}
