//! Tutoring sessions.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use common::{AllocationId, SessionId};
use serde::{Deserialize, Serialize};

use crate::status::SessionStatus;

/// A calendar slot a session occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.date, self.time.format("%H:%M"))
    }
}

/// One session of an allocation. Unique per (allocation, date, time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub allocation_id: AllocationId,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: NaiveTime,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Creates a scheduled session in a slot.
    pub fn scheduled(allocation_id: AllocationId, slot: Slot, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            allocation_id,
            scheduled_date: slot.date,
            scheduled_time: slot.time,
            status: SessionStatus::Scheduled,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn slot(&self) -> Slot {
        Slot {
            date: self.scheduled_date,
            time: self.scheduled_time,
        }
    }
}
