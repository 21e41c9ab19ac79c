//! Rolling-window session planning.
//!
//! The scheduler keeps a bounded runway of upcoming sessions per allocation
//! instead of creating the whole tier up front. [`plan_top_up`] is the pure
//! part of that: given an allocation and its existing sessions it decides
//! which slots to add and whether the allocation changes status. The store
//! applies the plan inside one transaction.

use chrono::{Datelike, Days, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::allocation::Allocation;
use crate::error::DomainError;
use crate::session::{Session, Slot};
use crate::status::{AllocationStatus, SessionStatus};

/// Metadata key holding [`ScheduleHints`].
pub const SCHEDULE_METADATA_KEY: &str = "schedule";

/// When an allocation's sessions should happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleHints {
    /// Days of the week sessions fall on.
    pub weekdays: Vec<Weekday>,

    /// Time of day of every session.
    pub start_time: NaiveTime,

    /// Earliest date for the first session.
    pub start_date: Option<NaiveDate>,
}

impl Default for ScheduleHints {
    fn default() -> Self {
        Self {
            weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            start_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or_default(),
            start_date: None,
        }
    }
}

impl ScheduleHints {
    /// Reads hints from allocation or purchase metadata.
    ///
    /// Missing hints give the defaults. Malformed hints are logged and also
    /// give the defaults.
    pub fn from_metadata(metadata: &serde_json::Value) -> Self {
        let Some(raw) = metadata.get(SCHEDULE_METADATA_KEY) else {
            return Self::default();
        };

        match serde_json::from_value::<ScheduleHints>(raw.clone()) {
            Ok(hints) if !hints.weekdays.is_empty() => hints,
            Ok(_) => {
                tracing::warn!("Schedule hints list no weekdays, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Malformed schedule hints, using defaults");
                Self::default()
            }
        }
    }

    /// Generates the next `count` slots.
    ///
    /// Slots start strictly after both `today` and `after` (the last date
    /// already used), and no earlier than `start_date`.
    pub fn next_slots(&self, after: Option<NaiveDate>, today: NaiveDate, count: usize) -> Vec<Slot> {
        let mut slots = Vec::with_capacity(count);
        if count == 0 || self.weekdays.is_empty() {
            return slots;
        }

        let floor = after.map_or(today, |d| d.max(today));
        let Some(mut date) = floor.checked_add_days(Days::new(1)) else {
            return slots;
        };
        if let Some(start) = self.start_date {
            date = date.max(start);
        }

        while slots.len() < count {
            if self.weekdays.contains(&date.weekday()) {
                slots.push(Slot {
                    date,
                    time: self.start_time,
                });
            }
            match date.checked_add_days(Days::new(1)) {
                Some(next) => date = next,
                None => break,
            }
        }
        slots
    }
}

/// Thresholds of the rolling window.
///
/// When fewer than `low_water` sessions are scheduled the window is refilled
/// up to `high_water`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    low_water: u32,
    high_water: u32,
}

impl WindowPolicy {
    pub fn new(low_water: u32, high_water: u32) -> Result<Self, DomainError> {
        if low_water == 0 || high_water < low_water {
            return Err(DomainError::InvalidWindowPolicy {
                low_water,
                high_water,
            });
        }
        Ok(Self {
            low_water,
            high_water,
        })
    }

    pub fn low_water(&self) -> u32 {
        self.low_water
    }

    pub fn high_water(&self) -> u32 {
        self.high_water
    }

    /// How many sessions to create for the given counts and tier.
    pub fn top_up(&self, counts: SessionCounts, session_count: u32) -> u32 {
        if counts.scheduled >= self.low_water {
            return 0;
        }
        let remaining = counts.remaining(session_count);
        (self.high_water - counts.scheduled).min(remaining)
    }
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            low_water: 3,
            high_water: 7,
        }
    }
}

/// Sessions of one allocation, by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionCounts {
    pub scheduled: u32,
    pub completed: u32,
    pub cancelled: u32,
}

impl SessionCounts {
    pub fn from_sessions(sessions: &[Session]) -> Self {
        sessions.iter().fold(Self::default(), |mut counts, session| {
            match session.status {
                SessionStatus::Scheduled => counts.scheduled += 1,
                SessionStatus::Completed => counts.completed += 1,
                SessionStatus::Cancelled => counts.cancelled += 1,
            }
            counts
        })
    }

    /// Sessions of the tier not yet scheduled or consumed.
    ///
    /// Cancelled sessions give their place in the tier back.
    pub fn remaining(&self, session_count: u32) -> u32 {
        session_count.saturating_sub(self.scheduled + self.completed)
    }
}

/// What a top-up run should do to one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopUpPlan {
    /// Slots to insert as scheduled sessions.
    pub slots: Vec<Slot>,

    /// Status the allocation moves to, if any.
    pub transition: Option<AllocationStatus>,
}

impl TopUpPlan {
    pub fn is_noop(&self) -> bool {
        self.slots.is_empty() && self.transition.is_none()
    }
}

/// Plans the top-up of one allocation.
///
/// Closed allocations get an empty plan. An `approved` allocation is
/// activated when its first sessions are created. An open allocation whose
/// tier is used up and that has nothing left scheduled is ended.
pub fn plan_top_up(
    allocation: &Allocation,
    existing: &[Session],
    policy: &WindowPolicy,
    today: NaiveDate,
) -> TopUpPlan {
    if !allocation.is_open() {
        return TopUpPlan::default();
    }

    let counts = SessionCounts::from_sessions(existing);
    let wanted = policy.top_up(counts, allocation.session_count) as usize;
    let last_date = existing.iter().map(|s| s.scheduled_date).max();
    let slots = allocation
        .schedule_hints()
        .next_slots(last_date, today, wanted);

    let exhausted = counts.remaining(allocation.session_count) == 0 && counts.scheduled == 0;
    let transition = if exhausted {
        Some(AllocationStatus::Ended)
    } else if allocation.status == AllocationStatus::Approved && !slots.is_empty() {
        Some(AllocationStatus::Active)
    } else {
        None
    };

    TopUpPlan { slots, transition }
}
