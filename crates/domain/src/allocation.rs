//! Tutor allocations.

use chrono::{DateTime, Utc};
use common::{AllocationId, CorrelationId, CourseId, PurchaseId, StudentId, TutorId};
use serde::{Deserialize, Serialize};

use crate::events::{PurchaseCreated, TrainerAllocated};
use crate::schedule::ScheduleHints;
use crate::status::AllocationStatus;

/// A tutor assigned to a student for a course.
///
/// At most one allocation per (student, course) is open, meaning
/// `approved` or `active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub id: AllocationId,
    pub purchase_id: PurchaseId,
    pub correlation_id: CorrelationId,
    pub student_id: StudentId,
    pub course_id: CourseId,
    pub tutor_id: TutorId,
    pub status: AllocationStatus,
    /// Total sessions the purchase paid for.
    pub session_count: u32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Allocation {
    /// Returns true while the allocation still needs sessions.
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Scheduling preferences stored in the metadata.
    pub fn schedule_hints(&self) -> ScheduleHints {
        ScheduleHints::from_metadata(&self.metadata)
    }

    /// The event announcing this allocation downstream.
    pub fn allocated_event(&self) -> TrainerAllocated {
        TrainerAllocated {
            allocation_id: self.id,
            student_id: self.student_id,
            course_id: self.course_id,
            tutor_id: self.tutor_id,
            session_count: self.session_count,
        }
    }
}

/// An allocation about to be inserted as `approved`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAllocation {
    pub id: AllocationId,
    pub purchase_id: PurchaseId,
    pub correlation_id: CorrelationId,
    pub student_id: StudentId,
    pub course_id: CourseId,
    pub tutor_id: TutorId,
    pub session_count: u32,
    pub metadata: serde_json::Value,
}

impl NewAllocation {
    /// Builds the allocation for a purchase and the tutor chosen for it.
    pub fn for_purchase(
        correlation_id: CorrelationId,
        event: &PurchaseCreated,
        tutor_id: TutorId,
    ) -> Self {
        Self {
            id: AllocationId::new(),
            purchase_id: event.purchase_id,
            correlation_id,
            student_id: event.student_id,
            course_id: event.course_id,
            tutor_id,
            session_count: event.tier,
            metadata: event.metadata.clone(),
        }
    }

    /// Materializes the row as the store would insert it.
    pub fn into_allocation(self, now: DateTime<Utc>) -> Allocation {
        Allocation {
            id: self.id,
            purchase_id: self.purchase_id,
            correlation_id: self.correlation_id,
            student_id: self.student_id,
            course_id: self.course_id,
            tutor_id: self.tutor_id,
            status: AllocationStatus::Approved,
            session_count: self.session_count,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}
