//! Shared identifier types for the fulfillment pipeline.

mod types;

pub use types::{
    AllocationId, CorrelationId, CourseId, DeadLetterId, PaymentId, PurchaseId, SessionId,
    StudentId, TutorId,
};
