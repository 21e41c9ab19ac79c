//! Domain model of the fulfillment pipeline.
//!
//! This crate provides:
//! - Event payloads (`PurchaseConfirmed`, `PurchaseCreated`, ...)
//! - `Purchase`, `Allocation`, and `Session` records with their state machines
//! - Rolling-window planning for session scheduling
//! - Ledger receipts and `WriteOutcome` for idempotent writes

pub mod allocation;
pub mod error;
pub mod events;
pub mod ledger;
pub mod outcome;
pub mod purchase;
pub mod schedule;
pub mod session;
pub mod status;

pub use allocation::{Allocation, NewAllocation};
pub use error::DomainError;
pub use events::{
    FulfillmentEvent, PurchaseConfirmed, PurchaseCreated, SessionsGenerated, TrainerAllocated,
    student_of,
};
pub use ledger::{IdempotencyKey, ProcessedEvent};
pub use outcome::WriteOutcome;
pub use purchase::{NewPurchase, Purchase};
pub use schedule::{
    SCHEDULE_METADATA_KEY, ScheduleHints, SessionCounts, TopUpPlan, WindowPolicy, plan_top_up,
};
pub use session::{Session, Slot};
pub use status::{AllocationStatus, SessionStatus};
