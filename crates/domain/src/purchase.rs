//! Purchases materialized from confirmed payments.

use chrono::{DateTime, Utc};
use common::{CorrelationId, CourseId, PaymentId, PurchaseId, StudentId};
use serde::{Deserialize, Serialize};

use crate::events::{PurchaseConfirmed, PurchaseCreated};

/// A materialized purchase.
///
/// At most one active purchase exists per (student, course).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub id: PurchaseId,
    pub payment_id: PaymentId,
    pub correlation_id: CorrelationId,
    pub student_id: StudentId,
    pub course_id: CourseId,
    pub tier: u32,
    pub metadata: serde_json::Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Purchase {
    /// The event announcing this purchase downstream.
    pub fn created_event(&self) -> PurchaseCreated {
        PurchaseCreated {
            purchase_id: self.id,
            student_id: self.student_id,
            course_id: self.course_id,
            tier: self.tier,
            metadata: self.metadata.clone(),
        }
    }
}

/// A purchase about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPurchase {
    pub id: PurchaseId,
    pub payment_id: PaymentId,
    pub correlation_id: CorrelationId,
    pub student_id: StudentId,
    pub course_id: CourseId,
    pub tier: u32,
    pub metadata: serde_json::Value,
}

impl NewPurchase {
    /// Builds the purchase a confirmation asks for.
    pub fn from_confirmed(correlation_id: CorrelationId, event: &PurchaseConfirmed) -> Self {
        Self {
            id: PurchaseId::new(),
            payment_id: event.payment_id,
            correlation_id,
            student_id: event.student_id,
            course_id: event.course_id,
            tier: event.tier,
            metadata: event.metadata.clone(),
        }
    }

    /// Materializes the row as the store would insert it.
    pub fn into_purchase(self, now: DateTime<Utc>) -> Purchase {
        Purchase {
            id: self.id,
            payment_id: self.payment_id,
            correlation_id: self.correlation_id,
            student_id: self.student_id,
            course_id: self.course_id,
            tier: self.tier,
            metadata: self.metadata,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}
