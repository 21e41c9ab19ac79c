//! Walks one purchase through the domain model: confirmation, purchase,
//! allocation, and a few rounds of session planning.

use chrono::{Days, NaiveDate, Utc};
use common::{CorrelationId, CourseId, PaymentId, StudentId, TutorId};
use domain::{
    AllocationStatus, FulfillmentEvent, NewAllocation, NewPurchase, PurchaseConfirmed,
    PurchaseCreated, Session, SessionStatus, TrainerAllocated, WindowPolicy, plan_top_up,
};
use event_log::{EventId, EventType};

fn confirmed(tier: u32) -> PurchaseConfirmed {
    PurchaseConfirmed {
        payment_id: PaymentId::new(),
        student_id: StudentId::new(),
        course_id: CourseId::new(),
        tier,
        metadata: serde_json::json!({ "schedule": { "weekdays": ["Mon", "Wed", "Fri"] } }),
    }
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

mod event_chain {
    use super::*;

    #[test]
    fn payloads_flow_from_confirmation_to_allocation() {
        let correlation_id = CorrelationId::new();
        let event = confirmed(10);

        let purchase = NewPurchase::from_confirmed(correlation_id, &event).into_purchase(Utc::now());
        assert!(purchase.active);
        assert_eq!(purchase.payment_id, event.payment_id);

        let created = purchase.created_event();
        assert_eq!(created.tier, 10);
        assert_eq!(created.metadata, event.metadata);

        let tutor_id = TutorId::new();
        let allocation = NewAllocation::for_purchase(correlation_id, &created, tutor_id)
            .into_allocation(Utc::now());
        assert_eq!(allocation.status, AllocationStatus::Approved);
        assert_eq!(allocation.session_count, 10);
        assert_eq!(allocation.purchase_id, purchase.id);

        let allocated: TrainerAllocated = allocation.allocated_event();
        assert_eq!(allocated.tutor_id, tutor_id);
        assert_eq!(allocated.student_id, event.student_id);
    }

    #[test]
    fn derived_envelopes_are_reproducible() {
        let correlation_id = CorrelationId::new();
        let purchase = NewPurchase::from_confirmed(correlation_id, &confirmed(4))
            .into_purchase(Utc::now());
        let event_id = EventId::for_step(correlation_id, EventType::PurchaseCreated);

        let first = purchase
            .created_event()
            .to_envelope(event_id, correlation_id, "materializer")
            .unwrap();
        let again = purchase
            .created_event()
            .to_envelope(event_id, correlation_id, "materializer")
            .unwrap();

        assert_eq!(first.event_id, again.event_id);
        assert_eq!(
            PurchaseCreated::from_envelope(&first).unwrap(),
            PurchaseCreated::from_envelope(&again).unwrap()
        );
    }
}

mod rolling_window {
    use super::*;

    #[test]
    fn tier_is_consumed_window_by_window_then_ended() {
        let correlation_id = CorrelationId::new();
        let created = NewPurchase::from_confirmed(correlation_id, &confirmed(10))
            .into_purchase(Utc::now())
            .created_event();
        let mut allocation = NewAllocation::for_purchase(correlation_id, &created, TutorId::new())
            .into_allocation(Utc::now());
        let policy = WindowPolicy::default();
        let mut sessions: Vec<Session> = Vec::new();
        let mut day = today();

        for _ in 0..10 {
            let plan = plan_top_up(&allocation, &sessions, &policy, day);
            if let Some(next) = plan.transition {
                allocation.status = allocation.status.transition_to(next).unwrap();
            }
            sessions.extend(
                plan.slots
                    .into_iter()
                    .map(|slot| Session::scheduled(allocation.id, slot, Utc::now())),
            );

            // No duplicate slots ever.
            let mut slots: Vec<_> = sessions.iter().map(Session::slot).collect();
            slots.sort();
            slots.dedup();
            assert_eq!(slots.len(), sessions.len());

            // Consume the two earliest scheduled sessions.
            let mut scheduled: Vec<&mut Session> = sessions
                .iter_mut()
                .filter(|s| s.status == SessionStatus::Scheduled)
                .collect();
            scheduled.sort_by_key(|s| s.slot());
            for session in scheduled.into_iter().take(2) {
                session.status = session.status.transition_to(SessionStatus::Completed).unwrap();
            }
            day = day.checked_add_days(Days::new(7)).unwrap();

            if allocation.status == AllocationStatus::Ended {
                break;
            }
        }

        assert_eq!(allocation.status, AllocationStatus::Ended);
        assert_eq!(sessions.len(), 10);
        assert!(sessions.iter().all(|s| s.status == SessionStatus::Completed));
    }
}
