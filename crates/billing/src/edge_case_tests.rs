// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Work Lifecycle
//!
//! Boundary conditions and interleavings across:
//! - Calendar arithmetic on renewal chains
//! - Payment reconciliation replays and races
//! - Terminal statuses
//! - Renewal failures and admin restores

#[cfg(test)]
mod interval_tests {
    use crate::interval::{add_interval, SubscriptionInterval};
    use time::macros::datetime;

    // =========================================================================
    // Month-end anchor: Jan 31 renews on Feb 28, then Mar 28 (clamped chain)
    // =========================================================================
    #[test]
    fn test_month_end_chain_stays_clamped() {
        let jan = datetime!(2026-01-31 9:00 UTC);
        let feb = add_interval(jan, SubscriptionInterval::Monthly).unwrap();
        let mar = add_interval(feb, SubscriptionInterval::Monthly).unwrap();
        assert_eq!(feb, datetime!(2026-02-28 9:00 UTC));
        assert_eq!(mar, datetime!(2026-03-28 9:00 UTC));
    }

    // =========================================================================
    // Weekly across a year boundary
    // =========================================================================
    #[test]
    fn test_weekly_across_new_year() {
        assert_eq!(
            add_interval(datetime!(2026-12-29 23:30 UTC), SubscriptionInterval::Weekly).unwrap(),
            datetime!(2027-01-05 23:30 UTC)
        );
    }
}

#[cfg(test)]
mod reconciliation_tests {
    use crate::error::BillingError;
    use crate::invariants::InvariantChecker;
    use crate::payment_detail::PaymentRequest;
    use crate::testing::TestHarness;
    use crate::work::{
        Category, ItemStatus, PaymentHistoryEntry, PaymentStatus, PaymentType, WorkStatus,
    };
    use uuid::Uuid;

    // =========================================================================
    // Two deliveries of the same callback at once: one settles, one no-ops
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_confirm_payment_settles_once() {
        let h = TestHarness::new();
        let mut work = h.new_work(Category::Software, WorkStatus::ConfirmationRequired);
        work.initial_payment = 100.0;
        work.initial_payment_status = ItemStatus::Incomplete;
        h.store.put_work(work.clone());

        let link = h
            .lifecycle
            .request_payment(work.id, PaymentRequest::Confirmation, None)
            .await
            .unwrap();
        h.gateway.set_session_paid(&link.session_id, true);

        let (a, b) = tokio::join!(
            h.lifecycle.confirm_payment(work.id, link.history_id),
            h.lifecycle.confirm_payment(work.id, link.history_id),
        );

        assert!(a.is_ok() || b.is_ok());
        for result in [&a, &b] {
            if let Err(e) = result {
                assert!(matches!(e, BillingError::ConcurrentModification));
            }
        }

        let stored = h.store.work(work.id).unwrap();
        assert_eq!(stored.status, WorkStatus::UserAccepted);
        assert_eq!(stored.initial_payment_status, ItemStatus::Completed);
        assert_eq!(h.notifier.count_kind("payment_receipt"), 1);
        assert!(InvariantChecker::check_work(&stored).is_empty());
    }

    // =========================================================================
    // Unknown history id
    // =========================================================================
    #[tokio::test]
    async fn test_confirm_payment_unknown_entry() {
        let h = TestHarness::new();
        let work = h.new_work(Category::Photography, WorkStatus::ConfirmationRequired);
        h.store.put_work(work.clone());

        assert!(matches!(
            h.lifecycle.confirm_payment(work.id, Uuid::new_v4()).await,
            Err(BillingError::NotFound(_))
        ));
    }

    // =========================================================================
    // A Failed entry is immutable
    // =========================================================================
    #[tokio::test]
    async fn test_failed_entry_cannot_be_completed() {
        let h = TestHarness::new();
        let mut work = h.new_work(Category::Photography, WorkStatus::ConfirmationRequired);
        work.initial_payment = 50.0;
        let mut entry = PaymentHistoryEntry::draft(PaymentType::Confirmation, 50.0, "Initial");
        entry.status = PaymentStatus::Failed;
        entry.payment_intent_id = Some("pi_declined".to_string());
        let entry_id = entry.id;
        work.payment_history.push(entry);
        h.store.put_work(work.clone());

        assert!(matches!(
            h.lifecycle.confirm_payment(work.id, entry_id).await,
            Err(BillingError::PaymentNotSuccessful)
        ));
        assert_eq!(
            h.store.work(work.id).unwrap().history_entry(entry_id).unwrap().status,
            PaymentStatus::Failed
        );
    }

    // =========================================================================
    // Paying a confirmation after the work moved on records the payment only
    // =========================================================================
    #[tokio::test]
    async fn test_late_confirmation_payment_keeps_status() {
        let h = TestHarness::new();
        let mut work = h.new_work(Category::Software, WorkStatus::ConfirmationRequired);
        work.initial_payment = 100.0;
        work.initial_payment_status = ItemStatus::Incomplete;
        h.store.put_work(work.clone());

        let link = h
            .lifecycle
            .request_payment(work.id, PaymentRequest::Confirmation, None)
            .await
            .unwrap();
        h.lifecycle
            .set_status_by_admin(work.id, WorkStatus::NeedsAttention)
            .await
            .unwrap();
        h.gateway.set_session_paid(&link.session_id, true);

        let done = h
            .lifecycle
            .confirm_payment(work.id, link.history_id)
            .await
            .unwrap();
        assert_eq!(done.status, WorkStatus::NeedsAttention);
        assert_eq!(done.initial_payment_status, ItemStatus::Completed);
    }

    // =========================================================================
    // Full payment after a partial item payment only charges what is left
    // =========================================================================
    #[tokio::test]
    async fn test_full_after_partial_payment() {
        let h = TestHarness::new();
        let mut work = h.new_work(Category::Videography, WorkStatus::UserAccepted);
        work.payment_items.push(crate::work::LineItem::new("Shoot", 300.0));
        work.payment_items.push(crate::work::LineItem::new("Edit", 200.0));
        h.store.put_work(work.clone());

        let item = h
            .lifecycle
            .request_payment(work.id, PaymentRequest::PaymentItem(work.payment_items[0].id), None)
            .await
            .unwrap();
        h.gateway.set_session_paid(&item.session_id, true);
        h.lifecycle
            .confirm_payment(work.id, item.history_id)
            .await
            .unwrap();

        h.lifecycle
            .request_payment(work.id, PaymentRequest::Full, None)
            .await
            .unwrap();
        assert_eq!(h.gateway.last_checkout().unwrap().amount_minor, 20_000);
    }
}

#[cfg(test)]
mod terminal_status_tests {
    use crate::error::BillingError;
    use crate::payment_detail::PaymentRequest;
    use crate::testing::TestHarness;
    use crate::work::{Category, ClassType, WorkStatus};

    // =========================================================================
    // Cancelled has no exits through any operation
    // =========================================================================
    #[tokio::test]
    async fn test_cancelled_work_rejects_everything() {
        let h = TestHarness::new();
        let mut work = h.new_work(Category::Classes, WorkStatus::Subscribed);
        work.class_type = Some(ClassType::SingleSession);
        h.store.put_work(work.clone());
        h.lifecycle.cancel(work.id).await.unwrap();

        assert!(matches!(
            h.lifecycle.confirm(work.id).await,
            Err(BillingError::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.lifecycle.use_single_session(work.id).await,
            Err(BillingError::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.lifecycle.cancel(work.id).await,
            Err(BillingError::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.lifecycle
                .request_payment(work.id, PaymentRequest::Full, None)
                .await,
            Err(BillingError::Validation(_))
        ));
        for status in WorkStatus::ALL {
            if status == WorkStatus::Cancelled {
                continue;
            }
            assert!(h.lifecycle.set_status_by_admin(work.id, status).await.is_err());
        }
        assert_eq!(h.store.work(work.id).unwrap().status, WorkStatus::Cancelled);
    }
}

#[cfg(test)]
mod renewal_tests {
    use crate::interval::SubscriptionInterval;
    use crate::sweep::RecurringBillingSweep;
    use crate::testing::TestHarness;
    use crate::work::{Category, PaymentStatus, SubscriptionTerm, WorkStatus};
    use time::{Duration, OffsetDateTime};

    fn subscribed_without_card(h: &TestHarness) -> uuid::Uuid {
        let now = OffsetDateTime::now_utc();
        let mut work = h.new_work(Category::Software, WorkStatus::Subscribed);
        let mut term = SubscriptionTerm::pending(12.0, SubscriptionInterval::Weekly);
        term.complete_subscription = false;
        term.date_activated = Some(now - Duration::days(7));
        term.next_payment = Some(now - Duration::minutes(5));
        work.subscription.push(term);
        h.store.put_work(work.clone());
        work.id
    }

    // =========================================================================
    // A due term without a card fails like a declined charge
    // =========================================================================
    #[tokio::test]
    async fn test_missing_card_marks_payments_failed() {
        let h = TestHarness::new();
        let work_id = subscribed_without_card(&h);

        let outcomes = RecurringBillingSweep::new(h.lifecycle.clone())
            .run(OffsetDateTime::now_utc())
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].charged);
        let stored = h.store.work(work_id).unwrap();
        assert_eq!(stored.status, WorkStatus::PaymentsFailed);
        assert_eq!(
            stored.current_term().unwrap().payment_history[0].status,
            PaymentStatus::Failed
        );
        assert!(h.gateway.charges().is_empty());
    }

    // =========================================================================
    // Admin restore re-anchors so the next sweep does not charge immediately
    // =========================================================================
    #[tokio::test]
    async fn test_restore_is_not_immediately_due() {
        let h = TestHarness::new();
        let work_id = subscribed_without_card(&h);
        let sweep = RecurringBillingSweep::new(h.lifecycle.clone());
        sweep.run(OffsetDateTime::now_utc()).await.unwrap();

        let restored = h
            .lifecycle
            .set_status_by_admin(work_id, WorkStatus::Subscribed)
            .await
            .unwrap();
        assert!(restored.next_payment_due().unwrap() > OffsetDateTime::now_utc() + Duration::days(6));

        let outcomes = sweep.run(OffsetDateTime::now_utc()).await.unwrap();
        assert!(outcomes.is_empty());
    }

    // =========================================================================
    // A card attached while Payments Failed is what the next renewal charges
    // =========================================================================
    #[tokio::test]
    async fn test_restored_subscription_charges_new_card() {
        let h = TestHarness::new();
        let work_id = subscribed_without_card(&h);
        let sweep = RecurringBillingSweep::new(h.lifecycle.clone());
        sweep.run(OffsetDateTime::now_utc()).await.unwrap();

        h.lifecycle
            .attach_payment_method(work_id, "pm_replacement")
            .await
            .unwrap();
        let restored = h
            .lifecycle
            .set_status_by_admin(work_id, WorkStatus::Subscribed)
            .await
            .unwrap();
        let due = restored.next_payment_due().unwrap();

        let outcomes = sweep.run(due + Duration::seconds(1)).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].charged);
        assert_eq!(h.gateway.charges()[0].payment_method_id, "pm_replacement");
        assert_eq!(h.store.work(work_id).unwrap().status, WorkStatus::Subscribed);
    }
}
