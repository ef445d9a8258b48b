//! Recurring billing sweep
//!
//! Charges every subscription whose current term is due. Works are processed
//! one at a time and a failure on one never stops the rest of the batch.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::lifecycle::WorkLifecycle;
use crate::work::WorkStatus;

/// What happened to one due work during a sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepOutcome {
    pub work_id: Uuid,
    pub charged: bool,
    pub next_payment: Option<String>,
    pub error: Option<String>,
}

pub struct RecurringBillingSweep {
    lifecycle: Arc<WorkLifecycle>,
}

impl RecurringBillingSweep {
    pub fn new(lifecycle: Arc<WorkLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// Charge all subscriptions due at `now`
    pub async fn run(&self, now: OffsetDateTime) -> BillingResult<Vec<SweepOutcome>> {
        let due: Vec<_> = self
            .lifecycle
            .store()
            .find_due_subscriptions(now)
            .await?
            .into_iter()
            .filter(|w| w.status == WorkStatus::Subscribed)
            .filter(|w| w.next_payment_due().is_some_and(|d| d <= now))
            .collect();

        tracing::info!(due = due.len(), "Starting recurring billing sweep");

        let mut outcomes = Vec::with_capacity(due.len());
        for work in due {
            let work_id = work.id;
            let outcome = match self.lifecycle.renew_subscription(work, now).await {
                Ok(renewed) => SweepOutcome {
                    work_id,
                    charged: true,
                    next_payment: renewed.next_payment_due().map(|d| d.to_string()),
                    error: None,
                },
                Err(e) => {
                    tracing::error!(work_id = %work_id, error = %e, "Renewal failed");
                    SweepOutcome {
                        work_id,
                        charged: false,
                        next_payment: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let charged = outcomes.iter().filter(|o| o.charged).count();
        tracing::info!(
            charged = charged,
            failed = outcomes.len() - charged,
            "Recurring billing sweep finished"
        );

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::SubscriptionInterval;
    use crate::testing::TestHarness;
    use crate::work::{Category, PaymentStatus, SubscriptionTerm, Work};
    use time::macros::datetime;

    fn due_work(h: &TestHarness, method: &str, due: OffsetDateTime) -> Work {
        let mut work = h.new_work(Category::Software, WorkStatus::Subscribed);
        let mut term = SubscriptionTerm::pending(49.0, SubscriptionInterval::Monthly);
        term.complete_subscription = false;
        term.created_date = Some(datetime!(2026-01-01 0:00 UTC));
        term.date_activated = Some(datetime!(2026-01-01 0:00 UTC));
        term.next_payment = Some(due);
        term.payment_method_id = Some(method.to_string());
        work.subscription.push(term);
        h.store.put_work(work.clone());
        work
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_batch() {
        let h = TestHarness::new();
        let now = datetime!(2026-02-01 6:00 UTC);
        let w1 = due_work(&h, "pm_one", datetime!(2026-02-01 0:00 UTC));
        let w2 = due_work(&h, "pm_two", datetime!(2026-02-01 1:00 UTC));
        let w3 = due_work(&h, "pm_three", datetime!(2026-02-01 2:00 UTC));
        h.gateway.fail_charges_for("pm_two");

        let sweep = RecurringBillingSweep::new(h.lifecycle.clone());
        let outcomes = sweep.run(now).await.unwrap();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes.iter().filter(|o| o.charged).count(), 2);

        for (work, due) in [
            (&w1, datetime!(2026-03-01 0:00 UTC)),
            (&w3, datetime!(2026-03-01 2:00 UTC)),
        ] {
            let stored = h.store.work(work.id).unwrap();
            assert_eq!(stored.status, WorkStatus::Subscribed);
            let term = stored.current_term().unwrap();
            assert_eq!(term.payment_history.len(), 1);
            assert_eq!(term.payment_history[0].status, PaymentStatus::Completed);
            assert_eq!(term.next_payment, Some(due));
        }

        let failed = h.store.work(w2.id).unwrap();
        assert_eq!(failed.status, WorkStatus::PaymentsFailed);
        let term = failed.current_term().unwrap();
        assert_eq!(term.next_payment, Some(datetime!(2026-02-01 1:00 UTC)));
        assert_eq!(term.payment_history.len(), 1);
        assert_eq!(term.payment_history[0].status, PaymentStatus::Failed);

        assert_eq!(h.notifier.count_kind("payment_receipt"), 2);
        assert_eq!(h.notifier.count_kind("billing_failed_customer"), 1);
        assert_eq!(h.notifier.count_kind("billing_failed_operator"), 1);
    }

    #[tokio::test]
    async fn test_not_yet_due_and_disabled_terms_are_skipped() {
        let h = TestHarness::new();
        let now = datetime!(2026-02-01 6:00 UTC);
        due_work(&h, "pm_future", datetime!(2026-02-02 0:00 UTC));
        let disabled = due_work(&h, "pm_disabled", datetime!(2026-01-20 0:00 UTC));
        let mut stored = h.store.work(disabled.id).unwrap();
        stored.subscription[0].date_disabled = Some(datetime!(2026-01-25 0:00 UTC));
        h.store.put_work(stored);

        let outcomes = RecurringBillingSweep::new(h.lifecycle.clone())
            .run(now)
            .await
            .unwrap();

        assert!(outcomes.is_empty());
        assert!(h.gateway.charges().is_empty());
    }

    #[tokio::test]
    async fn test_payments_failed_work_is_not_retried() {
        let h = TestHarness::new();
        let now = datetime!(2026-02-01 6:00 UTC);
        let work = due_work(&h, "pm_two", datetime!(2026-02-01 1:00 UTC));
        h.gateway.fail_charges_for("pm_two");
        let sweep = RecurringBillingSweep::new(h.lifecycle.clone());

        sweep.run(now).await.unwrap();
        let second = sweep.run(now + time::Duration::hours(1)).await.unwrap();

        assert!(second.is_empty());
        assert_eq!(h.store.work(work.id).unwrap().status, WorkStatus::PaymentsFailed);
        assert_eq!(h.notifier.count_kind("billing_failed_operator"), 1);
    }
}
