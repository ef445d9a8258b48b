//! Work consistency checks
//!
//! Read-only checks that can be run against a single work after any mutation,
//! or across the whole store by the worker's daily audit.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::WorkStore;
use crate::work::{PaymentStatus, Work, WorkStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub work_id: Uuid,
    pub description: String,
    /// Extra debugging context
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Customer may be charged incorrectly
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub works_checked: usize,
    pub checks_run: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

pub struct InvariantChecker {
    store: Arc<dyn WorkStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn WorkStore>) -> Self {
        Self { store }
    }

    /// Run every check on one work
    pub fn check_work(work: &Work) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        violations.extend(check_status_requires_initial_payment(work));
        violations.extend(check_single_active_term(work));
        violations.extend(check_subscribed_has_enabled_term(work));
        violations.extend(check_completed_payments_have_reference(work));
        violations
    }

    /// Run every check across all stored works
    pub async fn check_all(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let works = self.store.list_works().await?;

        let violations: Vec<InvariantViolation> =
            works.iter().flat_map(Self::check_work).collect();

        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        for violation in &violations {
            tracing::warn!(
                invariant = %violation.invariant,
                work_id = %violation.work_id,
                severity = %violation.severity,
                "{}",
                violation.description
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            works_checked: works.len(),
            checks_run: Self::available_checks().len(),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "status_requires_initial_payment",
            "single_active_term",
            "subscribed_has_enabled_term",
            "completed_payment_has_reference",
        ]
    }
}

/// User Accepted and Subscribed are only reachable once the initial payment
/// is settled
fn check_status_requires_initial_payment(work: &Work) -> Option<InvariantViolation> {
    let gated = matches!(work.status, WorkStatus::UserAccepted | WorkStatus::Subscribed);
    if !gated || work.initial_payment_settled() {
        return None;
    }

    Some(InvariantViolation {
        invariant: "status_requires_initial_payment".to_string(),
        work_id: work.id,
        description: format!(
            "Work is {} but its initial payment of {:.2} is {:?}",
            work.status, work.initial_payment, work.initial_payment_status
        ),
        context: serde_json::json!({
            "status": work.status,
            "initial_payment": work.initial_payment,
            "initial_payment_status": work.initial_payment_status,
        }),
        severity: ViolationSeverity::Critical,
    })
}

/// Two active terms would bill the customer twice
fn check_single_active_term(work: &Work) -> Option<InvariantViolation> {
    let active = work.subscription.iter().filter(|t| t.is_active()).count();
    if active <= 1 {
        return None;
    }

    Some(InvariantViolation {
        invariant: "single_active_term".to_string(),
        work_id: work.id,
        description: format!("Work has {} active subscription terms (expected at most 1)", active),
        context: serde_json::json!({ "active_terms": active }),
        severity: ViolationSeverity::Critical,
    })
}

fn check_subscribed_has_enabled_term(work: &Work) -> Option<InvariantViolation> {
    if work.status != WorkStatus::Subscribed || work.subscription.is_empty() {
        return None;
    }
    if work.current_term().is_some_and(|t| t.is_enabled()) {
        return None;
    }

    Some(InvariantViolation {
        invariant: "subscribed_has_enabled_term".to_string(),
        work_id: work.id,
        description: "Work is Subscribed but its current term is disabled".to_string(),
        context: serde_json::json!({ "terms": work.subscription.len() }),
        severity: ViolationSeverity::High,
    })
}

fn check_completed_payments_have_reference(work: &Work) -> Vec<InvariantViolation> {
    let term_entries = work.subscription.iter().flat_map(|t| t.payment_history.iter());

    work.payment_history
        .iter()
        .chain(term_entries)
        .filter(|e| e.status == PaymentStatus::Completed && e.gateway_reference().is_none())
        .map(|e| InvariantViolation {
            invariant: "completed_payment_has_reference".to_string(),
            work_id: work.id,
            description: format!(
                "{} payment {} is Completed without a gateway reference",
                e.payment_type, e.id
            ),
            context: serde_json::json!({ "history_id": e.id, "amount": e.amount }),
            severity: ViolationSeverity::Medium,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::SubscriptionInterval;
    use crate::testing::MemoryWorkStore;
    use crate::work::{
        Category, ItemStatus, PaymentHistoryEntry, PaymentType, SubscriptionTerm,
    };
    use time::macros::datetime;

    fn active_term() -> SubscriptionTerm {
        let mut term = SubscriptionTerm::pending(10.0, SubscriptionInterval::Weekly);
        term.complete_subscription = false;
        term.date_activated = Some(datetime!(2026-01-01 0:00 UTC));
        term.next_payment = Some(datetime!(2026-01-08 0:00 UTC));
        term
    }

    fn work(status: WorkStatus) -> Work {
        Work::new(Uuid::new_v4(), Category::Software, "hosting", status)
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_healthy_work_has_no_violations() {
        let mut w = work(WorkStatus::Subscribed);
        w.subscription.push(active_term());
        assert!(InvariantChecker::check_work(&w).is_empty());
    }

    #[test]
    fn test_unpaid_initial_payment_is_critical() {
        let mut w = work(WorkStatus::UserAccepted);
        w.initial_payment = 100.0;
        w.initial_payment_status = ItemStatus::Incomplete;

        let violations = InvariantChecker::check_work(&w);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, "status_requires_initial_payment");
        assert_eq!(violations[0].severity, ViolationSeverity::Critical);
    }

    #[test]
    fn test_two_active_terms() {
        let mut w = work(WorkStatus::Subscribed);
        w.subscription.push(active_term());
        w.subscription.push(active_term());

        let violations = InvariantChecker::check_work(&w);
        assert!(violations.iter().any(|v| v.invariant == "single_active_term"));
    }

    #[test]
    fn test_subscribed_with_disabled_term() {
        let mut w = work(WorkStatus::Subscribed);
        let mut term = active_term();
        term.date_disabled = Some(datetime!(2026-02-01 0:00 UTC));
        w.subscription.push(term);

        let violations = InvariantChecker::check_work(&w);
        assert!(violations.iter().any(|v| v.invariant == "subscribed_has_enabled_term"));
    }

    #[test]
    fn test_completed_entry_without_reference() {
        let mut w = work(WorkStatus::UserAccepted);
        let mut entry = PaymentHistoryEntry::draft(PaymentType::PaymentItem, 20.0, "Logo");
        entry.status = PaymentStatus::Completed;
        w.payment_history.push(entry);

        let violations = InvariantChecker::check_work(&w);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, ViolationSeverity::Medium);
    }

    #[tokio::test]
    async fn test_check_all_summarizes_store() {
        let store = Arc::new(MemoryWorkStore::new());
        let mut broken = work(WorkStatus::Subscribed);
        broken.initial_payment = 50.0;
        store.put_work(broken);
        store.put_work(work(WorkStatus::Meeting));

        let summary = InvariantChecker::new(store).check_all().await.unwrap();
        assert_eq!(summary.works_checked, 2);
        assert_eq!(summary.checks_failed, 1);
        assert!(!summary.healthy);
    }
}
