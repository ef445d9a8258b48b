//! Payment processor
//!
//! Business-level payment operations on top of the per-category gateway
//! accounts. The processor never touches the store: callers hand it the work
//! and persist whatever it changed.

use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChargeRequest, CheckoutRequest, CheckoutSessionSummary, GatewayAccounts, GatewayLineItem,
    PaymentGateway, PaymentIntentSummary,
};
use crate::interval::add_interval;
use crate::payment_detail::{to_minor_units, PaymentDetail};
use crate::work::{
    Category, PaymentHistoryEntry, PaymentStatus, PaymentType, UserContact, Work,
};

/// Result of checking a history entry against the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedPayment {
    pub payment_intent_id: Option<String>,
    /// Method used for the payment, when the gateway reports one
    pub payment_method_id: Option<String>,
}

pub struct PaymentProcessor {
    accounts: GatewayAccounts,
    app_base_url: String,
    default_currency: String,
}

impl PaymentProcessor {
    pub fn new(accounts: GatewayAccounts, app_base_url: &str, default_currency: &str) -> Self {
        Self {
            accounts,
            app_base_url: app_base_url.trim_end_matches('/').to_string(),
            default_currency: default_currency.to_lowercase(),
        }
    }

    pub fn default_currency(&self) -> &str {
        &self.default_currency
    }

    fn gateway(&self, category: Category) -> BillingResult<&dyn PaymentGateway> {
        self.accounts.for_category(category)
    }

    /// Find the customer by email on the category's account, creating it if absent
    pub async fn create_customer(
        &self,
        category: Category,
        user: &UserContact,
    ) -> BillingResult<String> {
        let gateway = self.gateway(category)?;

        if let Some(existing) = gateway.find_customer_by_email(&user.email).await? {
            return Ok(existing);
        }

        gateway.create_customer(&user.email, &user.name).await
    }

    /// Attach a card to the user's customer and return its last four digits
    pub async fn add_card(
        &self,
        category: Category,
        user: &UserContact,
        payment_method_id: &str,
    ) -> BillingResult<Option<String>> {
        let customer_id = self.create_customer(category, user).await?;
        let gateway = self.gateway(category)?;

        gateway
            .attach_payment_method(&customer_id, payment_method_id)
            .await?;

        tracing::info!(
            user_id = %user.id,
            category = %category,
            "Attached payment method"
        );

        gateway.payment_method_last4(payment_method_id).await
    }

    pub async fn remove_card(&self, category: Category, payment_method_id: &str) -> BillingResult<()> {
        self.gateway(category)?
            .detach_payment_method(payment_method_id)
            .await
    }

    /// Open a hosted checkout for `detail`.
    ///
    /// When the work has a pending subscription term without a saved method,
    /// the card is kept on file for later renewals.
    pub async fn create_checkout_session(
        &self,
        work: &Work,
        user: &UserContact,
        detail: &PaymentDetail,
        currency: Option<&str>,
    ) -> BillingResult<CheckoutSessionSummary> {
        let customer_id = self.create_customer(work.category, user).await?;

        let save_payment_method = detail.history_draft.payment_type == PaymentType::Confirmation
            && work
                .pending_term()
                .map(|t| t.payment_method_id.is_none())
                .unwrap_or(false);

        let request = CheckoutRequest {
            customer_id,
            currency: currency
                .map(str::to_lowercase)
                .unwrap_or_else(|| self.default_currency.clone()),
            amount_minor: detail.amount_minor(),
            description: detail.description.clone(),
            work_id: work.id,
            history_id: detail.history_draft.id,
            success_url: format!(
                "{}/works/{}?payment=success&history_id={}",
                self.app_base_url, work.id, detail.history_draft.id
            ),
            cancel_url: format!("{}/works/{}?payment=cancelled", self.app_base_url, work.id),
            save_payment_method,
        };

        self.gateway(work.category)?
            .create_checkout_session(request)
            .await
    }

    /// Charge the current term's saved card for `detail`.
    ///
    /// An intent that does not succeed immediately counts as a failure.
    pub async fn pay_via_attached_card(
        &self,
        work: &Work,
        user: &UserContact,
        detail: &PaymentDetail,
    ) -> BillingResult<PaymentIntentSummary> {
        let payment_method_id = work
            .current_term()
            .and_then(|t| t.payment_method_id.clone())
            .ok_or(BillingError::PaymentMethodRequired)?;

        let customer_id = self.create_customer(work.category, user).await?;

        let intent = self
            .gateway(work.category)?
            .create_payment_intent(ChargeRequest {
                customer_id,
                payment_method_id,
                currency: self.default_currency.clone(),
                amount_minor: detail.amount_minor(),
                description: detail.description.clone(),
                work_id: work.id,
                idempotency_key: detail.history_draft.id.to_string(),
            })
            .await?;

        if !intent.succeeded {
            return Err(BillingError::PaymentFailed(format!(
                "Payment intent {} ended in status {}",
                intent.id, intent.status
            )));
        }

        Ok(intent)
    }

    /// Charge the work's current term and advance its next billing date.
    ///
    /// On success a Completed entry is appended to the term history and
    /// `next_payment` moves forward by one interval from the previous due date
    /// (or from `now` if that still leaves it in the past). On failure the
    /// work is left untouched; recording the failure is the caller's job.
    pub async fn process_subscription_payment(
        &self,
        user: &UserContact,
        work: &mut Work,
        now: OffsetDateTime,
    ) -> BillingResult<PaymentHistoryEntry> {
        let work_id = work.id;
        let category = work.category;
        let term = work
            .current_term()
            .filter(|t| t.is_active())
            .ok_or_else(|| {
                BillingError::Validation(format!("Work {} has no active subscription term", work_id))
            })?;

        let payment_method_id = term
            .payment_method_id
            .clone()
            .ok_or(BillingError::PaymentMethodRequired)?;
        let amount = term.payment;
        let interval = term.interval;
        let due = term.next_payment.unwrap_or(now);

        let description = format!("Subscription Payment for Work ID {}", work_id);
        let mut entry = PaymentHistoryEntry::draft(PaymentType::Subscription, amount, &description);

        let customer_id = self.create_customer(category, user).await?;
        let intent = self
            .gateway(category)?
            .create_payment_intent(ChargeRequest {
                customer_id,
                payment_method_id,
                currency: self.default_currency.clone(),
                amount_minor: to_minor_units(amount),
                description,
                work_id,
                idempotency_key: format!("{}-{}", work_id, due.unix_timestamp()),
            })
            .await?;

        if !intent.succeeded {
            return Err(BillingError::PaymentFailed(format!(
                "Payment intent {} ended in status {}",
                intent.id, intent.status
            )));
        }

        let mut next = add_interval(due, interval)?;
        if next <= now {
            next = add_interval(now, interval)?;
        }

        entry.payment_intent_id = Some(intent.id);
        entry.status = PaymentStatus::Completed;
        entry.settled_at = Some(now);

        if let Some(term) = work.current_term_mut() {
            term.payment_history.push(entry.clone());
            term.next_payment = Some(next);
        }

        tracing::info!(
            work_id = %work_id,
            amount = amount,
            next_payment = %next,
            "Processed subscription payment"
        );

        Ok(entry)
    }

    /// Check with the gateway that the entry's payment actually went through
    pub async fn verify_payment(
        &self,
        category: Category,
        entry: &PaymentHistoryEntry,
    ) -> BillingResult<VerifiedPayment> {
        let gateway = self.gateway(category)?;

        if let Some(intent_id) = entry.payment_intent_id.as_deref() {
            let intent = gateway.retrieve_payment_intent(intent_id).await?;
            if !intent.succeeded {
                return Err(BillingError::PaymentNotSuccessful);
            }
            return Ok(VerifiedPayment {
                payment_intent_id: Some(intent.id),
                payment_method_id: intent.payment_method_id,
            });
        }

        if let Some(session_id) = entry.session_id.as_deref() {
            let session = gateway.retrieve_checkout_session(session_id).await?;
            if !session.paid {
                return Err(BillingError::PaymentNotSuccessful);
            }
            return Ok(VerifiedPayment {
                payment_intent_id: session.payment_intent_id,
                payment_method_id: session.payment_method_id,
            });
        }

        Err(BillingError::PaymentNotSuccessful)
    }

    pub async fn get_checkout_session(
        &self,
        category: Category,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionSummary> {
        self.gateway(category)?
            .retrieve_checkout_session(session_id)
            .await
    }

    pub async fn get_payment_intent(
        &self,
        category: Category,
        payment_intent_id: &str,
    ) -> BillingResult<PaymentIntentSummary> {
        self.gateway(category)?
            .retrieve_payment_intent(payment_intent_id)
            .await
    }

    pub async fn get_last4_digits(
        &self,
        category: Category,
        payment_method_id: &str,
    ) -> BillingResult<Option<String>> {
        self.gateway(category)?
            .payment_method_last4(payment_method_id)
            .await
    }

    pub async fn get_line_items(
        &self,
        category: Category,
        session_id: &str,
    ) -> BillingResult<Vec<GatewayLineItem>> {
        self.gateway(category)?.checkout_line_items(session_id).await
    }

    /// All payment intents for the user on the category's account, newest first
    pub async fn get_sub_payment_history(
        &self,
        category: Category,
        user: &UserContact,
    ) -> BillingResult<Vec<PaymentIntentSummary>> {
        let gateway = self.gateway(category)?;
        let Some(customer_id) = gateway.find_customer_by_email(&user.email).await? else {
            return Ok(Vec::new());
        };

        let mut intents = gateway.list_payment_intents(&customer_id).await?;
        intents.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(intents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::SubscriptionInterval;
    use crate::payment_detail::{resolve_payment, PaymentRequest};
    use crate::testing::FakeGateway;
    use crate::work::{SubscriptionTerm, WorkStatus};
    use std::sync::Arc;
    use time::macros::datetime;
    use uuid::Uuid;

    fn processor(gateway: Arc<FakeGateway>) -> PaymentProcessor {
        PaymentProcessor::new(GatewayAccounts::shared(gateway), "https://app.test/", "USD")
    }

    fn user() -> UserContact {
        UserContact {
            id: Uuid::new_v4(),
            email: "ada@example.com".to_string(),
            name: "Ada".to_string(),
        }
    }

    fn subscribed_work(due: OffsetDateTime) -> Work {
        let mut work = Work::new(Uuid::new_v4(), Category::Software, "hosting", WorkStatus::Subscribed);
        let mut term = SubscriptionTerm::pending(49.0, SubscriptionInterval::Monthly);
        term.complete_subscription = false;
        term.date_activated = Some(datetime!(2026-01-15 0:00 UTC));
        term.next_payment = Some(due);
        term.payment_method_id = Some("pm_card".to_string());
        work.subscription.push(term);
        work
    }

    #[tokio::test]
    async fn test_create_customer_reuses_existing() {
        let gateway = Arc::new(FakeGateway::new());
        let p = processor(gateway.clone());
        let u = user();

        let first = p.create_customer(Category::Software, &u).await.unwrap();
        let second = p.create_customer(Category::Software, &u).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.customer_count(), 1);
    }

    #[tokio::test]
    async fn test_add_and_remove_card() {
        let gateway = Arc::new(FakeGateway::new());
        let p = processor(gateway.clone());
        let u = user();

        let last4 = p.add_card(Category::Photography, &u, "pm_visa").await.unwrap();
        assert_eq!(last4.as_deref(), Some("4242"));
        assert_eq!(gateway.attached().len(), 1);
        assert_eq!(gateway.attached()[0].1, "pm_visa");

        p.remove_card(Category::Photography, "pm_visa").await.unwrap();
        assert_eq!(gateway.detached(), vec!["pm_visa".to_string()]);
    }

    #[tokio::test]
    async fn test_declined_intent_is_a_failure() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.decline_charges_for("pm_card");
        let p = processor(gateway);
        let mut work = subscribed_work(datetime!(2026-02-15 0:00 UTC));

        let result = p
            .process_subscription_payment(&user(), &mut work, datetime!(2026-02-15 1:00 UTC))
            .await;
        assert!(matches!(result, Err(BillingError::PaymentFailed(_))));
        assert!(work.current_term().unwrap().payment_history.is_empty());
    }

    #[tokio::test]
    async fn test_checkout_saves_card_for_pending_term() {
        let gateway = Arc::new(FakeGateway::new());
        let p = processor(gateway.clone());
        let mut work = Work::new(Uuid::new_v4(), Category::Software, "hosting", WorkStatus::ConfirmationRequired);
        work.initial_payment = 100.0;
        work.subscription.push(SubscriptionTerm::pending(49.0, SubscriptionInterval::Monthly));

        let detail = resolve_payment(PaymentRequest::Confirmation, &work).unwrap();
        let session = p
            .create_checkout_session(&work, &user(), &detail, None)
            .await
            .unwrap();

        assert!(session.url.is_some());
        let request = gateway.last_checkout().unwrap();
        assert!(request.save_payment_method);
        assert_eq!(request.amount_minor, 10_000);
        assert_eq!(request.currency, "usd");
        assert!(request.success_url.starts_with("https://app.test/works/"));
    }

    #[tokio::test]
    async fn test_pay_via_attached_card_requires_method() {
        let p = processor(Arc::new(FakeGateway::new()));
        let mut work = Work::new(Uuid::new_v4(), Category::Software, "hosting", WorkStatus::Subscribed);
        work.payment_items.push(crate::work::LineItem::new("Extra page", 30.0));
        work.subscription.push(SubscriptionTerm::pending(49.0, SubscriptionInterval::Monthly));

        let detail = resolve_payment(PaymentRequest::Full, &work).unwrap();
        assert!(matches!(
            p.pay_via_attached_card(&work, &user(), &detail).await,
            Err(BillingError::PaymentMethodRequired)
        ));
    }

    #[tokio::test]
    async fn test_subscription_payment_advances_from_due_date() {
        let gateway = Arc::new(FakeGateway::new());
        let p = processor(gateway.clone());
        let mut work = subscribed_work(datetime!(2026-02-15 0:00 UTC));

        let entry = p
            .process_subscription_payment(&user(), &mut work, datetime!(2026-02-15 1:00 UTC))
            .await
            .unwrap();

        assert_eq!(entry.status, PaymentStatus::Completed);
        assert_eq!(entry.payment_type, PaymentType::Subscription);
        let term = work.current_term().unwrap();
        assert_eq!(term.payment_history.len(), 1);
        assert_eq!(term.next_payment, Some(datetime!(2026-03-15 0:00 UTC)));
        assert_eq!(gateway.charges().len(), 1);
        assert_eq!(gateway.charges()[0].amount_minor, 4900);
    }

    #[tokio::test]
    async fn test_subscription_payment_reanchors_when_far_behind() {
        let p = processor(Arc::new(FakeGateway::new()));
        let mut work = subscribed_work(datetime!(2026-01-01 0:00 UTC));
        let now = datetime!(2026-06-10 12:00 UTC);

        p.process_subscription_payment(&user(), &mut work, now)
            .await
            .unwrap();

        assert_eq!(
            work.current_term().unwrap().next_payment,
            Some(datetime!(2026-07-10 12:00 UTC))
        );
    }

    #[tokio::test]
    async fn test_subscription_payment_failure_leaves_work_untouched() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.fail_charges_for("hosting-fail");
        let p = processor(gateway);
        let mut work = subscribed_work(datetime!(2026-02-15 0:00 UTC));
        work.current_term_mut().unwrap().payment_method_id = Some("hosting-fail".to_string());
        let before = work.clone();

        let result = p
            .process_subscription_payment(&user(), &mut work, datetime!(2026-02-15 1:00 UTC))
            .await;
        assert!(matches!(result, Err(BillingError::PaymentFailed(_))));
        assert_eq!(work, before);
    }

    #[tokio::test]
    async fn test_verify_payment_reports_unpaid_session() {
        let gateway = Arc::new(FakeGateway::new());
        let p = processor(gateway.clone());
        let mut entry = PaymentHistoryEntry::draft(PaymentType::Confirmation, 10.0, "x");
        entry.session_id = Some("cs_unpaid".to_string());
        gateway.set_session_paid("cs_unpaid", false);

        assert!(matches!(
            p.verify_payment(Category::Software, &entry).await,
            Err(BillingError::PaymentNotSuccessful)
        ));

        gateway.set_session_paid("cs_unpaid", true);
        assert!(p.verify_payment(Category::Software, &entry).await.is_ok());
    }

    #[tokio::test]
    async fn test_checkout_session_and_line_items_lookup() {
        let gateway = Arc::new(FakeGateway::new());
        let p = processor(gateway.clone());
        let mut work = Work::new(Uuid::new_v4(), Category::Photography, "portraits", WorkStatus::UserAccepted);
        work.payment_items.push(crate::work::LineItem::new("Prints", 30.0));
        let item_id = work.payment_items[0].id;

        let detail = resolve_payment(PaymentRequest::PaymentItem(item_id), &work).unwrap();
        let created = p
            .create_checkout_session(&work, &user(), &detail, Some("EUR"))
            .await
            .unwrap();

        let fetched = p
            .get_checkout_session(Category::Photography, &created.id)
            .await
            .unwrap();
        assert_eq!(fetched.id, created.id);
        assert!(!fetched.paid);
        assert_eq!(fetched.amount_total, Some(3000));
        assert_eq!(gateway.last_checkout().unwrap().currency, "eur");

        let items = p
            .get_line_items(Category::Photography, &created.id)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].amount_total, 3000);

        assert!(matches!(
            p.get_checkout_session(Category::Photography, "cs_missing").await,
            Err(BillingError::PaymentFailed(_))
        ));
        assert!(matches!(
            p.get_line_items(Category::Photography, "cs_missing").await,
            Err(BillingError::PaymentFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_payment_intent_lookup_after_charge() {
        let gateway = Arc::new(FakeGateway::new());
        let p = processor(gateway.clone());
        let mut work = subscribed_work(datetime!(2026-02-15 0:00 UTC));
        work.payment_items.push(crate::work::LineItem::new("Extra page", 30.0));

        let detail = resolve_payment(PaymentRequest::Full, &work).unwrap();
        let intent = p
            .pay_via_attached_card(&work, &user(), &detail)
            .await
            .unwrap();

        let fetched = p
            .get_payment_intent(Category::Software, &intent.id)
            .await
            .unwrap();
        assert_eq!(fetched, intent);
        assert!(fetched.succeeded);
        assert_eq!(fetched.amount, 3000);
        assert_eq!(fetched.payment_method_id.as_deref(), Some("pm_card"));
        assert_eq!(
            gateway.charges()[0].idempotency_key,
            detail.history_draft.id.to_string()
        );

        assert!(matches!(
            p.get_payment_intent(Category::Software, "pi_missing").await,
            Err(BillingError::PaymentFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_sub_payment_history_without_customer_is_empty() {
        let p = processor(Arc::new(FakeGateway::new()));
        let history = p
            .get_sub_payment_history(Category::Classes, &user())
            .await
            .unwrap();
        assert!(history.is_empty());
    }
}
