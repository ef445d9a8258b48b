//! Work lifecycle state machine
//!
//! Every status change of a work goes through `WorkLifecycle`. Each operation
//! reads the work, validates the transition, writes the whole document back
//! (version-checked), and only then sends notifications. Payment callbacks,
//! admin actions and the renewal sweep all re-enter through the same methods,
//! so confirm and cancel rules exist in exactly one place.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::{Notification, Notifier};
use crate::error::{BillingError, BillingResult};
use crate::interval::{add_interval, complete_subscription};
use crate::meeting::MeetingProvider;
use crate::payment_detail::{resolve_payment, PaymentRequest};
use crate::processor::PaymentProcessor;
use crate::store::WorkStore;
use crate::work::{
    ClassType, ItemStatus, PaymentHistoryEntry, PaymentStatus, PaymentType, UserContact, Work,
    WorkStatus,
};

/// Hosted checkout opened for a payment request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutLink {
    pub history_id: Uuid,
    pub session_id: String,
    pub url: String,
}

pub struct WorkLifecycle {
    store: Arc<dyn WorkStore>,
    processor: Arc<PaymentProcessor>,
    notifier: Arc<dyn Notifier>,
    meetings: Arc<dyn MeetingProvider>,
}

impl WorkLifecycle {
    pub fn new(
        store: Arc<dyn WorkStore>,
        processor: Arc<PaymentProcessor>,
        notifier: Arc<dyn Notifier>,
        meetings: Arc<dyn MeetingProvider>,
    ) -> Self {
        Self {
            store,
            processor,
            notifier,
            meetings,
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkStore> {
        &self.store
    }

    pub fn processor(&self) -> &Arc<PaymentProcessor> {
        &self.processor
    }

    pub async fn get_work(&self, work_id: Uuid) -> BillingResult<Work> {
        self.store.get_work(work_id).await
    }

    /// Confirmation Required → User Accepted or Subscribed.
    ///
    /// A pending subscription term needs a saved card unless it is free;
    /// that is checked first, then the initial payment must be settled. The
    /// pending term is activated and makes the work Subscribed, as does a
    /// single-session class.
    pub async fn confirm(&self, work_id: Uuid) -> BillingResult<Work> {
        let mut work = self.store.get_work(work_id).await?;

        if work.status != WorkStatus::ConfirmationRequired {
            return Err(BillingError::InvalidTransition {
                from: work.status,
                to: WorkStatus::UserAccepted,
            });
        }

        if let Some(term) = work.pending_term() {
            if term.payment > 0.0 && term.payment_method_id.is_none() {
                return Err(BillingError::PaymentMethodRequired);
            }
        }

        if !work.initial_payment_settled() {
            return Err(BillingError::PaymentRequired(format!(
                "Initial payment for work {} is outstanding",
                work_id
            )));
        }

        let now = OffsetDateTime::now_utc();
        let activated = activate_pending_term(&mut work, now)?;
        let single_session = work.class_type == Some(ClassType::SingleSession);

        work.status = if activated || single_session {
            WorkStatus::Subscribed
        } else {
            WorkStatus::UserAccepted
        };

        let work = self.store.save_work(&work).await?;

        tracing::info!(
            work_id = %work_id,
            status = %work.status,
            subscription_activated = activated,
            "Work confirmed"
        );

        if let Some(user) = self.contact(&work).await {
            self.notifier
                .send(Notification::WorkConfirmed {
                    email: user.email,
                    name: user.name,
                    work_id,
                    status: work.status.to_string(),
                })
                .await;
        }

        Ok(work)
    }

    /// Any non-terminal status → Cancelled, once the cancellation fee is settled
    pub async fn cancel(&self, work_id: Uuid) -> BillingResult<Work> {
        let mut work = self.store.get_work(work_id).await?;

        if work.status.is_terminal() {
            return Err(BillingError::InvalidTransition {
                from: work.status,
                to: WorkStatus::Cancelled,
            });
        }

        if !work.cancellation_payment_settled() {
            return Err(BillingError::PaymentRequired(format!(
                "Cancellation payment for work {} is outstanding",
                work_id
            )));
        }

        let now = OffsetDateTime::now_utc();
        work.cancellation_payment_status = ItemStatus::Completed;

        if let Some(term) = work.current_term_mut() {
            if term.is_enabled() {
                // Never before activation, or the term would look re-enabled
                let disabled_at = term.date_activated.map_or(now, |a| a.max(now));
                term.date_disabled = Some(disabled_at);
                term.complete_subscription = false;
            }
        }

        work.status = WorkStatus::Cancelled;
        let work = self.store.save_work(&work).await?;

        tracing::info!(work_id = %work_id, "Work cancelled");

        if let Some(meeting_id) = work.meeting_id.as_deref() {
            if let Err(e) = self.meetings.cancel_meeting(meeting_id).await {
                tracing::warn!(
                    work_id = %work_id,
                    meeting_id = meeting_id,
                    error = %e,
                    "Failed to cancel external meeting"
                );
            }
        }

        if let Some(user) = self.contact(&work).await {
            self.notifier
                .send(Notification::WorkCancelled {
                    email: user.email,
                    name: user.name,
                    work_id,
                })
                .await;
        }

        Ok(work)
    }

    /// Subscribed → In Use for a single-session class whose session is open
    pub async fn use_single_session(&self, work_id: Uuid) -> BillingResult<Work> {
        let mut work = self.store.get_work(work_id).await?;

        if work.class_type != Some(ClassType::SingleSession) {
            return Err(BillingError::Validation(format!(
                "Work {} is not a single-session class",
                work_id
            )));
        }

        if work.status != WorkStatus::Subscribed {
            return Err(BillingError::InvalidTransition {
                from: work.status,
                to: WorkStatus::InUse,
            });
        }

        let session = self
            .store
            .open_class_session(&work.service)
            .await?
            .filter(|s| s.come_in)
            .ok_or(BillingError::ClassClosed)?;

        work.status = WorkStatus::InUse;
        let work = self.store.save_work(&work).await?;

        tracing::info!(work_id = %work_id, service = %work.service, "Single session started");

        if let Some(user) = self.contact(&work).await {
            self.notifier
                .send(Notification::SessionCredentials {
                    email: user.email,
                    work_id,
                    join_url: session.join_url,
                    password: session.password,
                })
                .await;
        }

        Ok(work)
    }

    /// Reconcile a payment the gateway reports as done.
    ///
    /// The entry is checked against the gateway first; if it is not paid
    /// nothing is written. A confirmed entry is marked Completed and its
    /// effect applied. Confirmation and cancellation payments then drive the
    /// matching transition. A replay of an already Completed entry skips the
    /// gateway and the write but still runs that transition, so a follow-up
    /// that failed the first time can be retried through the same callback.
    pub async fn confirm_payment(&self, work_id: Uuid, history_id: Uuid) -> BillingResult<Work> {
        let work = self.store.get_work(work_id).await?;

        let entry = work.history_entry(history_id).cloned().ok_or_else(|| {
            BillingError::NotFound(format!("Payment {} not found on work {}", history_id, work_id))
        })?;

        let work = match entry.status {
            PaymentStatus::Completed => {
                tracing::debug!(
                    work_id = %work_id,
                    history_id = %history_id,
                    "Payment already reconciled"
                );
                work
            }
            PaymentStatus::Failed => return Err(BillingError::PaymentNotSuccessful),
            PaymentStatus::New => self.settle_entry(work, &entry).await?,
        };

        self.follow_up_payment(work, entry.payment_type).await
    }

    /// Mark a verified entry Completed, apply its effect and send the receipt
    async fn settle_entry(&self, mut work: Work, entry: &PaymentHistoryEntry) -> BillingResult<Work> {
        let work_id = work.id;
        let history_id = entry.id;

        let verified = self.processor.verify_payment(work.category, entry).await?;
        let now = OffsetDateTime::now_utc();

        if let Some(stored) = work.payment_history.iter_mut().find(|e| e.id == history_id) {
            stored.status = PaymentStatus::Completed;
            stored.settled_at = Some(now);
            if stored.payment_intent_id.is_none() {
                stored.payment_intent_id = verified.payment_intent_id.clone();
            }
        }

        apply_payment_effect(&mut work, entry);

        if let Some(method) = verified.payment_method_id.as_deref() {
            if let Some(term) = work.current_term_mut() {
                if term.complete_subscription
                    && term.date_disabled.is_none()
                    && term.payment_method_id.is_none()
                {
                    term.payment_method_id = Some(method.to_string());
                }
            }
        }

        let work = self.store.save_work(&work).await?;

        tracing::info!(
            work_id = %work_id,
            history_id = %history_id,
            payment_type = %entry.payment_type,
            amount = entry.amount,
            "Payment confirmed"
        );

        if let Some(user) = self.contact(&work).await {
            let last4 = match verified.payment_method_id.as_deref() {
                Some(method) => self
                    .processor
                    .get_last4_digits(work.category, method)
                    .await
                    .unwrap_or_default(),
                None => None,
            };
            self.notifier
                .send(Notification::PaymentReceipt {
                    email: user.email,
                    work_id,
                    amount: entry.amount,
                    description: entry.description.clone(),
                    last4,
                })
                .await;
        }

        Ok(work)
    }

    async fn follow_up_payment(&self, work: Work, payment_type: PaymentType) -> BillingResult<Work> {
        let work_id = work.id;
        let follow_up = match payment_type {
            PaymentType::Confirmation => self.confirm(work_id).await,
            PaymentType::Cancellation => self.cancel(work_id).await,
            _ => return Ok(work),
        };

        match follow_up {
            Ok(updated) => Ok(updated),
            Err(BillingError::InvalidTransition { from, to }) => {
                tracing::info!(
                    work_id = %work_id,
                    from = %from,
                    to = %to,
                    "Payment recorded without a status change"
                );
                Ok(work)
            }
            Err(e) => Err(e),
        }
    }

    /// Save a card for the work's subscription.
    ///
    /// The card is attached to the customer on the category's account and
    /// recorded on the current term, pending or active. Later renewals charge
    /// it instead of any earlier card.
    pub async fn attach_payment_method(
        &self,
        work_id: Uuid,
        payment_method_id: &str,
    ) -> BillingResult<Work> {
        let mut work = self.store.get_work(work_id).await?;

        ensure_open(&work)?;
        if payment_method_id.trim().is_empty() {
            return Err(BillingError::Validation(
                "payment_method_id must not be empty".to_string(),
            ));
        }
        if !work.current_term().is_some_and(|t| t.is_enabled()) {
            return Err(BillingError::Validation(format!(
                "Work {} has no subscription term to attach a card to",
                work_id
            )));
        }

        let user = self.store.get_user(work.user_id).await?;
        let last4 = self
            .processor
            .add_card(work.category, &user, payment_method_id)
            .await?;

        if let Some(term) = work.current_term_mut() {
            term.payment_method_id = Some(payment_method_id.to_string());
        }
        let work = self.store.save_work(&work).await?;

        tracing::info!(
            work_id = %work_id,
            last4 = ?last4,
            "Payment method attached to subscription"
        );

        Ok(work)
    }

    /// Open a hosted checkout for a payment request and record it as New
    pub async fn request_payment(
        &self,
        work_id: Uuid,
        request: PaymentRequest,
        currency: Option<&str>,
    ) -> BillingResult<CheckoutLink> {
        let mut work = self.store.get_work(work_id).await?;
        ensure_open(&work)?;

        let detail = resolve_payment(request, &work)?;
        if detail.amount <= 0.0 {
            return Err(BillingError::Validation(format!(
                "Nothing to pay for {} on work {}",
                request.payment_type(),
                work_id
            )));
        }

        let user = self.store.get_user(work.user_id).await?;
        let session = self
            .processor
            .create_checkout_session(&work, &user, &detail, currency)
            .await?;

        let url = session.url.clone().ok_or_else(|| {
            BillingError::PaymentFailed(format!("Checkout session {} has no URL", session.id))
        })?;

        let mut entry = detail.history_draft;
        entry.session_id = Some(session.id.clone());
        let history_id = entry.id;
        work.payment_history.push(entry);
        self.store.save_work(&work).await?;

        tracing::info!(
            work_id = %work_id,
            history_id = %history_id,
            session_id = %session.id,
            amount = detail.amount,
            "Payment requested"
        );

        Ok(CheckoutLink {
            history_id,
            session_id: session.id,
            url,
        })
    }

    /// Charge the saved card for a payment request, then reconcile it like
    /// any other payment.
    ///
    /// The New entry is saved before the gateway is called so a charge is
    /// never made without a record to reconcile it against. A declined charge
    /// marks that entry Failed.
    pub async fn pay_with_attached_card(
        &self,
        work_id: Uuid,
        request: PaymentRequest,
    ) -> BillingResult<Work> {
        let mut work = self.store.get_work(work_id).await?;
        ensure_open(&work)?;

        let detail = resolve_payment(request, &work)?;
        if detail.amount <= 0.0 {
            return Err(BillingError::Validation(format!(
                "Nothing to pay for {} on work {}",
                request.payment_type(),
                work_id
            )));
        }
        if work
            .current_term()
            .and_then(|t| t.payment_method_id.as_ref())
            .is_none()
        {
            return Err(BillingError::PaymentMethodRequired);
        }

        let user = self.store.get_user(work.user_id).await?;
        let history_id = detail.history_draft.id;
        work.payment_history.push(detail.history_draft.clone());
        let work = self.store.save_work(&work).await?;

        match self
            .processor
            .pay_via_attached_card(&work, &user, &detail)
            .await
        {
            Ok(intent) => {
                self.record_charge(work, history_id, &intent.id).await?;
                self.confirm_payment(work_id, history_id).await
            }
            Err(e) => {
                let mut failed = work;
                if let Some(entry) = failed
                    .payment_history
                    .iter_mut()
                    .find(|entry| entry.id == history_id)
                {
                    entry.status = PaymentStatus::Failed;
                    entry.settled_at = Some(OffsetDateTime::now_utc());
                }
                let _ = self.store.save_work(&failed).await.inspect_err(|save_err| {
                    tracing::error!(
                        work_id = %work_id,
                        history_id = %history_id,
                        error = %save_err,
                        "Could not mark saved card charge as failed"
                    );
                });

                tracing::warn!(
                    work_id = %work_id,
                    history_id = %history_id,
                    reason = %e,
                    "Charge on saved card failed"
                );
                Err(e)
            }
        }
    }

    /// Store the gateway intent on a pending entry. A concurrent write is
    /// retried once against the fresh document.
    async fn record_charge(
        &self,
        mut work: Work,
        history_id: Uuid,
        payment_intent_id: &str,
    ) -> BillingResult<Work> {
        let mut retried = false;
        loop {
            if let Some(entry) = work.payment_history.iter_mut().find(|e| e.id == history_id) {
                entry.payment_intent_id = Some(payment_intent_id.to_string());
            }

            match self.store.save_work(&work).await {
                Ok(saved) => return Ok(saved),
                Err(BillingError::ConcurrentModification) if !retried => {
                    retried = true;
                    work = self.store.get_work(work.id).await?;
                }
                Err(e) => {
                    tracing::error!(
                        work_id = %work.id,
                        history_id = %history_id,
                        payment_intent_id = %payment_intent_id,
                        error = %e,
                        "Saved card charged but the charge could not be recorded"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Charge one due subscription.
    ///
    /// Success saves the advanced term and emails a receipt. A failed charge
    /// records a Failed term entry, moves the work to Payments Failed, alerts
    /// customer and operator, and returns the charge error.
    pub async fn renew_subscription(
        &self,
        work: Work,
        now: OffsetDateTime,
    ) -> BillingResult<Work> {
        let work_id = work.id;
        let user = self.store.get_user(work.user_id).await?;
        let mut charged = work.clone();

        match self
            .processor
            .process_subscription_payment(&user, &mut charged, now)
            .await
        {
            Ok(entry) => {
                let saved = self.store.save_work(&charged).await.inspect_err(|e| {
                    tracing::error!(
                        work_id = %work_id,
                        payment_intent_id = ?entry.payment_intent_id,
                        error = %e,
                        "Subscription charged but renewal could not be saved"
                    );
                })?;

                let last4 = match saved.current_term().and_then(|t| t.payment_method_id.as_deref()) {
                    Some(method) => self
                        .processor
                        .get_last4_digits(saved.category, method)
                        .await
                        .unwrap_or_default(),
                    None => None,
                };

                self.notifier
                    .send(Notification::PaymentReceipt {
                        email: user.email,
                        work_id,
                        amount: entry.amount,
                        description: entry.description,
                        last4,
                    })
                    .await;

                Ok(saved)
            }
            Err(e @ (BillingError::PaymentFailed(_) | BillingError::PaymentMethodRequired)) => {
                let reason = e.to_string();
                let mut failed = work;
                let amount = failed.current_term().map(|t| t.payment).unwrap_or_default();

                let mut entry = PaymentHistoryEntry::draft(
                    PaymentType::Subscription,
                    amount,
                    &format!("Subscription Payment for Work ID {}", work_id),
                );
                entry.status = PaymentStatus::Failed;
                entry.settled_at = Some(now);
                if let Some(term) = failed.current_term_mut() {
                    term.payment_history.push(entry);
                }
                failed.status = WorkStatus::PaymentsFailed;
                self.store.save_work(&failed).await?;

                tracing::warn!(
                    work_id = %work_id,
                    amount = amount,
                    reason = %reason,
                    "Subscription renewal failed"
                );

                self.notifier
                    .send(Notification::BillingFailedCustomer {
                        email: user.email.clone(),
                        work_id,
                        amount,
                    })
                    .await;
                self.notifier
                    .send(Notification::BillingFailedOperator {
                        customer_email: user.email,
                        work_id,
                        amount,
                        reason,
                    })
                    .await;

                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Operator override of a work's status.
    ///
    /// Needs Attention is reachable from any open status. Restoring a
    /// Payments Failed work to Subscribed schedules the next charge one
    /// interval from now. Everything else follows the normal transition table.
    pub async fn set_status_by_admin(
        &self,
        work_id: Uuid,
        status: WorkStatus,
    ) -> BillingResult<Work> {
        let mut work = self.store.get_work(work_id).await?;
        let from = work.status;

        if from == status {
            return Ok(work);
        }

        if !from.can_transition_to(status) {
            return Err(BillingError::InvalidTransition { from, to: status });
        }

        if matches!(status, WorkStatus::UserAccepted | WorkStatus::Subscribed)
            && !work.initial_payment_settled()
        {
            return Err(BillingError::PaymentRequired(format!(
                "Initial payment for work {} is outstanding",
                work_id
            )));
        }

        if from == WorkStatus::PaymentsFailed && status == WorkStatus::Subscribed {
            let now = OffsetDateTime::now_utc();
            let term = work
                .current_term_mut()
                .filter(|t| t.is_active())
                .ok_or_else(|| {
                    BillingError::Validation(format!(
                        "Work {} has no active subscription term to restore",
                        work_id
                    ))
                })?;
            term.next_payment = Some(add_interval(now, term.interval)?);
        }

        work.status = status;
        let work = self.store.save_work(&work).await?;

        tracing::info!(
            work_id = %work_id,
            from = %from,
            to = %status,
            "Work status set by admin"
        );

        Ok(work)
    }

    async fn contact(&self, work: &Work) -> Option<UserContact> {
        match self.store.get_user(work.user_id).await {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::warn!(
                    work_id = %work.id,
                    user_id = %work.user_id,
                    error = %e,
                    "Could not load user for notification"
                );
                None
            }
        }
    }
}

fn ensure_open(work: &Work) -> BillingResult<()> {
    if work.status.is_terminal() {
        return Err(BillingError::Validation(format!(
            "Work {} is {} and takes no payments",
            work.id, work.status
        )));
    }
    Ok(())
}

/// Activate the pending term, disabling any other enabled term first.
/// Returns whether a term was activated.
fn activate_pending_term(work: &mut Work, now: OffsetDateTime) -> BillingResult<bool> {
    if work.pending_term().is_none() {
        return Ok(false);
    }

    let last = work.subscription.len() - 1;
    for term in work.subscription[..last].iter_mut() {
        if term.is_enabled() {
            term.date_disabled = Some(term.date_activated.map_or(now, |a| a.max(now)));
        }
    }

    if let Some(term) = work.current_term_mut() {
        complete_subscription(term, now)?;
    }
    Ok(true)
}

fn apply_payment_effect(work: &mut Work, entry: &PaymentHistoryEntry) {
    match entry.payment_type {
        PaymentType::Confirmation => work.initial_payment_status = ItemStatus::Completed,
        PaymentType::PaymentItem => {
            if let Some(item) = work
                .payment_items
                .iter_mut()
                .find(|i| Some(i.id) == entry.payment_item_id)
            {
                item.status = ItemStatus::Completed;
            }
        }
        PaymentType::Full => {
            for item in work
                .payment_items
                .iter_mut()
                .filter(|i| entry.payment_item_ids.contains(&i.id))
            {
                item.status = ItemStatus::Completed;
            }
        }
        PaymentType::Cancellation => work.cancellation_payment_status = ItemStatus::Completed,
        PaymentType::Subscription => {}
    }
}
