//! Stripe webhook handling
//!
//! Completed checkouts are reconciled through `WorkLifecycle::confirm_payment`.
//! Replays are harmless there: an already Completed history entry is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use stripe::{Event, EventObject, EventType, Webhook};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::lifecycle::WorkLifecycle;
use crate::work::{Category, Work};

pub struct WebhookHandler {
    lifecycle: Arc<WorkLifecycle>,
    secrets: HashMap<Category, String>,
}

impl WebhookHandler {
    pub fn new(lifecycle: Arc<WorkLifecycle>, secrets: HashMap<Category, String>) -> Self {
        Self { lifecycle, secrets }
    }

    /// Verify the `Stripe-Signature` header against the category's endpoint
    /// secret and parse the event
    pub fn verify_event(
        &self,
        category: Category,
        payload: &str,
        signature: &str,
    ) -> BillingResult<Event> {
        let secret = self.secrets.get(&category).ok_or_else(|| {
            BillingError::Config(format!("No webhook secret configured for {}", category))
        })?;

        Webhook::construct_event(payload, signature, secret).map_err(|e| {
            tracing::warn!(category = %category, error = %e, "Webhook signature rejected");
            BillingError::WebhookSignatureInvalid
        })
    }

    /// Handle a verified event. Returns the reconciled work when the event
    /// settled a payment.
    pub async fn handle_event(&self, event: Event) -> BillingResult<Option<Work>> {
        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        match event.type_ {
            EventType::CheckoutSessionCompleted => match event.data.object {
                EventObject::CheckoutSession(session) => {
                    let metadata = session.metadata.unwrap_or_default();
                    self.reconcile_checkout(&metadata).await
                }
                _ => {
                    tracing::warn!(event_id = %event.id, "Checkout event without a session object");
                    Ok(None)
                }
            },
            _ => {
                tracing::debug!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Ignoring unhandled Stripe event type"
                );
                Ok(None)
            }
        }
    }

    /// Settle the history entry named in a checkout's metadata.
    ///
    /// A session that is not paid yet (delayed payment methods) is left for a
    /// later event.
    pub async fn reconcile_checkout(
        &self,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<Option<Work>> {
        let (Some(work_id), Some(history_id)) = (
            metadata_uuid(metadata, "work_id"),
            metadata_uuid(metadata, "history_id"),
        ) else {
            tracing::info!("Checkout session without work metadata, ignoring");
            return Ok(None);
        };

        match self.lifecycle.confirm_payment(work_id, history_id).await {
            Ok(work) => Ok(Some(work)),
            Err(BillingError::PaymentNotSuccessful) => {
                tracing::info!(
                    work_id = %work_id,
                    history_id = %history_id,
                    "Checkout completed but not yet paid"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn metadata_uuid(metadata: &HashMap<String, String>, key: &str) -> Option<Uuid> {
    metadata.get(key).and_then(|v| Uuid::parse_str(v).ok())
}
