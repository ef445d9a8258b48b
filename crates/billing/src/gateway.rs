//! Payment gateway seam
//!
//! Every business category bills through its own gateway account. The
//! lifecycle only ever sees `dyn PaymentGateway`; the Stripe implementation
//! lives in [`crate::client`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::work::Category;

/// Hosted checkout request for a one-off payment
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub customer_id: String,
    pub currency: String,
    pub amount_minor: i64,
    pub description: String,
    pub work_id: Uuid,
    pub history_id: Uuid,
    pub success_url: String,
    pub cancel_url: String,
    /// Keep the card on file for later off-session subscription charges
    pub save_payment_method: bool,
}

/// Server-initiated charge against a saved payment method
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub customer_id: String,
    pub payment_method_id: String,
    pub currency: String,
    pub amount_minor: i64,
    pub description: String,
    pub work_id: Uuid,
    /// Idempotency key so retried requests cannot charge twice
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSessionSummary {
    pub id: String,
    pub url: Option<String>,
    pub paid: bool,
    pub amount_total: Option<i64>,
    pub payment_intent_id: Option<String>,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntentSummary {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub succeeded: bool,
    pub payment_method_id: Option<String>,
    pub description: Option<String>,
    /// Unix seconds
    pub created: i64,
}

/// Line item on a completed checkout, used for receipts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayLineItem {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub amount_total: i64,
    #[serde(default)]
    pub quantity: Option<u64>,
}

/// Operations the billing core needs from a payment gateway account
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<String>>;

    async fn create_customer(&self, email: &str, name: &str) -> BillingResult<String>;

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()>;

    async fn detach_payment_method(&self, payment_method_id: &str) -> BillingResult<()>;

    /// Last four digits of a card payment method, if it is a card
    async fn payment_method_last4(&self, payment_method_id: &str)
        -> BillingResult<Option<String>>;

    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutSessionSummary>;

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionSummary>;

    async fn checkout_line_items(&self, session_id: &str) -> BillingResult<Vec<GatewayLineItem>>;

    async fn create_payment_intent(
        &self,
        request: ChargeRequest,
    ) -> BillingResult<PaymentIntentSummary>;

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<PaymentIntentSummary>;

    async fn list_payment_intents(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<PaymentIntentSummary>>;
}

/// Typed mapping from every category to its gateway account.
///
/// Construction fails if any category is missing, so lookups never fail at
/// request time.
#[derive(Clone)]
pub struct GatewayAccounts {
    accounts: HashMap<Category, Arc<dyn PaymentGateway>>,
}

impl GatewayAccounts {
    pub fn new(accounts: HashMap<Category, Arc<dyn PaymentGateway>>) -> BillingResult<Self> {
        let missing: Vec<&str> = Category::ALL
            .iter()
            .filter(|c| !accounts.contains_key(c))
            .map(|c| c.as_str())
            .collect();

        if !missing.is_empty() {
            return Err(BillingError::Config(format!(
                "No payment gateway account configured for: {}",
                missing.join(", ")
            )));
        }

        Ok(Self { accounts })
    }

    /// Route every category to the same gateway (single-account setups and tests)
    pub fn shared(gateway: Arc<dyn PaymentGateway>) -> Self {
        let accounts = Category::ALL
            .into_iter()
            .map(|c| (c, gateway.clone()))
            .collect();
        Self { accounts }
    }

    pub fn for_category(&self, category: Category) -> BillingResult<&dyn PaymentGateway> {
        self.accounts
            .get(&category)
            .map(|g| g.as_ref())
            .ok_or_else(|| {
                BillingError::Config(format!("No payment gateway account for {}", category))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGateway;

    #[test]
    fn test_accounts_require_every_category() {
        let gateway: Arc<dyn PaymentGateway> = Arc::new(FakeGateway::new());
        let mut partial = HashMap::new();
        partial.insert(Category::Software, gateway.clone());
        partial.insert(Category::Classes, gateway.clone());

        match GatewayAccounts::new(partial) {
            Err(BillingError::Config(msg)) => {
                assert!(msg.contains("photography"));
                assert!(msg.contains("videography"));
                assert!(!msg.contains("software"));
            }
            _ => panic!("expected config error"),
        }

        let full = Category::ALL.into_iter().map(|c| (c, gateway.clone())).collect();
        let accounts = GatewayAccounts::new(full).unwrap();
        assert!(accounts.for_category(Category::Videography).is_ok());
    }

    #[test]
    fn test_line_item_decodes_partial_json() {
        let item: GatewayLineItem =
            serde_json::from_value(serde_json::json!({ "description": "Logo", "amount_total": 2000 }))
                .unwrap();
        assert_eq!(item.description, "Logo");
        assert_eq!(item.quantity, None);
    }
}
