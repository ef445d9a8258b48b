//! Stripe gateway accounts
//!
//! One `StripeClient` per business category, each with its own secret key.
//! Calls run under a timeout and are retried once on transient failures
//! (rate limiting, 5xx, timeouts). Charges carry an idempotency key so the
//! retry cannot double-charge.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    AttachPaymentMethod, CheckoutSession, CheckoutSessionId, CheckoutSessionMode,
    CheckoutSessionPaymentStatus, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionLineItemsPriceData, CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionPaymentIntentData,
    CreateCheckoutSessionPaymentIntentDataSetupFutureUsage, CreateCustomer, CreatePaymentIntent,
    Currency, Customer, CustomerId, Expandable, ListCustomers, ListPaymentIntents, PaymentIntent,
    PaymentIntentId, PaymentIntentStatus, PaymentMethod, PaymentMethodId, RequestStrategy,
    StripeError,
};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChargeRequest, CheckoutRequest, CheckoutSessionSummary, GatewayAccounts, GatewayLineItem,
    PaymentGateway, PaymentIntentSummary,
};
use crate::work::Category;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRIES: usize = 1;
const RETRY_DELAY_MS: u64 = 500;

/// Stripe configuration for all category accounts
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_keys: HashMap<Category, String>,
    pub webhook_secrets: HashMap<Category, String>,
    /// Base URL of the client app, used for checkout redirects
    pub app_base_url: String,
    pub default_currency: String,
    pub request_timeout: Duration,
    pub max_retries: usize,
}

impl StripeConfig {
    /// Load from `STRIPE_SECRET_KEY_<CATEGORY>` / `STRIPE_WEBHOOK_SECRET_<CATEGORY>`.
    ///
    /// Every category needs a secret key; webhook secrets are optional.
    pub fn from_env() -> BillingResult<Self> {
        let mut secret_keys = HashMap::new();
        let mut webhook_secrets = HashMap::new();

        for category in Category::ALL {
            let key_var = format!("STRIPE_SECRET_KEY_{}", category.env_suffix());
            let key = std::env::var(&key_var)
                .map_err(|_| BillingError::Config(format!("{} must be set", key_var)))?;
            if key.trim().is_empty() {
                return Err(BillingError::Config(format!("{} is empty", key_var)));
            }
            secret_keys.insert(category, key);

            let hook_var = format!("STRIPE_WEBHOOK_SECRET_{}", category.env_suffix());
            if let Ok(secret) = std::env::var(&hook_var) {
                webhook_secrets.insert(category, secret);
            }
        }

        let request_timeout = std::env::var("STRIPE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));

        Ok(Self {
            secret_keys,
            webhook_secrets,
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            default_currency: std::env::var("DEFAULT_CURRENCY")
                .unwrap_or_else(|_| "usd".to_string())
                .to_lowercase(),
            request_timeout,
            max_retries: DEFAULT_RETRIES,
        })
    }

    /// Build one Stripe client per category
    pub fn build_accounts(&self) -> BillingResult<GatewayAccounts> {
        let accounts = self
            .secret_keys
            .iter()
            .map(|(category, key)| {
                let client: Arc<dyn PaymentGateway> = Arc::new(StripeClient::new(
                    *category,
                    key,
                    self.request_timeout,
                    self.max_retries,
                ));
                (*category, client)
            })
            .collect();

        GatewayAccounts::new(accounts)
    }
}

/// Failure of a single gateway attempt
#[derive(Debug)]
enum CallError {
    Stripe(StripeError),
    Timeout,
}

impl CallError {
    fn is_transient(&self) -> bool {
        match self {
            CallError::Stripe(StripeError::Stripe(request_error)) => {
                let status = request_error.http_status;
                status == 429 || (500..600).contains(&status)
            }
            CallError::Stripe(StripeError::Timeout) => true,
            CallError::Stripe(_) => false,
            CallError::Timeout => true,
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Stripe(e) => write!(f, "{}", e),
            CallError::Timeout => write!(f, "request timed out"),
        }
    }
}

/// Stripe account for one business category
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    category: Category,
    timeout: Duration,
    max_retries: usize,
}

impl StripeClient {
    pub fn new(category: Category, secret_key: &str, timeout: Duration, max_retries: usize) -> Self {
        Self {
            inner: stripe::Client::new(secret_key),
            category,
            timeout,
            max_retries,
        }
    }

    /// Run a Stripe call with timeout and retry-on-transient-error
    async fn call<T, F, Fut>(&self, operation: &'static str, mut f: F) -> BillingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StripeError>>,
    {
        let timeout = self.timeout;
        let strategy = FixedInterval::from_millis(RETRY_DELAY_MS).take(self.max_retries);

        let result = RetryIf::start(
            strategy,
            || {
                let attempt = f();
                async move {
                    match tokio::time::timeout(timeout, attempt).await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(CallError::Stripe(e)),
                        Err(_) => Err(CallError::Timeout),
                    }
                }
            },
            |e: &CallError| {
                let transient = e.is_transient();
                if transient {
                    tracing::warn!(
                        category = %self.category,
                        operation = operation,
                        error = %e,
                        "Retrying Stripe call after transient error"
                    );
                }
                transient
            },
        )
        .await;

        result.map_err(|e| {
            tracing::error!(
                category = %self.category,
                operation = operation,
                error = %e,
                "Stripe call failed"
            );
            BillingError::PaymentFailed(format!("{}: {}", operation, e))
        })
    }
}

fn parse_currency(code: &str) -> BillingResult<Currency> {
    serde_json::from_value(serde_json::Value::String(code.to_lowercase()))
        .map_err(|_| BillingError::Validation(format!("Unsupported currency '{}'", code)))
}

fn parse_id<T: std::str::FromStr>(kind: &str, id: &str) -> BillingResult<T> {
    id.parse::<T>()
        .map_err(|_| BillingError::Validation(format!("Invalid {} id '{}'", kind, id)))
}

fn expandable_id<T: stripe::Object>(value: &Option<Expandable<T>>) -> Option<String>
where
    T::Id: std::fmt::Display,
{
    match value {
        Some(Expandable::Id(id)) => Some(id.to_string()),
        Some(Expandable::Object(obj)) => Some(obj.id().to_string()),
        None => None,
    }
}

fn summarize_intent(intent: &PaymentIntent) -> PaymentIntentSummary {
    PaymentIntentSummary {
        id: intent.id.to_string(),
        amount: intent.amount,
        currency: intent.currency.to_string(),
        status: intent.status.as_str().to_string(),
        succeeded: intent.status == PaymentIntentStatus::Succeeded,
        payment_method_id: expandable_id(&intent.payment_method),
        description: intent.description.clone(),
        created: intent.created,
    }
}

/// Read `line_items.data` off an expanded checkout session. Decoded from
/// JSON so optional description and quantity shapes both work.
fn line_items_from_session(session: &serde_json::Value) -> BillingResult<Vec<GatewayLineItem>> {
    match session.get("line_items").and_then(|l| l.get("data")) {
        Some(data) => Ok(serde_json::from_value(data.clone())?),
        None => Ok(Vec::new()),
    }
}

fn summarize_session(session: &CheckoutSession) -> CheckoutSessionSummary {
    let payment_method_id = match &session.payment_intent {
        Some(Expandable::Object(intent)) => expandable_id(&intent.payment_method),
        _ => None,
    };

    CheckoutSessionSummary {
        id: session.id.to_string(),
        url: session.url.clone(),
        paid: session.payment_status == CheckoutSessionPaymentStatus::Paid,
        amount_total: session.amount_total,
        payment_intent_id: expandable_id(&session.payment_intent),
        payment_method_id,
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<String>> {
        let mut params = ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(1);

        let customers = self
            .call("list_customers", || Customer::list(&self.inner, &params))
            .await?;

        Ok(customers.data.first().map(|c| c.id.to_string()))
    }

    async fn create_customer(&self, email: &str, name: &str) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("category".to_string(), self.category.to_string());

        let params = CreateCustomer {
            email: Some(email),
            name: Some(name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = self
            .call("create_customer", || {
                Customer::create(&self.inner, params.clone())
            })
            .await?;

        tracing::info!(
            category = %self.category,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let customer: CustomerId = parse_id("customer", customer_id)?;
        let method: PaymentMethodId = parse_id("payment method", payment_method_id)?;

        self.call("attach_payment_method", || {
            PaymentMethod::attach(
                &self.inner,
                &method,
                AttachPaymentMethod {
                    customer: customer.clone(),
                },
            )
        })
        .await?;

        Ok(())
    }

    async fn detach_payment_method(&self, payment_method_id: &str) -> BillingResult<()> {
        let method: PaymentMethodId = parse_id("payment method", payment_method_id)?;

        self.call("detach_payment_method", || {
            PaymentMethod::detach(&self.inner, &method)
        })
        .await?;

        Ok(())
    }

    async fn payment_method_last4(
        &self,
        payment_method_id: &str,
    ) -> BillingResult<Option<String>> {
        let method_id: PaymentMethodId = parse_id("payment method", payment_method_id)?;

        let method = self
            .call("retrieve_payment_method", || {
                PaymentMethod::retrieve(&self.inner, &method_id, &[])
            })
            .await?;

        Ok(method.card.map(|card| card.last4))
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutSessionSummary> {
        let customer: CustomerId = parse_id("customer", &request.customer_id)?;
        let currency = parse_currency(&request.currency)?;

        let mut metadata = HashMap::new();
        metadata.insert("work_id".to_string(), request.work_id.to_string());
        metadata.insert("history_id".to_string(), request.history_id.to_string());
        metadata.insert("category".to_string(), self.category.to_string());

        let line_items = vec![CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency,
                unit_amount: Some(request.amount_minor),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: request.description.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        }];

        let payment_intent_data = request.save_payment_method.then(|| {
            CreateCheckoutSessionPaymentIntentData {
                setup_future_usage: Some(
                    CreateCheckoutSessionPaymentIntentDataSetupFutureUsage::OffSession,
                ),
                ..Default::default()
            }
        });

        let params = CreateCheckoutSession {
            customer: Some(customer),
            mode: Some(CheckoutSessionMode::Payment),
            line_items: Some(line_items),
            success_url: Some(&request.success_url),
            cancel_url: Some(&request.cancel_url),
            metadata: Some(metadata),
            payment_intent_data,
            ..Default::default()
        };

        let session = self
            .call("create_checkout_session", || {
                CheckoutSession::create(&self.inner, params.clone())
            })
            .await?;

        tracing::info!(
            category = %self.category,
            work_id = %request.work_id,
            session_id = %session.id,
            amount_minor = request.amount_minor,
            "Created checkout session"
        );

        Ok(summarize_session(&session))
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionSummary> {
        let id: CheckoutSessionId = parse_id("checkout session", session_id)?;

        let session = self
            .call("retrieve_checkout_session", || {
                CheckoutSession::retrieve(&self.inner, &id, &["payment_intent"])
            })
            .await?;

        Ok(summarize_session(&session))
    }

    async fn checkout_line_items(&self, session_id: &str) -> BillingResult<Vec<GatewayLineItem>> {
        let id: CheckoutSessionId = parse_id("checkout session", session_id)?;

        let session = self
            .call("retrieve_checkout_line_items", || {
                CheckoutSession::retrieve(&self.inner, &id, &["line_items"])
            })
            .await?;

        line_items_from_session(&serde_json::to_value(&session)?)
    }

    async fn create_payment_intent(
        &self,
        request: ChargeRequest,
    ) -> BillingResult<PaymentIntentSummary> {
        let customer: CustomerId = parse_id("customer", &request.customer_id)?;
        let method: PaymentMethodId = parse_id("payment method", &request.payment_method_id)?;
        let currency = parse_currency(&request.currency)?;

        let mut metadata = HashMap::new();
        metadata.insert("work_id".to_string(), request.work_id.to_string());
        metadata.insert("category".to_string(), self.category.to_string());

        let mut params = CreatePaymentIntent::new(request.amount_minor, currency);
        params.customer = Some(customer);
        params.payment_method = Some(method);
        params.payment_method_types = Some(vec!["card".to_string()]);
        params.confirm = Some(true);
        params.description = Some(&request.description);
        params.metadata = Some(metadata);

        let client = self
            .inner
            .clone()
            .with_strategy(RequestStrategy::Idempotent(request.idempotency_key.clone()));

        let intent = self
            .call("create_payment_intent", || {
                PaymentIntent::create(&client, params.clone())
            })
            .await?;

        tracing::info!(
            category = %self.category,
            work_id = %request.work_id,
            payment_intent_id = %intent.id,
            status = intent.status.as_str(),
            amount_minor = request.amount_minor,
            "Created payment intent"
        );

        Ok(summarize_intent(&intent))
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<PaymentIntentSummary> {
        let id: PaymentIntentId = parse_id("payment intent", payment_intent_id)?;

        let intent = self
            .call("retrieve_payment_intent", || {
                PaymentIntent::retrieve(&self.inner, &id, &[])
            })
            .await?;

        Ok(summarize_intent(&intent))
    }

    async fn list_payment_intents(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<PaymentIntentSummary>> {
        let customer: CustomerId = parse_id("customer", customer_id)?;
        let mut params = ListPaymentIntents::new();
        params.customer = Some(customer);
        params.limit = Some(100);

        let intents = self
            .call("list_payment_intents", || {
                PaymentIntent::list(&self.inner, &params)
            })
            .await?;

        Ok(intents.data.iter().map(summarize_intent).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_all_keys() {
        for category in Category::ALL {
            std::env::set_var(
                format!("STRIPE_SECRET_KEY_{}", category.env_suffix()),
                format!("sk_test_{}", category.as_str()),
            );
        }
    }

    fn clear_all_keys() {
        for category in Category::ALL {
            std::env::remove_var(format!("STRIPE_SECRET_KEY_{}", category.env_suffix()));
            std::env::remove_var(format!("STRIPE_WEBHOOK_SECRET_{}", category.env_suffix()));
        }
        std::env::remove_var("DEFAULT_CURRENCY");
    }

    #[test]
    fn test_line_items_from_expanded_session() {
        let session = serde_json::json!({
            "id": "cs_test_1",
            "object": "checkout.session",
            "line_items": {
                "object": "list",
                "has_more": false,
                "data": [
                    { "description": "Milestone 1 for Work ID 7", "amount_total": 3000, "quantity": 1 },
                    { "amount_total": 1550, "quantity": null }
                ]
            }
        });

        let items = line_items_from_session(&session).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].description, "Milestone 1 for Work ID 7");
        assert_eq!(items[0].amount_total, 3000);
        assert_eq!(items[0].quantity, Some(1));
        assert_eq!(items[1].description, "");
        assert_eq!(items[1].quantity, None);
    }

    #[test]
    fn test_line_items_missing_or_malformed() {
        let unexpanded = serde_json::json!({ "id": "cs_test_2", "line_items": null });
        assert!(line_items_from_session(&unexpanded).unwrap().is_empty());

        let malformed = serde_json::json!({ "line_items": { "data": [{ "amount_total": "ten" }] } });
        assert!(matches!(
            line_items_from_session(&malformed),
            Err(BillingError::Serialization(_))
        ));
    }

    #[test]
    #[serial]
    fn test_config_requires_every_category_key() {
        clear_all_keys();
        set_all_keys();
        std::env::remove_var("STRIPE_SECRET_KEY_VIDEOGRAPHY");

        match StripeConfig::from_env() {
            Err(BillingError::Config(msg)) => assert!(msg.contains("STRIPE_SECRET_KEY_VIDEOGRAPHY")),
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
        clear_all_keys();
    }

    #[test]
    #[serial]
    fn test_config_builds_accounts_for_all_categories() {
        clear_all_keys();
        set_all_keys();
        std::env::set_var("STRIPE_WEBHOOK_SECRET_CLASSES", "whsec_classes");
        std::env::set_var("DEFAULT_CURRENCY", "GBP");

        let config = StripeConfig::from_env().unwrap();
        assert_eq!(config.default_currency, "gbp");
        assert_eq!(config.secret_keys.len(), Category::ALL.len());
        assert_eq!(
            config.webhook_secrets.get(&Category::Classes).map(String::as_str),
            Some("whsec_classes")
        );
        assert_eq!(config.request_timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));

        let accounts = config.build_accounts().unwrap();
        for category in Category::ALL {
            assert!(accounts.for_category(category).is_ok());
        }
        clear_all_keys();
    }

    #[test]
    fn test_parse_currency() {
        assert_eq!(parse_currency("USD").unwrap(), Currency::USD);
        assert!(parse_currency("doubloons").is_err());
    }

    #[test]
    fn test_timeout_is_transient() {
        assert!(CallError::Timeout.is_transient());
        assert!(CallError::Stripe(StripeError::Timeout).is_transient());
        assert!(!CallError::Stripe(StripeError::ClientError("bad".to_string())).is_transient());
    }
}
