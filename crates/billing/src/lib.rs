// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::InvalidTransition carries both statuses
#![allow(clippy::too_many_arguments)]
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! freelancedesk Billing Module
//!
//! Work lifecycle and payment reconciliation for the booking backend.
//!
//! ## Features
//!
//! - **Work Lifecycle**: Confirm, cancel, single-session use and admin overrides
//! - **Payments**: Hosted checkout, saved-card charges, gateway reconciliation
//! - **Subscriptions**: Term activation and interval arithmetic
//! - **Recurring Billing**: Sweep that charges due subscriptions
//! - **Invariants**: Consistency checks over stored works
//! - **Email Notifications**: Confirmations, receipts, billing failure alerts
//! - **Webhooks**: Handle Stripe checkout events

pub mod client;
pub mod email;
pub mod error;
pub mod gateway;
pub mod interval;
pub mod invariants;
pub mod lifecycle;
pub mod meeting;
pub mod payment_detail;
pub mod processor;
pub mod store;
pub mod sweep;
pub mod webhooks;
pub mod work;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{StripeClient, StripeConfig};

// Email
pub use email::{BillingEmailService, EmailConfig, Notification, Notifier};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{GatewayAccounts, PaymentGateway};

// Interval
pub use interval::{add_interval, SubscriptionInterval};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Lifecycle
pub use lifecycle::{CheckoutLink, WorkLifecycle};

// Meetings
pub use meeting::{MeetingProvider, ZoomClient};

// Payment detail
pub use payment_detail::{resolve_payment, PaymentDetail, PaymentRequest};

// Processor
pub use processor::PaymentProcessor;

// Store
pub use store::{create_pool, PgWorkStore, WorkStore};

// Sweep
pub use sweep::{RecurringBillingSweep, SweepOutcome};

// Webhooks
pub use webhooks::WebhookHandler;

// Work
pub use work::{
    Category, ClassType, ItemStatus, PaymentHistoryEntry, PaymentStatus, PaymentType,
    SubscriptionTerm, UserContact, Work, WorkStatus,
};

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service wiring the lifecycle to its collaborators
pub struct BillingService {
    pub store: Arc<dyn WorkStore>,
    pub processor: Arc<PaymentProcessor>,
    pub lifecycle: Arc<WorkLifecycle>,
    pub sweep: Arc<RecurringBillingSweep>,
    pub invariants: Arc<InvariantChecker>,
    pub webhooks: Arc<WebhookHandler>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Self::new(StripeConfig::from_env()?, pool)
    }

    /// Create a new billing service with explicit Stripe config
    pub fn new(config: StripeConfig, pool: PgPool) -> BillingResult<Self> {
        let accounts = config.build_accounts()?;
        let processor = PaymentProcessor::new(
            accounts,
            &config.app_base_url,
            &config.default_currency,
        );

        Ok(Self::assemble(
            Arc::new(PgWorkStore::new(pool)),
            Arc::new(processor),
            Arc::new(BillingEmailService::from_env()),
            Arc::new(ZoomClient::from_env()),
            config.webhook_secrets,
        ))
    }

    /// Wire the services around already-built collaborators
    pub fn assemble(
        store: Arc<dyn WorkStore>,
        processor: Arc<PaymentProcessor>,
        notifier: Arc<dyn Notifier>,
        meetings: Arc<dyn MeetingProvider>,
        webhook_secrets: HashMap<Category, String>,
    ) -> Self {
        let lifecycle = Arc::new(WorkLifecycle::new(
            store.clone(),
            processor.clone(),
            notifier,
            meetings,
        ));

        Self {
            store: store.clone(),
            processor,
            sweep: Arc::new(RecurringBillingSweep::new(lifecycle.clone())),
            invariants: Arc::new(InvariantChecker::new(store)),
            webhooks: Arc::new(WebhookHandler::new(lifecycle.clone(), webhook_secrets)),
            lifecycle,
        }
    }
}
