//! Billing notifications
//!
//! The lifecycle emits `Notification`s after a state change is committed.
//! Delivery is best-effort: a failed send is logged and never rolls back or
//! blocks the transition that produced it.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com";

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    WorkConfirmed {
        email: String,
        name: String,
        work_id: Uuid,
        status: String,
    },
    WorkCancelled {
        email: String,
        name: String,
        work_id: Uuid,
    },
    PaymentReceipt {
        email: String,
        work_id: Uuid,
        amount: f64,
        description: String,
        last4: Option<String>,
    },
    /// Sent to the customer when a renewal charge fails
    BillingFailedCustomer {
        email: String,
        work_id: Uuid,
        amount: f64,
    },
    /// Sent to the operator when a renewal charge fails
    BillingFailedOperator {
        customer_email: String,
        work_id: Uuid,
        amount: f64,
        reason: String,
    },
    SessionCredentials {
        email: String,
        work_id: Uuid,
        join_url: String,
        password: String,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::WorkConfirmed { .. } => "work_confirmed",
            Notification::WorkCancelled { .. } => "work_cancelled",
            Notification::PaymentReceipt { .. } => "payment_receipt",
            Notification::BillingFailedCustomer { .. } => "billing_failed_customer",
            Notification::BillingFailedOperator { .. } => "billing_failed_operator",
            Notification::SessionCredentials { .. } => "session_credentials",
        }
    }

    pub fn work_id(&self) -> Uuid {
        match self {
            Notification::WorkConfirmed { work_id, .. }
            | Notification::WorkCancelled { work_id, .. }
            | Notification::PaymentReceipt { work_id, .. }
            | Notification::BillingFailedCustomer { work_id, .. }
            | Notification::BillingFailedOperator { work_id, .. }
            | Notification::SessionCredentials { work_id, .. } => *work_id,
        }
    }
}

/// Outbound notification channel
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification. Implementations log their own failures.
    async fn send(&self, notification: Notification);
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: Option<String>,
    pub from: String,
    pub operator_email: String,
    pub api_url: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "freelancedesk <billing@freelancedesk.dev>".to_string()),
            operator_email: std::env::var("OPERATOR_EMAIL")
                .unwrap_or_else(|_| "operator@freelancedesk.dev".to_string()),
            api_url: RESEND_API_URL.to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Debug, Serialize)]
struct OutgoingEmail {
    from: String,
    to: Vec<String>,
    subject: String,
    html: String,
}

/// Sends billing emails through the Resend HTTP API.
///
/// Without an API key every send is logged and dropped.
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    http: reqwest::Client,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        let config = EmailConfig::from_env();
        if !config.is_enabled() {
            tracing::warn!("RESEND_API_KEY not set, billing emails will only be logged");
        }
        Self::new(config)
    }

    fn render(&self, notification: &Notification) -> OutgoingEmail {
        let (to, subject, html) = match notification {
            Notification::WorkConfirmed {
                email,
                name,
                work_id,
                status,
            } => (
                vec![email.clone(), self.config.operator_email.clone()],
                format!("Work {} confirmed", work_id),
                format!(
                    "<p>Hi {},</p><p>Your work <strong>{}</strong> is now <strong>{}</strong>.</p>",
                    escape_html(name), work_id, escape_html(status)
                ),
            ),
            Notification::WorkCancelled {
                email,
                name,
                work_id,
            } => (
                vec![email.clone(), self.config.operator_email.clone()],
                format!("Work {} cancelled", work_id),
                format!(
                    "<p>Hi {},</p><p>Work <strong>{}</strong> has been cancelled.</p>",
                    escape_html(name), work_id
                ),
            ),
            Notification::PaymentReceipt {
                email,
                work_id,
                amount,
                description,
                last4,
            } => {
                let card = last4
                    .as_deref()
                    .map(|d| format!(" with card ending in {}", escape_html(d)))
                    .unwrap_or_default();
                (
                    vec![email.clone()],
                    format!("Payment receipt for work {}", work_id),
                    format!(
                        "<p>We received your payment of <strong>{:.2}</strong>{} for {}.</p>",
                        amount, card, escape_html(description)
                    ),
                )
            }
            Notification::BillingFailedCustomer {
                email,
                work_id,
                amount,
            } => (
                vec![email.clone()],
                "Action required: subscription payment failed".to_string(),
                format!(
                    "<p>We could not charge <strong>{:.2}</strong> for work {}. \
                     Please update your payment method.</p>",
                    amount, work_id
                ),
            ),
            Notification::BillingFailedOperator {
                customer_email,
                work_id,
                amount,
                reason,
            } => (
                vec![self.config.operator_email.clone()],
                format!("Subscription charge failed for work {}", work_id),
                format!(
                    "<p>Charge of {:.2} for {} failed: {}</p>",
                    amount, escape_html(customer_email), escape_html(reason)
                ),
            ),
            Notification::SessionCredentials {
                email,
                work_id,
                join_url,
                password,
            } => (
                vec![email.clone()],
                "Your class session details".to_string(),
                format!(
                    "<p>Join your session for work {} at <a href=\"{}\">{}</a>.</p>\
                     <p>Password: <code>{}</code></p>",
                    work_id,
                    escape_html(join_url),
                    escape_html(join_url),
                    escape_html(password)
                ),
            ),
        };

        OutgoingEmail {
            from: self.config.from.clone(),
            to,
            subject,
            html,
        }
    }

    async fn deliver(&self, api_key: &str, email: &OutgoingEmail) -> BillingResult<()> {
        let response = self
            .http
            .post(format!("{}/emails", self.config.api_url))
            .bearer_auth(api_key)
            .json(email)
            .send()
            .await
            .map_err(|e| BillingError::Config(format!("Email request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Config(format!(
                "Email API returned {}: {}",
                status, body
            )));
        }

        Ok(())
    }
}

/// Escape text interpolated into an HTML email body
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

#[async_trait]
impl Notifier for BillingEmailService {
    async fn send(&self, notification: Notification) {
        let email = self.render(&notification);

        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::info!(
                kind = notification.kind(),
                work_id = %notification.work_id(),
                to = ?email.to,
                subject = %email.subject,
                "Email delivery disabled, skipping send"
            );
            return;
        };

        match self.deliver(api_key, &email).await {
            Ok(()) => tracing::info!(
                kind = notification.kind(),
                work_id = %notification.work_id(),
                "Sent billing email"
            ),
            Err(e) => tracing::error!(
                kind = notification.kind(),
                work_id = %notification.work_id(),
                error = %e,
                "Failed to send billing email"
            ),
        }
    }
}
