//! Billing error taxonomy

use thiserror::Error;

use crate::work::WorkStatus;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// The requested charge (or item) is already marked Completed
    #[error("Payment has already been completed")]
    AlreadyPaid,

    #[error("{0}")]
    NotFound(String),

    /// A subscription needs a saved payment method before it can be confirmed or charged
    #[error("A payment method is required for this subscription")]
    PaymentMethodRequired,

    /// An outstanding payment blocks the requested transition
    #[error("Payment required: {0}")]
    PaymentRequired(String),

    /// The gateway reports the session or intent as unpaid
    #[error("Payment was not successful")]
    PaymentNotSuccessful,

    /// The gateway call itself failed (network or API error)
    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("No class session is currently open")]
    ClassClosed,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid subscription interval: {0}")]
    InvalidInterval(String),

    #[error("Cannot move work from '{from}' to '{to}'")]
    InvalidTransition { from: WorkStatus, to: WorkStatus },

    /// Another writer saved the work since it was read
    #[error("Work was modified concurrently, retry the operation")]
    ConcurrentModification,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,
}

impl BillingError {
    /// Whether the error is a caller-facing business rejection rather than an
    /// infrastructure failure
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            BillingError::PaymentFailed(_)
                | BillingError::Config(_)
                | BillingError::Database(_)
                | BillingError::Serialization(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Serialization(e.to_string())
    }
}
