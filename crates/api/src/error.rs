//! API error type and JSON envelope

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use freelancedesk_billing::BillingError;
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Response envelope shared by every route
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: None,
        })
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Billing(e) => match e {
                BillingError::NotFound(_) => StatusCode::NOT_FOUND,
                BillingError::AlreadyPaid
                | BillingError::InvalidTransition { .. }
                | BillingError::ConcurrentModification => StatusCode::CONFLICT,
                BillingError::PaymentMethodRequired
                | BillingError::PaymentRequired(_)
                | BillingError::PaymentNotSuccessful => StatusCode::PAYMENT_REQUIRED,
                BillingError::ClassClosed => StatusCode::FORBIDDEN,
                BillingError::Validation(_)
                | BillingError::InvalidInterval(_)
                | BillingError::WebhookSignatureInvalid => StatusCode::BAD_REQUEST,
                BillingError::PaymentFailed(_) => StatusCode::BAD_GATEWAY,
                BillingError::Config(_)
                | BillingError::Database(_)
                | BillingError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Machine-readable code for clients
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Billing(e) => match e {
                BillingError::AlreadyPaid => "already_paid",
                BillingError::NotFound(_) => "not_found",
                BillingError::PaymentMethodRequired => "payment_method_required",
                BillingError::PaymentRequired(_) => "payment_required",
                BillingError::PaymentNotSuccessful => "payment_not_successful",
                BillingError::PaymentFailed(_) => "payment_failed",
                BillingError::ClassClosed => "class_closed",
                BillingError::Validation(_) => "validation_error",
                BillingError::InvalidInterval(_) => "invalid_interval",
                BillingError::InvalidTransition { .. } => "invalid_transition",
                BillingError::ConcurrentModification => "concurrent_modification",
                BillingError::WebhookSignatureInvalid => "invalid_signature",
                BillingError::Config(_)
                | BillingError::Database(_)
                | BillingError::Serialization(_) => "internal_error",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if matches!(&self, ApiError::Billing(e) if !e.is_client_error()) {
            tracing::error!(error = %self, status = %status, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }

        // Infrastructure details stay in the logs
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = serde_json::json!({
            "success": false,
            "code": self.code(),
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}
