//! Customer-facing work routes

use axum::{
    extract::{Path, State},
    Json,
};
use freelancedesk_billing::{CheckoutLink, PaymentRequest, Work};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::{ApiResult, Envelope},
    state::AppState,
};

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PaymentRequestBody {
    /// `confirmation`, `paymentItem`, `full` or `cancellation`
    #[serde(rename = "type")]
    pub request_type: String,
    pub item_id: Option<Uuid>,
    /// ISO currency code, lowercase or uppercase
    pub currency: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChargeRequestBody {
    #[serde(rename = "type")]
    pub request_type: String,
    pub item_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentMethodBody {
    pub payment_method_id: String,
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn get_work(
    State(state): State<AppState>,
    Path(work_id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Work>>> {
    let work = state.billing.lifecycle.get_work(work_id).await?;
    Ok(Envelope::ok(work))
}

/// Open a hosted checkout and return its URL
pub async fn request_payment(
    State(state): State<AppState>,
    Path(work_id): Path<Uuid>,
    Json(body): Json<PaymentRequestBody>,
) -> ApiResult<Json<Envelope<CheckoutLink>>> {
    let request = PaymentRequest::parse(&body.request_type, body.item_id)?;
    let link = state
        .billing
        .lifecycle
        .request_payment(work_id, request, body.currency.as_deref())
        .await?;
    Ok(Envelope::ok(link))
}

/// Charge the customer's saved card
pub async fn charge_saved_card(
    State(state): State<AppState>,
    Path(work_id): Path<Uuid>,
    Json(body): Json<ChargeRequestBody>,
) -> ApiResult<Json<Envelope<Work>>> {
    let request = PaymentRequest::parse(&body.request_type, body.item_id)?;
    let work = state
        .billing
        .lifecycle
        .pay_with_attached_card(work_id, request)
        .await?;
    Ok(Envelope::ok(work))
}

/// Save a card on the work's subscription term
pub async fn attach_payment_method(
    State(state): State<AppState>,
    Path(work_id): Path<Uuid>,
    Json(body): Json<PaymentMethodBody>,
) -> ApiResult<Json<Envelope<Work>>> {
    let work = state
        .billing
        .lifecycle
        .attach_payment_method(work_id, &body.payment_method_id)
        .await?;
    Ok(Envelope::ok(work))
}

/// Return target of the hosted checkout
pub async fn confirm_payment(
    State(state): State<AppState>,
    Path((work_id, history_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Envelope<Work>>> {
    let work = state
        .billing
        .lifecycle
        .confirm_payment(work_id, history_id)
        .await?;
    Ok(Envelope::ok(work))
}

pub async fn confirm_work(
    State(state): State<AppState>,
    Path(work_id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Work>>> {
    let work = state.billing.lifecycle.confirm(work_id).await?;
    Ok(Envelope::ok(work))
}

pub async fn cancel_work(
    State(state): State<AppState>,
    Path(work_id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Work>>> {
    let work = state.billing.lifecycle.cancel(work_id).await?;
    Ok(Envelope::ok(work))
}

pub async fn use_session(
    State(state): State<AppState>,
    Path(work_id): Path<Uuid>,
) -> ApiResult<Json<Envelope<Work>>> {
    let work = state.billing.lifecycle.use_single_session(work_id).await?;
    Ok(Envelope::ok(work))
}
