//! Stripe webhook endpoint, one per category account

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use freelancedesk_billing::Category;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult, Envelope},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct WebhookReceipt {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_id: Option<Uuid>,
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    Path(category): Path<String>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Envelope<WebhookReceipt>>> {
    let category: Category = category.parse()?;

    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe-Signature header".to_string()))?;

    let event = state.billing.webhooks.verify_event(category, &body, signature)?;
    let work = state.billing.webhooks.handle_event(event).await?;

    Ok(Envelope::ok(WebhookReceipt {
        received: true,
        work_id: work.map(|w| w.id),
    }))
}
