//! API routes

pub mod admin;
pub mod webhooks;
pub mod works;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::{config::Config, state::AppState};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Works
        .route("/works/{id}", get(works::get_work))
        .route("/works/{id}/payments", post(works::request_payment))
        .route("/works/{id}/payments/charge", post(works::charge_saved_card))
        .route(
            "/works/{id}/payments/{history_id}/confirm",
            post(works::confirm_payment),
        )
        .route(
            "/works/{id}/payment-method",
            post(works::attach_payment_method),
        )
        .route("/works/{id}/confirm", post(works::confirm_work))
        .route("/works/{id}/cancel", post(works::cancel_work))
        .route("/works/{id}/sessions/use", post(works::use_session))
        // Admin
        .route("/admin/works/{id}/status", post(admin::set_work_status))
        .route("/admin/billing/sweep", post(admin::run_sweep))
        .route("/admin/invariants", get(admin::check_invariants))
        // Webhooks
        .route("/webhooks/stripe/{category}", post(webhooks::stripe_webhook))
        .with_state(state)
}

/// CORS restricted to the configured origins
pub fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    tracing::info!(count = origins.len(), "CORS configured with allowed origins");

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
