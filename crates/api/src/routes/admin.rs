//! Operator routes
//!
//! Authentication sits in front of the API, these handlers assume the
//! caller is an operator.

use axum::{
    extract::{Path, State},
    Json,
};
use freelancedesk_billing::{InvariantCheckSummary, SweepOutcome, Work, WorkStatus};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::{ApiResult, Envelope},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    /// Display name, e.g. "Needs Attention"
    pub status: String,
}

pub async fn set_work_status(
    State(state): State<AppState>,
    Path(work_id): Path<Uuid>,
    Json(req): Json<SetStatusRequest>,
) -> ApiResult<Json<Envelope<Work>>> {
    let status: WorkStatus = req.status.parse()?;

    tracing::info!(work_id = %work_id, status = %status, "Admin status override requested");

    let work = state
        .billing
        .lifecycle
        .set_status_by_admin(work_id, status)
        .await?;
    Ok(Envelope::ok(work))
}

/// Run the recurring billing sweep now instead of waiting for the worker
pub async fn run_sweep(
    State(state): State<AppState>,
) -> ApiResult<Json<Envelope<Vec<SweepOutcome>>>> {
    let outcomes = state.billing.sweep.run(OffsetDateTime::now_utc()).await?;
    Ok(Envelope::ok(outcomes))
}

pub async fn check_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<Envelope<InvariantCheckSummary>>> {
    let summary = state.billing.invariants.check_all().await?;
    Ok(Envelope::ok(summary))
}
