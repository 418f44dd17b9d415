//! Administrative operations, restricted to privileged owners.

use crate::auth::Owner;
use crate::errors::AppError;
use crate::state::AppState;
use axum::{Json, extract::State};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapResp {
    success: bool,
    expired: usize,
    purged: usize,
    failures: usize,
}

/// `POST /api/admin/reap` — run one reaper sweep on demand.
pub async fn trigger_reap(
    State(state): State<AppState>,
    owner: Owner,
) -> Result<Json<ReapResp>, AppError> {
    if !owner.privileged {
        return Err(AppError::unauthorized("admin role required"));
    }

    let report = state.reaper.sweep().await?;
    Ok(Json(ReapResp {
        success: true,
        expired: report.expired,
        purged: report.purged,
        failures: report.failures,
    }))
}
