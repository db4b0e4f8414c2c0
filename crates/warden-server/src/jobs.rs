//! Out-of-band job status: `GET /jobs` and `GET /jobs/{key}`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use warden_core::{JobKey, JobStatus};

use crate::{ApiError, AppState};

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    state
        .orchestrator
        .status(&JobKey::from_raw(key.as_str()))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown job {key}")))
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<JobStatus>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    Ok(Json(state.orchestrator.recent(limit).await?))
}
