use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::store::{DbStats, RetentionConfig};

use super::{ApiError, ApiResult, AppState};

/// `GET /api/db/stats`
pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<DbStats>> {
    Ok(Json(state.store.db_stats().await?))
}

#[derive(Debug, Deserialize)]
pub struct CleanupBody {
    pub days: u32,
    #[serde(rename = "backendId", default)]
    pub backend_id: Option<i64>,
}

/// `POST /api/db/cleanup` — `days = 0` wipes all aggregates for the
/// target backend (or every backend); otherwise prunes connection logs
/// older than `days`.
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CleanupBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if let Some(id) = body.backend_id {
        if state.store.get_backend(id).await?.is_none() {
            return Err(ApiError::not_found(format!("backend {id} not found")));
        }
    }

    if body.days == 0 {
        // Pending hot deltas would resurrect wiped rows on the next
        // flush; drop them first.
        match body.backend_id {
            Some(id) => state.cache.clear_backend(id),
            None => {
                for id in state.cache.backend_ids() {
                    state.cache.clear_backend(id);
                }
            }
        }
    }

    let counts = state
        .store
        .cleanup_old_data(body.backend_id, body.days, Utc::now().timestamp_millis())
        .await?;

    info!(days = body.days, backend_id = ?body.backend_id, "cleanup executed");
    Ok(Json(json!({ "deleted": counts })))
}

/// `POST /api/db/vacuum`
pub async fn vacuum(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    state.store.vacuum().await?;
    info!("vacuum completed");
    Ok(Json(json!({ "vacuumed": true })))
}

/// `GET /api/db/retention`
pub async fn get_retention(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<RetentionConfig>> {
    Ok(Json(state.store.retention().await?))
}

#[derive(Debug, Deserialize)]
pub struct RetentionBody {
    #[serde(rename = "connectionLogsDays", default)]
    pub connection_logs_days: Option<u32>,
    #[serde(rename = "hourlyStatsDays", default)]
    pub hourly_stats_days: Option<u32>,
    #[serde(rename = "autoCleanup", default)]
    pub auto_cleanup: Option<bool>,
}

/// `PUT /api/db/retention` — partial update, bounds-checked.
pub async fn put_retention(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RetentionBody>,
) -> ApiResult<Json<RetentionConfig>> {
    let current = state.store.retention().await?;
    let updated = RetentionConfig {
        connection_logs_days: body.connection_logs_days.unwrap_or(current.connection_logs_days),
        hourly_stats_days: body.hourly_stats_days.unwrap_or(current.hourly_stats_days),
        auto_cleanup: body.auto_cleanup.unwrap_or(current.auto_cleanup),
    };
    updated.validate().map_err(ApiError::bad_request)?;

    state.store.set_retention(&updated).await?;
    Ok(Json(updated))
}
