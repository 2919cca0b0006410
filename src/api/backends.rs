use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::collector::session::probe_backend;
use crate::collector::SessionHealthView;
use crate::store::rows::iso_ms;
use crate::store::{Backend, BackendPatch, NewBackend, StoreError};

use super::{ApiError, ApiResult, AppState};

/// Connectivity tests dial the upstream once with this hard timeout.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend as exposed over the API: the token itself is elided.
#[derive(Debug, Serialize)]
pub struct BackendView {
    pub id: i64,
    pub name: String,
    pub url: String,
    #[serde(rename = "hasToken")]
    pub has_token: bool,
    pub enabled: bool,
    pub listening: bool,
    #[serde(rename = "isActive")]
    pub is_active: bool,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<SessionHealthView>,
}

impl BackendView {
    fn from_backend(backend: Backend, health: Option<SessionHealthView>) -> Self {
        Self {
            id: backend.id,
            name: backend.name,
            url: backend.url,
            has_token: backend.token.is_some(),
            enabled: backend.enabled,
            listening: backend.listening,
            is_active: backend.is_active,
            created_at: iso_ms(backend.created_at_ms),
            health,
        }
    }
}

async fn view(state: &AppState, backend: Backend) -> BackendView {
    let health = state.supervisor.health(backend.id).await;
    BackendView::from_backend(backend, health)
}

/// `GET /api/backends`
pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<BackendView>>> {
    let backends = state.store.list_backends().await?;
    let mut views = Vec::with_capacity(backends.len());
    for backend in backends {
        views.push(view(&state, backend).await);
    }
    Ok(Json(views))
}

/// `GET /api/backends/active`
pub async fn active(State(state): State<Arc<AppState>>) -> ApiResult<Json<BackendView>> {
    match state.store.active_backend().await? {
        Some(backend) => Ok(Json(view(&state, backend).await)),
        None => Err(ApiError::not_found("no active backend configured")),
    }
}

/// `GET /api/backends/listening`
pub async fn listening(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<BackendView>>> {
    let backends = state.store.listening_backends().await?;
    let mut views = Vec::with_capacity(backends.len());
    for backend in backends {
        views.push(view(&state, backend).await);
    }
    Ok(Json(views))
}

/// `GET /api/backends/{id}`
pub async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<BackendView>> {
    match state.store.get_backend(id).await? {
        Some(backend) => Ok(Json(view(&state, backend).await)),
        None => Err(ApiError::not_found(format!("backend {id} not found"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateBackendBody {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// `POST /api/backends` — 409 on duplicate name; the first backend in
/// an empty table becomes active.
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBackendBody>,
) -> ApiResult<Json<BackendView>> {
    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    if body.url.trim().is_empty() {
        return Err(ApiError::bad_request("url must not be empty"));
    }

    let new = NewBackend {
        name: body.name.trim().to_string(),
        url: body.url.trim().to_string(),
        token: body.token.filter(|t| !t.is_empty()),
    };

    let backend = match state
        .store
        .create_backend(&new, Utc::now().timestamp_millis())
        .await
    {
        Ok(backend) => backend,
        Err(StoreError::Constraint(_)) => {
            return Err(ApiError::conflict(format!(
                "backend name {:?} already exists",
                new.name,
            )));
        }
        Err(e) => return Err(e.into()),
    };

    info!(backend_id = backend.id, backend = %backend.name, "backend created");
    state.supervisor.sync().await?;
    Ok(Json(view(&state, backend).await))
}

/// Distinguishes an absent field (leave untouched) from an explicit
/// null (clear the value).
fn double_option<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(de).map(Some)
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateBackendBody {
    pub name: Option<String>,
    pub url: Option<String>,
    /// Absent leaves the token untouched; explicit null clears it.
    #[serde(default, deserialize_with = "double_option")]
    pub token: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub listening: Option<bool>,
}

/// `PUT /api/backends/{id}` — partial update.
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateBackendBody>,
) -> ApiResult<Json<BackendView>> {
    if let Some(name) = &body.name {
        if name.trim().is_empty() {
            return Err(ApiError::bad_request("name must not be empty"));
        }
    }
    if let Some(url) = &body.url {
        if url.trim().is_empty() {
            return Err(ApiError::bad_request("url must not be empty"));
        }
    }

    let patch = BackendPatch {
        name: body.name,
        url: body.url,
        token: body.token,
        enabled: body.enabled,
        listening: body.listening,
    };

    let backend = match state.store.update_backend(id, &patch).await {
        Ok(Some(backend)) => backend,
        Ok(None) => return Err(ApiError::not_found(format!("backend {id} not found"))),
        Err(StoreError::Constraint(_)) => {
            return Err(ApiError::conflict("backend name already exists"));
        }
        Err(e) => return Err(e.into()),
    };

    state.supervisor.sync().await?;
    Ok(Json(view(&state, backend).await))
}

/// `DELETE /api/backends/{id}` — cascades to every owned row and wipes
/// the hot cache.
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.store.delete_backend(id).await? {
        return Err(ApiError::not_found(format!("backend {id} not found")));
    }

    state.cache.clear_backend(id);
    state.supervisor.sync().await?;
    info!(backend_id = id, "backend deleted");
    Ok(Json(json!({ "deleted": true })))
}

/// `POST /api/backends/{id}/activate`
pub async fn activate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<BackendView>> {
    match state.store.set_active_backend(id).await? {
        Some(backend) => Ok(Json(view(&state, backend).await)),
        None => Err(ApiError::not_found(format!("backend {id} not found"))),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListeningBody {
    pub listening: Option<bool>,
}

/// `POST /api/backends/{id}/listening` — set, or toggle when no body is
/// given.
pub async fn toggle_listening(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: axum::body::Bytes,
) -> ApiResult<Json<BackendView>> {
    let requested = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<ListeningBody>(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid body: {e}")))?
            .listening
    };

    let current = state
        .store
        .get_backend(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("backend {id} not found")))?;

    let target = requested.unwrap_or(!current.listening);

    let backend = state
        .store
        .set_listening(id, target)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("backend {id} not found")))?;

    info!(backend_id = id, listening = target, "listening toggled");
    state.supervisor.sync().await?;
    Ok(Json(view(&state, backend).await))
}

#[derive(Debug, Serialize)]
pub struct TestResult {
    pub success: bool,
    #[serde(rename = "latencyMs", skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn run_probe(url: &str, token: Option<&str>) -> TestResult {
    match probe_backend(url, token, TEST_TIMEOUT).await {
        Ok(latency) => TestResult {
            success: true,
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
        },
        Err(e) => TestResult {
            success: false,
            latency_ms: None,
            error: Some(format!("{e:#}")),
        },
    }
}

/// `POST /api/backends/{id}/test` — dials the stored endpoint.
pub async fn test_saved(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<TestResult>> {
    let backend = state
        .store
        .get_backend(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("backend {id} not found")))?;

    Ok(Json(run_probe(&backend.url, backend.token.as_deref()).await))
}

#[derive(Debug, Deserialize)]
pub struct TestBody {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// `POST /api/backends/test` — dials an unsaved endpoint.
pub async fn test_unsaved(
    State(_state): State<Arc<AppState>>,
    Json(body): Json<TestBody>,
) -> ApiResult<Json<TestResult>> {
    if body.url.trim().is_empty() {
        return Err(ApiError::bad_request("url must not be empty"));
    }
    Ok(Json(run_probe(body.url.trim(), body.token.as_deref()).await))
}

/// `POST /api/backends/{id}/clear-data` — wipes aggregates and the hot
/// cache for one backend, leaving others untouched.
pub async fn clear_data(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    if state.store.get_backend(id).await?.is_none() {
        return Err(ApiError::not_found(format!("backend {id} not found")));
    }

    // Hot deltas first, so a concurrent flush cannot re-persist them.
    state.cache.clear_backend(id);
    let counts = state
        .store
        .cleanup_old_data(Some(id), 0, Utc::now().timestamp_millis())
        .await?;

    info!(backend_id = id, "backend data cleared");
    Ok(Json(json!({ "cleared": true, "deleted": counts })))
}
