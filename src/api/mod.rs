mod backends;
mod db;
mod error;
mod stats;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::RealtimeCache;
use crate::collector::Supervisor;
use crate::store::rows::TimeWindow;
use crate::store::Store;

pub use error::{ApiError, ApiResult};

/// Shared handler state.
pub struct AppState {
    pub store: Store,
    pub cache: Arc<RealtimeCache>,
    pub supervisor: Arc<Supervisor>,
}

/// Query parameters shared across the stats family.
#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    #[serde(rename = "backendId")]
    pub backend_id: Option<i64>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub offset: Option<u32>,
    pub limit: Option<u32>,
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
    #[serde(rename = "sortOrder")]
    pub sort_order: Option<String>,
    pub search: Option<String>,
    pub key: Option<String>,
    pub chain: Option<String>,
    pub rule: Option<String>,
    #[serde(rename = "sourceIP")]
    pub source_ip: Option<String>,
    #[serde(rename = "sourceChain")]
    pub source_chain: Option<String>,
    #[serde(rename = "windowMinutes")]
    pub window_minutes: Option<i64>,
}

impl StatsQuery {
    /// Resolves the target backend: explicit id (must exist) or the
    /// active backend, 404 otherwise.
    pub async fn resolve_backend(&self, state: &AppState) -> ApiResult<i64> {
        match self.backend_id {
            Some(id) => match state.store.get_backend(id).await? {
                Some(backend) => Ok(backend.id),
                None => Err(ApiError::not_found(format!("backend {id} not found"))),
            },
            None => match state.store.active_backend().await? {
                Some(backend) => Ok(backend.id),
                None => Err(ApiError::not_found("no active backend configured")),
            },
        }
    }

    /// Validates the optional time range: both bounds or neither,
    /// ISO-8601, start ≤ end.
    pub fn window(&self) -> ApiResult<TimeWindow> {
        match (&self.start, &self.end) {
            (None, None) => Ok(TimeWindow::all()),
            (Some(_), None) | (None, Some(_)) => Err(ApiError::bad_request(
                "start and end must be provided together",
            )),
            (Some(start), Some(end)) => {
                let start_ms = parse_iso(start)?;
                let end_ms = parse_iso(end)?;
                if start_ms > end_ms {
                    return Err(ApiError::bad_request("start must not be after end"));
                }
                Ok(TimeWindow {
                    start_ms: Some(start_ms),
                    end_ms: Some(end_ms),
                })
            }
        }
    }

    pub fn clamped_limit(&self, default: u32) -> u32 {
        self.limit.unwrap_or(default).clamp(1, 500)
    }
}

fn parse_iso(value: &str) -> ApiResult<i64> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .map_err(|_| ApiError::bad_request(format!("invalid ISO-8601 datetime: {value}")))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Builds the full route table.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        // Stats family.
        .route("/api/stats/summary", get(stats::summary))
        .route("/api/stats/global", get(stats::global))
        .route("/api/stats/domains", get(stats::domains))
        .route("/api/stats/domains/proxy-stats", get(stats::domain_proxy_stats))
        .route("/api/stats/domains/ip-details", get(stats::domain_ip_details))
        .route("/api/stats/ips", get(stats::ips))
        .route("/api/stats/ips/proxy-stats", get(stats::ip_proxy_stats))
        .route("/api/stats/ips/domain-details", get(stats::ip_domain_details))
        .route("/api/stats/proxies", get(stats::proxies))
        .route("/api/stats/proxies/domains", get(stats::proxy_domains))
        .route("/api/stats/proxies/ips", get(stats::proxy_ips))
        .route("/api/stats/rules", get(stats::rules))
        .route("/api/stats/rules/domains", get(stats::rule_domains))
        .route("/api/stats/rules/proxies", get(stats::rule_proxies))
        .route("/api/stats/countries", get(stats::countries))
        .route("/api/stats/devices", get(stats::devices))
        .route("/api/stats/hourly", get(stats::hourly))
        .route("/api/stats/trend", get(stats::trend))
        .route("/api/stats/trend/aggregated", get(stats::trend_aggregated))
        .route("/api/stats/connections", get(stats::connections))
        // Backends.
        .route("/api/backends", get(backends::list).post(backends::create))
        .route("/api/backends/active", get(backends::active))
        .route("/api/backends/listening", get(backends::listening))
        .route("/api/backends/test", post(backends::test_unsaved))
        .route(
            "/api/backends/{id}",
            get(backends::get_one)
                .put(backends::update)
                .delete(backends::delete),
        )
        .route("/api/backends/{id}/activate", post(backends::activate))
        .route("/api/backends/{id}/listening", post(backends::toggle_listening))
        .route("/api/backends/{id}/test", post(backends::test_saved))
        .route("/api/backends/{id}/clear-data", post(backends::clear_data))
        // Database maintenance.
        .route("/api/db/stats", get(db::stats))
        .route("/api/db/cleanup", post(db::cleanup))
        .route("/api/db/vacuum", post(db::vacuum))
        .route("/api/db/retention", get(db::get_retention).put(db::put_retention))
        .with_state(state)
}

/// Binds and serves until the token is cancelled.
pub async fn serve(state: Arc<AppState>, port: u16, cancel: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding API listener on {addr}"))?;
    info!(addr = %addr, "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("serving API")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_iso_accepts_utc_and_offsets() {
        assert_eq!(parse_iso("1970-01-01T00:00:00Z").expect("epoch"), 0);
        assert_eq!(
            parse_iso("1970-01-01T01:00:00+01:00").expect("offset"),
            0,
        );
        assert!(parse_iso("yesterday").is_err());
    }

    #[test]
    fn test_window_requires_both_bounds() {
        let q = StatsQuery {
            start: Some("2024-05-01T00:00:00Z".into()),
            ..Default::default()
        };
        assert!(q.window().is_err());

        let q = StatsQuery {
            start: Some("2024-05-01T00:00:00Z".into()),
            end: Some("2024-05-02T00:00:00Z".into()),
            ..Default::default()
        };
        let window = q.window().expect("valid");
        assert!(window.start_ms.is_some());
        assert!(window.end_ms.is_some());
    }

    #[test]
    fn test_window_rejects_inverted_range() {
        let q = StatsQuery {
            start: Some("2024-05-02T00:00:00Z".into()),
            end: Some("2024-05-01T00:00:00Z".into()),
            ..Default::default()
        };
        assert!(q.window().is_err());
    }

    #[test]
    fn test_limit_clamps() {
        let q = StatsQuery {
            limit: Some(9999),
            ..Default::default()
        };
        assert_eq!(q.clamped_limit(50), 500);
        assert_eq!(StatsQuery::default().clamped_limit(50), 50);
    }
}
