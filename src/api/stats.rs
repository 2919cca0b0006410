use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::model::day_start_ms;
use crate::store::rows::{
    ConnectionLogRow, CountryRow, DeviceRow, DomainDetailRow, DomainRow, GlobalBackendRow,
    HourlyRow, IpDetailRow, IpRow, Page, PageParams, ProxyRow, RuleRow, SortOrder, TimeWindow,
    TrafficTotals,
};

use super::{ApiError, ApiResult, AppState, StatsQuery};

const TOP_N: usize = 10;
const DEFAULT_LIST_LIMIT: u32 = 50;
const DEFAULT_DETAIL_LIMIT: u32 = 20;
const DEFAULT_TREND_MINUTES: i64 = 24 * 60;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn page_params(q: &StatsQuery) -> PageParams {
    PageParams {
        offset: q.offset.unwrap_or(0),
        limit: q.clamped_limit(DEFAULT_LIST_LIMIT),
        sort_by: q.sort_by.clone(),
        sort_order: match q.sort_order.as_deref() {
            Some(order) if order.eq_ignore_ascii_case("asc") => SortOrder::Asc,
            _ => SortOrder::Desc,
        },
        search: q.search.clone(),
    }
}

#[derive(Debug, Serialize)]
pub struct TodayStats {
    pub upload: u64,
    pub download: u64,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    #[serde(rename = "backendId")]
    pub backend_id: i64,
    #[serde(flatten)]
    pub totals: TrafficTotals,
    pub today: TodayStats,
    #[serde(rename = "topDomains")]
    pub top_domains: Vec<DomainRow>,
    #[serde(rename = "topIps")]
    pub top_ips: Vec<IpRow>,
    #[serde(rename = "proxyStats")]
    pub proxy_stats: Vec<ProxyRow>,
    #[serde(rename = "ruleStats")]
    pub rule_stats: Vec<RuleRow>,
    #[serde(rename = "hourlyStats")]
    pub hourly_stats: Vec<HourlyRow>,
    pub overlaid: bool,
}

/// `GET /api/stats/summary` — dashboard headline numbers; hot deltas are
/// overlaid when the window reaches near enough to now.
pub async fn summary(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<SummaryResponse>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let now = now_ms();
    let overlaid = state.cache.overlay_applies(window.end_ms, now);

    let mut totals = state.store.summary_totals(backend_id, window).await?;
    let (mut today_up, mut today_down) =
        state.store.today_totals(backend_id, day_start_ms(now)).await?;
    let mut top_domains = state
        .store
        .top_domains(backend_id, window, TOP_N as u32)
        .await?;
    let mut top_ips = state.store.top_ips(backend_id, window, TOP_N as u32).await?;
    let mut proxy_stats = state
        .store
        .proxy_stats(backend_id, window, DEFAULT_LIST_LIMIT)
        .await?;
    let mut rule_stats = state
        .store
        .rule_stats(backend_id, window, DEFAULT_LIST_LIMIT)
        .await?;
    let mut hourly_stats = state.store.hourly_series(backend_id, window, 24).await?;

    if overlaid {
        state.cache.apply_summary(backend_id, &mut totals, window);
        let (cached_up, cached_down) = state.cache.today_delta(backend_id, now);
        today_up += cached_up;
        today_down += cached_down;
        top_domains = state
            .cache
            .merge_top_domains(backend_id, top_domains, window, TOP_N);
        top_ips = state.cache.merge_top_ips(backend_id, top_ips, window, TOP_N);
        proxy_stats = state.cache.merge_proxy_stats(
            backend_id,
            proxy_stats,
            window,
            DEFAULT_LIST_LIMIT as usize,
        );
        rule_stats = state.cache.merge_rule_stats(
            backend_id,
            rule_stats,
            window,
            DEFAULT_LIST_LIMIT as usize,
        );
        let trend_start = hourly_stats.first().map(|r| r.bucket_ms).unwrap_or(0);
        hourly_stats = state.cache.merge_trend(backend_id, hourly_stats, trend_start);
    }

    Ok(Json(SummaryResponse {
        backend_id,
        totals,
        today: TodayStats {
            upload: today_up,
            download: today_down,
        },
        top_domains,
        top_ips,
        proxy_stats,
        rule_stats,
        hourly_stats,
        overlaid,
    }))
}

#[derive(Debug, Serialize)]
pub struct GlobalResponse {
    #[serde(flatten)]
    pub totals: TrafficTotals,
    pub backends: Vec<GlobalBackendRow>,
}

/// `GET /api/stats/global` — cross-backend aggregate, store only.
pub async fn global(State(state): State<Arc<AppState>>) -> ApiResult<Json<GlobalResponse>> {
    let (totals, backends) = state.store.global_stats().await?;
    Ok(Json(GlobalResponse { totals, backends }))
}

/// `GET /api/stats/domains` — paginated domain table, no overlay.
pub async fn domains(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Page<DomainRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let page = state
        .store
        .list_domains(backend_id, window, &page_params(&q))
        .await?;
    Ok(Json(page))
}

/// `GET /api/stats/ips` — paginated IP table, no overlay.
pub async fn ips(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Page<IpRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let page = state
        .store
        .list_ips(backend_id, window, &page_params(&q))
        .await?;
    Ok(Json(page))
}

fn required<'a>(value: &'a Option<String>, name: &str) -> ApiResult<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("{name} is required")))
}

/// `GET /api/stats/domains/proxy-stats?key=<host>`
pub async fn domain_proxy_stats(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<ProxyRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let host = required(&q.key, "key")?;
    let rows = state
        .store
        .domain_proxy_stats(
            backend_id,
            host,
            window,
            q.source_ip.as_deref(),
            q.source_chain.as_deref(),
            q.clamped_limit(DEFAULT_LIST_LIMIT),
        )
        .await?;
    Ok(Json(rows))
}

/// `GET /api/stats/domains/ip-details?key=<host>`
pub async fn domain_ip_details(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<IpDetailRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let host = required(&q.key, "key")?;
    let rows = state
        .store
        .domain_ip_details(backend_id, host, window, q.clamped_limit(DEFAULT_DETAIL_LIMIT))
        .await?;
    Ok(Json(rows))
}

/// `GET /api/stats/ips/proxy-stats?key=<ip>`
pub async fn ip_proxy_stats(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<ProxyRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let ip = required(&q.key, "key")?;
    let rows = state
        .store
        .ip_proxy_stats(
            backend_id,
            ip,
            window,
            q.source_ip.as_deref(),
            q.source_chain.as_deref(),
            q.clamped_limit(DEFAULT_LIST_LIMIT),
        )
        .await?;
    Ok(Json(rows))
}

/// `GET /api/stats/ips/domain-details?key=<ip>`
pub async fn ip_domain_details(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<DomainDetailRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let ip = required(&q.key, "key")?;
    let rows = state
        .store
        .ip_domain_details(backend_id, ip, window, q.clamped_limit(DEFAULT_DETAIL_LIMIT))
        .await?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ProxiesResponse {
    Totals(ProxyRow),
    List(Vec<ProxyRow>),
}

/// `GET /api/stats/proxies[?chain=…]` — totals for one chain, or the
/// full list; realtime overlay on both.
pub async fn proxies(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<ProxiesResponse>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let now = now_ms();
    let overlaid = state.cache.overlay_applies(window.end_ms, now);

    match q.chain.as_deref().filter(|c| !c.is_empty()) {
        Some(chain) => {
            let base = state.store.proxy_totals(backend_id, chain, window).await?;
            let row = if overlaid {
                state
                    .cache
                    .merge_proxy_stats(backend_id, vec![base], window, usize::MAX)
                    .into_iter()
                    .find(|r| r.chain == chain)
                    .unwrap_or(ProxyRow {
                        chain: chain.to_string(),
                        upload: 0,
                        download: 0,
                        connections: 0,
                    })
            } else {
                base
            };
            Ok(Json(ProxiesResponse::Totals(row)))
        }
        None => {
            let limit = q.clamped_limit(DEFAULT_LIST_LIMIT);
            let mut rows = state.store.proxy_stats(backend_id, window, limit).await?;
            if overlaid {
                rows = state
                    .cache
                    .merge_proxy_stats(backend_id, rows, window, limit as usize);
            }
            Ok(Json(ProxiesResponse::List(rows)))
        }
    }
}

/// `GET /api/stats/proxies/domains?chain=…`
pub async fn proxy_domains(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<DomainDetailRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let chain = required(&q.chain, "chain")?;
    let rows = state
        .store
        .proxy_domains(backend_id, chain, window, q.clamped_limit(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(rows))
}

/// `GET /api/stats/proxies/ips?chain=…`
pub async fn proxy_ips(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<IpDetailRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let chain = required(&q.chain, "chain")?;
    let rows = state
        .store
        .proxy_ips(backend_id, chain, window, q.clamped_limit(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(rows))
}

/// `GET /api/stats/rules` — per-rule totals with overlay.
pub async fn rules(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<RuleRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let limit = q.clamped_limit(DEFAULT_LIST_LIMIT);
    let mut rows = state.store.rule_stats(backend_id, window, limit).await?;
    if state.cache.overlay_applies(window.end_ms, now_ms()) {
        rows = state
            .cache
            .merge_rule_stats(backend_id, rows, window, limit as usize);
    }
    Ok(Json(rows))
}

/// `GET /api/stats/rules/domains?rule=…`
pub async fn rule_domains(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<DomainDetailRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let rule = required(&q.rule, "rule")?;
    let rows = state
        .store
        .rule_domains(backend_id, rule, window, q.clamped_limit(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(rows))
}

/// `GET /api/stats/rules/proxies?rule=…`
pub async fn rule_proxies(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<ProxyRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let rule = required(&q.rule, "rule")?;
    let rows = state
        .store
        .rule_proxies(backend_id, rule, window, q.clamped_limit(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(rows))
}

/// `GET /api/stats/countries`
pub async fn countries(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<CountryRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let limit = q.clamped_limit(DEFAULT_LIST_LIMIT);
    let mut rows = state.store.country_stats(backend_id, window, limit).await?;
    if state.cache.overlay_applies(window.end_ms, now_ms()) {
        rows = state
            .cache
            .merge_country_stats(backend_id, rows, window, limit as usize);
    }
    Ok(Json(rows))
}

/// `GET /api/stats/devices`
pub async fn devices(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<DeviceRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let limit = q.clamped_limit(DEFAULT_LIST_LIMIT);
    let mut rows = state.store.device_stats(backend_id, window, limit).await?;
    if state.cache.overlay_applies(window.end_ms, now_ms()) {
        rows = state
            .cache
            .merge_device_stats(backend_id, rows, window, limit as usize);
    }
    Ok(Json(rows))
}

/// `GET /api/stats/hourly`
pub async fn hourly(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<HourlyRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let window = q.window()?;
    let limit = q.clamped_limit(24 * 7);
    let mut rows = state.store.hourly_series(backend_id, window, limit).await?;
    if state.cache.overlay_applies(window.end_ms, now_ms()) {
        let start = window.start_ms.unwrap_or(0);
        rows = state.cache.merge_trend(backend_id, rows, start);
    }
    Ok(Json(rows))
}

fn trend_window(q: &StatsQuery, now: i64) -> ApiResult<TimeWindow> {
    let explicit = q.window()?;
    if explicit != TimeWindow::all() {
        return Ok(explicit);
    }
    let minutes = q.window_minutes.unwrap_or(DEFAULT_TREND_MINUTES).max(1);
    Ok(TimeWindow {
        start_ms: Some(now - minutes * 60_000),
        end_ms: None,
    })
}

/// `GET /api/stats/trend` — recent time-series, hot buckets included.
pub async fn trend(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<HourlyRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let now = now_ms();
    let window = trend_window(&q, now)?;

    let mut rows = state
        .store
        .hourly_series(backend_id, window, 24 * 7)
        .await?;
    if state.cache.overlay_applies(window.end_ms, now) {
        rows = state
            .cache
            .merge_trend(backend_id, rows, window.start_ms.unwrap_or(0));
    }
    Ok(Json(rows))
}

/// `GET /api/stats/trend/aggregated` — the same series summed across
/// every backend.
pub async fn trend_aggregated(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<HourlyRow>>> {
    let now = now_ms();
    let window = trend_window(&q, now)?;

    let mut rows = state.store.hourly_series_all(window, 24 * 7).await?;
    if state.cache.overlay_applies(window.end_ms, now) {
        for backend in state.store.list_backends().await? {
            rows = state
                .cache
                .merge_trend(backend.id, rows, window.start_ms.unwrap_or(0));
        }
    }
    Ok(Json(rows))
}

/// `GET /api/stats/connections` — recent closed connections.
pub async fn connections(
    State(state): State<Arc<AppState>>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Page<ConnectionLogRow>>> {
    let backend_id = q.resolve_backend(&state).await?;
    let page = state
        .store
        .list_connection_logs(backend_id, &page_params(&q))
        .await?;
    Ok(Json(page))
}
