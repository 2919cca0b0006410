use chrono::{DateTime, Utc};
use serde::Serialize;

/// Formats a millisecond epoch timestamp as ISO-8601 UTC.
pub fn iso_ms(ts_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Half-open `[start, end)` query window over `ts_bucket`, in epoch
/// milliseconds. Absent bounds span all time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

impl TimeWindow {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains_bucket(&self, bucket_ms: i64) -> bool {
        if let Some(start) = self.start_ms {
            if bucket_ms < start {
                return false;
            }
        }
        if let Some(end) = self.end_ms {
            if bucket_ms >= end {
                return false;
            }
        }
        true
    }
}

/// Byte and connection totals shared by summary responses.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TrafficTotals {
    #[serde(rename = "totalUpload")]
    pub upload: u64,
    #[serde(rename = "totalDownload")]
    pub download: u64,
    #[serde(rename = "totalConnections")]
    pub connections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainRow {
    pub host: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
    #[serde(rename = "lastSeen")]
    pub last_seen: String,
    #[serde(skip)]
    pub last_seen_ms: i64,
    #[serde(rename = "ipsSeen")]
    pub ips_seen: u64,
    #[serde(rename = "chainsSeen")]
    pub chains_seen: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpRow {
    pub ip: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
    #[serde(rename = "lastSeen")]
    pub last_seen: String,
    #[serde(skip)]
    pub last_seen_ms: i64,
    #[serde(rename = "countryCode")]
    pub country_code: String,
    pub location: String,
    #[serde(rename = "domainsSeen")]
    pub domains_seen: u64,
    #[serde(rename = "chainsSeen")]
    pub chains_seen: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyRow {
    pub chain: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleRow {
    pub rule: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRow {
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CountryRow {
    #[serde(rename = "countryCode")]
    pub country_code: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

/// One hourly time-series point; also the trend bucket shape.
#[derive(Debug, Clone, Serialize)]
pub struct HourlyRow {
    #[serde(rename = "timeBucket")]
    pub time_bucket: String,
    #[serde(skip)]
    pub bucket_ms: i64,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

impl HourlyRow {
    pub fn at_bucket(bucket_ms: i64) -> Self {
        Self {
            time_bucket: iso_ms(bucket_ms),
            bucket_ms,
            upload: 0,
            download: 0,
            connections: 0,
        }
    }
}

/// Drill-down row: one destination IP reached through a domain/proxy.
#[derive(Debug, Clone, Serialize)]
pub struct IpDetailRow {
    pub ip: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
    #[serde(rename = "countryCode")]
    pub country_code: String,
    pub location: String,
}

/// Drill-down row: one domain behind an IP/proxy/rule.
#[derive(Debug, Clone, Serialize)]
pub struct DomainDetailRow {
    pub host: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

/// Per-backend totals for the cross-backend aggregate view.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalBackendRow {
    #[serde(rename = "backendId")]
    pub backend_id: i64,
    pub name: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

/// Paginated list envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Pagination and ordering for list queries. `sort_by` values outside
/// the per-query whitelist fall back to download descending.
#[derive(Debug, Clone)]
pub struct PageParams {
    pub offset: u32,
    pub limit: u32,
    pub sort_by: Option<String>,
    pub sort_order: SortOrder,
    pub search: Option<String>,
}

impl PageParams {
    pub const MAX_LIMIT: u32 = 500;

    pub fn clamped_limit(&self) -> u32 {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
            sort_by: None,
            sort_order: SortOrder::Desc,
            search: None,
        }
    }
}

/// Persisted record of a closed connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionLogRow {
    pub id: i64,
    #[serde(rename = "connectionId")]
    pub conn_id: String,
    pub host: String,
    pub ip: String,
    pub chain: String,
    pub rule: String,
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
    pub network: String,
    pub upload: u64,
    pub download: u64,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "closedAt")]
    pub closed_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_half_open() {
        let w = TimeWindow {
            start_ms: Some(1000),
            end_ms: Some(2000),
        };
        assert!(!w.contains_bucket(999));
        assert!(w.contains_bucket(1000));
        assert!(w.contains_bucket(1999));
        assert!(!w.contains_bucket(2000));
    }

    #[test]
    fn test_window_unbounded() {
        assert!(TimeWindow::all().contains_bucket(i64::MIN));
        assert!(TimeWindow::all().contains_bucket(i64::MAX));
    }

    #[test]
    fn test_iso_ms_is_utc() {
        assert_eq!(iso_ms(0), "1970-01-01T00:00:00.000Z");
    }
}
