use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::model::{
    day_start_ms, BackendId, DimensionKey, FlushBatch, FlushRow, GeoInfo, StatDelta,
};
use crate::store::rows::{
    CountryRow, DeviceRow, DomainRow, HourlyRow, IpRow, ProxyRow, RuleRow, TimeWindow,
    TrafficTotals,
};

/// Cached IP-dimension entry; geo attributes stick from the first
/// resolution.
#[derive(Debug, Clone, Default)]
struct IpEntry {
    delta: StatDelta,
    geo: Option<GeoInfo>,
}

/// Un-flushed aggregates for one backend, mirroring every aggregate
/// table keyed identically (dimension key + hour bucket).
#[derive(Debug, Default)]
struct RealtimeBucket {
    hourly: HashMap<i64, StatDelta>,
    domains: HashMap<(String, i64), StatDelta>,
    ips: HashMap<(String, i64), IpEntry>,
    proxies: HashMap<(String, i64), StatDelta>,
    rules: HashMap<(String, i64), StatDelta>,
    devices: HashMap<(String, i64), StatDelta>,
    countries: HashMap<(String, i64), StatDelta>,
    domain_chain: HashMap<(String, String, i64), StatDelta>,
    ip_chain: HashMap<(String, String, i64), StatDelta>,
    domain_ip: HashMap<(String, String, i64), StatDelta>,
    rule_domain: HashMap<(String, String, i64), StatDelta>,
    rule_chain: HashMap<(String, String, i64), StatDelta>,
    device_domain_chain: HashMap<(String, String, String, i64), StatDelta>,
    device_ip_chain: HashMap<(String, String, String, i64), StatDelta>,

    /// Un-flushed bytes observed since the last UTC midnight.
    today_day_ms: i64,
    today_upload: u64,
    today_download: u64,
}

impl RealtimeBucket {
    fn apply(&mut self, key: DimensionKey, bucket_ms: i64, delta: StatDelta, geo: Option<GeoInfo>) {
        match key {
            DimensionKey::Hourly => {
                self.hourly.entry(bucket_ms).or_default().merge(&delta);
                self.roll_today(delta.last_seen_ms);
                self.today_upload = self.today_upload.saturating_add(delta.upload);
                self.today_download = self.today_download.saturating_add(delta.download);
            }
            DimensionKey::Domain { host } => {
                self.domains.entry((host, bucket_ms)).or_default().merge(&delta);
            }
            DimensionKey::Ip { ip } => {
                let entry = self.ips.entry((ip, bucket_ms)).or_default();
                entry.delta.merge(&delta);
                if entry.geo.is_none() {
                    entry.geo = geo;
                }
            }
            DimensionKey::Proxy { chain } => {
                self.proxies.entry((chain, bucket_ms)).or_default().merge(&delta);
            }
            DimensionKey::Rule { rule } => {
                self.rules.entry((rule, bucket_ms)).or_default().merge(&delta);
            }
            DimensionKey::Device { source_ip } => {
                self.devices
                    .entry((source_ip, bucket_ms))
                    .or_default()
                    .merge(&delta);
            }
            DimensionKey::Country { code } => {
                self.countries.entry((code, bucket_ms)).or_default().merge(&delta);
            }
            DimensionKey::DomainChain { host, chain } => {
                self.domain_chain
                    .entry((host, chain, bucket_ms))
                    .or_default()
                    .merge(&delta);
            }
            DimensionKey::IpChain { ip, chain } => {
                self.ip_chain
                    .entry((ip, chain, bucket_ms))
                    .or_default()
                    .merge(&delta);
            }
            DimensionKey::DomainIp { host, ip } => {
                self.domain_ip
                    .entry((host, ip, bucket_ms))
                    .or_default()
                    .merge(&delta);
            }
            DimensionKey::RuleDomain { rule, host } => {
                self.rule_domain
                    .entry((rule, host, bucket_ms))
                    .or_default()
                    .merge(&delta);
            }
            DimensionKey::RuleChain { rule, chain } => {
                self.rule_chain
                    .entry((rule, chain, bucket_ms))
                    .or_default()
                    .merge(&delta);
            }
            DimensionKey::DeviceDomainChain {
                source_ip,
                host,
                chain,
            } => {
                self.device_domain_chain
                    .entry((source_ip, host, chain, bucket_ms))
                    .or_default()
                    .merge(&delta);
            }
            DimensionKey::DeviceIpChain {
                source_ip,
                ip,
                chain,
            } => {
                self.device_ip_chain
                    .entry((source_ip, ip, chain, bucket_ms))
                    .or_default()
                    .merge(&delta);
            }
        }
    }

    /// Resets the today counters when the UTC day flips.
    fn roll_today(&mut self, now_ms: i64) {
        let day = day_start_ms(now_ms);
        if day != self.today_day_ms {
            self.today_day_ms = day;
            self.today_upload = 0;
            self.today_download = 0;
        }
    }

    fn is_empty(&self) -> bool {
        self.hourly.is_empty()
            && self.domains.is_empty()
            && self.ips.is_empty()
            && self.proxies.is_empty()
            && self.rules.is_empty()
            && self.devices.is_empty()
            && self.countries.is_empty()
            && self.domain_chain.is_empty()
            && self.ip_chain.is_empty()
            && self.domain_ip.is_empty()
            && self.rule_domain.is_empty()
            && self.rule_chain.is_empty()
            && self.device_domain_chain.is_empty()
            && self.device_ip_chain.is_empty()
    }

    fn drain(&mut self) -> FlushBatch {
        let mut rows = Vec::new();

        for (bucket, delta) in self.hourly.drain() {
            rows.push(FlushRow {
                key: DimensionKey::Hourly,
                bucket_ms: bucket,
                delta,
                geo: None,
            });
        }
        for ((host, bucket), delta) in self.domains.drain() {
            rows.push(FlushRow {
                key: DimensionKey::Domain { host },
                bucket_ms: bucket,
                delta,
                geo: None,
            });
        }
        for ((ip, bucket), entry) in self.ips.drain() {
            rows.push(FlushRow {
                key: DimensionKey::Ip { ip },
                bucket_ms: bucket,
                delta: entry.delta,
                geo: entry.geo,
            });
        }
        for ((chain, bucket), delta) in self.proxies.drain() {
            rows.push(FlushRow {
                key: DimensionKey::Proxy { chain },
                bucket_ms: bucket,
                delta,
                geo: None,
            });
        }
        for ((rule, bucket), delta) in self.rules.drain() {
            rows.push(FlushRow {
                key: DimensionKey::Rule { rule },
                bucket_ms: bucket,
                delta,
                geo: None,
            });
        }
        for ((source_ip, bucket), delta) in self.devices.drain() {
            rows.push(FlushRow {
                key: DimensionKey::Device { source_ip },
                bucket_ms: bucket,
                delta,
                geo: None,
            });
        }
        for ((code, bucket), delta) in self.countries.drain() {
            rows.push(FlushRow {
                key: DimensionKey::Country { code },
                bucket_ms: bucket,
                delta,
                geo: None,
            });
        }
        for ((host, chain, bucket), delta) in self.domain_chain.drain() {
            rows.push(FlushRow {
                key: DimensionKey::DomainChain { host, chain },
                bucket_ms: bucket,
                delta,
                geo: None,
            });
        }
        for ((ip, chain, bucket), delta) in self.ip_chain.drain() {
            rows.push(FlushRow {
                key: DimensionKey::IpChain { ip, chain },
                bucket_ms: bucket,
                delta,
                geo: None,
            });
        }
        for ((host, ip, bucket), delta) in self.domain_ip.drain() {
            rows.push(FlushRow {
                key: DimensionKey::DomainIp { host, ip },
                bucket_ms: bucket,
                delta,
                geo: None,
            });
        }
        for ((rule, host, bucket), delta) in self.rule_domain.drain() {
            rows.push(FlushRow {
                key: DimensionKey::RuleDomain { rule, host },
                bucket_ms: bucket,
                delta,
                geo: None,
            });
        }
        for ((rule, chain, bucket), delta) in self.rule_chain.drain() {
            rows.push(FlushRow {
                key: DimensionKey::RuleChain { rule, chain },
                bucket_ms: bucket,
                delta,
                geo: None,
            });
        }
        for ((source_ip, host, chain, bucket), delta) in self.device_domain_chain.drain() {
            rows.push(FlushRow {
                key: DimensionKey::DeviceDomainChain {
                    source_ip,
                    host,
                    chain,
                },
                bucket_ms: bucket,
                delta,
                geo: None,
            });
        }
        for ((source_ip, ip, chain, bucket), delta) in self.device_ip_chain.drain() {
            rows.push(FlushRow {
                key: DimensionKey::DeviceIpChain {
                    source_ip,
                    ip,
                    chain,
                },
                bucket_ms: bucket,
                delta,
                geo: None,
            });
        }

        self.today_upload = 0;
        self.today_download = 0;

        FlushBatch { rows }
    }
}

/// Hot per-backend aggregate holding deltas the store has not seen yet.
///
/// Serves two masters: the flusher drains it, and read queries overlay
/// it onto store rows so dashboards see near-real-time numbers. Each
/// backend's bucket sits behind its own mutex; merge computation happens
/// on snapshot copies taken under the lock.
pub struct RealtimeCache {
    buckets: DashMap<BackendId, Mutex<RealtimeBucket>>,
    tolerance_ms: i64,
}

impl RealtimeCache {
    pub fn new(tolerance_ms: i64) -> Self {
        Self {
            buckets: DashMap::new(),
            tolerance_ms,
        }
    }

    /// Additively merges one dimension-keyed delta.
    pub fn apply(
        &self,
        backend_id: BackendId,
        key: DimensionKey,
        bucket_ms: i64,
        delta: StatDelta,
        geo: Option<GeoInfo>,
    ) {
        let entry = self.buckets.entry(backend_id).or_default();
        entry.lock().apply(key, bucket_ms, delta, geo);
    }

    /// Backends with pending (or previously pending) data.
    pub fn backend_ids(&self) -> Vec<BackendId> {
        self.buckets.iter().map(|e| *e.key()).collect()
    }

    /// Atomically snapshots and clears every pending delta for one
    /// backend. Flusher-only.
    pub fn drain(&self, backend_id: BackendId) -> FlushBatch {
        match self.buckets.get(&backend_id) {
            Some(bucket) => bucket.lock().drain(),
            None => FlushBatch::default(),
        }
    }

    /// Re-applies rows that failed to persist so the next flush retries
    /// them.
    pub fn restore(&self, backend_id: BackendId, rows: Vec<FlushRow>) {
        let entry = self.buckets.entry(backend_id).or_default();
        let mut bucket = entry.lock();
        for row in rows {
            bucket.apply(row.key, row.bucket_ms, row.delta, row.geo);
        }
    }

    /// Wipes a backend's pending data without flushing (data-clear path).
    pub fn clear_backend(&self, backend_id: BackendId) {
        self.buckets.remove(&backend_id);
    }

    /// True when any backend holds pending data.
    pub fn has_pending(&self, backend_id: BackendId) -> bool {
        self.buckets
            .get(&backend_id)
            .map(|b| !b.lock().is_empty())
            .unwrap_or(false)
    }

    /// Overlay policy: hot deltas are merged into a response only when
    /// the requested window reaches near enough to now. Historical
    /// windows get store data verbatim.
    pub fn overlay_applies(&self, end_ms: Option<i64>, now_ms: i64) -> bool {
        match end_ms {
            None => true,
            Some(end) => end >= now_ms - self.tolerance_ms,
        }
    }

    /// Un-flushed upload/download observed since UTC midnight.
    pub fn today_delta(&self, backend_id: BackendId, now_ms: i64) -> (u64, u64) {
        match self.buckets.get(&backend_id) {
            Some(bucket) => {
                let mut b = bucket.lock();
                b.roll_today(now_ms);
                (b.today_upload, b.today_download)
            }
            None => (0, 0),
        }
    }

    /// Adds pending hourly deltas within the window to summary totals.
    pub fn apply_summary(
        &self,
        backend_id: BackendId,
        totals: &mut TrafficTotals,
        window: TimeWindow,
    ) {
        for (bucket_ms, delta) in self.snapshot_hourly(backend_id) {
            if window.contains_bucket(bucket_ms) {
                totals.upload = totals.upload.saturating_add(delta.upload);
                totals.download = totals.download.saturating_add(delta.download);
                totals.connections = totals.connections.saturating_add(delta.connections);
            }
        }
    }

    fn snapshot_hourly(&self, backend_id: BackendId) -> Vec<(i64, StatDelta)> {
        match self.buckets.get(&backend_id) {
            Some(b) => b.lock().hourly.iter().map(|(k, v)| (*k, *v)).collect(),
            None => Vec::new(),
        }
    }

    /// Merges cached domain deltas into a DB-sorted top list, re-sorts
    /// by download, and truncates to `top_n`.
    pub fn merge_top_domains(
        &self,
        backend_id: BackendId,
        base: Vec<DomainRow>,
        window: TimeWindow,
        top_n: usize,
    ) -> Vec<DomainRow> {
        let cached: Vec<((String, i64), StatDelta)> = match self.buckets.get(&backend_id) {
            Some(b) => b
                .lock()
                .domains
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            None => return truncate_sorted(base, top_n, |r| r.download),
        };

        let mut merged: HashMap<String, DomainRow> =
            base.into_iter().map(|r| (r.host.clone(), r)).collect();
        for ((host, bucket_ms), delta) in cached {
            if !window.contains_bucket(bucket_ms) {
                continue;
            }
            let row = merged.entry(host.clone()).or_insert_with(|| DomainRow {
                host,
                upload: 0,
                download: 0,
                connections: 0,
                last_seen: String::new(),
                last_seen_ms: 0,
                ips_seen: 0,
                chains_seen: 0,
            });
            row.upload = row.upload.saturating_add(delta.upload);
            row.download = row.download.saturating_add(delta.download);
            row.connections = row.connections.saturating_add(delta.connections);
            if delta.last_seen_ms > row.last_seen_ms {
                row.last_seen_ms = delta.last_seen_ms;
                row.last_seen = crate::store::rows::iso_ms(delta.last_seen_ms);
            }
        }

        truncate_sorted(merged.into_values().collect(), top_n, |r| r.download)
    }

    /// Merges cached IP deltas into a DB-sorted top list.
    pub fn merge_top_ips(
        &self,
        backend_id: BackendId,
        base: Vec<IpRow>,
        window: TimeWindow,
        top_n: usize,
    ) -> Vec<IpRow> {
        let cached: Vec<((String, i64), IpEntry)> = match self.buckets.get(&backend_id) {
            Some(b) => b
                .lock()
                .ips
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => return truncate_sorted(base, top_n, |r| r.download),
        };

        let mut merged: HashMap<String, IpRow> =
            base.into_iter().map(|r| (r.ip.clone(), r)).collect();
        for ((ip, bucket_ms), entry) in cached {
            if !window.contains_bucket(bucket_ms) {
                continue;
            }
            let row = merged.entry(ip.clone()).or_insert_with(|| IpRow {
                ip,
                upload: 0,
                download: 0,
                connections: 0,
                last_seen: String::new(),
                last_seen_ms: 0,
                country_code: String::new(),
                location: String::new(),
                domains_seen: 0,
                chains_seen: 0,
            });
            row.upload = row.upload.saturating_add(entry.delta.upload);
            row.download = row.download.saturating_add(entry.delta.download);
            row.connections = row.connections.saturating_add(entry.delta.connections);
            if entry.delta.last_seen_ms > row.last_seen_ms {
                row.last_seen_ms = entry.delta.last_seen_ms;
                row.last_seen = crate::store::rows::iso_ms(entry.delta.last_seen_ms);
            }
            if row.country_code.is_empty() {
                if let Some(geo) = entry.geo {
                    row.country_code = geo.country_code;
                    row.location = geo.location;
                }
            }
        }

        truncate_sorted(merged.into_values().collect(), top_n, |r| r.download)
    }

    /// Merges cached proxy-chain deltas into a DB-sorted list.
    pub fn merge_proxy_stats(
        &self,
        backend_id: BackendId,
        base: Vec<ProxyRow>,
        window: TimeWindow,
        top_n: usize,
    ) -> Vec<ProxyRow> {
        let cached: Vec<((String, i64), StatDelta)> = match self.buckets.get(&backend_id) {
            Some(b) => b
                .lock()
                .proxies
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            None => return truncate_sorted(base, top_n, |r| r.download),
        };

        let mut merged: HashMap<String, ProxyRow> =
            base.into_iter().map(|r| (r.chain.clone(), r)).collect();
        for ((chain, bucket_ms), delta) in cached {
            if !window.contains_bucket(bucket_ms) {
                continue;
            }
            let row = merged.entry(chain.clone()).or_insert_with(|| ProxyRow {
                chain,
                upload: 0,
                download: 0,
                connections: 0,
            });
            row.upload = row.upload.saturating_add(delta.upload);
            row.download = row.download.saturating_add(delta.download);
            row.connections = row.connections.saturating_add(delta.connections);
        }

        truncate_sorted(merged.into_values().collect(), top_n, |r| r.download)
    }

    /// Merges cached rule deltas into a DB-sorted list.
    pub fn merge_rule_stats(
        &self,
        backend_id: BackendId,
        base: Vec<RuleRow>,
        window: TimeWindow,
        top_n: usize,
    ) -> Vec<RuleRow> {
        let cached: Vec<((String, i64), StatDelta)> = match self.buckets.get(&backend_id) {
            Some(b) => b
                .lock()
                .rules
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            None => return truncate_sorted(base, top_n, |r| r.download),
        };

        let mut merged: HashMap<String, RuleRow> =
            base.into_iter().map(|r| (r.rule.clone(), r)).collect();
        for ((rule, bucket_ms), delta) in cached {
            if !window.contains_bucket(bucket_ms) {
                continue;
            }
            let row = merged.entry(rule.clone()).or_insert_with(|| RuleRow {
                rule,
                upload: 0,
                download: 0,
                connections: 0,
            });
            row.upload = row.upload.saturating_add(delta.upload);
            row.download = row.download.saturating_add(delta.download);
            row.connections = row.connections.saturating_add(delta.connections);
        }

        truncate_sorted(merged.into_values().collect(), top_n, |r| r.download)
    }

    /// Merges cached country deltas into a DB-sorted list.
    pub fn merge_country_stats(
        &self,
        backend_id: BackendId,
        base: Vec<CountryRow>,
        window: TimeWindow,
        top_n: usize,
    ) -> Vec<CountryRow> {
        let cached: Vec<((String, i64), StatDelta)> = match self.buckets.get(&backend_id) {
            Some(b) => b
                .lock()
                .countries
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            None => return truncate_sorted(base, top_n, |r| r.download),
        };

        let mut merged: HashMap<String, CountryRow> =
            base.into_iter().map(|r| (r.country_code.clone(), r)).collect();
        for ((code, bucket_ms), delta) in cached {
            if !window.contains_bucket(bucket_ms) {
                continue;
            }
            let row = merged.entry(code.clone()).or_insert_with(|| CountryRow {
                country_code: code,
                upload: 0,
                download: 0,
                connections: 0,
            });
            row.upload = row.upload.saturating_add(delta.upload);
            row.download = row.download.saturating_add(delta.download);
            row.connections = row.connections.saturating_add(delta.connections);
        }

        truncate_sorted(merged.into_values().collect(), top_n, |r| r.download)
    }

    /// Merges cached device deltas into a DB-sorted list.
    pub fn merge_device_stats(
        &self,
        backend_id: BackendId,
        base: Vec<DeviceRow>,
        window: TimeWindow,
        top_n: usize,
    ) -> Vec<DeviceRow> {
        let cached: Vec<((String, i64), StatDelta)> = match self.buckets.get(&backend_id) {
            Some(b) => b
                .lock()
                .devices
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            None => return truncate_sorted(base, top_n, |r| r.download),
        };

        let mut merged: HashMap<String, DeviceRow> =
            base.into_iter().map(|r| (r.source_ip.clone(), r)).collect();
        for ((source_ip, bucket_ms), delta) in cached {
            if !window.contains_bucket(bucket_ms) {
                continue;
            }
            let row = merged.entry(source_ip.clone()).or_insert_with(|| DeviceRow {
                source_ip,
                upload: 0,
                download: 0,
                connections: 0,
            });
            row.upload = row.upload.saturating_add(delta.upload);
            row.download = row.download.saturating_add(delta.download);
            row.connections = row.connections.saturating_add(delta.connections);
        }

        truncate_sorted(merged.into_values().collect(), top_n, |r| r.download)
    }

    /// Overlays cached hourly deltas onto a time-series whose buckets
    /// fall inside the trend window.
    pub fn merge_trend(
        &self,
        backend_id: BackendId,
        mut base: Vec<HourlyRow>,
        window_start_ms: i64,
    ) -> Vec<HourlyRow> {
        let cached = self.snapshot_hourly(backend_id);
        if cached.is_empty() {
            return base;
        }

        for (bucket_ms, delta) in cached {
            if bucket_ms < window_start_ms {
                continue;
            }
            match base.iter_mut().find(|r| r.bucket_ms == bucket_ms) {
                Some(row) => {
                    row.upload = row.upload.saturating_add(delta.upload);
                    row.download = row.download.saturating_add(delta.download);
                    row.connections = row.connections.saturating_add(delta.connections);
                }
                None => {
                    let mut row = HourlyRow::at_bucket(bucket_ms);
                    row.upload = delta.upload;
                    row.download = delta.download;
                    row.connections = delta.connections;
                    base.push(row);
                }
            }
        }

        base.sort_by_key(|r| r.bucket_ms);
        base
    }
}

fn truncate_sorted<T, F: Fn(&T) -> u64>(mut rows: Vec<T>, top_n: usize, key: F) -> Vec<T> {
    rows.sort_by(|a, b| key(b).cmp(&key(a)));
    rows.truncate(top_n);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HOUR_MS;

    fn delta(upload: u64, download: u64, at: i64) -> StatDelta {
        StatDelta {
            upload,
            download,
            connections: 1,
            last_seen_ms: at,
        }
    }

    #[test]
    fn test_apply_and_drain_roundtrip() {
        let cache = RealtimeCache::new(120_000);
        cache.apply(1, DimensionKey::Hourly, 0, delta(10, 20, 5), None);
        cache.apply(
            1,
            DimensionKey::Domain {
                host: "a.example".into(),
            },
            0,
            delta(10, 20, 5),
            None,
        );

        assert!(cache.has_pending(1));
        let batch = cache.drain(1);
        assert_eq!(batch.rows.len(), 2);
        assert!(!cache.has_pending(1));

        // Second drain is empty: the clear is atomic with the snapshot.
        assert!(cache.drain(1).is_empty());
    }

    #[test]
    fn test_apply_merges_same_key() {
        let cache = RealtimeCache::new(120_000);
        let key = DimensionKey::Proxy {
            chain: "P > R".into(),
        };
        cache.apply(1, key.clone(), 0, delta(10, 0, 1), None);
        cache.apply(1, key, 0, delta(5, 7, 2), None);

        let batch = cache.drain(1);
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].delta.upload, 15);
        assert_eq!(batch.rows[0].delta.download, 7);
        assert_eq!(batch.rows[0].delta.connections, 2);
        assert_eq!(batch.rows[0].delta.last_seen_ms, 2);
    }

    #[test]
    fn test_restore_after_failed_flush() {
        let cache = RealtimeCache::new(120_000);
        cache.apply(1, DimensionKey::Hourly, 0, delta(10, 20, 5), None);
        let batch = cache.drain(1);
        cache.restore(1, batch.rows);
        let batch = cache.drain(1);
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].delta.upload, 10);
    }

    #[test]
    fn test_overlay_policy() {
        let cache = RealtimeCache::new(120_000);
        let now = 10_000_000;
        assert!(cache.overlay_applies(None, now));
        assert!(cache.overlay_applies(Some(now), now));
        assert!(cache.overlay_applies(Some(now - 120_000), now));
        assert!(!cache.overlay_applies(Some(now - 120_001), now));
    }

    #[test]
    fn test_today_delta_resets_at_midnight() {
        let cache = RealtimeCache::new(120_000);
        let day1 = crate::model::DAY_MS + 1000;
        cache.apply(1, DimensionKey::Hourly, 0, delta(100, 200, day1), None);
        assert_eq!(cache.today_delta(1, day1), (100, 200));

        // Next UTC day: counters reset.
        let day2 = 2 * crate::model::DAY_MS + 1000;
        assert_eq!(cache.today_delta(1, day2), (0, 0));
    }

    #[test]
    fn test_apply_summary_respects_window() {
        let cache = RealtimeCache::new(120_000);
        cache.apply(1, DimensionKey::Hourly, 0, delta(10, 10, 0), None);
        cache.apply(1, DimensionKey::Hourly, HOUR_MS, delta(5, 5, HOUR_MS), None);

        let mut totals = TrafficTotals::default();
        cache.apply_summary(
            1,
            &mut totals,
            TimeWindow {
                start_ms: Some(HOUR_MS),
                end_ms: None,
            },
        );
        assert_eq!(totals.upload, 5);
        assert_eq!(totals.download, 5);
    }

    #[test]
    fn test_merge_top_domains_overlays_and_truncates() {
        let cache = RealtimeCache::new(120_000);
        cache.apply(
            1,
            DimensionKey::Domain {
                host: "hot.example".into(),
            },
            0,
            delta(0, 500, 10),
            None,
        );
        cache.apply(
            1,
            DimensionKey::Domain {
                host: "a.example".into(),
            },
            0,
            delta(0, 50, 10),
            None,
        );

        let base = vec![DomainRow {
            host: "a.example".into(),
            upload: 0,
            download: 100,
            connections: 3,
            last_seen: String::new(),
            last_seen_ms: 0,
            ips_seen: 1,
            chains_seen: 1,
        }];

        let merged = cache.merge_top_domains(1, base, TimeWindow::all(), 1);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].host, "hot.example");
        assert_eq!(merged[0].download, 500);
    }

    #[test]
    fn test_merge_top_domains_adds_to_existing_rows() {
        let cache = RealtimeCache::new(120_000);
        cache.apply(
            1,
            DimensionKey::Domain {
                host: "a.example".into(),
            },
            0,
            delta(25, 250, 10),
            None,
        );

        let base = vec![DomainRow {
            host: "a.example".into(),
            upload: 100,
            download: 1000,
            connections: 3,
            last_seen: String::new(),
            last_seen_ms: 0,
            ips_seen: 1,
            chains_seen: 1,
        }];

        let merged = cache.merge_top_domains(1, base, TimeWindow::all(), 10);
        assert_eq!(merged[0].upload, 125);
        assert_eq!(merged[0].download, 1250);
        assert_eq!(merged[0].connections, 4);
    }

    #[test]
    fn test_merge_trend_adds_missing_buckets() {
        let cache = RealtimeCache::new(120_000);
        cache.apply(1, DimensionKey::Hourly, HOUR_MS, delta(1, 2, HOUR_MS), None);
        cache.apply(
            1,
            DimensionKey::Hourly,
            2 * HOUR_MS,
            delta(10, 20, 2 * HOUR_MS),
            None,
        );

        let base = vec![HourlyRow {
            time_bucket: crate::store::rows::iso_ms(HOUR_MS),
            bucket_ms: HOUR_MS,
            upload: 100,
            download: 100,
            connections: 1,
        }];

        let merged = cache.merge_trend(1, base, HOUR_MS);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].bucket_ms, HOUR_MS);
        assert_eq!(merged[0].upload, 101);
        assert_eq!(merged[1].bucket_ms, 2 * HOUR_MS);
        assert_eq!(merged[1].download, 20);
    }

    #[test]
    fn test_clear_backend_is_isolated() {
        let cache = RealtimeCache::new(120_000);
        cache.apply(1, DimensionKey::Hourly, 0, delta(1, 1, 0), None);
        cache.apply(2, DimensionKey::Hourly, 0, delta(2, 2, 0), None);

        cache.clear_backend(1);
        assert!(!cache.has_pending(1));
        assert!(cache.has_pending(2));
    }
}
