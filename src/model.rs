use std::sync::Arc;

use serde::Serialize;

/// Row id of a backend in the store.
pub type BackendId = i64;

/// Milliseconds in one hour, the aggregate bucket width.
pub const HOUR_MS: i64 = 3_600_000;

/// Milliseconds in one day.
pub const DAY_MS: i64 = 86_400_000;

/// Floors a millisecond timestamp to the start of its UTC hour.
pub fn hour_bucket_ms(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(HOUR_MS)
}

/// Floors a millisecond timestamp to UTC midnight.
pub fn day_start_ms(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(DAY_MS)
}

/// Aggregation dimension tag. Also defines the flush order: the
/// most-queried dimensions are persisted first so a partial flush
/// failure leaves them consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Hourly,
    Domain,
    Ip,
    Proxy,
    Rule,
    Device,
    Country,
    DomainChain,
    IpChain,
    DomainIp,
    RuleDomain,
    RuleChain,
    DeviceDomainChain,
    DeviceIpChain,
}

/// All dimensions in flush order.
pub const FLUSH_ORDER: [Dimension; 14] = [
    Dimension::Hourly,
    Dimension::Domain,
    Dimension::Ip,
    Dimension::Proxy,
    Dimension::Rule,
    Dimension::Device,
    Dimension::Country,
    Dimension::DomainChain,
    Dimension::IpChain,
    Dimension::DomainIp,
    Dimension::RuleDomain,
    Dimension::RuleChain,
    Dimension::DeviceDomainChain,
    Dimension::DeviceIpChain,
];

impl Dimension {
    /// Table name backing this dimension in the store.
    pub fn table(self) -> &'static str {
        match self {
            Dimension::Hourly => "hourly_stats",
            Dimension::Domain => "domain_stats",
            Dimension::Ip => "ip_stats",
            Dimension::Proxy => "proxy_stats",
            Dimension::Rule => "rule_stats",
            Dimension::Device => "device_stats",
            Dimension::Country => "country_stats",
            Dimension::DomainChain => "domain_chain_stats",
            Dimension::IpChain => "ip_chain_stats",
            Dimension::DomainIp => "domain_ip_stats",
            Dimension::RuleDomain => "rule_domain_stats",
            Dimension::RuleChain => "rule_chain_stats",
            Dimension::DeviceDomainChain => "device_domain_chain_stats",
            Dimension::DeviceIpChain => "device_ip_chain_stats",
        }
    }
}

/// Typed key for one aggregate row, minus backend and time bucket.
///
/// The string-keyed dimension selection of a dashboard store becomes an
/// enumerated tag carrying the key fields, so the flusher and the store
/// dispatch on it without stringly-typed lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DimensionKey {
    Hourly,
    Domain { host: String },
    Ip { ip: String },
    Proxy { chain: String },
    Rule { rule: String },
    Device { source_ip: String },
    Country { code: String },
    DomainChain { host: String, chain: String },
    IpChain { ip: String, chain: String },
    DomainIp { host: String, ip: String },
    RuleDomain { rule: String, host: String },
    RuleChain { rule: String, chain: String },
    DeviceDomainChain {
        source_ip: String,
        host: String,
        chain: String,
    },
    DeviceIpChain {
        source_ip: String,
        ip: String,
        chain: String,
    },
}

impl DimensionKey {
    pub fn dimension(&self) -> Dimension {
        match self {
            DimensionKey::Hourly => Dimension::Hourly,
            DimensionKey::Domain { .. } => Dimension::Domain,
            DimensionKey::Ip { .. } => Dimension::Ip,
            DimensionKey::Proxy { .. } => Dimension::Proxy,
            DimensionKey::Rule { .. } => Dimension::Rule,
            DimensionKey::Device { .. } => Dimension::Device,
            DimensionKey::Country { .. } => Dimension::Country,
            DimensionKey::DomainChain { .. } => Dimension::DomainChain,
            DimensionKey::IpChain { .. } => Dimension::IpChain,
            DimensionKey::DomainIp { .. } => Dimension::DomainIp,
            DimensionKey::RuleDomain { .. } => Dimension::RuleDomain,
            DimensionKey::RuleChain { .. } => Dimension::RuleChain,
            DimensionKey::DeviceDomainChain { .. } => Dimension::DeviceDomainChain,
            DimensionKey::DeviceIpChain { .. } => Dimension::DeviceIpChain,
        }
    }
}

/// Immutable descriptors of one observed connection, frozen at the first
/// snapshot that introduces its id. Shared between the tracker state and
/// emitted deltas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub host: String,
    pub destination_ip: String,
    /// Canonical proxy chain, `"<proxy> > … > <rule>"`.
    pub chain: String,
    /// First segment of the chain, or "DIRECT" when the chain is empty.
    pub landing: String,
    pub rule: String,
    pub source_ip: String,
    pub network: String,
    pub process: Option<String>,
}

impl ConnectionIdentity {
    /// Fans out to every dimension key this identity contributes to.
    /// The country dimension is appended by the caller once geo data is
    /// resolved.
    pub fn dimension_keys(&self) -> Vec<DimensionKey> {
        let mut keys = Vec::with_capacity(13);
        keys.push(DimensionKey::Hourly);
        keys.push(DimensionKey::Domain {
            host: self.host.clone(),
        });
        keys.push(DimensionKey::Ip {
            ip: self.destination_ip.clone(),
        });
        keys.push(DimensionKey::Proxy {
            chain: self.chain.clone(),
        });
        keys.push(DimensionKey::Rule {
            rule: self.rule.clone(),
        });
        keys.push(DimensionKey::Device {
            source_ip: self.source_ip.clone(),
        });
        keys.push(DimensionKey::DomainChain {
            host: self.host.clone(),
            chain: self.chain.clone(),
        });
        keys.push(DimensionKey::IpChain {
            ip: self.destination_ip.clone(),
            chain: self.chain.clone(),
        });
        keys.push(DimensionKey::DomainIp {
            host: self.host.clone(),
            ip: self.destination_ip.clone(),
        });
        keys.push(DimensionKey::RuleDomain {
            rule: self.rule.clone(),
            host: self.host.clone(),
        });
        keys.push(DimensionKey::RuleChain {
            rule: self.rule.clone(),
            chain: self.chain.clone(),
        });
        keys.push(DimensionKey::DeviceDomainChain {
            source_ip: self.source_ip.clone(),
            host: self.host.clone(),
            chain: self.chain.clone(),
        });
        keys.push(DimensionKey::DeviceIpChain {
            source_ip: self.source_ip.clone(),
            ip: self.destination_ip.clone(),
            chain: self.chain.clone(),
        });
        keys
    }
}

/// Additive increment applied to one aggregate row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatDelta {
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
    /// Millisecond timestamp of the most recent activity; merged with max.
    pub last_seen_ms: i64,
}

impl StatDelta {
    pub fn merge(&mut self, other: &StatDelta) {
        self.upload = self.upload.saturating_add(other.upload);
        self.download = self.download.saturating_add(other.download);
        self.connections = self.connections.saturating_add(other.connections);
        self.last_seen_ms = self.last_seen_ms.max(other.last_seen_ms);
    }

    pub fn is_empty(&self) -> bool {
        self.upload == 0 && self.download == 0 && self.connections == 0
    }
}

/// GeoIP attributes attached to IP-keyed rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GeoInfo {
    #[serde(rename = "countryCode")]
    pub country_code: String,
    pub location: String,
}

/// One pending aggregate row drained out of the realtime cache.
#[derive(Debug, Clone)]
pub struct FlushRow {
    pub key: DimensionKey,
    pub bucket_ms: i64,
    pub delta: StatDelta,
    /// Only populated for IP-keyed rows.
    pub geo: Option<GeoInfo>,
}

/// Everything a flush cycle drained for one backend.
#[derive(Debug, Default)]
pub struct FlushBatch {
    pub rows: Vec<FlushRow>,
}

impl FlushBatch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Splits the batch into per-dimension groups, in flush order.
    pub fn by_dimension(self) -> Vec<(Dimension, Vec<FlushRow>)> {
        let mut groups: Vec<(Dimension, Vec<FlushRow>)> =
            FLUSH_ORDER.iter().map(|d| (*d, Vec::new())).collect();
        for row in self.rows {
            let dim = row.key.dimension();
            if let Some((_, rows)) = groups.iter_mut().find(|(d, _)| *d == dim) {
                rows.push(row);
            }
        }
        groups.retain(|(_, rows)| !rows.is_empty());
        groups
    }
}

/// Record of a connection that closed upstream, persisted short-term.
#[derive(Debug, Clone)]
pub struct ClosedConnection {
    pub backend_id: BackendId,
    pub conn_id: String,
    pub identity: Arc<ConnectionIdentity>,
    pub upload: u64,
    pub download: u64,
    pub started_at_ms: i64,
    pub closed_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ConnectionIdentity {
        ConnectionIdentity {
            host: "a.example".into(),
            destination_ip: "1.2.3.4".into(),
            chain: "P > R".into(),
            landing: "P".into(),
            rule: "Match".into(),
            source_ip: "192.168.1.10".into(),
            network: "tcp".into(),
            process: None,
        }
    }

    #[test]
    fn test_hour_bucket_floors() {
        assert_eq!(hour_bucket_ms(0), 0);
        assert_eq!(hour_bucket_ms(HOUR_MS - 1), 0);
        assert_eq!(hour_bucket_ms(HOUR_MS), HOUR_MS);
        assert_eq!(hour_bucket_ms(HOUR_MS + 1), HOUR_MS);
    }

    #[test]
    fn test_day_start_floors() {
        assert_eq!(day_start_ms(DAY_MS + 12 * HOUR_MS + 5), DAY_MS);
    }

    #[test]
    fn test_dimension_keys_cover_all_but_country() {
        let keys = identity().dimension_keys();
        assert_eq!(keys.len(), 13);
        for dim in FLUSH_ORDER {
            if dim == Dimension::Country {
                continue;
            }
            assert!(
                keys.iter().any(|k| k.dimension() == dim),
                "missing dimension {dim:?}",
            );
        }
    }

    #[test]
    fn test_stat_delta_merge() {
        let mut a = StatDelta {
            upload: 10,
            download: 20,
            connections: 1,
            last_seen_ms: 100,
        };
        a.merge(&StatDelta {
            upload: 5,
            download: 0,
            connections: 0,
            last_seen_ms: 50,
        });
        assert_eq!(a.upload, 15);
        assert_eq!(a.download, 20);
        assert_eq!(a.connections, 1);
        assert_eq!(a.last_seen_ms, 100);
    }

    #[test]
    fn test_flush_batch_groups_in_order() {
        let batch = FlushBatch {
            rows: vec![
                FlushRow {
                    key: DimensionKey::Domain {
                        host: "a.example".into(),
                    },
                    bucket_ms: 0,
                    delta: StatDelta::default(),
                    geo: None,
                },
                FlushRow {
                    key: DimensionKey::Hourly,
                    bucket_ms: 0,
                    delta: StatDelta::default(),
                    geo: None,
                },
            ],
        };
        let groups = batch.by_dimension();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, Dimension::Hourly);
        assert_eq!(groups[1].0, Dimension::Domain);
    }
}
