//! Schema definitions, applied idempotently at startup.
//!
//! Every aggregate table is keyed by `(backend_id, <dimension keys>,
//! ts_bucket)` where `ts_bucket` is the UTC hour floor in epoch
//! milliseconds. Seen-sets (IPs per domain, domains per IP, ...) are
//! separate join-table rows rather than serialized blobs, so drill-down
//! queries answer in a single scan.

pub const CREATE_BACKENDS: &str = r#"
CREATE TABLE IF NOT EXISTS backends (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL,
    token TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    listening INTEGER NOT NULL DEFAULT 1,
    is_active INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
)"#;

pub const CREATE_HOURLY_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS hourly_stats (
    backend_id INTEGER NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, ts_bucket)
)"#;

pub const CREATE_DOMAIN_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS domain_stats (
    backend_id INTEGER NOT NULL,
    host TEXT NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, host, ts_bucket)
)"#;

pub const CREATE_IP_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS ip_stats (
    backend_id INTEGER NOT NULL,
    ip TEXT NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    country_code TEXT NOT NULL DEFAULT '',
    location TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, ip, ts_bucket)
)"#;

pub const CREATE_PROXY_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS proxy_stats (
    backend_id INTEGER NOT NULL,
    chain TEXT NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, chain, ts_bucket)
)"#;

pub const CREATE_RULE_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS rule_stats (
    backend_id INTEGER NOT NULL,
    rule TEXT NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, rule, ts_bucket)
)"#;

pub const CREATE_DEVICE_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS device_stats (
    backend_id INTEGER NOT NULL,
    source_ip TEXT NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, source_ip, ts_bucket)
)"#;

pub const CREATE_COUNTRY_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS country_stats (
    backend_id INTEGER NOT NULL,
    country_code TEXT NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, country_code, ts_bucket)
)"#;

pub const CREATE_DOMAIN_CHAIN_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS domain_chain_stats (
    backend_id INTEGER NOT NULL,
    host TEXT NOT NULL,
    chain TEXT NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, host, chain, ts_bucket)
)"#;

pub const CREATE_IP_CHAIN_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS ip_chain_stats (
    backend_id INTEGER NOT NULL,
    ip TEXT NOT NULL,
    chain TEXT NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, ip, chain, ts_bucket)
)"#;

pub const CREATE_DOMAIN_IP_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS domain_ip_stats (
    backend_id INTEGER NOT NULL,
    host TEXT NOT NULL,
    ip TEXT NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, host, ip, ts_bucket)
)"#;

pub const CREATE_RULE_DOMAIN_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS rule_domain_stats (
    backend_id INTEGER NOT NULL,
    rule TEXT NOT NULL,
    host TEXT NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, rule, host, ts_bucket)
)"#;

pub const CREATE_RULE_CHAIN_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS rule_chain_stats (
    backend_id INTEGER NOT NULL,
    rule TEXT NOT NULL,
    chain TEXT NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, rule, chain, ts_bucket)
)"#;

pub const CREATE_DEVICE_DOMAIN_CHAIN_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS device_domain_chain_stats (
    backend_id INTEGER NOT NULL,
    source_ip TEXT NOT NULL,
    host TEXT NOT NULL,
    chain TEXT NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, source_ip, host, chain, ts_bucket)
)"#;

pub const CREATE_DEVICE_IP_CHAIN_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS device_ip_chain_stats (
    backend_id INTEGER NOT NULL,
    source_ip TEXT NOT NULL,
    ip TEXT NOT NULL,
    chain TEXT NOT NULL,
    ts_bucket INTEGER NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, source_ip, ip, chain, ts_bucket)
)"#;

pub const CREATE_CONNECTION_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS connection_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backend_id INTEGER NOT NULL,
    conn_id TEXT NOT NULL,
    host TEXT NOT NULL,
    ip TEXT NOT NULL,
    chain TEXT NOT NULL,
    rule TEXT NOT NULL,
    source_ip TEXT NOT NULL,
    network TEXT NOT NULL,
    upload INTEGER NOT NULL DEFAULT 0,
    download INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER NOT NULL,
    closed_at INTEGER NOT NULL
)"#;

pub const CREATE_RETENTION_CONFIG: &str = r#"
CREATE TABLE IF NOT EXISTS retention_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    connection_logs_days INTEGER NOT NULL,
    hourly_stats_days INTEGER NOT NULL,
    auto_cleanup INTEGER NOT NULL
)"#;

pub const CREATE_INDEX_DOMAIN_BUCKET: &str =
    "CREATE INDEX IF NOT EXISTS idx_domain_stats_bucket ON domain_stats (backend_id, ts_bucket)";

pub const CREATE_INDEX_IP_BUCKET: &str =
    "CREATE INDEX IF NOT EXISTS idx_ip_stats_bucket ON ip_stats (backend_id, ts_bucket)";

pub const CREATE_INDEX_LOGS_CLOSED: &str =
    "CREATE INDEX IF NOT EXISTS idx_connection_logs_closed ON connection_logs (backend_id, closed_at)";

pub const CREATE_INDEX_DOMAIN_CHAIN: &str =
    "CREATE INDEX IF NOT EXISTS idx_domain_chain_chain ON domain_chain_stats (backend_id, chain)";

pub const CREATE_INDEX_IP_CHAIN: &str =
    "CREATE INDEX IF NOT EXISTS idx_ip_chain_chain ON ip_chain_stats (backend_id, chain)";

pub const CREATE_INDEX_DOMAIN_IP: &str =
    "CREATE INDEX IF NOT EXISTS idx_domain_ip_ip ON domain_ip_stats (backend_id, ip)";

/// Statements executed in order during migration.
pub const ALL_STATEMENTS: &[&str] = &[
    CREATE_BACKENDS,
    CREATE_HOURLY_STATS,
    CREATE_DOMAIN_STATS,
    CREATE_IP_STATS,
    CREATE_PROXY_STATS,
    CREATE_RULE_STATS,
    CREATE_DEVICE_STATS,
    CREATE_COUNTRY_STATS,
    CREATE_DOMAIN_CHAIN_STATS,
    CREATE_IP_CHAIN_STATS,
    CREATE_DOMAIN_IP_STATS,
    CREATE_RULE_DOMAIN_STATS,
    CREATE_RULE_CHAIN_STATS,
    CREATE_DEVICE_DOMAIN_CHAIN_STATS,
    CREATE_DEVICE_IP_CHAIN_STATS,
    CREATE_CONNECTION_LOGS,
    CREATE_RETENTION_CONFIG,
    CREATE_INDEX_DOMAIN_BUCKET,
    CREATE_INDEX_IP_BUCKET,
    CREATE_INDEX_LOGS_CLOSED,
    CREATE_INDEX_DOMAIN_CHAIN,
    CREATE_INDEX_IP_CHAIN,
    CREATE_INDEX_DOMAIN_IP,
];

/// Tables wiped by a backend data clear, in deletion order.
pub const AGGREGATE_TABLES: &[&str] = &[
    "hourly_stats",
    "domain_stats",
    "ip_stats",
    "proxy_stats",
    "rule_stats",
    "device_stats",
    "country_stats",
    "domain_chain_stats",
    "ip_chain_stats",
    "domain_ip_stats",
    "rule_domain_stats",
    "rule_chain_stats",
    "device_domain_chain_stats",
    "device_ip_chain_stats",
];
