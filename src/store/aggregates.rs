use sqlx::Sqlite;
use tracing::debug;

use crate::model::{DimensionKey, FlushRow};

use super::rows::{
    iso_ms, CountryRow, DeviceRow, DomainDetailRow, DomainRow, GlobalBackendRow, HourlyRow,
    IpDetailRow, IpRow, Page, PageParams, ProxyRow, RuleRow, TimeWindow, TrafficTotals,
};
use super::{Store, StoreResult};

/// Upsert for tables carrying `last_seen`.
fn keyed_upsert_sql(table: &str, key_cols: &[&str]) -> String {
    let keys = key_cols.join(", ");
    let placeholders = key_cols.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    format!(
        "INSERT INTO {table} (backend_id, {keys}, ts_bucket, upload, download, connections, last_seen) \
         VALUES (?, {placeholders}, ?, ?, ?, ?, ?) \
         ON CONFLICT(backend_id, {keys}, ts_bucket) DO UPDATE SET \
         upload = upload + excluded.upload, \
         download = download + excluded.download, \
         connections = connections + excluded.connections, \
         last_seen = max(last_seen, excluded.last_seen)"
    )
}

/// Upsert for counter-only tables (no `last_seen`).
fn counter_upsert_sql(table: &str, key_cols: &[&str]) -> String {
    let keys = if key_cols.is_empty() {
        String::new()
    } else {
        format!("{}, ", key_cols.join(", "))
    };
    let placeholders = key_cols.iter().map(|_| "?, ").collect::<String>();
    let conflict_keys = if key_cols.is_empty() {
        String::new()
    } else {
        format!("{}, ", key_cols.join(", "))
    };
    format!(
        "INSERT INTO {table} (backend_id, {keys}ts_bucket, upload, download, connections) \
         VALUES (?, {placeholders}?, ?, ?, ?) \
         ON CONFLICT(backend_id, {conflict_keys}ts_bucket) DO UPDATE SET \
         upload = upload + excluded.upload, \
         download = download + excluded.download, \
         connections = connections + excluded.connections"
    )
}

fn bind_window<'q, O>(
    mut q: sqlx::query::QueryAs<'q, Sqlite, O, sqlx::sqlite::SqliteArguments<'q>>,
    window: &TimeWindow,
) -> sqlx::query::QueryAs<'q, Sqlite, O, sqlx::sqlite::SqliteArguments<'q>> {
    if let Some(start) = window.start_ms {
        q = q.bind(start);
    }
    if let Some(end) = window.end_ms {
        q = q.bind(end);
    }
    q
}

fn push_window(sql: &mut String, window: &TimeWindow) {
    if window.start_ms.is_some() {
        sql.push_str(" AND ts_bucket >= ?");
    }
    if window.end_ms.is_some() {
        sql.push_str(" AND ts_bucket < ?");
    }
}

impl Store {
    /// Applies one drained dimension batch in a single transaction.
    /// Any row failure aborts the whole batch; the flusher decides
    /// whether to retry, split, or return the rows to the cache.
    pub async fn upsert_batch(&self, backend_id: i64, rows: &[FlushRow]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;
        for row in rows {
            self.upsert_row(&mut tx, backend_id, row).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Single-row variant used by the flusher's constraint split-retry.
    pub async fn upsert_one(&self, backend_id: i64, row: &FlushRow) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        self.upsert_row(&mut tx, backend_id, row).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_row(
        &self,
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        backend_id: i64,
        row: &FlushRow,
    ) -> StoreResult<()> {
        let d = &row.delta;
        let (up, down, conns, seen) = (
            d.upload as i64,
            d.download as i64,
            d.connections as i64,
            d.last_seen_ms,
        );

        match &row.key {
            DimensionKey::Hourly => {
                sqlx::query(&counter_upsert_sql("hourly_stats", &[]))
                    .bind(backend_id)
                    .bind(row.bucket_ms)
                    .bind(up)
                    .bind(down)
                    .bind(conns)
                    .execute(&mut **tx)
                    .await?;
            }
            DimensionKey::Domain { host } => {
                sqlx::query(&keyed_upsert_sql("domain_stats", &["host"]))
                    .bind(backend_id)
                    .bind(host)
                    .bind(row.bucket_ms)
                    .bind(up)
                    .bind(down)
                    .bind(conns)
                    .bind(seen)
                    .execute(&mut **tx)
                    .await?;
            }
            DimensionKey::Ip { ip } => {
                // Backfill geo attribution when the cache did not carry
                // it; a miss persists as empty.
                let geo = match &row.geo {
                    Some(geo) => Some(geo.clone()),
                    None => {
                        let looked_up = self.geo().lookup(ip);
                        if looked_up.is_none() {
                            debug!(ip = %ip, "geo lookup empty, persisting without country");
                        }
                        looked_up
                    }
                };
                let (country, location) = geo
                    .map(|g| (g.country_code, g.location))
                    .unwrap_or_default();

                sqlx::query(
                    "INSERT INTO ip_stats (backend_id, ip, ts_bucket, upload, download, connections, last_seen, country_code, location) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT(backend_id, ip, ts_bucket) DO UPDATE SET \
                     upload = upload + excluded.upload, \
                     download = download + excluded.download, \
                     connections = connections + excluded.connections, \
                     last_seen = max(last_seen, excluded.last_seen), \
                     country_code = CASE WHEN ip_stats.country_code = '' THEN excluded.country_code ELSE ip_stats.country_code END, \
                     location = CASE WHEN ip_stats.location = '' THEN excluded.location ELSE ip_stats.location END",
                )
                .bind(backend_id)
                .bind(ip)
                .bind(row.bucket_ms)
                .bind(up)
                .bind(down)
                .bind(conns)
                .bind(seen)
                .bind(country)
                .bind(location)
                .execute(&mut **tx)
                .await?;
            }
            DimensionKey::Proxy { chain } => {
                sqlx::query(&counter_upsert_sql("proxy_stats", &["chain"]))
                    .bind(backend_id)
                    .bind(chain)
                    .bind(row.bucket_ms)
                    .bind(up)
                    .bind(down)
                    .bind(conns)
                    .execute(&mut **tx)
                    .await?;
            }
            DimensionKey::Rule { rule } => {
                sqlx::query(&counter_upsert_sql("rule_stats", &["rule"]))
                    .bind(backend_id)
                    .bind(rule)
                    .bind(row.bucket_ms)
                    .bind(up)
                    .bind(down)
                    .bind(conns)
                    .execute(&mut **tx)
                    .await?;
            }
            DimensionKey::Device { source_ip } => {
                sqlx::query(&counter_upsert_sql("device_stats", &["source_ip"]))
                    .bind(backend_id)
                    .bind(source_ip)
                    .bind(row.bucket_ms)
                    .bind(up)
                    .bind(down)
                    .bind(conns)
                    .execute(&mut **tx)
                    .await?;
            }
            DimensionKey::Country { code } => {
                sqlx::query(&counter_upsert_sql("country_stats", &["country_code"]))
                    .bind(backend_id)
                    .bind(code)
                    .bind(row.bucket_ms)
                    .bind(up)
                    .bind(down)
                    .bind(conns)
                    .execute(&mut **tx)
                    .await?;
            }
            DimensionKey::DomainChain { host, chain } => {
                sqlx::query(&keyed_upsert_sql("domain_chain_stats", &["host", "chain"]))
                    .bind(backend_id)
                    .bind(host)
                    .bind(chain)
                    .bind(row.bucket_ms)
                    .bind(up)
                    .bind(down)
                    .bind(conns)
                    .bind(seen)
                    .execute(&mut **tx)
                    .await?;
            }
            DimensionKey::IpChain { ip, chain } => {
                sqlx::query(&keyed_upsert_sql("ip_chain_stats", &["ip", "chain"]))
                    .bind(backend_id)
                    .bind(ip)
                    .bind(chain)
                    .bind(row.bucket_ms)
                    .bind(up)
                    .bind(down)
                    .bind(conns)
                    .bind(seen)
                    .execute(&mut **tx)
                    .await?;
            }
            DimensionKey::DomainIp { host, ip } => {
                sqlx::query(&keyed_upsert_sql("domain_ip_stats", &["host", "ip"]))
                    .bind(backend_id)
                    .bind(host)
                    .bind(ip)
                    .bind(row.bucket_ms)
                    .bind(up)
                    .bind(down)
                    .bind(conns)
                    .bind(seen)
                    .execute(&mut **tx)
                    .await?;
            }
            DimensionKey::RuleDomain { rule, host } => {
                sqlx::query(&keyed_upsert_sql("rule_domain_stats", &["rule", "host"]))
                    .bind(backend_id)
                    .bind(rule)
                    .bind(host)
                    .bind(row.bucket_ms)
                    .bind(up)
                    .bind(down)
                    .bind(conns)
                    .bind(seen)
                    .execute(&mut **tx)
                    .await?;
            }
            DimensionKey::RuleChain { rule, chain } => {
                sqlx::query(&keyed_upsert_sql("rule_chain_stats", &["rule", "chain"]))
                    .bind(backend_id)
                    .bind(rule)
                    .bind(chain)
                    .bind(row.bucket_ms)
                    .bind(up)
                    .bind(down)
                    .bind(conns)
                    .bind(seen)
                    .execute(&mut **tx)
                    .await?;
            }
            DimensionKey::DeviceDomainChain {
                source_ip,
                host,
                chain,
            } => {
                sqlx::query(&keyed_upsert_sql(
                    "device_domain_chain_stats",
                    &["source_ip", "host", "chain"],
                ))
                .bind(backend_id)
                .bind(source_ip)
                .bind(host)
                .bind(chain)
                .bind(row.bucket_ms)
                .bind(up)
                .bind(down)
                .bind(conns)
                .bind(seen)
                .execute(&mut **tx)
                .await?;
            }
            DimensionKey::DeviceIpChain {
                source_ip,
                ip,
                chain,
            } => {
                sqlx::query(&keyed_upsert_sql(
                    "device_ip_chain_stats",
                    &["source_ip", "ip", "chain"],
                ))
                .bind(backend_id)
                .bind(source_ip)
                .bind(ip)
                .bind(chain)
                .bind(row.bucket_ms)
                .bind(up)
                .bind(down)
                .bind(conns)
                .bind(seen)
                .execute(&mut **tx)
                .await?;
            }
        }

        Ok(())
    }

    // --- Totals and series ---

    pub async fn summary_totals(
        &self,
        backend_id: i64,
        window: TimeWindow,
    ) -> StoreResult<TrafficTotals> {
        let mut sql = String::from(
            "SELECT COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0), \
             COALESCE(SUM(connections), 0) FROM hourly_stats WHERE backend_id = ?",
        );
        push_window(&mut sql, &window);

        let q = sqlx::query_as::<_, (i64, i64, i64)>(&sql).bind(backend_id);
        let (upload, download, connections) = bind_window(q, &window).fetch_one(self.pool()).await?;

        Ok(TrafficTotals {
            upload: upload.max(0) as u64,
            download: download.max(0) as u64,
            connections: connections.max(0) as u64,
        })
    }

    /// Persisted upload/download since the given UTC midnight.
    pub async fn today_totals(&self, backend_id: i64, day_start_ms: i64) -> StoreResult<(u64, u64)> {
        let (upload, download): (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0) \
             FROM hourly_stats WHERE backend_id = ? AND ts_bucket >= ?",
        )
        .bind(backend_id)
        .bind(day_start_ms)
        .fetch_one(self.pool())
        .await?;
        Ok((upload.max(0) as u64, download.max(0) as u64))
    }

    pub async fn hourly_series(
        &self,
        backend_id: i64,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<HourlyRow>> {
        let mut sql = String::from(
            "SELECT ts_bucket, upload, download, connections FROM hourly_stats WHERE backend_id = ?",
        );
        push_window(&mut sql, &window);
        sql.push_str(" ORDER BY ts_bucket DESC LIMIT ?");

        let q = sqlx::query_as::<_, (i64, i64, i64, i64)>(&sql).bind(backend_id);
        let mut rows = bind_window(q, &window)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;
        rows.reverse();

        Ok(rows
            .into_iter()
            .map(|(bucket, upload, download, connections)| HourlyRow {
                time_bucket: iso_ms(bucket),
                bucket_ms: bucket,
                upload: upload.max(0) as u64,
                download: download.max(0) as u64,
                connections: connections.max(0) as u64,
            })
            .collect())
    }

    /// Hourly series summed across every backend.
    pub async fn hourly_series_all(
        &self,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<HourlyRow>> {
        let mut sql = String::from(
            "SELECT ts_bucket, COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0), \
             COALESCE(SUM(connections), 0) FROM hourly_stats WHERE 1 = 1",
        );
        push_window(&mut sql, &window);
        sql.push_str(" GROUP BY ts_bucket ORDER BY ts_bucket DESC LIMIT ?");

        let q = sqlx::query_as::<_, (i64, i64, i64, i64)>(&sql);
        let mut rows = bind_window(q, &window)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;
        rows.reverse();

        Ok(rows
            .into_iter()
            .map(|(bucket, upload, download, connections)| HourlyRow {
                time_bucket: iso_ms(bucket),
                bucket_ms: bucket,
                upload: upload.max(0) as u64,
                download: download.max(0) as u64,
                connections: connections.max(0) as u64,
            })
            .collect())
    }

    // --- Domain dimension ---

    pub async fn top_domains(
        &self,
        backend_id: i64,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<DomainRow>> {
        let page = PageParams {
            limit,
            ..Default::default()
        };
        Ok(self.list_domains(backend_id, window, &page).await?.data)
    }

    pub async fn list_domains(
        &self,
        backend_id: i64,
        window: TimeWindow,
        page: &PageParams,
    ) -> StoreResult<Page<DomainRow>> {
        let (sort_expr, order) = match page.sort_by.as_deref() {
            Some("upload") | Some("totalUpload") => ("SUM(d.upload)", page.sort_order.sql()),
            Some("download") | Some("totalDownload") => ("SUM(d.download)", page.sort_order.sql()),
            Some("connections") => ("SUM(d.connections)", page.sort_order.sql()),
            Some("host") => ("d.host", page.sort_order.sql()),
            Some("lastSeen") => ("MAX(d.last_seen)", page.sort_order.sql()),
            _ => ("SUM(d.download)", "DESC"),
        };

        let mut filter = String::from(" WHERE d.backend_id = ?");
        if window.start_ms.is_some() {
            filter.push_str(" AND d.ts_bucket >= ?");
        }
        if window.end_ms.is_some() {
            filter.push_str(" AND d.ts_bucket < ?");
        }
        let search = page.search.as_ref().filter(|s| !s.is_empty());
        if search.is_some() {
            filter.push_str(" AND d.host LIKE ?");
        }

        let total_sql = format!("SELECT COUNT(DISTINCT d.host) FROM domain_stats d{filter}");
        let mut q = sqlx::query_as::<_, (i64,)>(&total_sql).bind(backend_id);
        q = bind_window(q, &window);
        if let Some(s) = search {
            q = q.bind(format!("%{s}%"));
        }
        let (total,) = q.fetch_one(self.pool()).await?;

        let data_sql = format!(
            "SELECT d.host, COALESCE(SUM(d.upload), 0), COALESCE(SUM(d.download), 0), \
             COALESCE(SUM(d.connections), 0), COALESCE(MAX(d.last_seen), 0), \
             (SELECT COUNT(DISTINCT j.ip) FROM domain_ip_stats j \
              WHERE j.backend_id = d.backend_id AND j.host = d.host), \
             (SELECT COUNT(DISTINCT c.chain) FROM domain_chain_stats c \
              WHERE c.backend_id = d.backend_id AND c.host = d.host) \
             FROM domain_stats d{filter} GROUP BY d.host ORDER BY {sort_expr} {order} \
             LIMIT ? OFFSET ?"
        );
        let mut q =
            sqlx::query_as::<_, (String, i64, i64, i64, i64, i64, i64)>(&data_sql).bind(backend_id);
        q = bind_window(q, &window);
        if let Some(s) = search {
            q = q.bind(format!("%{s}%"));
        }
        let rows = q
            .bind(page.clamped_limit() as i64)
            .bind(page.offset as i64)
            .fetch_all(self.pool())
            .await?;

        let data = rows
            .into_iter()
            .map(
                |(host, upload, download, connections, last_seen, ips_seen, chains_seen)| {
                    DomainRow {
                        host,
                        upload: upload.max(0) as u64,
                        download: download.max(0) as u64,
                        connections: connections.max(0) as u64,
                        last_seen: iso_ms(last_seen),
                        last_seen_ms: last_seen,
                        ips_seen: ips_seen.max(0) as u64,
                        chains_seen: chains_seen.max(0) as u64,
                    }
                },
            )
            .collect();

        Ok(Page {
            data,
            total: total.max(0) as u64,
        })
    }

    // --- IP dimension ---

    pub async fn top_ips(
        &self,
        backend_id: i64,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<IpRow>> {
        let page = PageParams {
            limit,
            ..Default::default()
        };
        Ok(self.list_ips(backend_id, window, &page).await?.data)
    }

    pub async fn list_ips(
        &self,
        backend_id: i64,
        window: TimeWindow,
        page: &PageParams,
    ) -> StoreResult<Page<IpRow>> {
        let (sort_expr, order) = match page.sort_by.as_deref() {
            Some("upload") | Some("totalUpload") => ("SUM(s.upload)", page.sort_order.sql()),
            Some("download") | Some("totalDownload") => ("SUM(s.download)", page.sort_order.sql()),
            Some("connections") => ("SUM(s.connections)", page.sort_order.sql()),
            Some("ip") => ("s.ip", page.sort_order.sql()),
            Some("lastSeen") => ("MAX(s.last_seen)", page.sort_order.sql()),
            Some("countryCode") => ("MAX(s.country_code)", page.sort_order.sql()),
            _ => ("SUM(s.download)", "DESC"),
        };

        let mut filter = String::from(" WHERE s.backend_id = ?");
        if window.start_ms.is_some() {
            filter.push_str(" AND s.ts_bucket >= ?");
        }
        if window.end_ms.is_some() {
            filter.push_str(" AND s.ts_bucket < ?");
        }
        let search = page.search.as_ref().filter(|s| !s.is_empty());
        if search.is_some() {
            filter.push_str(" AND s.ip LIKE ?");
        }

        let total_sql = format!("SELECT COUNT(DISTINCT s.ip) FROM ip_stats s{filter}");
        let mut q = sqlx::query_as::<_, (i64,)>(&total_sql).bind(backend_id);
        q = bind_window(q, &window);
        if let Some(s) = search {
            q = q.bind(format!("%{s}%"));
        }
        let (total,) = q.fetch_one(self.pool()).await?;

        let data_sql = format!(
            "SELECT s.ip, COALESCE(SUM(s.upload), 0), COALESCE(SUM(s.download), 0), \
             COALESCE(SUM(s.connections), 0), COALESCE(MAX(s.last_seen), 0), \
             COALESCE(MAX(s.country_code), ''), COALESCE(MAX(s.location), ''), \
             (SELECT COUNT(DISTINCT j.host) FROM domain_ip_stats j \
              WHERE j.backend_id = s.backend_id AND j.ip = s.ip), \
             (SELECT COUNT(DISTINCT c.chain) FROM ip_chain_stats c \
              WHERE c.backend_id = s.backend_id AND c.ip = s.ip) \
             FROM ip_stats s{filter} GROUP BY s.ip ORDER BY {sort_expr} {order} \
             LIMIT ? OFFSET ?"
        );
        let mut q = sqlx::query_as::<_, (String, i64, i64, i64, i64, String, String, i64, i64)>(
            &data_sql,
        )
        .bind(backend_id);
        q = bind_window(q, &window);
        if let Some(s) = search {
            q = q.bind(format!("%{s}%"));
        }
        let rows = q
            .bind(page.clamped_limit() as i64)
            .bind(page.offset as i64)
            .fetch_all(self.pool())
            .await?;

        let data = rows
            .into_iter()
            .map(
                |(
                    ip,
                    upload,
                    download,
                    connections,
                    last_seen,
                    country_code,
                    location,
                    domains_seen,
                    chains_seen,
                )| IpRow {
                    ip,
                    upload: upload.max(0) as u64,
                    download: download.max(0) as u64,
                    connections: connections.max(0) as u64,
                    last_seen: iso_ms(last_seen),
                    last_seen_ms: last_seen,
                    country_code,
                    location,
                    domains_seen: domains_seen.max(0) as u64,
                    chains_seen: chains_seen.max(0) as u64,
                },
            )
            .collect();

        Ok(Page {
            data,
            total: total.max(0) as u64,
        })
    }

    // --- Single-key dimensions ---

    pub async fn proxy_stats(
        &self,
        backend_id: i64,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<ProxyRow>> {
        let rows = self
            .grouped_counter_rows("proxy_stats", "chain", backend_id, window, limit)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(chain, upload, download, connections)| ProxyRow {
                chain,
                upload,
                download,
                connections,
            })
            .collect())
    }

    pub async fn rule_stats(
        &self,
        backend_id: i64,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<RuleRow>> {
        let rows = self
            .grouped_counter_rows("rule_stats", "rule", backend_id, window, limit)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(rule, upload, download, connections)| RuleRow {
                rule,
                upload,
                download,
                connections,
            })
            .collect())
    }

    pub async fn device_stats(
        &self,
        backend_id: i64,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<DeviceRow>> {
        let rows = self
            .grouped_counter_rows("device_stats", "source_ip", backend_id, window, limit)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(source_ip, upload, download, connections)| DeviceRow {
                source_ip,
                upload,
                download,
                connections,
            })
            .collect())
    }

    pub async fn country_stats(
        &self,
        backend_id: i64,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<CountryRow>> {
        let rows = self
            .grouped_counter_rows("country_stats", "country_code", backend_id, window, limit)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(country_code, upload, download, connections)| CountryRow {
                country_code,
                upload,
                download,
                connections,
            })
            .collect())
    }

    async fn grouped_counter_rows(
        &self,
        table: &str,
        key_col: &str,
        backend_id: i64,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<(String, u64, u64, u64)>> {
        let mut sql = format!(
            "SELECT {key_col}, COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0), \
             COALESCE(SUM(connections), 0) FROM {table} WHERE backend_id = ?"
        );
        push_window(&mut sql, &window);
        sql.push_str(&format!(
            " GROUP BY {key_col} ORDER BY SUM(download) DESC LIMIT ?"
        ));

        let q = sqlx::query_as::<_, (String, i64, i64, i64)>(&sql).bind(backend_id);
        let rows = bind_window(q, &window)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;

        Ok(rows
            .into_iter()
            .map(|(key, upload, download, connections)| {
                (
                    key,
                    upload.max(0) as u64,
                    download.max(0) as u64,
                    connections.max(0) as u64,
                )
            })
            .collect())
    }

    // --- Drill-downs over join tables ---

    /// Proxy chains observed for one domain, optionally scoped to a
    /// source device and/or a specific chain.
    pub async fn domain_proxy_stats(
        &self,
        backend_id: i64,
        host: &str,
        window: TimeWindow,
        source_ip: Option<&str>,
        source_chain: Option<&str>,
        limit: u32,
    ) -> StoreResult<Vec<ProxyRow>> {
        self.keyed_chain_stats(
            ("domain_chain_stats", "device_domain_chain_stats"),
            "host",
            host,
            backend_id,
            window,
            source_ip,
            source_chain,
            limit,
        )
        .await
    }

    /// Proxy chains observed for one destination IP.
    pub async fn ip_proxy_stats(
        &self,
        backend_id: i64,
        ip: &str,
        window: TimeWindow,
        source_ip: Option<&str>,
        source_chain: Option<&str>,
        limit: u32,
    ) -> StoreResult<Vec<ProxyRow>> {
        self.keyed_chain_stats(
            ("ip_chain_stats", "device_ip_chain_stats"),
            "ip",
            ip,
            backend_id,
            window,
            source_ip,
            source_chain,
            limit,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn keyed_chain_stats(
        &self,
        (pair_table, device_table): (&str, &str),
        key_col: &str,
        key: &str,
        backend_id: i64,
        window: TimeWindow,
        source_ip: Option<&str>,
        source_chain: Option<&str>,
        limit: u32,
    ) -> StoreResult<Vec<ProxyRow>> {
        // A device filter switches to the device-scoped triple table so
        // combined filters stay a single scan.
        let table = if source_ip.is_some() {
            device_table
        } else {
            pair_table
        };

        let mut sql = format!(
            "SELECT chain, COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0), \
             COALESCE(SUM(connections), 0) FROM {table} WHERE backend_id = ? AND {key_col} = ?"
        );
        if source_ip.is_some() {
            sql.push_str(" AND source_ip = ?");
        }
        if source_chain.is_some() {
            sql.push_str(" AND chain = ?");
        }
        push_window(&mut sql, &window);
        sql.push_str(" GROUP BY chain ORDER BY SUM(download) DESC LIMIT ?");

        let mut q = sqlx::query_as::<_, (String, i64, i64, i64)>(&sql)
            .bind(backend_id)
            .bind(key);
        if let Some(sip) = source_ip {
            q = q.bind(sip);
        }
        if let Some(chain) = source_chain {
            q = q.bind(chain);
        }
        let rows = bind_window(q, &window)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;

        Ok(rows
            .into_iter()
            .map(|(chain, upload, download, connections)| ProxyRow {
                chain,
                upload: upload.max(0) as u64,
                download: download.max(0) as u64,
                connections: connections.max(0) as u64,
            })
            .collect())
    }

    /// Destination IPs reached through one domain, with geo attribution.
    pub async fn domain_ip_details(
        &self,
        backend_id: i64,
        host: &str,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<IpDetailRow>> {
        let mut sql = String::from(
            "SELECT j.ip, COALESCE(SUM(j.upload), 0), COALESCE(SUM(j.download), 0), \
             COALESCE(SUM(j.connections), 0), \
             COALESCE((SELECT s.country_code FROM ip_stats s \
              WHERE s.backend_id = j.backend_id AND s.ip = j.ip AND s.country_code != '' LIMIT 1), ''), \
             COALESCE((SELECT s.location FROM ip_stats s \
              WHERE s.backend_id = j.backend_id AND s.ip = j.ip AND s.location != '' LIMIT 1), '') \
             FROM domain_ip_stats j WHERE j.backend_id = ? AND j.host = ?",
        );
        if window.start_ms.is_some() {
            sql.push_str(" AND j.ts_bucket >= ?");
        }
        if window.end_ms.is_some() {
            sql.push_str(" AND j.ts_bucket < ?");
        }
        sql.push_str(" GROUP BY j.ip ORDER BY SUM(j.download) DESC LIMIT ?");

        let q = sqlx::query_as::<_, (String, i64, i64, i64, String, String)>(&sql)
            .bind(backend_id)
            .bind(host);
        let rows = bind_window(q, &window)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(ip, upload, download, connections, country_code, location)| IpDetailRow {
                    ip,
                    upload: upload.max(0) as u64,
                    download: download.max(0) as u64,
                    connections: connections.max(0) as u64,
                    country_code,
                    location,
                },
            )
            .collect())
    }

    /// Domains served by one destination IP.
    pub async fn ip_domain_details(
        &self,
        backend_id: i64,
        ip: &str,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<DomainDetailRow>> {
        self.detail_rows("domain_ip_stats", "ip", ip, "host", backend_id, window, limit)
            .await
    }

    /// Domains routed through one proxy chain.
    pub async fn proxy_domains(
        &self,
        backend_id: i64,
        chain: &str,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<DomainDetailRow>> {
        self.detail_rows(
            "domain_chain_stats",
            "chain",
            chain,
            "host",
            backend_id,
            window,
            limit,
        )
        .await
    }

    /// Domains matched by one rule.
    pub async fn rule_domains(
        &self,
        backend_id: i64,
        rule: &str,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<DomainDetailRow>> {
        self.detail_rows(
            "rule_domain_stats",
            "rule",
            rule,
            "host",
            backend_id,
            window,
            limit,
        )
        .await
    }

    /// Proxy chains selected by one rule.
    pub async fn rule_proxies(
        &self,
        backend_id: i64,
        rule: &str,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<ProxyRow>> {
        let rows = self
            .detail_rows(
                "rule_chain_stats",
                "rule",
                rule,
                "chain",
                backend_id,
                window,
                limit,
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| ProxyRow {
                chain: r.host,
                upload: r.upload,
                download: r.download,
                connections: r.connections,
            })
            .collect())
    }

    /// Destination IPs reached through one proxy chain, with geo.
    pub async fn proxy_ips(
        &self,
        backend_id: i64,
        chain: &str,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<IpDetailRow>> {
        let mut sql = String::from(
            "SELECT j.ip, COALESCE(SUM(j.upload), 0), COALESCE(SUM(j.download), 0), \
             COALESCE(SUM(j.connections), 0), \
             COALESCE((SELECT s.country_code FROM ip_stats s \
              WHERE s.backend_id = j.backend_id AND s.ip = j.ip AND s.country_code != '' LIMIT 1), ''), \
             COALESCE((SELECT s.location FROM ip_stats s \
              WHERE s.backend_id = j.backend_id AND s.ip = j.ip AND s.location != '' LIMIT 1), '') \
             FROM ip_chain_stats j WHERE j.backend_id = ? AND j.chain = ?",
        );
        if window.start_ms.is_some() {
            sql.push_str(" AND j.ts_bucket >= ?");
        }
        if window.end_ms.is_some() {
            sql.push_str(" AND j.ts_bucket < ?");
        }
        sql.push_str(" GROUP BY j.ip ORDER BY SUM(j.download) DESC LIMIT ?");

        let q = sqlx::query_as::<_, (String, i64, i64, i64, String, String)>(&sql)
            .bind(backend_id)
            .bind(chain);
        let rows = bind_window(q, &window)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(ip, upload, download, connections, country_code, location)| IpDetailRow {
                    ip,
                    upload: upload.max(0) as u64,
                    download: download.max(0) as u64,
                    connections: connections.max(0) as u64,
                    country_code,
                    location,
                },
            )
            .collect())
    }

    async fn detail_rows(
        &self,
        table: &str,
        key_col: &str,
        key: &str,
        select_col: &str,
        backend_id: i64,
        window: TimeWindow,
        limit: u32,
    ) -> StoreResult<Vec<DomainDetailRow>> {
        let mut sql = format!(
            "SELECT {select_col}, COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0), \
             COALESCE(SUM(connections), 0) FROM {table} WHERE backend_id = ? AND {key_col} = ?"
        );
        push_window(&mut sql, &window);
        sql.push_str(&format!(
            " GROUP BY {select_col} ORDER BY SUM(download) DESC LIMIT ?"
        ));

        let q = sqlx::query_as::<_, (String, i64, i64, i64)>(&sql)
            .bind(backend_id)
            .bind(key);
        let rows = bind_window(q, &window)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;

        Ok(rows
            .into_iter()
            .map(|(host, upload, download, connections)| DomainDetailRow {
                host,
                upload: upload.max(0) as u64,
                download: download.max(0) as u64,
                connections: connections.max(0) as u64,
            })
            .collect())
    }

    /// Totals for one proxy chain.
    pub async fn proxy_totals(
        &self,
        backend_id: i64,
        chain: &str,
        window: TimeWindow,
    ) -> StoreResult<ProxyRow> {
        let mut sql = String::from(
            "SELECT COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0), \
             COALESCE(SUM(connections), 0) FROM proxy_stats WHERE backend_id = ? AND chain = ?",
        );
        push_window(&mut sql, &window);

        let q = sqlx::query_as::<_, (i64, i64, i64)>(&sql)
            .bind(backend_id)
            .bind(chain);
        let (upload, download, connections) = bind_window(q, &window).fetch_one(self.pool()).await?;

        Ok(ProxyRow {
            chain: chain.to_string(),
            upload: upload.max(0) as u64,
            download: download.max(0) as u64,
            connections: connections.max(0) as u64,
        })
    }

    /// Cross-backend totals with a per-backend breakdown. No realtime
    /// overlay is applied to this view.
    pub async fn global_stats(&self) -> StoreResult<(TrafficTotals, Vec<GlobalBackendRow>)> {
        let rows: Vec<(i64, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT b.id, b.name, COALESCE(SUM(h.upload), 0), COALESCE(SUM(h.download), 0), \
             COALESCE(SUM(h.connections), 0) \
             FROM backends b LEFT JOIN hourly_stats h ON h.backend_id = b.id \
             GROUP BY b.id, b.name ORDER BY b.id",
        )
        .fetch_all(self.pool())
        .await?;

        let mut totals = TrafficTotals::default();
        let backends = rows
            .into_iter()
            .map(|(backend_id, name, upload, download, connections)| {
                let row = GlobalBackendRow {
                    backend_id,
                    name,
                    upload: upload.max(0) as u64,
                    download: download.max(0) as u64,
                    connections: connections.max(0) as u64,
                };
                totals.upload += row.upload;
                totals.download += row.download;
                totals.connections += row.connections;
                row
            })
            .collect();

        Ok((totals, backends))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::geoip::StubGeo;
    use crate::model::{hour_bucket_ms, StatDelta};

    async fn test_store() -> Store {
        Store::open_in_memory(Arc::new(StubGeo::returning("US", "Dallas")))
            .await
            .expect("store opens")
    }

    fn row(key: DimensionKey, bucket_ms: i64, upload: u64, download: u64) -> FlushRow {
        FlushRow {
            key,
            bucket_ms,
            delta: StatDelta {
                upload,
                download,
                connections: 1,
                last_seen_ms: bucket_ms + 1,
            },
            geo: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_accumulates() {
        let store = test_store().await;
        let bucket = hour_bucket_ms(1_700_000_000_000);

        let key = DimensionKey::Domain {
            host: "a.example".into(),
        };
        store
            .upsert_batch(1, &[row(key.clone(), bucket, 100, 1000)])
            .await
            .expect("first upsert");
        store
            .upsert_batch(1, &[row(key, bucket, 50, 500)])
            .await
            .expect("second upsert");

        let domains = store
            .top_domains(1, TimeWindow::all(), 10)
            .await
            .expect("query");
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].upload, 150);
        assert_eq!(domains[0].download, 1500);
        assert_eq!(domains[0].connections, 2);
    }

    #[tokio::test]
    async fn test_ip_upsert_backfills_geo() {
        let store = test_store().await;
        store
            .upsert_batch(
                1,
                &[row(
                    DimensionKey::Ip {
                        ip: "8.8.8.8".into(),
                    },
                    0,
                    10,
                    10,
                )],
            )
            .await
            .expect("upsert");

        let ips = store.top_ips(1, TimeWindow::all(), 10).await.expect("query");
        assert_eq!(ips[0].country_code, "US");
        assert_eq!(ips[0].location, "Dallas");
    }

    #[tokio::test]
    async fn test_window_is_half_open() {
        let store = test_store().await;
        let b0 = 0;
        let b1 = crate::model::HOUR_MS;

        store
            .upsert_batch(1, &[row(DimensionKey::Hourly, b0, 10, 10)])
            .await
            .expect("upsert");
        store
            .upsert_batch(1, &[row(DimensionKey::Hourly, b1, 5, 5)])
            .await
            .expect("upsert");

        let totals = store
            .summary_totals(
                1,
                TimeWindow {
                    start_ms: Some(b0),
                    end_ms: Some(b1),
                },
            )
            .await
            .expect("query");
        assert_eq!(totals.upload, 10);

        let totals = store.summary_totals(1, TimeWindow::all()).await.expect("query");
        assert_eq!(totals.upload, 15);
    }

    #[tokio::test]
    async fn test_pagination_contract() {
        let store = test_store().await;
        for i in 0..7 {
            store
                .upsert_batch(
                    1,
                    &[row(
                        DimensionKey::Domain {
                            host: format!("host{i}.example"),
                        },
                        0,
                        0,
                        (i as u64 + 1) * 100,
                    )],
                )
                .await
                .expect("upsert");
        }

        let page = store
            .list_domains(
                1,
                TimeWindow::all(),
                &PageParams {
                    offset: 5,
                    limit: 3,
                    ..Default::default()
                },
            )
            .await
            .expect("page");
        assert_eq!(page.total, 7);
        assert!(page.data.len() <= 3);
        assert!(page.data.len() as u64 + 5 <= page.total);
        // download desc default: offset 5 lands on the 6th-largest.
        assert_eq!(page.data[0].download, 200);
    }

    #[tokio::test]
    async fn test_unknown_sort_falls_back_to_download_desc() {
        let store = test_store().await;
        for (host, dl) in [("a.example", 100u64), ("b.example", 300), ("c.example", 200)] {
            store
                .upsert_batch(
                    1,
                    &[row(
                        DimensionKey::Domain {
                            host: host.to_string(),
                        },
                        0,
                        0,
                        dl,
                    )],
                )
                .await
                .expect("upsert");
        }

        let page = store
            .list_domains(
                1,
                TimeWindow::all(),
                &PageParams {
                    sort_by: Some("evil; DROP TABLE".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("page");
        let hosts: Vec<&str> = page.data.iter().map(|r| r.host.as_str()).collect();
        assert_eq!(hosts, vec!["b.example", "c.example", "a.example"]);
    }

    #[tokio::test]
    async fn test_search_filters_hosts() {
        let store = test_store().await;
        for host in ["video.example", "api.example", "video.other"] {
            store
                .upsert_batch(
                    1,
                    &[row(
                        DimensionKey::Domain {
                            host: host.to_string(),
                        },
                        0,
                        0,
                        10,
                    )],
                )
                .await
                .expect("upsert");
        }

        let page = store
            .list_domains(
                1,
                TimeWindow::all(),
                &PageParams {
                    search: Some("video".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("page");
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn test_drilldown_filters_select_join_tables() {
        let store = test_store().await;
        let host = "a.example";

        store
            .upsert_batch(
                1,
                &[
                    row(
                        DimensionKey::DomainChain {
                            host: host.into(),
                            chain: "P1 > R".into(),
                        },
                        0,
                        10,
                        100,
                    ),
                    row(
                        DimensionKey::DomainChain {
                            host: host.into(),
                            chain: "P2 > R".into(),
                        },
                        0,
                        20,
                        200,
                    ),
                ],
            )
            .await
            .expect("pair rows");
        store
            .upsert_batch(
                1,
                &[row(
                    DimensionKey::DeviceDomainChain {
                        source_ip: "192.168.1.10".into(),
                        host: host.into(),
                        chain: "P1 > R".into(),
                    },
                    0,
                    10,
                    100,
                )],
            )
            .await
            .expect("triple rows");

        let all = store
            .domain_proxy_stats(1, host, TimeWindow::all(), None, None, 10)
            .await
            .expect("unfiltered");
        assert_eq!(all.len(), 2);

        let chained = store
            .domain_proxy_stats(1, host, TimeWindow::all(), None, Some("P2 > R"), 10)
            .await
            .expect("chain filter");
        assert_eq!(chained.len(), 1);
        assert_eq!(chained[0].chain, "P2 > R");

        let devices = store
            .domain_proxy_stats(1, host, TimeWindow::all(), Some("192.168.1.10"), None, 10)
            .await
            .expect("device filter");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].chain, "P1 > R");

        let none = store
            .domain_proxy_stats(1, host, TimeWindow::all(), Some("10.0.0.9"), None, 10)
            .await
            .expect("unknown device");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_days_zero_is_backend_scoped() {
        let store = test_store().await;
        store
            .upsert_batch(1, &[row(DimensionKey::Hourly, 0, 10, 10)])
            .await
            .expect("b1");
        store
            .upsert_batch(2, &[row(DimensionKey::Hourly, 0, 20, 20)])
            .await
            .expect("b2");

        store.cleanup_old_data(Some(1), 0, 0).await.expect("wipe b1");

        let t1 = store.summary_totals(1, TimeWindow::all()).await.expect("q1");
        let t2 = store.summary_totals(2, TimeWindow::all()).await.expect("q2");
        assert_eq!(t1.upload, 0);
        assert_eq!(t2.upload, 20);
    }

    #[tokio::test]
    async fn test_global_stats_spans_backends() {
        let store = test_store().await;
        store
            .create_backend(
                &crate::store::NewBackend {
                    name: "one".into(),
                    url: "http://x".into(),
                    token: None,
                },
                0,
            )
            .await
            .expect("backend");
        store
            .upsert_batch(1, &[row(DimensionKey::Hourly, 0, 7, 70)])
            .await
            .expect("upsert");

        let (totals, backends) = store.global_stats().await.expect("global");
        assert_eq!(totals.upload, 7);
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].download, 70);
    }
}
