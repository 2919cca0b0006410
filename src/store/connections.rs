use crate::model::ClosedConnection;

use super::rows::{iso_ms, ConnectionLogRow, Page, PageParams};
use super::{Store, StoreResult};

impl Store {
    /// Persists the final byte counts of a closed connection.
    pub async fn insert_connection_log(&self, conn: &ClosedConnection) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO connection_logs \
             (backend_id, conn_id, host, ip, chain, rule, source_ip, network, upload, download, started_at, closed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(conn.backend_id)
        .bind(&conn.conn_id)
        .bind(&conn.identity.host)
        .bind(&conn.identity.destination_ip)
        .bind(&conn.identity.chain)
        .bind(&conn.identity.rule)
        .bind(&conn.identity.source_ip)
        .bind(&conn.identity.network)
        .bind(conn.upload as i64)
        .bind(conn.download as i64)
        .bind(conn.started_at_ms)
        .bind(conn.closed_at_ms)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Batched variant for the log write buffer.
    pub async fn insert_connection_logs(&self, conns: &[ClosedConnection]) -> StoreResult<()> {
        if conns.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        for conn in conns {
            sqlx::query(
                "INSERT INTO connection_logs \
                 (backend_id, conn_id, host, ip, chain, rule, source_ip, network, upload, download, started_at, closed_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(conn.backend_id)
            .bind(&conn.conn_id)
            .bind(&conn.identity.host)
            .bind(&conn.identity.destination_ip)
            .bind(&conn.identity.chain)
            .bind(&conn.identity.rule)
            .bind(&conn.identity.source_ip)
            .bind(&conn.identity.network)
            .bind(conn.upload as i64)
            .bind(conn.download as i64)
            .bind(conn.started_at_ms)
            .bind(conn.closed_at_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Recent closed connections, newest first.
    pub async fn list_connection_logs(
        &self,
        backend_id: i64,
        page: &PageParams,
    ) -> StoreResult<Page<ConnectionLogRow>> {
        let mut filter = String::from(" WHERE backend_id = ?");
        let search = page.search.as_ref().filter(|s| !s.is_empty());
        if search.is_some() {
            filter.push_str(" AND (host LIKE ? OR ip LIKE ?)");
        }

        let total_sql = format!("SELECT COUNT(*) FROM connection_logs{filter}");
        let mut q = sqlx::query_as::<_, (i64,)>(&total_sql).bind(backend_id);
        if let Some(s) = search {
            let pattern = format!("%{s}%");
            q = q.bind(pattern.clone()).bind(pattern);
        }
        let (total,) = q.fetch_one(self.pool()).await?;

        let data_sql = format!(
            "SELECT id, conn_id, host, ip, chain, rule, source_ip, network, upload, download, \
             started_at, closed_at FROM connection_logs{filter} \
             ORDER BY closed_at DESC LIMIT ? OFFSET ?"
        );
        let mut q = sqlx::query_as::<
            _,
            (
                i64,
                String,
                String,
                String,
                String,
                String,
                String,
                String,
                i64,
                i64,
                i64,
                i64,
            ),
        >(&data_sql)
        .bind(backend_id);
        if let Some(s) = search {
            let pattern = format!("%{s}%");
            q = q.bind(pattern.clone()).bind(pattern);
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
                    id,
                    conn_id,
                    host,
                    ip,
                    chain,
                    rule,
                    source_ip,
                    network,
                    upload,
                    download,
                    started_at,
                    closed_at,
                )| ConnectionLogRow {
                    id,
                    conn_id,
                    host,
                    ip,
                    chain,
                    rule,
                    source_ip,
                    network,
                    upload: upload.max(0) as u64,
                    download: download.max(0) as u64,
                    started_at: iso_ms(started_at),
                    closed_at: iso_ms(closed_at),
                },
            )
            .collect();

        Ok(Page {
            data,
            total: total.max(0) as u64,
        })
    }
}
