//! Connection-record write buffer.
//!
//! Closed connections are queued on a channel and written to the store
//! in batches, keeping record persistence off the frame-processing path.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::ClosedConnection;
use crate::store::Store;

const BATCH_SIZE: usize = 100;
const FLUSH_EVERY: Duration = Duration::from_millis(500);

pub type LogSender = mpsc::UnboundedSender<ClosedConnection>;

/// Starts the background writer and returns the sender sessions use.
pub fn start_log_buffer(store: Store, cancel: CancellationToken) -> LogSender {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(log_buffer_task(store, rx, cancel));
    tx
}

async fn log_buffer_task(
    store: Store,
    mut rx: mpsc::UnboundedReceiver<ClosedConnection>,
    cancel: CancellationToken,
) {
    let mut buffer: Vec<ClosedConnection> = Vec::with_capacity(BATCH_SIZE);
    let mut ticker = tokio::time::interval(FLUSH_EVERY);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Drain whatever is still queued before exiting.
                while let Ok(conn) = rx.try_recv() {
                    buffer.push(conn);
                }
                flush(&store, &mut buffer).await;
                return;
            }
            conn = rx.recv() => {
                match conn {
                    Some(conn) => {
                        buffer.push(conn);
                        if buffer.len() >= BATCH_SIZE {
                            flush(&store, &mut buffer).await;
                        }
                    }
                    None => {
                        flush(&store, &mut buffer).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&store, &mut buffer).await;
                }
            }
        }
    }
}

async fn flush(store: &Store, buffer: &mut Vec<ClosedConnection>) {
    if buffer.is_empty() {
        return;
    }
    let count = buffer.len();
    // Best-effort: connection records are short-lived diagnostics, a
    // failed batch is dropped rather than retried.
    match store.insert_connection_logs(buffer).await {
        Ok(()) => debug!(count, "connection records flushed"),
        Err(e) => warn!(error = %e, count, "dropping connection record batch"),
    }
    buffer.clear();
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::geoip::StubGeo;
    use crate::model::ConnectionIdentity;
    use crate::store::rows::PageParams;

    fn closed(conn_id: &str) -> ClosedConnection {
        ClosedConnection {
            backend_id: 1,
            conn_id: conn_id.to_string(),
            identity: Arc::new(ConnectionIdentity {
                host: "a.example".into(),
                destination_ip: "1.2.3.4".into(),
                chain: "P > R".into(),
                landing: "P".into(),
                rule: "Match".into(),
                source_ip: "192.168.1.10".into(),
                network: "tcp".into(),
                process: None,
            }),
            upload: 1,
            download: 2,
            started_at_ms: 0,
            closed_at_ms: 1000,
        }
    }

    #[tokio::test]
    async fn test_records_flush_on_cancel() {
        let store = Store::open_in_memory(Arc::new(StubGeo::default()))
            .await
            .expect("store");
        let cancel = CancellationToken::new();
        let tx = start_log_buffer(store.clone(), cancel.clone());

        tx.send(closed("c1")).expect("send");
        tx.send(closed("c2")).expect("send");

        cancel.cancel();
        // Give the writer a moment to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let page = store
            .list_connection_logs(1, &PageParams::default())
            .await
            .expect("list");
        assert_eq!(page.total, 2);
    }
}
