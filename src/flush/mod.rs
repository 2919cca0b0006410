//! Periodic persistence of the realtime cache.
//!
//! Every tick the flusher drains each backend's pending deltas and
//! submits them per dimension, in a fixed order, as single transactions.
//! Busy errors retry with backoff; integrity errors discard only the
//! offending row; anything else puts the rows back into the cache for
//! the next cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::RealtimeCache;
use crate::model::{BackendId, Dimension, FlushRow};
use crate::store::{Store, StoreError};

/// Busy-retry policy: 5 attempts with doubling delay.
const BUSY_RETRIES: u32 = 5;
const BUSY_BASE_DELAY: Duration = Duration::from_millis(100);

pub struct Flusher {
    store: Store,
    cache: Arc<RealtimeCache>,
    interval: Duration,
    cancel: CancellationToken,
}

impl Flusher {
    pub fn new(
        store: Store,
        cache: Arc<RealtimeCache>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            cache,
            interval,
            cancel,
        }
    }

    /// Spawns the flush loop. The task performs one final synchronous
    /// flush when cancelled, so awaiting the handle after cancellation
    /// guarantees the cache is empty.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_ms = self.interval.as_millis() as u64, "flusher started");

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.flush_all().await;
                        info!("flusher stopped after final flush");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.flush_all().await;
                    }
                }
            }
        })
    }

    /// Drains and persists every backend with pending deltas.
    pub async fn flush_all(&self) {
        for backend_id in self.cache.backend_ids() {
            if !self.cache.has_pending(backend_id) {
                continue;
            }
            self.flush_backend(backend_id).await;
        }
    }

    async fn flush_backend(&self, backend_id: BackendId) {
        let batch = self.cache.drain(backend_id);
        if batch.is_empty() {
            return;
        }

        // Fixed dimension order: a partial failure leaves the
        // most-queried tables consistent first.
        for (dimension, rows) in batch.by_dimension() {
            let count = rows.len();
            match self.flush_dimension(backend_id, dimension, rows).await {
                Ok(discarded) => {
                    if discarded > 0 {
                        warn!(
                            backend_id,
                            table = dimension.table(),
                            discarded,
                            "rows discarded on integrity errors",
                        );
                    }
                    debug!(backend_id, table = dimension.table(), count, "dimension flushed");
                }
                Err(rows) => {
                    warn!(
                        backend_id,
                        table = dimension.table(),
                        count = rows.len(),
                        "flush failed, returning rows to cache",
                    );
                    self.cache.restore(backend_id, rows);
                }
            }
        }
    }

    /// Persists one dimension batch. Returns the number of rows
    /// discarded on integrity errors, or gives the rows back when the
    /// batch could not be persisted at all.
    async fn flush_dimension(
        &self,
        backend_id: BackendId,
        dimension: Dimension,
        rows: Vec<FlushRow>,
    ) -> Result<usize, Vec<FlushRow>> {
        let mut delay = BUSY_BASE_DELAY;

        for attempt in 0..=BUSY_RETRIES {
            match self.store.upsert_batch(backend_id, &rows).await {
                Ok(()) => return Ok(0),
                Err(e) if e.is_retryable() && attempt < BUSY_RETRIES => {
                    debug!(
                        backend_id,
                        table = dimension.table(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "store busy, retrying batch",
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) if e.is_constraint() => {
                    // One bad row must not sink the batch: replay rows
                    // individually and drop only the offenders.
                    return self.split_retry(backend_id, dimension, rows).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(
                            backend_id,
                            table = dimension.table(),
                            error = %e,
                            "store still busy after {BUSY_RETRIES} retries",
                        );
                    } else {
                        error!(backend_id, table = dimension.table(), error = %e, "batch flush failed");
                    }
                    return Err(rows);
                }
            }
        }

        Err(rows)
    }

    async fn split_retry(
        &self,
        backend_id: BackendId,
        dimension: Dimension,
        rows: Vec<FlushRow>,
    ) -> Result<usize, Vec<FlushRow>> {
        let mut discarded = 0usize;
        let mut failed = Vec::new();

        for row in rows {
            match self.store.upsert_one(backend_id, &row).await {
                Ok(()) => {}
                Err(StoreError::Constraint(e)) => {
                    discarded += 1;
                    warn!(
                        backend_id,
                        table = dimension.table(),
                        error = %e,
                        "discarding row on integrity error",
                    );
                }
                Err(_) => failed.push(row),
            }
        }

        if failed.is_empty() {
            Ok(discarded)
        } else {
            // Preserve what could not be written at all.
            self.cache.restore(backend_id, failed);
            Ok(discarded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoip::StubGeo;
    use crate::model::{DimensionKey, StatDelta};
    use crate::store::rows::TimeWindow;

    fn apply(cache: &RealtimeCache, backend_id: i64, host: &str, upload: u64, download: u64) {
        let delta = StatDelta {
            upload,
            download,
            connections: 1,
            last_seen_ms: 1000,
        };
        cache.apply(backend_id, DimensionKey::Hourly, 0, delta, None);
        cache.apply(
            backend_id,
            DimensionKey::Domain {
                host: host.to_string(),
            },
            0,
            delta,
            None,
        );
    }

    #[tokio::test]
    async fn test_flush_moves_cache_to_store() {
        let store = Store::open_in_memory(Arc::new(StubGeo::default()))
            .await
            .expect("store");
        let cache = Arc::new(RealtimeCache::new(120_000));
        apply(&cache, 1, "a.example", 150, 1500);

        let flusher = Flusher::new(
            store.clone(),
            Arc::clone(&cache),
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        flusher.flush_all().await;

        assert!(!cache.has_pending(1));
        let totals = store.summary_totals(1, TimeWindow::all()).await.expect("totals");
        assert_eq!(totals.upload, 150);
        assert_eq!(totals.download, 1500);
        assert_eq!(totals.connections, 1);

        let domains = store.top_domains(1, TimeWindow::all(), 10).await.expect("domains");
        assert_eq!(domains[0].host, "a.example");
        assert_eq!(domains[0].upload, 150);
    }

    #[tokio::test]
    async fn test_flush_is_not_double_counted_on_replay() {
        // Replaying a drained batch without re-draining the cache must
        // come from an explicit restore; a normal cycle flushes once.
        let store = Store::open_in_memory(Arc::new(StubGeo::default()))
            .await
            .expect("store");
        let cache = Arc::new(RealtimeCache::new(120_000));
        apply(&cache, 1, "a.example", 100, 1000);

        let flusher = Flusher::new(
            store.clone(),
            Arc::clone(&cache),
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        flusher.flush_all().await;
        flusher.flush_all().await;

        let totals = store.summary_totals(1, TimeWindow::all()).await.expect("totals");
        assert_eq!(totals.upload, 100);
    }

    #[tokio::test]
    async fn test_failed_flush_restores_rows() {
        let store = Store::open_in_memory(Arc::new(StubGeo::default()))
            .await
            .expect("store");
        let cache = Arc::new(RealtimeCache::new(120_000));
        apply(&cache, 1, "a.example", 10, 10);

        // A closed pool makes every write fail with a non-retryable
        // error; the rows must come back to the cache.
        store.close().await;

        let flusher = Flusher::new(
            store,
            Arc::clone(&cache),
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        flusher.flush_all().await;

        assert!(cache.has_pending(1));
    }

    #[tokio::test]
    async fn test_cancel_triggers_final_flush() {
        let store = Store::open_in_memory(Arc::new(StubGeo::default()))
            .await
            .expect("store");
        let cache = Arc::new(RealtimeCache::new(120_000));
        apply(&cache, 1, "a.example", 42, 84);

        let cancel = CancellationToken::new();
        let task = Flusher::new(
            store.clone(),
            Arc::clone(&cache),
            Duration::from_secs(3600),
            cancel.clone(),
        )
        .spawn();

        cancel.cancel();
        task.await.expect("flusher exits");

        assert!(!cache.has_pending(1));
        let totals = store.summary_totals(1, TimeWindow::all()).await.expect("totals");
        assert_eq!(totals.upload, 42);
    }
}
