use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::collector::protocol::ConnectionSnapshot;
use crate::model::ConnectionIdentity;

/// Entries whose id has not appeared in a snapshot for this long are
/// dropped, guarding against upstreams that silently forget connections.
pub const STALE_AFTER: Duration = Duration::from_secs(30 * 60);

/// Per-connection baseline counters and frozen identity.
#[derive(Debug, Clone)]
struct TrackedConnection {
    last_upload: u64,
    last_download: u64,
    started_at_ms: i64,
    last_seen_ms: i64,
    identity: Arc<ConnectionIdentity>,
}

/// Byte delta emitted for one connection between two snapshots.
#[derive(Debug, Clone)]
pub struct DeltaEvent {
    pub conn_id: String,
    pub identity: Arc<ConnectionIdentity>,
    pub upload_delta: u64,
    pub download_delta: u64,
    pub is_new: bool,
    pub is_closed: bool,
    /// Final counters, populated on close for the connection record.
    pub total_upload: u64,
    pub total_download: u64,
    pub started_at_ms: i64,
}

/// Turns a sequence of full connection snapshots into byte-accurate
/// deltas. Owned exclusively by one collector session; state is reset on
/// session restart so every open upstream connection re-baselines with a
/// zero delta.
#[derive(Debug, Default)]
pub struct DeltaComputer {
    tracked: HashMap<String, TrackedConnection>,
}

impl DeltaComputer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections currently tracked.
    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    /// Seeds baselines from currently-open connections without emitting
    /// deltas. Used when a session (re)subscribes so bytes that predate
    /// the subscription are never counted.
    pub fn rebaseline(&mut self, snapshot: &[ConnectionSnapshot], now_ms: i64) {
        self.tracked.clear();
        for conn in snapshot {
            self.tracked.insert(
                conn.id.clone(),
                TrackedConnection {
                    last_upload: conn.upload,
                    last_download: conn.download,
                    started_at_ms: now_ms,
                    last_seen_ms: now_ms,
                    identity: Arc::new(conn.identity()),
                },
            );
        }
    }

    /// Processes one snapshot of currently-open connections and returns
    /// the deltas since the previous snapshot.
    pub fn advance(&mut self, snapshot: &[ConnectionSnapshot], now_ms: i64) -> Vec<DeltaEvent> {
        let mut events = Vec::with_capacity(snapshot.len());

        for conn in snapshot {
            match self.tracked.get_mut(&conn.id) {
                None => {
                    // First sight: initial counters count as the first
                    // delta (usually zero but upstream does not promise it),
                    // and the identity is frozen here.
                    let identity = Arc::new(conn.identity());
                    self.tracked.insert(
                        conn.id.clone(),
                        TrackedConnection {
                            last_upload: conn.upload,
                            last_download: conn.download,
                            started_at_ms: now_ms,
                            last_seen_ms: now_ms,
                            identity: Arc::clone(&identity),
                        },
                    );
                    events.push(DeltaEvent {
                        conn_id: conn.id.clone(),
                        identity,
                        upload_delta: conn.upload,
                        download_delta: conn.download,
                        is_new: true,
                        is_closed: false,
                        total_upload: conn.upload,
                        total_download: conn.download,
                        started_at_ms: now_ms,
                    });
                }
                Some(tracked) => {
                    tracked.last_seen_ms = now_ms;

                    let decreased =
                        conn.upload < tracked.last_upload || conn.download < tracked.last_download;
                    let (du, dd) = if decreased {
                        // Upstream counter reset (restart or id reuse):
                        // re-baseline, emit nothing.
                        (0, 0)
                    } else {
                        (
                            conn.upload - tracked.last_upload,
                            conn.download - tracked.last_download,
                        )
                    };

                    tracked.last_upload = conn.upload;
                    tracked.last_download = conn.download;

                    if du > 0 || dd > 0 {
                        events.push(DeltaEvent {
                            conn_id: conn.id.clone(),
                            identity: Arc::clone(&tracked.identity),
                            upload_delta: du,
                            download_delta: dd,
                            is_new: false,
                            is_closed: false,
                            total_upload: conn.upload,
                            total_download: conn.download,
                            started_at_ms: tracked.started_at_ms,
                        });
                    }
                }
            }
        }

        // Ids that vanished from the snapshot closed upstream.
        let current: std::collections::HashSet<&str> =
            snapshot.iter().map(|c| c.id.as_str()).collect();
        let closed: Vec<String> = self
            .tracked
            .keys()
            .filter(|id| !current.contains(id.as_str()))
            .cloned()
            .collect();

        for id in closed {
            if let Some(tracked) = self.tracked.remove(&id) {
                events.push(DeltaEvent {
                    conn_id: id,
                    identity: tracked.identity,
                    upload_delta: 0,
                    download_delta: 0,
                    is_new: false,
                    is_closed: true,
                    total_upload: tracked.last_upload,
                    total_download: tracked.last_download,
                    started_at_ms: tracked.started_at_ms,
                });
            }
        }

        self.sweep_stale(now_ms);

        events
    }

    /// Drops entries not seen within [`STALE_AFTER`].
    fn sweep_stale(&mut self, now_ms: i64) {
        let cutoff = now_ms - STALE_AFTER.as_millis() as i64;
        self.tracked.retain(|_, t| t.last_seen_ms >= cutoff);
    }
}
