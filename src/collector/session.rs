use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::RealtimeCache;
use crate::delta::{DeltaComputer, DeltaEvent};
use crate::geoip::GeoProvider;
use crate::model::{hour_bucket_ms, ClosedConnection, DimensionKey, StatDelta};
use crate::store::Backend;

use super::protocol::{decode_frame, subscription_url};

/// Consecutive undecodable frames tolerated before the stream is treated
/// as corrupt and the session backs off.
const MAX_DECODE_FAILURES: u32 = 5;

/// Session tunables, owned by the application config.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// A session is healthy only when a frame arrived this recently.
    pub frame_fresh: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            frame_fresh: Duration::from_secs(60),
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    Open = 2,
    Backoff = 3,
    Stopped = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> SessionState {
        match v {
            1 => SessionState::Connecting,
            2 => SessionState::Open,
            3 => SessionState::Backoff,
            4 => SessionState::Stopped,
            _ => SessionState::Idle,
        }
    }
}

/// Shared health surface, read by the backends API.
#[derive(Debug)]
pub struct SessionHealth {
    state: AtomicU8,
    last_frame_at_ms: AtomicI64,
    decode_errors: AtomicU64,
    last_error: parking_lot::Mutex<Option<String>>,
}

impl SessionHealth {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            last_frame_at_ms: AtomicI64::new(0),
            decode_errors: AtomicU64::new(0),
            last_error: parking_lot::Mutex::new(None),
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn record_frame(&self, now_ms: i64) {
        self.last_frame_at_ms.store(now_ms, Ordering::Relaxed);
    }

    fn record_error(&self, err: &str) {
        *self.last_error.lock() = Some(err.to_string());
    }

    fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn last_frame_at_ms(&self) -> Option<i64> {
        match self.last_frame_at_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// healthy iff open with a fresh frame; unknown before any frame.
    pub fn status(&self, now_ms: i64, frame_fresh: Duration) -> &'static str {
        let last = self.last_frame_at_ms.load(Ordering::Relaxed);
        match self.state() {
            SessionState::Open => {
                if last > 0 && now_ms - last <= frame_fresh.as_millis() as i64 {
                    "healthy"
                } else {
                    "unhealthy"
                }
            }
            SessionState::Backoff => "unhealthy",
            SessionState::Idle | SessionState::Connecting | SessionState::Stopped => {
                if last > 0 {
                    "unhealthy"
                } else {
                    "unknown"
                }
            }
        }
    }
}

/// Running session handle held by the supervisor.
pub struct SessionHandle {
    pub backend_id: i64,
    pub url: String,
    pub token: Option<String>,
    pub health: Arc<SessionHealth>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl SessionHandle {
    /// Cancels the session and waits for in-flight frame processing to
    /// finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(backend_id = self.backend_id, error = %e, "session task join failed");
        }
    }
}

/// One upstream WebSocket subscription.
pub struct Session {
    backend: Backend,
    cfg: SessionConfig,
    cache: Arc<RealtimeCache>,
    geo: Arc<dyn GeoProvider>,
    logs: mpsc::UnboundedSender<ClosedConnection>,
    health: Arc<SessionHealth>,
    cancel: CancellationToken,
}

enum StreamExit {
    Cancelled,
}

impl Session {
    /// Spawns the session task and returns its handle.
    pub fn spawn(
        backend: Backend,
        cfg: SessionConfig,
        cache: Arc<RealtimeCache>,
        geo: Arc<dyn GeoProvider>,
        logs: mpsc::UnboundedSender<ClosedConnection>,
        parent: &CancellationToken,
    ) -> SessionHandle {
        let cancel = parent.child_token();
        let health = Arc::new(SessionHealth::new());

        let handle_meta = (backend.id, backend.url.clone(), backend.token.clone());
        let session = Session {
            backend,
            cfg,
            cache,
            geo,
            logs,
            health: Arc::clone(&health),
            cancel: cancel.clone(),
        };

        let task = tokio::spawn(session.run());

        SessionHandle {
            backend_id: handle_meta.0,
            url: handle_meta.1,
            token: handle_meta.2,
            health,
            cancel,
            task,
        }
    }

    async fn run(self) {
        let backend_id = self.backend.id;
        let name = self.backend.name.clone();
        info!(backend_id, backend = %name, "collector session starting");

        let mut attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.health.set_state(SessionState::Connecting);
            // A panic in frame processing must not take the process (or
            // the reconnect loop) down with it.
            let outcome = std::panic::AssertUnwindSafe(self.connect_and_stream(&mut attempts))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(StreamExit::Cancelled)) => break,
                Ok(Err(e)) => {
                    self.health.record_error(&format!("{e:#}"));
                    warn!(backend_id, backend = %name, error = %e, "session stream ended");
                }
                Err(_) => {
                    self.health.record_error("session panicked");
                    error!(backend_id, backend = %name, "session panicked, backing off");
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            self.health.set_state(SessionState::Backoff);
            let delay = backoff_delay(self.cfg.backoff_base, self.cfg.backoff_max, attempts);
            attempts = attempts.saturating_add(1);
            debug!(backend_id, delay_ms = delay.as_millis() as u64, "backing off");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.health.set_state(SessionState::Stopped);
        info!(backend_id, backend = %name, "collector session stopped");
    }

    async fn connect_and_stream(&self, attempts: &mut u32) -> Result<StreamExit> {
        let url = subscription_url(&self.backend.url)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .context("building upgrade request")?;
        if let Some(token) = &self.backend.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("token is not a valid header value")?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (mut ws, _) = tokio::time::timeout(self.cfg.handshake_timeout, connect_async(request))
            .await
            .context("handshake timed out")?
            .context("handshake failed")?;

        self.health.set_state(SessionState::Open);
        *attempts = 0;
        debug!(backend_id = self.backend.id, url = %url, "subscription open");

        // Session restart semantics: the first snapshot only seeds
        // baselines, so bytes that predate this subscription are never
        // counted and resumes cannot double-count.
        let mut delta = DeltaComputer::new();
        let mut seeded = false;
        let mut decode_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = SinkExt::close(&mut ws).await;
                    return Ok(StreamExit::Cancelled);
                }
                msg = ws.next() => {
                    match msg {
                        None => bail!("stream closed by upstream"),
                        Some(Err(e)) => bail!("frame read failed: {e}"),
                        Some(Ok(Message::Text(text))) => {
                            match decode_frame(text.as_str()) {
                                Ok(snapshot) => {
                                    decode_failures = 0;
                                    let now_ms = Utc::now().timestamp_millis();
                                    self.health.record_frame(now_ms);

                                    if !seeded {
                                        delta.rebaseline(&snapshot, now_ms);
                                        seeded = true;
                                        continue;
                                    }

                                    for event in delta.advance(&snapshot, now_ms) {
                                        self.record_event(event, now_ms);
                                    }
                                }
                                Err(e) => {
                                    // Malformed frames are dropped; only a
                                    // run of them means the stream is bad.
                                    self.health.record_decode_error();
                                    decode_failures += 1;
                                    warn!(
                                        backend_id = self.backend.id,
                                        error = %e,
                                        "dropping undecodable frame",
                                    );
                                    if decode_failures >= MAX_DECODE_FAILURES {
                                        bail!("{decode_failures} consecutive decode failures");
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) => bail!("close frame from upstream"),
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    /// Fans one delta event out to every dimension and, on close, queues
    /// the persistent connection record.
    fn record_event(&self, event: DeltaEvent, now_ms: i64) {
        if event.is_closed {
            let record = ClosedConnection {
                backend_id: self.backend.id,
                conn_id: event.conn_id.clone(),
                identity: Arc::clone(&event.identity),
                upload: event.total_upload,
                download: event.total_download,
                started_at_ms: event.started_at_ms,
                closed_at_ms: now_ms,
            };
            // Best-effort: the writer may already be shutting down.
            let _ = self.logs.send(record);
        }

        // Closes carry zero deltas but still touch every dimension so
        // last_seen reflects the connection's actual end.
        if event.upload_delta == 0
            && event.download_delta == 0
            && !event.is_new
            && !event.is_closed
        {
            return;
        }

        let delta = StatDelta {
            upload: event.upload_delta,
            download: event.download_delta,
            connections: u64::from(event.is_new),
            last_seen_ms: now_ms,
        };
        let bucket = hour_bucket_ms(now_ms);
        let geo = self.geo.lookup(&event.identity.destination_ip);

        for key in event.identity.dimension_keys() {
            let row_geo = match &key {
                DimensionKey::Ip { .. } => geo.clone(),
                _ => None,
            };
            self.cache.apply(self.backend.id, key, bucket, delta, row_geo);
        }
        if let Some(geo) = geo {
            self.cache.apply(
                self.backend.id,
                DimensionKey::Country {
                    code: geo.country_code,
                },
                bucket,
                delta,
                None,
            );
        }
    }
}

/// `min(base × 2^attempts, max)` with ±20% jitter.
fn backoff_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempts.min(16)));
    let capped = exp.min(max);
    let jitter = 0.8 + (rand::random::<u64>() % 401) as f64 / 1000.0;
    Duration::from_millis((capped.as_millis() as f64 * jitter) as u64)
}

/// Dials a backend's subscription endpoint once and reports the
/// handshake latency. Used by the connectivity-test API.
pub async fn probe_backend(url: &str, token: Option<&str>, timeout: Duration) -> Result<Duration> {
    let url = subscription_url(url)?;

    let mut request = url
        .as_str()
        .into_client_request()
        .context("building upgrade request")?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("token is not a valid header value")?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let started = std::time::Instant::now();
    let (mut ws, _) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .context("connection test timed out")?
        .context("connection test failed")?;
    let latency = started.elapsed();

    let _ = SinkExt::close(&mut ws).await;
    Ok(latency)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);

        // Jitter is ±20%, so check against widened bounds.
        let d0 = backoff_delay(base, max, 0);
        assert!(d0 >= Duration::from_millis(800) && d0 <= Duration::from_millis(1200));

        let d3 = backoff_delay(base, max, 3);
        assert!(d3 >= Duration::from_millis(6400) && d3 <= Duration::from_millis(9600));

        let d10 = backoff_delay(base, max, 10);
        assert!(d10 <= Duration::from_millis(36_000));
        assert!(d10 >= Duration::from_millis(24_000));
    }

    #[test]
    fn test_health_status_transitions() {
        let health = SessionHealth::new();
        assert_eq!(health.status(0, Duration::from_secs(60)), "unknown");

        health.set_state(SessionState::Open);
        health.record_frame(1_000);
        assert_eq!(health.status(2_000, Duration::from_secs(60)), "healthy");

        // Frame older than the freshness window.
        assert_eq!(health.status(62_000, Duration::from_secs(60)), "unhealthy");

        health.set_state(SessionState::Backoff);
        assert_eq!(health.status(2_000, Duration::from_secs(60)), "unhealthy");
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            SessionState::Idle,
            SessionState::Connecting,
            SessionState::Open,
            SessionState::Backoff,
            SessionState::Stopped,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }

    #[tokio::test]
    async fn test_probe_rejects_unreachable() {
        let err = probe_backend("http://127.0.0.1:1", None, Duration::from_millis(500))
            .await
            .expect_err("nothing listens on port 1");
        assert!(!err.to_string().is_empty());
    }
}
