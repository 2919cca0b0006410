pub mod log_buffer;
pub mod protocol;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::RealtimeCache;
use crate::geoip::GeoProvider;
use crate::store::{Backend, Store};

use self::log_buffer::LogSender;
use self::session::{Session, SessionConfig, SessionHandle};

/// Live health snapshot of one session, attached to backend responses.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHealthView {
    pub status: &'static str,
    #[serde(rename = "lastFrameAt")]
    pub last_frame_at: Option<String>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "decodeErrors")]
    pub decode_errors: u64,
}

/// Owns the set of collector sessions and reconciles it against the
/// backends table. Called at startup and after every mutating backends
/// API call; all mutations are serialized on one mutex.
pub struct Supervisor {
    store: Store,
    cache: Arc<RealtimeCache>,
    geo: Arc<dyn GeoProvider>,
    logs: LogSender,
    session_cfg: SessionConfig,
    cancel: CancellationToken,
    sessions: tokio::sync::Mutex<HashMap<i64, SessionHandle>>,
}

impl Supervisor {
    pub fn new(
        store: Store,
        cache: Arc<RealtimeCache>,
        geo: Arc<dyn GeoProvider>,
        logs: LogSender,
        session_cfg: SessionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            cache,
            geo,
            logs,
            session_cfg,
            cancel,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles running sessions with the enabled+listening backends:
    /// starts the missing ones, stops the removed/disabled ones, and
    /// restarts those whose connection settings changed.
    pub async fn sync(&self) -> Result<()> {
        let desired = self
            .store
            .listening_backends()
            .await
            .context("loading listening backends")?;
        let desired_by_id: HashMap<i64, &Backend> = desired.iter().map(|b| (b.id, b)).collect();

        let mut sessions = self.sessions.lock().await;

        let stop_ids: Vec<i64> = sessions
            .iter()
            .filter(|(id, handle)| match desired_by_id.get(id) {
                None => true,
                Some(backend) => backend.url != handle.url || backend.token != handle.token,
            })
            .map(|(id, _)| *id)
            .collect();

        for id in stop_ids {
            if let Some(handle) = sessions.remove(&id) {
                info!(backend_id = id, "stopping collector session");
                handle.stop().await;
            }
        }

        for backend in &desired {
            if sessions.contains_key(&backend.id) {
                continue;
            }
            info!(backend_id = backend.id, backend = %backend.name, "starting collector session");
            let handle = Session::spawn(
                backend.clone(),
                self.session_cfg,
                Arc::clone(&self.cache),
                Arc::clone(&self.geo),
                self.logs.clone(),
                &self.cancel,
            );
            sessions.insert(backend.id, handle);
        }

        Ok(())
    }

    /// Stops every session, draining in-flight frames.
    pub async fn stop_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (id, handle) in sessions.drain() {
            info!(backend_id = id, "stopping collector session");
            handle.stop().await;
        }
    }

    pub async fn running_ids(&self) -> Vec<i64> {
        let sessions = self.sessions.lock().await;
        let mut ids: Vec<i64> = sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Health view for one backend, when a session is running.
    pub async fn health(&self, backend_id: i64) -> Option<SessionHealthView> {
        let sessions = self.sessions.lock().await;
        let handle = sessions.get(&backend_id)?;
        let now_ms = Utc::now().timestamp_millis();

        Some(SessionHealthView {
            status: handle.health.status(now_ms, self.session_cfg.frame_fresh),
            last_frame_at: handle
                .health
                .last_frame_at_ms()
                .map(crate::store::rows::iso_ms),
            last_error: handle.health.last_error(),
            decode_errors: handle.health.decode_errors(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoip::StubGeo;
    use crate::store::NewBackend;

    async fn supervisor() -> (Supervisor, Store, CancellationToken) {
        let geo: Arc<dyn GeoProvider> = Arc::new(StubGeo::default());
        let store = Store::open_in_memory(Arc::clone(&geo)).await.expect("store");
        let cache = Arc::new(RealtimeCache::new(120_000));
        let cancel = CancellationToken::new();
        let logs = log_buffer::start_log_buffer(store.clone(), cancel.child_token());

        let sup = Supervisor::new(
            store.clone(),
            cache,
            geo,
            logs,
            SessionConfig::default(),
            cancel.clone(),
        );
        (sup, store, cancel)
    }

    fn backend(name: &str) -> NewBackend {
        NewBackend {
            name: name.to_string(),
            // Nothing listens here; sessions sit in connect/backoff,
            // which is all reconciliation needs.
            url: "http://127.0.0.1:1".to_string(),
            token: None,
        }
    }

    #[tokio::test]
    async fn test_sync_starts_and_stops_sessions() {
        let (sup, store, cancel) = supervisor().await;

        let a = store.create_backend(&backend("a"), 0).await.expect("a");
        let b = store.create_backend(&backend("b"), 0).await.expect("b");

        sup.sync().await.expect("sync");
        assert_eq!(sup.running_ids().await, vec![a.id, b.id]);

        // Stopping listening removes the session on the next sync.
        store.set_listening(a.id, false).await.expect("toggle");
        sup.sync().await.expect("sync");
        assert_eq!(sup.running_ids().await, vec![b.id]);

        // Deleting removes the rest.
        store.delete_backend(b.id).await.expect("delete");
        sup.sync().await.expect("sync");
        assert!(sup.running_ids().await.is_empty());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_sync_restarts_on_url_change() {
        let (sup, store, cancel) = supervisor().await;
        let a = store.create_backend(&backend("a"), 0).await.expect("a");

        sup.sync().await.expect("sync");
        let health_before = sup.health(a.id).await.expect("running");
        assert!(matches!(health_before.status, "unknown" | "unhealthy"));

        store
            .update_backend(
                a.id,
                &crate::store::BackendPatch {
                    url: Some("http://127.0.0.1:2".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("update");

        sup.sync().await.expect("sync");
        assert_eq!(sup.running_ids().await, vec![a.id]);

        sup.stop_all().await;
        assert!(sup.running_ids().await.is_empty());
        cancel.cancel();
    }
}
