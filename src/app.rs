use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::cache::RealtimeCache;
use crate::collector::log_buffer::start_log_buffer;
use crate::collector::Supervisor;
use crate::config::Config;
use crate::flush::Flusher;
use crate::geoip::{GeoProvider, MaxMindGeo};
use crate::store::Store;

/// Shutdown drain budget before tasks are abandoned.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// App wires every component together: store, cache, collector
/// supervisor, flusher, retention sweeper, and the HTTP API.
pub struct App {
    supervisor: Arc<Supervisor>,
    store: Store,
    cancel: CancellationToken,
    flusher_task: Option<tokio::task::JoinHandle<()>>,
    api_task: Option<tokio::task::JoinHandle<()>>,
}

impl App {
    /// Starts every component, blocks until SIGINT or SIGTERM, then
    /// shuts down gracefully.
    pub async fn run(cfg: Config) -> Result<()> {
        let app = App::start(cfg).await?;
        let signal = wait_for_shutdown_signal().await?;
        info!(signal, "shutdown signal received");
        app.stop().await
    }

    /// Builds and starts all components.
    pub async fn start(cfg: Config) -> Result<Self> {
        let cancel = CancellationToken::new();

        let geo: Arc<dyn GeoProvider> = Arc::new(MaxMindGeo::open(&cfg.database.geoip_path));
        let store = Store::open(&cfg.database.path, Arc::clone(&geo))
            .await
            .context("opening store")?;
        let cache = Arc::new(RealtimeCache::new(cfg.realtime_tolerance_ms()));

        let logs = start_log_buffer(store.clone(), cancel.child_token());

        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            Arc::clone(&cache),
            geo,
            logs,
            cfg.session_config(),
            cancel.child_token(),
        ));
        supervisor.sync().await.context("starting collector sessions")?;

        let flusher_task = Flusher::new(
            store.clone(),
            Arc::clone(&cache),
            cfg.flush.interval,
            cancel.child_token(),
        )
        .spawn();

        Self::spawn_retention_sweeper(store.clone(), cancel.child_token());

        let state = Arc::new(AppState {
            store: store.clone(),
            cache,
            supervisor: Arc::clone(&supervisor),
        });
        let api_cancel = cancel.child_token();
        let api_port = cfg.api.port;
        let api_task = tokio::spawn(async move {
            if let Err(e) = api::serve(state, api_port, api_cancel).await {
                error!(error = %e, "API server exited");
            }
        });

        info!("all components started");

        Ok(Self {
            supervisor,
            store,
            cancel,
            flusher_task: Some(flusher_task),
            api_task: Some(api_task),
        })
    }

    /// Graceful shutdown: sessions drain in-flight frames, the flusher
    /// performs its final flush, then the store closes.
    pub async fn stop(mut self) -> Result<()> {
        info!("shutting down");

        // Stop ingestion first so the final flush sees everything.
        if tokio::time::timeout(SHUTDOWN_BUDGET, self.supervisor.stop_all())
            .await
            .is_err()
        {
            warn!("collector sessions did not drain within shutdown budget");
        }

        self.cancel.cancel();

        if let Some(task) = self.flusher_task.take() {
            if tokio::time::timeout(SHUTDOWN_BUDGET, task).await.is_err() {
                warn!("flusher did not finish within shutdown budget");
            }
        }
        if let Some(task) = self.api_task.take() {
            if tokio::time::timeout(SHUTDOWN_BUDGET, task).await.is_err() {
                warn!("API server did not finish within shutdown budget");
            }
        }

        self.store.close().await;
        info!("shutdown complete");
        Ok(())
    }

    /// Hourly sweep applying the retention policy when auto-cleanup is
    /// enabled.
    fn spawn_retention_sweeper(store: Store, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so startup is not
            // burdened with a sweep.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let auto = match store.retention().await {
                            Ok(cfg) => cfg.auto_cleanup,
                            Err(e) => {
                                warn!(error = %e, "reading retention config failed");
                                continue;
                            }
                        };
                        if !auto {
                            continue;
                        }

                        match store.apply_retention(Utc::now().timestamp_millis()).await {
                            Ok(counts) => {
                                let total: u64 = counts.values().sum();
                                if total > 0 {
                                    info!(deleted = total, "retention sweep completed");
                                }
                            }
                            Err(e) => warn!(error = %e, "retention sweep failed"),
                        }
                    }
                }
            }
        });
    }
}

/// Resolves once SIGINT or SIGTERM arrives, naming the signal. Failing
/// to register a handler is a startup error, not a reason to run
/// uninterruptible.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    let signal = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for SIGINT")?;
            "SIGINT"
        }
        _ = sigterm.recv() => "SIGTERM",
    };

    Ok(signal)
}
