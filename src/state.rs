use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::backend_manager::{BackendManager, BackendReadiness};
use crate::lifecycle::Lifecycle;
use crate::settings::{RunMode, Settings};
use crate::status_channel::StatusChannel;
use crate::updater::{HttpUpdateFeed, UpdateManager};

/// Orchestration state shared with every command handler
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub run_mode: RunMode,
    pub backend: Arc<BackendManager>,
    pub updates: Arc<UpdateManager>,
    pub status: StatusChannel,
    /// Recorded once the startup health check has an outcome
    pub readiness: Arc<RwLock<BackendReadiness>>,
    pub lifecycle: Arc<Lifecycle>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let run_mode = RunMode::detect(&settings);
        let status = StatusChannel::new();

        let feed = HttpUpdateFeed::new(settings.updates.feed_url.clone(), staging_dir());
        let updates = UpdateManager::new(
            env!("CARGO_PKG_VERSION"),
            run_mode,
            settings.updates.clone(),
            Arc::new(feed),
            status.clone(),
        );
        let backend = BackendManager::new(settings.backend.clone(), run_mode);

        Self::from_parts(settings, run_mode, backend, updates, status)
    }

    pub fn from_parts(
        settings: Settings,
        run_mode: RunMode,
        backend: BackendManager,
        updates: UpdateManager,
        status: StatusChannel,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            run_mode,
            backend: Arc::new(backend),
            updates: Arc::new(updates),
            status,
            readiness: Arc::new(RwLock::new(BackendReadiness::Pending)),
            lifecycle: Arc::new(Lifecycle::new()),
        }
    }
}

fn staging_dir() -> PathBuf {
    Settings::update_staging_dir().unwrap_or_else(|e| {
        let fallback = std::env::temp_dir().join("desktop-shell-updates");
        warn!("{}, staging updates in {}", e, fallback.display());
        fallback
    })
}
