//! Application startup and shutdown sequencing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend_manager::BackendReadiness;
use crate::state::AppState;

/// Extra wait on top of the stop grace period for the force kill to land
const EXIT_WAIT_MARGIN: Duration = Duration::from_secs(1);

pub struct Lifecycle {
    shutting_down: AtomicBool,
    background: CancellationToken,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            shutting_down: AtomicBool::new(false),
            background: CancellationToken::new(),
        }
    }

    /// Cancelled when shutdown begins
    pub fn background_token(&self) -> CancellationToken {
        self.background.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Bring the backend online and record the outcome for the UI.
    ///
    /// Resolves only once the health check is decided, so a window created
    /// afterwards never sees `Pending`. Backend failures leave the app in
    /// degraded mode rather than failing startup.
    pub async fn startup(&self, state: &AppState) -> BackendReadiness {
        let readiness = state.backend.bring_online().await;
        *state.readiness.write().await = readiness.clone();

        match &readiness {
            BackendReadiness::Ready { port } => info!(port, "backend ready"),
            BackendReadiness::Offline { reason } => warn!("continuing without backend: {}", reason),
            BackendReadiness::Pending => {}
        }
        readiness
    }

    /// Start the periodic update checks tied to this lifecycle
    pub fn start_update_checks(&self, state: &AppState) -> Option<JoinHandle<()>> {
        state.updates.clone().start_auto_check(self.background_token())
    }

    /// Stop the backend and run install-on-quit. Only the first call does anything.
    ///
    /// Returns whether this call performed the shutdown.
    pub async fn shutdown(&self, state: &AppState) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!("shutting down");
        self.background.cancel();
        state.backend.stop().await;

        if state.updates.install_on_quit().await {
            info!("staged update handed to installer");
        }

        let wait = state.settings.backend.stop_grace() + EXIT_WAIT_MARGIN;
        if !state.backend.wait_exit(wait).await {
            warn!("backend still running after {:?}", wait);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_manager::BackendManager;
    use crate::health::HealthCheck;
    use crate::settings::{RunMode, Settings};
    use crate::status_channel::StatusChannel;
    use crate::updater::{HttpUpdateFeed, UpdateManager};
    use futures::future::BoxFuture;
    use std::sync::Arc;

    struct NeverHealthy;

    impl HealthCheck for NeverHealthy {
        fn check(&self) -> BoxFuture<'_, bool> {
            Box::pin(async { false })
        }
    }

    fn state_with(backend: BackendManager) -> AppState {
        let mut settings = Settings::default();
        settings.backend.health_retries = 2;
        settings.backend.health_interval_ms = 10;
        let channel = StatusChannel::new();
        let feed = Arc::new(HttpUpdateFeed::new("http://127.0.0.1:9", std::env::temp_dir()));
        let updates = UpdateManager::new(
            "1.0.0",
            RunMode::Packaged,
            settings.updates.clone(),
            feed,
            channel.clone(),
        );
        AppState::from_parts(settings, RunMode::Packaged, backend, updates, channel)
    }

    #[tokio::test]
    async fn test_startup_records_offline_readiness() {
        let backend = BackendManager::new(Default::default(), RunMode::Packaged)
            .with_launch_spec(crate::launcher::LaunchSpec::new("/definitely/not/here/backend"));
        let state = state_with(backend);

        let readiness = state.lifecycle.startup(&state).await;
        assert!(matches!(readiness, BackendReadiness::Offline { .. }));
        assert_eq!(*state.readiness.read().await, readiness);
    }

    #[tokio::test]
    async fn test_shutdown_runs_once() {
        let backend = BackendManager::new(Default::default(), RunMode::Packaged)
            .with_health_check(|_| Arc::new(NeverHealthy) as Arc<dyn HealthCheck>);
        let state = state_with(backend);
        let token = state.lifecycle.background_token();

        assert!(state.lifecycle.shutdown(&state).await);
        assert!(token.is_cancelled());
        assert!(state.lifecycle.is_shutting_down());
        assert!(!state.lifecycle.shutdown(&state).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_stops_backend() {
        let backend = BackendManager::new(Default::default(), RunMode::Packaged)
            .with_launch_spec(
                crate::launcher::LaunchSpec::new("sh")
                    .arg("-c")
                    .arg("sleep 30")
                    .arg("sh"),
            )
            .with_health_check(|_| Arc::new(NeverHealthy) as Arc<dyn HealthCheck>);
        let state = state_with(backend);

        state.backend.start().await.unwrap();
        assert!(state.backend.is_running().await);

        assert!(state.lifecycle.shutdown(&state).await);
        assert!(!state.backend.is_running().await);
    }
}
