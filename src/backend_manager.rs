use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::BackendError;
use crate::health::{HealthCheck, HealthProbe, HttpHealthCheck, ProbeOutcome};
use crate::launcher::{self, ExitInfo, LaunchSpec};
use crate::port_allocator::PortAllocator;
use crate::settings::{BackendSettings, RunMode};
use crate::terminate::{platform_terminator, Terminator};

/// Backend lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendState {
    Starting,
    Healthy,
    Exited,
    FailedToStart,
}

/// Snapshot of the supervised backend process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendHandle {
    /// Distinguishes successive processes within one run
    pub generation: u64,
    pub pid: Option<u32>,
    pub port: u16,
    pub state: BackendState,
    pub exit: Option<ExitInfo>,
}

/// Outcome of bringing the backend online, consumed once by the UI at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum BackendReadiness {
    Pending,
    Ready { port: u16 },
    Offline { reason: String },
}

impl BackendReadiness {
    pub fn port(&self) -> Option<u16> {
        match self {
            BackendReadiness::Ready { port } => Some(*port),
            _ => None,
        }
    }
}

type PortSource = Arc<dyn Fn() -> Result<u16, BackendError> + Send + Sync>;
type HealthCheckFactory = Arc<dyn Fn(u16) -> Arc<dyn HealthCheck> + Send + Sync>;

struct LiveBackend {
    handle: BackendHandle,
    /// Cancelled by the exit observer
    exited: CancellationToken,
    force_kill: CancellationToken,
    stopping: bool,
}

/// Supervises the single backend process of this run
pub struct BackendManager {
    settings: BackendSettings,
    run_mode: RunMode,
    launch_spec: Option<LaunchSpec>,
    port_source: PortSource,
    health_check: HealthCheckFactory,
    terminator: Arc<dyn Terminator>,
    live: Arc<RwLock<Option<LiveBackend>>>,
    last_exit: Arc<RwLock<Option<BackendHandle>>>,
    generation: AtomicU64,
}

impl BackendManager {
    /// Create a new backend manager
    pub fn new(settings: BackendSettings, run_mode: RunMode) -> Self {
        let health_path = settings.health_path.clone();

        Self {
            settings,
            run_mode,
            launch_spec: None,
            port_source: Arc::new(PortAllocator::allocate),
            health_check: Arc::new(move |port| {
                Arc::new(HttpHealthCheck::new(port, &health_path)) as Arc<dyn HealthCheck>
            }),
            terminator: platform_terminator(),
            live: Arc::new(RwLock::new(None)),
            last_exit: Arc::new(RwLock::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    /// Launch this instead of resolving the executable from settings
    pub fn with_launch_spec(mut self, spec: LaunchSpec) -> Self {
        self.launch_spec = Some(spec);
        self
    }

    pub fn with_port_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> Result<u16, BackendError> + Send + Sync + 'static,
    {
        self.port_source = Arc::new(source);
        self
    }

    pub fn with_health_check<F>(mut self, factory: F) -> Self
    where
        F: Fn(u16) -> Arc<dyn HealthCheck> + Send + Sync + 'static,
    {
        self.health_check = Arc::new(factory);
        self
    }

    pub fn with_terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Allocate a port, launch the backend on it and start observing its exit.
    ///
    /// Rejected while a previous process has not exited yet.
    pub async fn start(&self) -> Result<BackendHandle, BackendError> {
        let mut live = self.live.write().await;
        if let Some(existing) = live.as_ref() {
            warn!(
                port = existing.handle.port,
                state = ?existing.handle.state,
                "backend already live, refusing to start another"
            );
            return Err(BackendError::AlreadyRunning {
                port: existing.handle.port,
            });
        }

        let port = (self.port_source)()?;
        let spec = match &self.launch_spec {
            Some(spec) => spec.clone(),
            None => LaunchSpec::resolve(&self.settings, self.run_mode)?,
        };
        let child = launcher::spawn(&spec, port)?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = BackendHandle {
            generation,
            pid: child.id(),
            port,
            state: BackendState::Starting,
            exit: None,
        };
        let exited = CancellationToken::new();
        let force_kill = CancellationToken::new();

        *live = Some(LiveBackend {
            handle: handle.clone(),
            exited: exited.clone(),
            force_kill: force_kill.clone(),
            stopping: false,
        });
        drop(live);

        let live_slot = self.live.clone();
        let last_exit = self.last_exit.clone();
        launcher::watch_exit(child, force_kill, move |exit| async move {
            let mut live = live_slot.write().await;
            let is_current = live
                .as_ref()
                .map(|record| record.handle.generation == generation)
                .unwrap_or(false);

            if is_current {
                if let Some(record) = live.take() {
                    if record.handle.state == BackendState::Healthy && !record.stopping {
                        error!(
                            code = ?exit.code,
                            signal = ?exit.signal,
                            "backend terminated unexpectedly"
                        );
                    }

                    let mut handle = record.handle;
                    if handle.state != BackendState::FailedToStart {
                        handle.state = BackendState::Exited;
                    }
                    handle.exit = Some(exit);
                    *last_exit.write().await = Some(handle);
                }
            }
            drop(live);
            exited.cancel();
        });

        info!(port, pid = ?handle.pid, "backend process started");
        Ok(handle)
    }

    /// Poll the liveness endpoint until success, budget exhaustion or process exit
    pub async fn wait_healthy(&self, handle: &BackendHandle) -> Result<BackendHandle, BackendError> {
        let exited = {
            let live = self.live.read().await;
            match live.as_ref() {
                Some(record) if record.handle.generation == handle.generation => {
                    record.exited.clone()
                }
                _ => {
                    return Err(BackendError::ExitedDuringStartup {
                        code: self.exit_code_of(handle.generation).await,
                    })
                }
            }
        };

        let probe = HealthProbe::new(
            self.settings.health_retries,
            self.settings.health_interval(),
        );
        let check = (self.health_check)(handle.port);

        info!(
            port = handle.port,
            retries = probe.retries(),
            interval_ms = probe.interval().as_millis() as u64,
            "waiting for backend to become healthy"
        );

        match probe.run(check.as_ref(), &exited).await {
            ProbeOutcome::Healthy { .. } => {
                self.transition(handle.generation, BackendState::Healthy)
                    .await
                    .ok_or(BackendError::ExitedDuringStartup { code: None })
            }
            ProbeOutcome::Exhausted { attempts } => {
                error!(attempts, port = handle.port, "backend never became healthy");
                let mut live = self.live.write().await;
                if let Some(record) = live.as_mut() {
                    if record.handle.generation == handle.generation {
                        record.handle.state = BackendState::FailedToStart;
                        // Stuck process; release it so a later start is possible
                        self.request_termination(record);
                    }
                }
                Err(BackendError::HealthCheckExhausted { attempts })
            }
            ProbeOutcome::Cancelled { attempts } => {
                let code = self.exit_code_of(handle.generation).await;
                warn!(attempts, code = ?code, "backend exited before becoming healthy");
                Err(BackendError::ExitedDuringStartup { code })
            }
        }
    }

    /// Start and wait; never fails, errors become an offline readiness
    pub async fn bring_online(&self) -> BackendReadiness {
        let result = match self.start().await {
            Ok(handle) => self.wait_healthy(&handle).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(handle) => {
                info!(port = handle.port, "backend online");
                BackendReadiness::Ready { port: handle.port }
            }
            Err(e) => {
                error!("backend unavailable, continuing in degraded mode: {}", e);
                BackendReadiness::Offline {
                    reason: e.user_message(),
                }
            }
        }
    }

    /// Request termination of the live backend, if any. Returns immediately.
    pub async fn stop(&self) {
        let mut live = self.live.write().await;
        match live.as_mut() {
            Some(record) => {
                info!(port = record.handle.port, "stopping backend");
                self.request_termination(record);
            }
            None => debug!("no backend process to stop"),
        }
    }

    /// Wait up to `timeout` for the live backend to exit; `true` if none is left
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let exited = match self.live.read().await.as_ref() {
            Some(record) => record.exited.clone(),
            None => return true,
        };

        tokio::time::timeout(timeout, exited.cancelled()).await.is_ok()
    }

    /// Current live handle
    pub async fn handle(&self) -> Option<BackendHandle> {
        self.live.read().await.as_ref().map(|r| r.handle.clone())
    }

    /// Most recently exited handle
    pub async fn last_exit(&self) -> Option<BackendHandle> {
        self.last_exit.read().await.clone()
    }

    /// Port of a healthy backend
    pub async fn healthy_port(&self) -> Option<u16> {
        self.live
            .read()
            .await
            .as_ref()
            .filter(|r| r.handle.state == BackendState::Healthy)
            .map(|r| r.handle.port)
    }

    /// Check if a backend process is live
    pub async fn is_running(&self) -> bool {
        self.live.read().await.is_some()
    }

    fn request_termination(&self, record: &mut LiveBackend) {
        record.stopping = true;

        let requested = match record.handle.pid {
            Some(pid) => match self.terminator.terminate(pid) {
                Ok(()) => true,
                Err(e) => {
                    error!("{}", e);
                    false
                }
            },
            None => false,
        };

        if !requested {
            record.force_kill.cancel();
            return;
        }

        let exited = record.exited.clone();
        let force_kill = record.force_kill.clone();
        let grace = self.settings.stop_grace();
        tokio::spawn(async move {
            tokio::select! {
                _ = exited.cancelled() => {}
                _ = tokio::time::sleep(grace) => force_kill.cancel(),
            }
        });
    }

    async fn transition(&self, generation: u64, state: BackendState) -> Option<BackendHandle> {
        let mut live = self.live.write().await;
        let record = live
            .as_mut()
            .filter(|r| r.handle.generation == generation)?;
        debug!(from = ?record.handle.state, to = ?state, "backend state change");
        record.handle.state = state;
        Some(record.handle.clone())
    }

    async fn exit_code_of(&self, generation: u64) -> Option<i32> {
        self.last_exit
            .read()
            .await
            .as_ref()
            .filter(|h| h.generation == generation)
            .and_then(|h| h.exit)
            .and_then(|e| e.code)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    struct Scripted {
        succeed_on: Option<u32>,
        calls: Arc<AtomicU32>,
    }

    impl HealthCheck for Scripted {
        fn check(&self) -> BoxFuture<'_, bool> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                self.succeed_on == Some(n)
            })
        }
    }

    #[derive(Default)]
    struct RecordingTerminator {
        pids: Mutex<Vec<u32>>,
    }

    impl Terminator for RecordingTerminator {
        fn terminate(&self, pid: u32) -> Result<(), BackendError> {
            self.pids.lock().unwrap().push(pid);
            crate::terminate::SignalTerminator.terminate(pid)
        }
    }

    fn fast_settings(retries: u32) -> BackendSettings {
        BackendSettings {
            health_retries: retries,
            health_interval_ms: 10,
            stop_grace_ms: 2000,
            ..Default::default()
        }
    }

    fn sleeper() -> LaunchSpec {
        LaunchSpec::new("sh").arg("-c").arg("sleep 30").arg("sh")
    }

    fn manager(retries: u32, succeed_on: Option<u32>, calls: Arc<AtomicU32>) -> BackendManager {
        BackendManager::new(fast_settings(retries), RunMode::Packaged)
            .with_launch_spec(sleeper())
            .with_health_check(move |_port| {
                Arc::new(Scripted {
                    succeed_on,
                    calls: calls.clone(),
                }) as Arc<dyn HealthCheck>
            })
    }

    #[tokio::test]
    async fn test_cold_start_healthy_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let manager = manager(30, Some(1), calls.clone()).with_port_source(|| Ok(54321));

        let handle = manager.start().await.unwrap();
        assert_eq!(handle.port, 54321);
        assert_eq!(handle.state, BackendState::Starting);
        assert!(handle.pid.is_some());

        let handle = manager.wait_healthy(&handle).await.unwrap();
        assert_eq!(handle.state, BackendState::Healthy);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.healthy_port().await, Some(54321));

        manager.stop().await;
        assert!(manager.wait_exit(Duration::from_secs(5)).await);
        assert_eq!(manager.handle().await, None);
        assert_eq!(manager.last_exit().await.unwrap().state, BackendState::Exited);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_live() {
        let calls = Arc::new(AtomicU32::new(0));
        let manager = manager(30, Some(1), calls);

        let first = manager.start().await.unwrap();
        match manager.start().await {
            Err(BackendError::AlreadyRunning { port }) => assert_eq!(port, first.port),
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }

        manager.wait_healthy(&first).await.unwrap();
        assert!(matches!(
            manager.start().await,
            Err(BackendError::AlreadyRunning { .. })
        ));

        manager.stop().await;
        assert!(manager.wait_exit(Duration::from_secs(5)).await);

        // Previous process fully exited; a new one may start
        let second = manager.start().await.unwrap();
        assert_eq!(second.generation, first.generation + 1);
        manager.stop().await;
        assert!(manager.wait_exit(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_exhaustion_fails_and_releases_process() {
        let calls = Arc::new(AtomicU32::new(0));
        let terminator = Arc::new(RecordingTerminator::default());
        let manager = manager(3, None, calls.clone()).with_terminator(terminator.clone());

        let handle = manager.start().await.unwrap();
        match manager.wait_healthy(&handle).await {
            Err(BackendError::HealthCheckExhausted { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected HealthCheckExhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(terminator.pids.lock().unwrap().as_slice(), &[handle.pid.unwrap()]);

        assert!(manager.wait_exit(Duration::from_secs(5)).await);
        let exited = manager.last_exit().await.unwrap();
        assert_eq!(exited.state, BackendState::FailedToStart);
        assert!(exited.exit.is_some());
    }

    #[tokio::test]
    async fn test_early_exit_cancels_probe() {
        let calls = Arc::new(AtomicU32::new(0));
        let manager = BackendManager::new(
            BackendSettings {
                health_retries: 1000,
                health_interval_ms: 20,
                ..Default::default()
            },
            RunMode::Packaged,
        )
        .with_launch_spec(LaunchSpec::new("sh").arg("-c").arg("sleep 0.2; exit 3").arg("sh"))
        .with_health_check({
            let calls = calls.clone();
            move |_port| {
                Arc::new(Scripted {
                    succeed_on: None,
                    calls: calls.clone(),
                }) as Arc<dyn HealthCheck>
            }
        });

        let handle = manager.start().await.unwrap();
        match manager.wait_healthy(&handle).await {
            Err(BackendError::ExitedDuringStartup { code }) => assert_eq!(code, Some(3)),
            other => panic!("expected ExitedDuringStartup, got {:?}", other),
        }
        assert!(calls.load(Ordering::SeqCst) < 1000);
        assert_eq!(manager.handle().await, None);
    }

    #[tokio::test]
    async fn test_bring_online_degrades_instead_of_failing() {
        let manager = BackendManager::new(
            BackendSettings {
                executable: Some("/definitely/not/here/backend".into()),
                ..Default::default()
            },
            RunMode::Packaged,
        );

        match manager.bring_online().await {
            BackendReadiness::Offline { reason } => assert!(reason.contains("not found")),
            other => panic!("expected Offline, got {:?}", other),
        }
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn test_port_allocation_failure_propagates() {
        let manager = manager(1, Some(1), Arc::new(AtomicU32::new(0))).with_port_source(|| {
            Err(BackendError::PortAllocation(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "no ports",
            )))
        });

        assert!(matches!(
            manager.start().await,
            Err(BackendError::PortAllocation(_))
        ));
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let manager = manager(1, Some(1), Arc::new(AtomicU32::new(0)));
        manager.stop().await;

        manager.start().await.unwrap();
        manager.stop().await;
        manager.stop().await;
        assert!(manager.wait_exit(Duration::from_secs(5)).await);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stubborn_process_is_force_killed() {
        let manager = BackendManager::new(
            BackendSettings {
                stop_grace_ms: 100,
                ..Default::default()
            },
            RunMode::Packaged,
        )
        .with_launch_spec(
            LaunchSpec::new("sh")
                .arg("-c")
                .arg("trap '' TERM; while true; do sleep 0.05; done")
                .arg("sh"),
        );

        manager.start().await.unwrap();
        // Give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.stop().await;

        assert!(manager.wait_exit(Duration::from_secs(5)).await);
        let exit = manager.last_exit().await.unwrap().exit.unwrap();
        assert_eq!(exit.signal, Some(9));
    }
}
