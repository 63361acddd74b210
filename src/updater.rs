use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::UpdateError;
use crate::settings::{RunMode, UpdateSettings};
use crate::status_channel::{StatusChannel, StatusEvent};

/// Update status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStatus {
    Idle,
    Checking,
    UpdateAvailable,
    /// Transient; folded back into `Idle` as soon as it is reported
    NoUpdateAvailable,
    Downloading,
    Downloaded,
    Failed,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Idle => "idle",
            UpdateStatus::Checking => "checking",
            UpdateStatus::UpdateAvailable => "update-available",
            UpdateStatus::NoUpdateAvailable => "no-update-available",
            UpdateStatus::Downloading => "downloading",
            UpdateStatus::Downloaded => "downloaded",
            UpdateStatus::Failed => "failed",
        }
    }

    /// States a new check may start from
    fn accepts_check(&self) -> bool {
        matches!(self, UpdateStatus::Idle | UpdateStatus::Failed)
    }
}

/// Span the transfer rate is averaged over
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Current transfer rate, from the chunks received within the last `RATE_WINDOW`
#[derive(Debug)]
struct RateMeter {
    started: Instant,
    samples: VecDeque<(Instant, u64)>,
}

impl RateMeter {
    fn new(started: Instant) -> Self {
        Self {
            started,
            samples: VecDeque::new(),
        }
    }

    fn record(&mut self, now: Instant, bytes: u64) -> u64 {
        self.samples.push_back((now, bytes));
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        let span = now.duration_since(self.started).min(RATE_WINDOW).as_secs_f64();
        if span <= 0.0 {
            return 0;
        }
        let bytes: u64 = self.samples.iter().map(|(_, b)| b).sum();
        (bytes as f64 / span) as u64
    }
}

/// Download progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub percent: f64,
    pub transferred: u64,
    pub total: Option<u64>,
    pub bytes_per_second: u64,
}

impl DownloadProgress {
    pub fn new(transferred: u64, total: Option<u64>, bytes_per_second: u64) -> Self {
        let percent = match total {
            Some(0) => 100.0,
            Some(total) => (transferred as f64 / total as f64 * 100.0).min(100.0),
            None => 0.0,
        };

        Self {
            percent,
            transferred,
            total,
            bytes_per_second,
        }
    }

    fn started() -> Self {
        Self {
            percent: 0.0,
            transferred: 0,
            total: None,
            bytes_per_second: 0,
        }
    }
}

/// Release advertised by the feed for this platform
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseInfo {
    pub version: String,
    pub notes: Option<String>,
    pub pub_date: Option<DateTime<Utc>>,
    pub url: String,
    pub sha256: Option<String>,
    pub size: Option<u64>,
}

/// Verified artifact waiting in the staging directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedUpdate {
    pub version: String,
    pub path: PathBuf,
}

/// Read-only snapshot of the current update attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSession {
    pub status: UpdateStatus,
    pub current_version: String,
    pub candidate_version: Option<String>,
    pub update_info: Option<ReleaseInfo>,
    pub progress: Option<DownloadProgress>,
    pub last_error: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
}

impl UpdateSession {
    fn idle(current_version: &str) -> Self {
        Self {
            status: UpdateStatus::Idle,
            current_version: current_version.to_string(),
            candidate_version: None,
            update_info: None,
            progress: None,
            last_error: None,
            last_check: None,
        }
    }
}

/// Result of a check request
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Available(ReleaseInfo),
    UpToDate,
    /// Unpackaged build; nothing was contacted
    DevMode,
}

/// Remote source of releases
pub trait UpdateFeed: Send + Sync {
    /// Latest release published for this platform
    fn latest(&self) -> BoxFuture<'_, Result<ReleaseInfo, UpdateError>>;

    /// Fetch and verify `release`, reporting progress as chunks arrive
    fn download<'a>(
        &'a self,
        release: &'a ReleaseInfo,
        progress: mpsc::UnboundedSender<DownloadProgress>,
    ) -> BoxFuture<'a, Result<StagedUpdate, UpdateError>>;
}

/// Hands a staged artifact to the platform
pub trait Installer: Send + Sync {
    fn install(&self, staged: &StagedUpdate, relaunch: bool) -> Result<(), UpdateError>;
}

/// Lets an explicit install end the running application
pub trait AppControl: Send + Sync {
    fn exit(&self);
}

#[derive(Debug, Deserialize)]
struct ReleaseManifest {
    version: String,
    notes: Option<String>,
    pub_date: Option<DateTime<Utc>>,
    #[serde(default)]
    platforms: HashMap<String, PlatformArtifact>,
}

#[derive(Debug, Deserialize)]
struct PlatformArtifact {
    url: String,
    sha256: Option<String>,
    size: Option<u64>,
}

/// `<os>-<arch>` key used in the release manifest, e.g. `linux-x86_64`
pub fn current_target() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

fn normalize_version(version: &str) -> &str {
    version.trim().trim_start_matches('v')
}

/// Whether `candidate` is a strictly newer semantic version than `current`
pub fn is_newer(candidate: &str, current: &str) -> Result<bool, UpdateError> {
    let candidate = semver::Version::parse(normalize_version(candidate))
        .map_err(|e| UpdateError::FeedParse(format!("version {candidate:?}: {e}")))?;
    let current = semver::Version::parse(normalize_version(current))
        .map_err(|e| UpdateError::FeedParse(format!("running version {current:?}: {e}")))?;

    Ok(candidate > current)
}

/// Release feed following the "latest release download" convention:
/// `<feed_url>/latest.json` plus per-platform artifacts
pub struct HttpUpdateFeed {
    client: reqwest::Client,
    base_url: String,
    target: String,
    staging_dir: PathBuf,
}

impl HttpUpdateFeed {
    pub fn new(base_url: impl Into<String>, staging_dir: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("desktop-shell/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into(),
            target: current_target(),
            staging_dir: staging_dir.into(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn manifest_url(&self) -> String {
        format!("{}/latest.json", self.base_url.trim_end_matches('/'))
    }

    async fn fetch_latest(&self) -> Result<ReleaseInfo, UpdateError> {
        let manifest_url = self.manifest_url();
        debug!("fetching release manifest from {}", manifest_url);

        let response = self
            .client
            .get(&manifest_url)
            .send()
            .await
            .map_err(|e| UpdateError::Check(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UpdateError::Check(format!(
                "HTTP {} from {}",
                response.status(),
                manifest_url
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| UpdateError::Check(e.to_string()))?;

        let manifest: ReleaseManifest =
            serde_json::from_str(&body).map_err(|e| UpdateError::FeedParse(e.to_string()))?;

        let artifact = manifest.platforms.get(&self.target).ok_or_else(|| {
            UpdateError::FeedParse(format!("no artifact published for {}", self.target))
        })?;

        // Artifact URLs may be relative to the manifest
        let url = reqwest::Url::parse(&manifest_url)
            .and_then(|base| base.join(&artifact.url))
            .map_err(|e| UpdateError::FeedParse(format!("artifact url {:?}: {e}", artifact.url)))?;

        Ok(ReleaseInfo {
            version: normalize_version(&manifest.version).to_string(),
            notes: manifest.notes,
            pub_date: manifest.pub_date,
            url: url.to_string(),
            sha256: artifact.sha256.clone(),
            size: artifact.size,
        })
    }

    fn staged_path(&self, release: &ReleaseInfo) -> PathBuf {
        let file_name = reqwest::Url::parse(&release.url)
            .ok()
            .and_then(|url| {
                url.path_segments()
                    .and_then(|segments| segments.last().map(|s| s.to_string()))
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("update-{}", release.version));

        self.staging_dir.join(file_name)
    }

    async fn fetch_artifact(
        &self,
        release: &ReleaseInfo,
        progress: mpsc::UnboundedSender<DownloadProgress>,
    ) -> Result<StagedUpdate, UpdateError> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let path = self.staged_path(release);
        let partial = path.with_file_name(format!(
            "{}.part",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));

        info!("downloading update {} from {}", release.version, release.url);

        let response = self
            .client
            .get(&release.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| UpdateError::Download(e.to_string()))?;

        let total = response.content_length().or(release.size);
        let mut file = tokio::fs::File::create(&partial).await?;
        let streamed = stream_to_file(&mut file, response, total, &progress).await;
        drop(file);

        let (transferred, digest, rate) = match streamed {
            Ok(done) => done,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        if let Some(expected) = total {
            if transferred != expected {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(UpdateError::Download(format!(
                    "transfer ended after {transferred} of {expected} bytes"
                )));
            }
        }

        if let Some(expected) = &release.sha256 {
            if !digest.eq_ignore_ascii_case(expected.trim()) {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(UpdateError::Integrity {
                    expected: expected.clone(),
                    actual: digest,
                });
            }
        } else {
            warn!("release {} has no sha256, skipping verification", release.version);
        }

        // Unknown length never reached 100 while streaming
        if total.is_none() {
            let _ = progress.send(DownloadProgress::new(transferred, Some(transferred), rate));
        }

        tokio::fs::rename(&partial, &path).await?;
        info!("update {} staged at {}", release.version, path.display());

        Ok(StagedUpdate {
            version: release.version.clone(),
            path,
        })
    }
}

/// Write the response body to `file`, reporting progress per chunk.
/// Returns the byte count, the hex SHA-256 and the last measured rate.
async fn stream_to_file(
    file: &mut tokio::fs::File,
    response: reqwest::Response,
    total: Option<u64>,
    progress: &mpsc::UnboundedSender<DownloadProgress>,
) -> Result<(u64, String, u64), UpdateError> {
    let mut meter = RateMeter::new(Instant::now());
    let mut transferred: u64 = 0;
    let mut rate = 0;
    let mut hasher = Sha256::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| UpdateError::Download(e.to_string()))?;

        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        transferred += chunk.len() as u64;
        rate = meter.record(Instant::now(), chunk.len() as u64);

        let _ = progress.send(DownloadProgress::new(transferred, total, rate));
    }

    file.flush().await?;
    Ok((transferred, format!("{:x}", hasher.finalize()), rate))
}

impl UpdateFeed for HttpUpdateFeed {
    fn latest(&self) -> BoxFuture<'_, Result<ReleaseInfo, UpdateError>> {
        Box::pin(self.fetch_latest())
    }

    fn download<'a>(
        &'a self,
        release: &'a ReleaseInfo,
        progress: mpsc::UnboundedSender<DownloadProgress>,
    ) -> BoxFuture<'a, Result<StagedUpdate, UpdateError>> {
        Box::pin(self.fetch_artifact(release, progress))
    }
}

/// Launches the staged installer package detached from this process
pub struct ArtifactInstaller;

impl Installer for ArtifactInstaller {
    fn install(&self, staged: &StagedUpdate, relaunch: bool) -> Result<(), UpdateError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&staged.path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&staged.path, perms)?;
        }

        let mut cmd = std::process::Command::new(&staged.path);
        if relaunch {
            cmd.arg("--relaunch");
        }

        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| UpdateError::Install(format!("{}: {e}", staged.path.display())))?;

        info!(
            relaunch,
            "launched installer for {} ({})",
            staged.version,
            staged.path.display()
        );
        Ok(())
    }
}

/// Update manager
pub struct UpdateManager {
    current_version: String,
    run_mode: RunMode,
    settings: UpdateSettings,
    feed: Arc<dyn UpdateFeed>,
    installer: Arc<dyn Installer>,
    channel: StatusChannel,
    app_control: RwLock<Option<Arc<dyn AppControl>>>,
    session: RwLock<UpdateSession>,
    staged: RwLock<Option<StagedUpdate>>,
    installed: AtomicBool,
}

impl UpdateManager {
    /// Create a new update manager
    pub fn new(
        current_version: impl Into<String>,
        run_mode: RunMode,
        settings: UpdateSettings,
        feed: Arc<dyn UpdateFeed>,
        channel: StatusChannel,
    ) -> Self {
        let current_version = current_version.into();
        let session = UpdateSession::idle(&current_version);

        Self {
            current_version,
            run_mode,
            settings,
            feed,
            installer: Arc::new(ArtifactInstaller),
            channel,
            app_control: RwLock::new(None),
            session: RwLock::new(session),
            staged: RwLock::new(None),
            installed: AtomicBool::new(false),
        }
    }

    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = installer;
        self
    }

    /// Set the hook used to leave the app after an explicit install
    pub async fn set_app_control(&self, control: Arc<dyn AppControl>) {
        *self.app_control.write().await = Some(control);
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    /// Get current update state
    pub async fn state(&self) -> UpdateSession {
        self.session.read().await.clone()
    }

    pub async fn staged(&self) -> Option<StagedUpdate> {
        self.staged.read().await.clone()
    }

    /// Ask the feed whether a newer release exists.
    ///
    /// Only one check runs at a time; a request while a session is active is
    /// rejected with `UpdateError::Busy` and leaves the session untouched.
    pub async fn check_for_updates(&self) -> Result<CheckOutcome, UpdateError> {
        if self.run_mode.is_dev() {
            debug!("update check skipped in development mode");
            return Ok(CheckOutcome::DevMode);
        }

        {
            let mut session = self.session.write().await;
            if !session.status.accepts_check() {
                return Err(UpdateError::Busy(session.status));
            }

            *session = UpdateSession::idle(&self.current_version);
            session.status = UpdateStatus::Checking;
            session.last_check = Some(Utc::now());
        }

        self.channel.publish(StatusEvent::checking());

        let release = match self.feed.latest().await {
            Ok(release) => release,
            Err(e) => return Err(self.fail(e).await),
        };

        match is_newer(&release.version, &self.current_version) {
            Ok(true) => {
                info!(
                    "update available: {} -> {}",
                    self.current_version, release.version
                );
                {
                    let mut session = self.session.write().await;
                    session.status = UpdateStatus::UpdateAvailable;
                    session.candidate_version = Some(release.version.clone());
                    session.update_info = Some(release.clone());
                }
                self.channel.publish(StatusEvent::available(&release.version));
                Ok(CheckOutcome::Available(release))
            }
            Ok(false) => {
                debug!(
                    "no update: feed has {}, running {}",
                    release.version, self.current_version
                );
                // Nothing to approve, report and fold straight back to idle
                self.session.write().await.status = UpdateStatus::Idle;
                self.channel.publish(StatusEvent::not_available());
                Ok(CheckOutcome::UpToDate)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Move an available update into `Downloading`; returns the release to fetch
    pub async fn begin_download(&self) -> Result<ReleaseInfo, UpdateError> {
        let release = {
            let mut session = self.session.write().await;
            let release = match (&session.status, &session.update_info) {
                (UpdateStatus::UpdateAvailable, Some(release)) => release.clone(),
                (status, _) => {
                    return Err(UpdateError::InvalidState {
                        action: "download",
                        status: *status,
                    })
                }
            };

            session.status = UpdateStatus::Downloading;
            session.progress = Some(DownloadProgress::started());
            release
        };

        self.channel
            .publish(StatusEvent::downloading(&DownloadProgress::started()));
        Ok(release)
    }

    /// Transfer a release previously accepted by `begin_download`
    pub async fn run_download(&self, release: ReleaseInfo) -> Result<StagedUpdate, UpdateError> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let transfer = self.feed.download(&release, tx);
        let forward = async {
            while let Some(progress) = rx.recv().await {
                self.record_progress(progress).await;
            }
        };
        let (result, ()) = tokio::join!(transfer, forward);

        match result {
            Ok(staged) => {
                *self.staged.write().await = Some(staged.clone());
                {
                    let mut session = self.session.write().await;
                    session.status = UpdateStatus::Downloaded;
                    session.candidate_version = Some(staged.version.clone());
                }
                self.channel.publish(StatusEvent::downloaded(&staged.version));
                Ok(staged)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Download the available update, reporting progress on the status channel
    pub async fn download_update(&self) -> Result<StagedUpdate, UpdateError> {
        let release = self.begin_download().await?;
        self.run_download(release).await
    }

    async fn record_progress(&self, progress: DownloadProgress) {
        self.session.write().await.progress = Some(progress.clone());
        self.channel.publish(StatusEvent::downloading(&progress));
    }

    /// Launch the staged installer and leave the app so it can relaunch
    pub async fn install_update(&self) -> Result<(), UpdateError> {
        let status = self.session.read().await.status;
        let staged = match (status, self.staged.read().await.clone()) {
            (UpdateStatus::Downloaded, Some(staged)) => staged,
            (status, _) => {
                return Err(UpdateError::InvalidState {
                    action: "install",
                    status,
                })
            }
        };

        if self.installed.swap(true, Ordering::SeqCst) {
            debug!("installer already launched");
            return Ok(());
        }

        if let Err(e) = self.installer.install(&staged, true) {
            self.installed.store(false, Ordering::SeqCst);
            return Err(self.fail(e).await);
        }

        match self.app_control.read().await.as_ref() {
            Some(control) => control.exit(),
            None => warn!("no app control registered, installer runs alongside the app"),
        }
        Ok(())
    }

    /// Run the installer for a staged update without relaunching, at most once.
    ///
    /// Returns whether an installer was launched.
    pub fn install_on_quit_blocking(&self, staged: Option<StagedUpdate>) -> bool {
        if !self.settings.auto_install_on_quit {
            return false;
        }
        let Some(staged) = staged else {
            return false;
        };
        if self.installed.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!("installing update {} on quit", staged.version);
        match self.installer.install(&staged, false) {
            Ok(()) => true,
            Err(e) => {
                error!("install on quit failed: {}", e);
                false
            }
        }
    }

    pub async fn install_on_quit(&self) -> bool {
        let staged = self.staged().await;
        self.install_on_quit_blocking(staged)
    }

    /// Clear a terminal `Failed`/`Downloaded` session back to `Idle`.
    ///
    /// Other states are left as they are. A staged artifact is kept so it is
    /// still installed on quit.
    pub async fn dismiss(&self) -> UpdateStatus {
        let mut session = self.session.write().await;
        if matches!(
            session.status,
            UpdateStatus::Failed | UpdateStatus::Downloaded
        ) {
            *session = UpdateSession::idle(&self.current_version);
        }
        session.status
    }

    async fn fail(&self, err: UpdateError) -> UpdateError {
        let message = err.to_string();
        error!("{}", message);

        {
            let mut session = self.session.write().await;
            session.status = UpdateStatus::Failed;
            session.last_error = Some(message.clone());
        }
        self.channel.publish(StatusEvent::error(message));
        err
    }

    async fn scheduled_check(&self) {
        match self.check_for_updates().await {
            Ok(_) => {}
            Err(UpdateError::Busy(status)) => {
                debug!("skipping scheduled update check while {}", status.as_str());
            }
            Err(e) => warn!("scheduled update check failed: {}", e),
        }
    }

    /// Start automatic update checking: once after the initial delay, then on
    /// every interval. Disabled in development mode.
    pub fn start_auto_check(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.run_mode.is_dev() {
            info!("automatic update checks disabled in development mode");
            return None;
        }

        let initial_delay = self.settings.initial_delay();
        let interval = self.settings.check_interval();

        Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            self.scheduled_check().await;

            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.scheduled_check().await,
                }
            }
            debug!("automatic update checks stopped");
        }))
    }
}
