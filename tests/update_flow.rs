use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shell_lib::backend_manager::BackendManager;
use shell_lib::commands;
use shell_lib::errors::UpdateError;
use shell_lib::settings::{RunMode, Settings};
use shell_lib::status_channel::{StatusChannel, UpdateEventKind};
use shell_lib::state::AppState;
use shell_lib::updater::{current_target, HttpUpdateFeed, Installer, StagedUpdate, UpdateManager, UpdateStatus};

#[derive(Default)]
struct RecordingInstaller {
    calls: Mutex<Vec<(StagedUpdate, bool)>>,
}

impl Installer for RecordingInstaller {
    fn install(&self, staged: &StagedUpdate, relaunch: bool) -> Result<(), UpdateError> {
        self.calls.lock().unwrap().push((staged.clone(), relaunch));
        Ok(())
    }
}

fn app_state(
    mode: RunMode,
    feed_url: &str,
    staging: &std::path::Path,
    installer: Arc<RecordingInstaller>,
) -> AppState {
    let settings = Settings::default();
    let channel = StatusChannel::new();
    let feed = Arc::new(HttpUpdateFeed::new(feed_url, staging));
    let updates = UpdateManager::new("1.0.0", mode, settings.updates.clone(), feed, channel.clone())
        .with_installer(installer);
    let backend = BackendManager::new(settings.backend.clone(), mode);
    AppState::from_parts(settings, mode, backend, updates, channel)
}

fn manifest(version: &str, artifact: &str, sha256: &str) -> String {
    serde_json::json!({
        "version": version,
        "notes": "Faster startup",
        "platforms": {
            current_target(): { "url": artifact, "sha256": sha256 }
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_update_happy_path() {
    let artifact: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let digest = format!("{:x}", Sha256::digest(&artifact));

    let mut server = mockito::Server::new_async().await;
    let feed_mock = server
        .mock("GET", "/latest.json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(manifest("2.0.0", "desktop-shell-2.0.0.bin", &digest))
        .expect(1)
        .create_async()
        .await;
    let _artifact_mock = server
        .mock("GET", "/desktop-shell-2.0.0.bin")
        .with_status(200)
        .with_body(artifact.clone())
        .create_async()
        .await;

    let staging = tempfile::tempdir().unwrap();
    let installer = Arc::new(RecordingInstaller::default());
    let state = app_state(RunMode::Packaged, &server.url(), staging.path(), installer.clone());
    let mut events = state.status.subscribe();

    let reply = commands::check_for_updates(&state).await;
    assert_eq!(reply.status, "available");
    assert_eq!(reply.update_info.unwrap().version, "2.0.0");
    feed_mock.assert_async().await;

    assert_eq!(events.recv().await.unwrap().status, UpdateEventKind::Checking);
    let available = events.recv().await.unwrap();
    assert_eq!(available.status, UpdateEventKind::Available);
    assert_eq!(available.version.as_deref(), Some("2.0.0"));

    assert_eq!(commands::download_update(&state).await.status, "downloading");

    let mut percents = Vec::new();
    let downloaded = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            match event.status {
                UpdateEventKind::Downloading => percents.push(event.percent.unwrap()),
                UpdateEventKind::Downloaded => return event,
                other => panic!("unexpected event {:?}", other),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(downloaded.version.as_deref(), Some("2.0.0"));
    assert_eq!(percents.first(), Some(&0.0));
    assert_eq!(percents.last(), Some(&100.0));
    assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));

    let session = commands::get_update_state(&state).await;
    assert_eq!(session.status, UpdateStatus::Downloaded);
    let staged_path = staging.path().join("desktop-shell-2.0.0.bin");
    assert_eq!(std::fs::read(&staged_path).unwrap(), artifact);

    assert_eq!(commands::install_update(&state).await.status, "installing");
    {
        let calls = installer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.path, staged_path);
        assert!(calls[0].1);
    }

    // Quitting afterwards must not launch the installer again
    assert!(state.lifecycle.shutdown(&state).await);
    assert_eq!(installer.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_dev_mode_makes_no_network_calls() {
    let mut server = mockito::Server::new_async().await;
    let feed_mock = server
        .mock("GET", "/latest.json")
        .with_status(200)
        .with_body(manifest("2.0.0", "x.bin", "00"))
        .expect(0)
        .create_async()
        .await;

    let staging = tempfile::tempdir().unwrap();
    let state = app_state(
        RunMode::Development,
        &server.url(),
        staging.path(),
        Arc::new(RecordingInstaller::default()),
    );

    assert_eq!(commands::check_for_updates(&state).await.status, "dev-mode");
    assert!(state.lifecycle.start_update_checks(&state).is_none());
    feed_mock.assert_async().await;
}

#[tokio::test]
async fn test_corrupted_download_fails_and_dismisses() {
    let mut server = mockito::Server::new_async().await;
    let _feed_mock = server
        .mock("GET", "/latest.json")
        .with_status(200)
        .with_body(manifest("2.0.0", "app.bin", &"ab".repeat(32)))
        .create_async()
        .await;
    let _artifact_mock = server
        .mock("GET", "/app.bin")
        .with_status(200)
        .with_body("not the published bytes")
        .create_async()
        .await;

    let staging = tempfile::tempdir().unwrap();
    let installer = Arc::new(RecordingInstaller::default());
    let state = app_state(RunMode::Packaged, &server.url(), staging.path(), installer.clone());
    let mut events = state.status.subscribe();

    assert_eq!(commands::check_for_updates(&state).await.status, "available");
    assert_eq!(commands::download_update(&state).await.status, "downloading");

    let error = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.status == UpdateEventKind::Error {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert!(error.message.unwrap().contains("verification"));

    let session = commands::get_update_state(&state).await;
    assert_eq!(session.status, UpdateStatus::Failed);

    // Dismissing a failure is idempotent
    assert_eq!(commands::dismiss_update(&state).await.status, "idle");
    assert_eq!(commands::dismiss_update(&state).await.status, "idle");

    // Nothing was staged, so quitting installs nothing
    assert!(state.lifecycle.shutdown(&state).await);
    assert!(installer.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_check_while_update_pending_is_busy() {
    let mut server = mockito::Server::new_async().await;
    let feed_mock = server
        .mock("GET", "/latest.json")
        .with_status(200)
        .with_body(manifest("2.0.0", "app.bin", "00"))
        .expect(1)
        .create_async()
        .await;

    let staging = tempfile::tempdir().unwrap();
    let state = app_state(
        RunMode::Packaged,
        &server.url(),
        staging.path(),
        Arc::new(RecordingInstaller::default()),
    );

    assert_eq!(commands::check_for_updates(&state).await.status, "available");

    let reply = commands::check_for_updates(&state).await;
    assert_eq!(reply.status, "busy");
    assert!(reply.message.unwrap().contains("update-available"));
    assert_eq!(
        commands::get_update_state(&state).await.status,
        UpdateStatus::UpdateAvailable
    );
    feed_mock.assert_async().await;
}
