use serde::Serialize;
use tracing::{debug, error};

use crate::backend_manager::BackendReadiness;
use crate::errors::UpdateError;
use crate::state::AppState;
use crate::updater::{CheckOutcome, ReleaseInfo, UpdateSession};

/// Reply to an update command. Failures are replies too, with status `error`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_info: Option<ReleaseInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandReply {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            update_info: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::status("error").with_message(message)
    }

    fn from_update_error(err: UpdateError) -> Self {
        match err {
            UpdateError::Busy(_) => Self::status("busy").with_message(err.to_string()),
            err => Self::error(err.to_string()),
        }
    }
}

pub async fn check_for_updates(state: &AppState) -> CommandReply {
    match state.updates.check_for_updates().await {
        Ok(CheckOutcome::Available(release)) => CommandReply {
            update_info: Some(release),
            ..CommandReply::status("available")
        },
        Ok(CheckOutcome::UpToDate) => CommandReply::status("not-available"),
        Ok(CheckOutcome::DevMode) => {
            CommandReply::status("dev-mode").with_message("Updates disabled in development")
        }
        Err(e) => CommandReply::from_update_error(e),
    }
}

/// Accept the available update and transfer it in the background.
///
/// Replies as soon as the transfer has started; progress and completion
/// arrive on the status channel.
pub async fn download_update(state: &AppState) -> CommandReply {
    let release = match state.updates.begin_download().await {
        Ok(release) => release,
        Err(e) => return CommandReply::from_update_error(e),
    };

    let updates = state.updates.clone();
    tokio::spawn(async move {
        if let Err(e) = updates.run_download(release).await {
            // Already reported as a status event
            debug!("background download ended with: {}", e);
        }
    });

    CommandReply::status("downloading")
}

pub async fn install_update(state: &AppState) -> CommandReply {
    match state.updates.install_update().await {
        Ok(()) => CommandReply::status("installing"),
        Err(e) => {
            error!("install request failed: {}", e);
            CommandReply::from_update_error(e)
        }
    }
}

pub async fn dismiss_update(state: &AppState) -> CommandReply {
    CommandReply::status(state.updates.dismiss().await.as_str())
}

pub async fn get_update_state(state: &AppState) -> UpdateSession {
    state.updates.state().await
}

pub fn get_app_version(state: &AppState) -> String {
    state.updates.current_version().to_string()
}

/// Port of the healthy backend, `None` while degraded, starting or after it exited
pub async fn get_backend_port(state: &AppState) -> Option<u16> {
    state.backend.healthy_port().await
}

/// Startup outcome, downgraded to offline once a ready backend has gone away
pub async fn get_backend_status(state: &AppState) -> BackendReadiness {
    let recorded = state.readiness.read().await.clone();
    match recorded {
        BackendReadiness::Ready { .. } if state.backend.healthy_port().await.is_none() => {
            BackendReadiness::Offline {
                reason: "The backend service stopped unexpectedly. Restart the application to recover.".to_string(),
            }
        }
        other => other,
    }
}

/// Webview-facing wrappers. Async commands borrowing managed state must
/// return `Result`, but these never produce the `Err` side.
#[cfg(feature = "desktop")]
pub mod tauri_commands {
    use tauri::State;

    use super::CommandReply;
    use crate::backend_manager::BackendReadiness;
    use crate::state::AppState;
    use crate::updater::UpdateSession;

    #[tauri::command]
    pub async fn check_for_updates(state: State<'_, AppState>) -> Result<CommandReply, String> {
        Ok(super::check_for_updates(&state).await)
    }

    #[tauri::command]
    pub async fn download_update(state: State<'_, AppState>) -> Result<CommandReply, String> {
        Ok(super::download_update(&state).await)
    }

    #[tauri::command]
    pub async fn install_update(state: State<'_, AppState>) -> Result<CommandReply, String> {
        Ok(super::install_update(&state).await)
    }

    #[tauri::command]
    pub async fn dismiss_update(state: State<'_, AppState>) -> Result<CommandReply, String> {
        Ok(super::dismiss_update(&state).await)
    }

    #[tauri::command]
    pub async fn get_update_state(state: State<'_, AppState>) -> Result<UpdateSession, String> {
        Ok(super::get_update_state(&state).await)
    }

    #[tauri::command]
    pub fn get_app_version(state: State<'_, AppState>) -> String {
        super::get_app_version(&state)
    }

    #[tauri::command]
    pub async fn get_backend_port(state: State<'_, AppState>) -> Result<Option<u16>, String> {
        Ok(super::get_backend_port(&state).await)
    }

    #[tauri::command]
    pub async fn get_backend_status(
        state: State<'_, AppState>,
    ) -> Result<BackendReadiness, String> {
        Ok(super::get_backend_status(&state).await)
    }
}
