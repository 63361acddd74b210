use std::fmt;

use crate::updater::UpdateStatus;

/// Backend supervision errors
#[derive(Debug)]
pub enum BackendError {
    /// No ephemeral port could be bound on the loopback interface
    PortAllocation(std::io::Error),
    /// Backend executable not found
    ExecutableNotFound(String),
    /// Failed to spawn the backend process
    Launch(std::io::Error),
    /// A backend process is still live
    AlreadyRunning { port: u16 },
    /// Backend never answered the liveness endpoint within the probe budget
    HealthCheckExhausted { attempts: u32 },
    /// Backend exited before it became healthy
    ExitedDuringStartup { code: Option<i32> },
    /// Failed to terminate the backend process
    Termination(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortAllocation(err) => {
                write!(f, "Failed to allocate a local port: {err}")
            }
            Self::ExecutableNotFound(path) => {
                write!(f, "backend executable not found at: {path}")
            }
            Self::Launch(err) => {
                write!(f, "Failed to spawn backend process: {err}")
            }
            Self::AlreadyRunning { port } => {
                write!(f, "Backend is already running on port {port}")
            }
            Self::HealthCheckExhausted { attempts } => {
                write!(f, "Backend did not become healthy after {attempts} attempts")
            }
            Self::ExitedDuringStartup { code: Some(code) } => {
                write!(f, "Backend exited during startup with code: {code}")
            }
            Self::ExitedDuringStartup { code: None } => {
                write!(f, "Backend was terminated by a signal during startup")
            }
            Self::Termination(msg) => {
                write!(f, "Failed to terminate backend: {msg}")
            }
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PortAllocation(err) | Self::Launch(err) => Some(err),
            _ => None,
        }
    }
}

impl BackendError {
    /// Text shown by the UI while it runs without the backend
    pub fn user_message(&self) -> String {
        match self {
            Self::PortAllocation(_) => {
                "No free local port was available for the backend service.".to_string()
            }
            Self::ExecutableNotFound(_) => {
                "The backend service executable was not found. Please reinstall the application.".to_string()
            }
            Self::Launch(_) => {
                "Failed to start the backend service. Please check your system permissions.".to_string()
            }
            Self::AlreadyRunning { port } => {
                format!("The backend service is already running on port {port}.")
            }
            Self::HealthCheckExhausted { .. } => {
                "The backend service took too long to start. Restart the application to try again.".to_string()
            }
            Self::ExitedDuringStartup { code } => match code {
                Some(127) => "Backend executable or its dependencies are missing. Please reinstall the application.".to_string(),
                Some(code) => format!("The backend service stopped unexpectedly (code {code}). Check the logs for details."),
                None => "The backend service was stopped during startup.".to_string(),
            },
            Self::Termination(_) => "The backend service could not be stopped.".to_string(),
        }
    }
}

/// Self-update errors
#[derive(Debug)]
pub enum UpdateError {
    /// Release feed could not be reached
    Check(String),
    /// Release manifest was malformed
    FeedParse(String),
    /// Artifact transfer failed
    Download(String),
    /// Downloaded artifact does not match the published digest
    Integrity { expected: String, actual: String },
    /// A check is already in flight
    Busy(UpdateStatus),
    /// Command not valid from the current status
    InvalidState {
        action: &'static str,
        status: UpdateStatus,
    },
    /// Staged artifact could not be launched
    Install(String),
    /// Local filesystem failure while staging
    Io(std::io::Error),
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Check(msg) => write!(f, "Failed to check for updates: {msg}"),
            Self::FeedParse(msg) => write!(f, "Invalid release manifest: {msg}"),
            Self::Download(msg) => write!(f, "Failed to download update: {msg}"),
            Self::Integrity { expected, actual } => {
                write!(
                    f,
                    "Downloaded update failed verification (expected sha256 {expected}, got {actual})"
                )
            }
            Self::Busy(status) => {
                write!(f, "Update already in progress ({})", status.as_str())
            }
            Self::InvalidState { action, status } => {
                write!(f, "Cannot {action} while update status is {}", status.as_str())
            }
            Self::Install(msg) => write!(f, "Failed to install update: {msg}"),
            Self::Io(err) => write!(f, "Update staging failed: {err}"),
        }
    }
}

impl std::error::Error for UpdateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for UpdateError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
