use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::BackendError;
use crate::settings::{BackendSettings, RunMode};

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Program and leading arguments used to start the backend; `--port <N>` is appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Bundled executable when packaged, `dev_command` through the interpreter on PATH otherwise
    pub fn resolve(settings: &BackendSettings, mode: RunMode) -> Result<Self, BackendError> {
        match mode {
            RunMode::Development => Self::dev_invocation(settings),
            RunMode::Packaged => Self::bundled_executable(settings),
        }
    }

    fn dev_invocation(settings: &BackendSettings) -> Result<Self, BackendError> {
        let (program, args) = settings
            .dev_command
            .split_first()
            .ok_or_else(|| BackendError::ExecutableNotFound("<empty dev_command>".to_string()))?;

        let program = which::which(program)
            .map_err(|_| BackendError::ExecutableNotFound(program.clone()))?;

        Ok(Self {
            program,
            args: args.to_vec(),
            current_dir: std::env::current_dir().ok(),
        })
    }

    fn bundled_executable(settings: &BackendSettings) -> Result<Self, BackendError> {
        if let Some(explicit) = &settings.executable {
            if explicit.exists() {
                return Ok(Self::new(explicit.clone()));
            }
            return Err(BackendError::ExecutableNotFound(
                explicit.display().to_string(),
            ));
        }

        let exe_name = if cfg!(windows) {
            format!("{}.exe", settings.executable_name)
        } else {
            settings.executable_name.clone()
        };

        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()));

        let candidates = exe_dir
            .iter()
            .flat_map(|dir| {
                [
                    // Next to the shell executable
                    dir.join(&exe_name),
                    // In resources directory (common for packaged apps)
                    dir.join("resources").join(&exe_name),
                    // macOS bundle layout
                    dir.join("../Resources").join(&exe_name),
                ]
            })
            .collect::<Vec<_>>();

        for path in &candidates {
            if path.exists() {
                return Ok(Self::new(path.clone()).in_dir_of_program());
            }
        }

        Err(BackendError::ExecutableNotFound(
            candidates
                .first()
                .map(|p| p.display().to_string())
                .unwrap_or(exe_name),
        ))
    }

    fn in_dir_of_program(mut self) -> Self {
        self.current_dir = self.program.parent().map(|p| p.to_path_buf());
        self
    }
}

/// Start the backend bound to `port` with its output forwarded to the log
pub fn spawn(spec: &LaunchSpec, port: u16) -> Result<Child, BackendError> {
    info!(
        port,
        "launching backend: {} {}",
        spec.program.display(),
        spec.args.join(" ")
    );

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .arg("--port")
        .arg(port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &spec.current_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BackendError::ExecutableNotFound(spec.program.display().to_string())
        } else {
            BackendError::Launch(e)
        }
    })?;

    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, false);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, true);
    }

    Ok(child)
}

fn forward_lines<R>(stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log_output(&line, is_stderr);
        }
    });
}

/// Log backend output
fn log_output(line: &str, is_stderr: bool) {
    let line_lower = line.to_lowercase();

    if is_stderr || line_lower.contains("error") || line_lower.contains("failed") {
        error!("backend: {}", line);
    } else if line_lower.contains("warn") {
        warn!("backend: {}", line);
    } else {
        info!("backend: {}", line);
    }
}

/// Own `child` until it exits, then hand the exit to `on_exit`.
///
/// Cancelling `force_kill` sends an immediate kill to a child that is still running.
pub fn watch_exit<F, Fut>(mut child: Child, force_kill: CancellationToken, on_exit: F) -> JoinHandle<()>
where
    F: FnOnce(ExitInfo) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = force_kill.cancelled() => {
                warn!("backend did not exit in time, force killing");
                if let Err(e) = child.start_kill() {
                    error!("failed to force kill backend: {}", e);
                }
                child.wait().await
            }
        };

        let exit = match status {
            Ok(status) => ExitInfo::from_status(status),
            Err(e) => {
                error!("error waiting for backend process: {}", e);
                ExitInfo {
                    code: None,
                    signal: None,
                }
            }
        };

        info!(code = ?exit.code, signal = ?exit.signal, "backend process exited");
        on_exit(exit).await;
    })
}
