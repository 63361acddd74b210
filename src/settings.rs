use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable forcing development run mode ("1"/"true") or packaged ("0"/"false")
pub const DEV_MODE_ENV: &str = "DESKTOP_SHELL_DEV";
/// Environment variable replacing the release feed URL
pub const FEED_URL_ENV: &str = "DESKTOP_SHELL_FEED_URL";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GeneralSettings {
    pub dev_mode: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BackendSettings {
    pub executable: Option<PathBuf>,
    pub executable_name: String,
    pub dev_command: Vec<String>,
    pub health_path: String,
    pub health_retries: u32,
    pub health_interval_ms: u64,
    pub stop_grace_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            executable: None,
            executable_name: "backend".to_string(),
            dev_command: vec!["python".to_string(), "backend/main.py".to_string()],
            health_path: "/api/health".to_string(),
            health_retries: 30,
            health_interval_ms: 500,
            stop_grace_ms: 5000,
        }
    }
}

impl BackendSettings {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UpdateSettings {
    pub feed_url: String,
    pub initial_delay_secs: u64,
    pub check_interval_hours: u64,
    pub auto_install_on_quit: bool,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            feed_url: "https://github.com/desktop-shell/desktop-shell/releases/latest/download"
                .to_string(),
            initial_delay_secs: 3,
            check_interval_hours: 4,
            auto_install_on_quit: true,
        }
    }
}

impl UpdateSettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_hours * 3600)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub updates: UpdateSettings,
}

/// Whether the shell runs from an unpackaged checkout or an installed bundle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Development,
    Packaged,
}

impl RunMode {
    pub fn is_dev(&self) -> bool {
        matches!(self, RunMode::Development)
    }

    /// Environment override first, then the settings file, then the build profile
    pub fn detect(settings: &Settings) -> Self {
        let from_env = std::env::var(DEV_MODE_ENV)
            .ok()
            .and_then(|value| parse_flag(&value));

        let dev = from_env
            .or(settings.general.dev_mode)
            .unwrap_or(cfg!(debug_assertions));

        if dev {
            RunMode::Development
        } else {
            RunMode::Packaged
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Settings {
    pub fn load() -> Result<Self, String> {
        let config_path = Self::config_path()?;
        let mut settings = Self::load_from(&config_path)?;

        if let Ok(url) = std::env::var(FEED_URL_ENV) {
            if !url.trim().is_empty() {
                settings.updates.feed_url = url;
            }
        }

        Ok(settings)
    }

    pub fn load_from(config_path: &Path) -> Result<Self, String> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(config_path)
            .map_err(|e| format!("Failed to read settings: {}", e))?;

        toml::from_str(&contents).map_err(|e| format!("Failed to parse settings: {}", e))
    }

    pub fn save(&self) -> Result<(), String> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<(), String> {
        // Ensure the config directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        std::fs::write(config_path, contents)
            .map_err(|e| format!("Failed to write settings: {}", e))
    }

    fn project_dirs() -> Result<ProjectDirs, String> {
        ProjectDirs::from("com", "desktop-shell", "DesktopShell")
            .ok_or_else(|| "Failed to get project directories".to_string())
    }

    fn config_path() -> Result<PathBuf, String> {
        Ok(Self::project_dirs()?.config_dir().join("settings.toml"))
    }

    /// Directory where downloaded update artifacts are staged
    pub fn update_staging_dir() -> Result<PathBuf, String> {
        Ok(Self::project_dirs()?.cache_dir().join("updates"))
    }
}
