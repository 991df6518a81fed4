//! Layered configuration: defaults, TOML file, then `PREFILLD__*` environment.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use log::info;
use serde::{Deserialize, Serialize};

use crate::container::RuntimeType;

pub const APP_NAME: &str = "prefilld";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub container: ContainerRuntimeConfig,
    pub sessions: SessionsConfig,
    pub watcher: WatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
    /// SQLite file; defaults to `<state_dir>/prefill.db`.
    pub database: Option<String>,
}

/// When to pull the worker image before spawning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfMissing,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRuntimeConfig {
    /// "docker" or "podman"; auto-detected when unset.
    pub runtime: Option<RuntimeType>,
    /// Custom path to the runtime binary.
    pub binary: Option<String>,
    /// Worker image.
    pub image: String,
    pub pull_policy: PullPolicy,
    /// Every worker container name starts with this; orphan reaping keys on it.
    pub name_prefix: String,
    /// e.g. "2g"
    pub memory_limit: Option<String>,
    /// e.g. "2.0"
    pub cpu_limit: Option<String>,
    pub network: Option<String>,
    /// Host path of `paths.data_dir`, for when prefilld itself runs in a container.
    pub host_data_path: Option<String>,
    /// How long a freshly started worker must stay up to count as started.
    pub startup_grace_ms: u64,
    /// Lines of worker log attached to crash-on-start diagnostics.
    pub log_tail_lines: u32,
}

impl Default for ContainerRuntimeConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            image: "ghcr.io/prefill/steam-prefill-daemon:latest".to_string(),
            pull_policy: PullPolicy::IfMissing,
            name_prefix: "prefill-daemon-".to_string(),
            memory_limit: Some("2g".to_string()),
            cpu_limit: Some("2.0".to_string()),
            network: None,
            host_data_path: None,
            startup_grace_ms: 1000,
            log_tail_lines: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Absolute lifetime of a session.
    pub timeout_minutes: i64,
    /// Expiry and health sweep period.
    pub sweep_interval_seconds: u64,
    /// Default wait for a command response.
    pub command_timeout_seconds: u64,
    /// How long `start_login` waits for the first challenge or `logged-in`.
    pub login_timeout_seconds: u64,
    /// Wait for the shutdown acknowledgement on graceful termination.
    pub shutdown_grace_seconds: u64,
    /// `stop -t` value passed to the runtime.
    pub stop_timeout_seconds: u32,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 120,
            sweep_interval_seconds: 60,
            command_timeout_seconds: 30,
            login_timeout_seconds: 60,
            shutdown_grace_seconds: 5,
            stop_timeout_seconds: 10,
        }
    }
}

impl SessionsConfig {
    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.timeout_minutes)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Disable to drive the response handlers by hand (tests, debugging).
    pub enabled: bool,
    /// Notifications for the same file inside this window coalesce into one.
    pub dedup_window_ms: u64,
    /// Pause between the coalesced notification and the read.
    pub settle_delay_ms: u64,
    /// Poll period when waiting for a response file.
    pub poll_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dedup_window_ms: 100,
            settle_delay_ms: 50,
            poll_interval_ms: 100,
        }
    }
}

impl WatcherConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Resolved on-disk locations.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
    pub database: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        let data_dir = default_data_dir()?;
        let state_dir = default_state_dir()?;
        let database = state_dir.join("prefill.db");

        Ok(Self {
            config_file,
            data_dir,
            state_dir,
            database,
        })
    }

    pub fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
            self.database = self.state_dir.join("prefill.db");
        }
        if let Some(ref db_override) = cfg.paths.database {
            self.database = expand_str_path(db_override)?;
        }
        Ok(self)
    }

    /// Root of the per-session mailbox directories.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }
}

pub fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

/// Load the config file, writing a default one first if none exists.
pub fn load_or_init_config(paths: &AppPaths, dry_run: bool) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    let defaults = AppConfig::default();
    let built = Config::builder()
        .set_default("logging.level", defaults.logging.level.as_str())?
        .set_default("container.image", defaults.container.image.as_str())?
        .set_default("container.name_prefix", defaults.container.name_prefix.as_str())?
        .set_default("sessions.timeout_minutes", defaults.sessions.timeout_minutes)?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix().as_str()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let body = format!(
        "# Configuration for {APP_NAME}\n# File: {}\n\n{toml}",
        path.display()
    );
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn xdg_dir(var: &str, fallback: Option<PathBuf>, home_suffix: &[&str]) -> Result<PathBuf> {
    if let Some(dir) = env::var_os(var).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = fallback {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| {
            home_suffix
                .iter()
                .fold(home, |path, part| path.join(part))
                .join(APP_NAME)
        })
        .ok_or_else(|| anyhow!("unable to determine {var} directory"))
}

fn default_config_dir() -> Result<PathBuf> {
    xdg_dir("XDG_CONFIG_HOME", dirs::config_dir(), &[".config"])
}

fn default_data_dir() -> Result<PathBuf> {
    xdg_dir("XDG_DATA_HOME", dirs::data_dir(), &[".local", "share"])
}

fn default_state_dir() -> Result<PathBuf> {
    xdg_dir("XDG_STATE_HOME", dirs::state_dir(), &[".local", "state"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.watcher.dedup_window_ms, 100);
        assert_eq!(config.container.pull_policy, PullPolicy::IfMissing);
        assert!(config.container.name_prefix.ends_with('-'));
        assert_eq!(config.sessions.session_timeout(), chrono::Duration::hours(2));
    }

    #[test]
    fn test_default_config_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths {
            config_file: dir.path().join("config.toml"),
            data_dir: dir.path().join("data"),
            state_dir: dir.path().join("state"),
            database: dir.path().join("state/prefill.db"),
        };

        let config = load_or_init_config(&paths, false).unwrap();
        assert!(paths.config_file.exists());
        assert_eq!(config.container.image, AppConfig::default().container.image);
        assert_eq!(config.sessions.stop_timeout_seconds, 10);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("config.toml");
        fs::write(
            &config_file,
            "[container]\nruntime = \"docker\"\npull_policy = \"never\"\n\n[sessions]\ntimeout_minutes = 5\n",
        )
        .unwrap();
        let paths = AppPaths {
            config_file,
            data_dir: dir.path().join("data"),
            state_dir: dir.path().join("state"),
            database: dir.path().join("state/prefill.db"),
        };

        let config = load_or_init_config(&paths, false).unwrap();
        assert_eq!(config.container.runtime, Some(RuntimeType::Docker));
        assert_eq!(config.container.pull_policy, PullPolicy::Never);
        assert_eq!(config.sessions.timeout_minutes, 5);
        assert_eq!(config.watcher.settle_delay_ms, 50);
    }

    #[test]
    fn test_path_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths {
            config_file: dir.path().join("config.toml"),
            data_dir: dir.path().join("data"),
            state_dir: dir.path().join("state"),
            database: dir.path().join("state/prefill.db"),
        };
        let mut config = AppConfig::default();
        config.paths.state_dir = Some(dir.path().join("other").display().to_string());

        let paths = paths.apply_overrides(&config).unwrap();
        assert_eq!(paths.database, dir.path().join("other/prefill.db"));
        assert_eq!(paths.sessions_dir(), dir.path().join("data/sessions"));
    }
}
