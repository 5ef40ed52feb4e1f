//! Daemon configuration and directories.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};

/// Command that launches the on-device control server
pub const DEFAULT_SERVER_COMMAND: &str =
    "CLASSPATH=/data/local/tmp/scrcpy-server.jar app_process / com.genymobile.scrcpy.Server";

/// Application directories following XDG conventions
#[derive(Debug, Clone)]
pub struct Directories {
    /// Config directory (~/.config/devmux)
    pub config: PathBuf,

    /// Data directory (~/.local/share/devmux)
    pub data: PathBuf,

    /// Config file path
    pub config_file: PathBuf,

    /// Saved devices file
    pub devices_file: PathBuf,
}

impl Directories {
    /// Standard XDG paths, falling back to the working directory when the
    /// home directory cannot be determined.
    #[must_use]
    pub fn new() -> Self {
        match ProjectDirs::from("", "", "devmux") {
            Some(project) => Self::from_parts(
                project.config_dir().to_path_buf(),
                project.data_dir().to_path_buf(),
            ),
            None => Self::with_base(PathBuf::from(".")),
        }
    }

    #[must_use]
    pub fn with_base(base: PathBuf) -> Self {
        Self::from_parts(base.clone(), base)
    }

    fn from_parts(config: PathBuf, data: PathBuf) -> Self {
        Self {
            config_file: config.join("config.json"),
            devices_file: data.join("devices.json"),
            config,
            data,
        }
    }
}

impl Default for Directories {
    fn default() -> Self {
        Self::new()
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub adb: AdbConfig,

    /// Saved devices file, defaults to `devices.json` in the data directory
    #[serde(default)]
    pub devices_file: Option<PathBuf>,

    /// Connect saved devices at start-up
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            adb: AdbConfig::default(),
            devices_file: None,
            auto_connect: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Overrides the hostname in the tracker name
    #[serde(default)]
    pub name: Option<String>,

    /// Port for multiplexed connections over raw TCP with length-prefixed
    /// frames; unset disables the listener
    #[serde(default)]
    pub stream_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            name: None,
            stream_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdbConfig {
    #[serde(default = "default_adb_binary")]
    pub binary: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Device list poll interval; 0 disables reconciliation
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_server_command")]
    pub server_command: String,
}

impl AdbConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            binary: default_adb_binary(),
            connect_timeout_ms: default_connect_timeout(),
            poll_interval_ms: default_poll_interval(),
            server_command: default_server_command(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_adb_binary() -> String {
    "adb".to_string()
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_poll_interval() -> u64 {
    2_000
}

fn default_server_command() -> String {
    DEFAULT_SERVER_COMMAND.to_string()
}

impl Config {
    /// Load config from file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains invalid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| DaemonError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `DaemonError::Config` for values the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.adb.binary.trim().is_empty() {
            return Err(DaemonError::Config("adb.binary must not be empty".to_string()));
        }
        if self.adb.connect_timeout_ms == 0 {
            return Err(DaemonError::Config(
                "adb.connectTimeoutMs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn devices_path(&self, dirs: &Directories) -> PathBuf {
        self.devices_file
            .clone()
            .unwrap_or_else(|| dirs.devices_file.clone())
    }
}
