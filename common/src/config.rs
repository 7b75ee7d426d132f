//! Named configuration options for the ingest loop and the dashboard.
//!
//! Everything has a default, so an empty JSON object (or no file at all) is a
//! valid configuration. Command line flags are layered on top by the binaries.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sensorlog_model::Schema;

use crate::{Error, Result};

const CONFIG_FILE_NAME: &str = "config.json";
const TOKEN_FILE_NAME: &str = "token.json";

/// Platform specific configuration directory, e.g. `~/.config/sensorlog`.
pub fn default_config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "sensorlog", "sensorlog")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LoggerConfig {
    pub serial: SerialConfig,
    pub csv: CsvConfig,
    /// Stop collecting after this many seconds. Runs until interrupted when unset.
    pub max_duration_secs: Option<u64>,
    pub upload: UploadConfig,
    pub drive: DriveConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SerialConfig {
    /// Device identifier, `COM5` on Windows or a device path such as `/dev/ttyACM0`.
    pub port: String,
    pub baud_rate: u32,
    /// How long a single read may block before stop conditions are checked again.
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: if cfg!(windows) { "COM5" } else { "/dev/ttyACM0" }.to_owned(),
            baud_rate: 9600,
            read_timeout_ms: 1000,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CsvConfig {
    pub path: PathBuf,
    /// Whether every line starts with a timestamp (5 columns) or not (4 columns).
    pub timestamp_column: bool,
    /// Lines containing this text are sensor-side errors and never logged.
    pub error_marker: String,
    /// Stop collecting once the log reaches this size.
    pub max_file_bytes: Option<u64>,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sensor_data.csv"),
            timestamp_column: true,
            error_marker: "Error".to_owned(),
            max_file_bytes: None,
        }
    }
}

/// When the CSV log is pushed to remote storage.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UploadPolicy {
    #[default]
    Never,
    /// Once, after collection stopped.
    OnStop,
    /// After every logged row, and once more after collection stopped.
    EveryRow,
}

impl UploadPolicy {
    pub fn uploads_each_row(&self) -> bool {
        matches!(self, Self::EveryRow)
    }

    pub fn uploads_on_stop(&self) -> bool {
        !matches!(self, Self::Never)
    }
}

impl FromStr for UploadPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "never" => Ok(Self::Never),
            "on-stop" => Ok(Self::OnStop),
            "every-row" => Ok(Self::EveryRow),
            other => Err(Error::Config(format!(
                "unknown upload policy {other:?}, expected never, on-stop or every-row"
            ))),
        }
    }
}

/// Where the remote copy lives.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// A directory, typically a mounted share.
    LocalDir,
    /// Google Drive.
    #[default]
    Drive,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local-dir" => Ok(Self::LocalDir),
            "drive" => Ok(Self::Drive),
            other => Err(Error::Config(format!(
                "unknown backend {other:?}, expected local-dir or drive"
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    pub policy: UploadPolicy,
    /// Name of the remote object mirroring the log.
    pub remote_name: String,
    pub backend: Backend,
    /// Root directory of the `local-dir` backend.
    pub local_dir: PathBuf,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            policy: UploadPolicy::default(),
            remote_name: "sensor_data.csv".to_owned(),
            backend: Backend::default(),
            local_dir: PathBuf::from("remote"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DriveConfig {
    /// OAuth client secrets downloaded from the Google Cloud console.
    pub client_secrets: PathBuf,
    /// Where the access token is cached between runs. Defaults to the config directory.
    pub token_cache: Option<PathBuf>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            client_secrets: PathBuf::from("credentials.json"),
            token_cache: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DashboardConfig {
    /// Remote object id to fetch. The dashboard reads `csv.path` directly when unset.
    pub file_id: Option<String>,
    /// Where fetched copies are stored.
    pub local_csv: PathBuf,
    pub refresh_secs: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            file_id: None,
            local_csv: PathBuf::from("dashboard_data.csv"),
            refresh_secs: 60,
        }
    }
}

impl LoggerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Loads `path` if given. Otherwise loads the file in the default config
    /// directory, falling back to defaults when there is none.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match default_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME)) {
            Some(path) if path.exists() => {
                log::info!("Using configuration from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.port.trim().is_empty() {
            return Err(Error::Config("serial.port is empty".into()));
        }
        if self.serial.baud_rate == 0 {
            return Err(Error::Config("serial.baud_rate must be positive".into()));
        }
        if self.serial.read_timeout_ms == 0 {
            return Err(Error::Config("serial.read_timeout_ms must be positive".into()));
        }
        if self.csv.path.as_os_str().is_empty() {
            return Err(Error::Config("csv.path is empty".into()));
        }
        if self.upload.policy != UploadPolicy::Never && self.upload.remote_name.trim().is_empty()
        {
            return Err(Error::Config("upload.remote_name is empty".into()));
        }
        if self.dashboard.refresh_secs == 0 {
            return Err(Error::Config("dashboard.refresh_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn schema(&self) -> Schema {
        Schema::from_timestamp_column(self.csv.timestamp_column)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.serial.read_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.dashboard.refresh_secs)
    }

    pub fn token_cache_path(&self) -> Result<PathBuf> {
        match &self.drive.token_cache {
            Some(path) => Ok(path.clone()),
            None => default_config_dir()
                .map(|dir| dir.join(TOKEN_FILE_NAME))
                .ok_or_else(|| {
                    Error::Config("no home directory, set drive.token_cache explicitly".into())
                }),
        }
    }
}
