//! Filter configuration, read from a JSON file with per-field defaults.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use {
    serde::{Deserialize, Serialize},
    tracing::warn,
};

use crate::Result;

/// Conventional location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/filter_config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Directory holding the rule files.
    pub config_dir: PathBuf,
    /// Directory holding the event database.
    pub data_dir: PathBuf,
    /// Blocked-domain rule file name, relative to `config_dir`.
    pub domains_file: String,
    /// Blocked-keyword rule file name, relative to `config_dir`.
    pub keywords_file: String,
    /// SQLite database file name, relative to `data_dir`.
    pub database_file: String,
    /// Window covered by the dashboard statistics.
    pub dashboard_window_secs: u64,
    /// Block events listed on the dashboard.
    pub recent_blocks_limit: usize,
    pub logging: LoggingConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("config"),
            data_dir: PathBuf::from("data"),
            domains_file: "blocked_domains.txt".into(),
            keywords_file: "blocked_keywords.txt".into(),
            database_file: "network_stats.db".into(),
            dashboard_window_secs: 24 * 60 * 60,
            recent_blocks_limit: 10,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Also write logs to this file when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}

impl FilterConfig {
    /// Read `path`, falling back to defaults when the file is missing or
    /// unreadable. A broken file is logged rather than treated as fatal.
    pub fn load(path: &Path) -> Self {
        match Self::from_file(path) {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not load config file, using defaults");
                Self::default()
            },
        }
    }

    /// Strict variant of [`FilterConfig::load`]: `Ok(None)` when the file does not exist.
    pub fn from_file(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    pub fn domains_path(&self) -> PathBuf {
        self.config_dir.join(&self.domains_file)
    }

    pub fn keywords_path(&self) -> PathBuf {
        self.config_dir.join(&self.keywords_file)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn dashboard_window(&self) -> Duration {
        Duration::from_secs(self.dashboard_window_secs)
    }
}
