//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::files::DaemonInfo;

#[derive(Debug, Clone)]
pub struct Config {
    /// Name this daemon signs its file tokens with.
    pub daemon_id: String,
    /// Root of the work cache.
    pub cache_folder: PathBuf,
    /// Filesystem subtree visible under the same relative paths on every daemon.
    pub shared_space: Option<PathBuf>,
    pub temp_folder: PathBuf,
    /// Where child log files get written.
    pub log_folder: PathBuf,
    /// How long the cache waits for a finished worker's outputs to show up.
    pub file_wait: Duration,
    pub max_concurrent: usize,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let temp_folder = std::env::var("LABPIPE_TEMP_FOLDER")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp/labpipe"));
        let log_folder = std::env::var("LABPIPE_LOG_FOLDER")
            .map(PathBuf::from)
            .unwrap_or_else(|_| temp_folder.join("logs"));

        Ok(Self {
            daemon_id: required_var("LABPIPE_DAEMON_ID")?,
            cache_folder: PathBuf::from(required_var("LABPIPE_CACHE_FOLDER")?),
            shared_space: std::env::var("LABPIPE_SHARED_SPACE").ok().map(PathBuf::from),
            temp_folder,
            log_folder,
            file_wait: Duration::from_secs(parsed_var("LABPIPE_FILE_WAIT_SECS", 120)?),
            max_concurrent: parsed_var("LABPIPE_MAX_CONCURRENT", 4)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Identity used by the file-token factory of this daemon.
    pub fn daemon_info(&self) -> DaemonInfo {
        DaemonInfo {
            daemon_id: self.daemon_id.clone(),
            shared_space: self.shared_space.clone(),
            temp_folder: self.temp_folder.clone(),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}
