//! Error types for labpipe.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bad toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot translate {path} for transfer: {reason}")]
    Untranslatable { path: PathBuf, reason: String },

    #[error("invalid file token: {0}")]
    InvalidToken(String),

    #[error("expected file does not exist: {0}")]
    MissingFile(PathBuf),

    #[error("timeout when waiting for files: [{}]", join_paths(.files))]
    Timeout { files: Vec<PathBuf> },

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("cannot open log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("{0}")]
    Other(String),
}

fn join_paths(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|f| f.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
