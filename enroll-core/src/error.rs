use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures raised while loading the enroll TOML file. Each variant carries
/// the offending path so CLI output can name the file it choked on.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid config {path}: {detail}")]
    Invalid { detail: String, path: PathBuf },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
