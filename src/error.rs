//! Error taxonomy shared by the photo index, the cast device and config loading.

use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by an asset source while listing albums or assets.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },
    #[error("malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures raised while rebuilding or sampling the content index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The snapshot has no usable buckets, or no snapshot was ever built.
    #[error("content index has no usable buckets")]
    EmptyIndex,
    /// A sampled group had no usable asset left after filtering.
    #[error("group '{0}' has no usable assets")]
    EmptySelection(String),
    #[error("all bucket weights are zero")]
    ZeroWeights,
    #[error(transparent)]
    Source(#[from] SourceError),
}

impl IndexError {
    /// Whether waiting and trying again can resolve the condition.
    pub fn is_transient(&self) -> bool {
        !matches!(self, IndexError::EmptyIndex)
    }
}

/// Failures raised by the cast device capability.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("cast device '{0}' not found")]
    NotFound(String),
    #[error("multiple cast devices ({count}) found with name '{name}'")]
    Ambiguous { name: String, count: usize },
    #[error("cast connection failed: {0}")]
    Connection(String),
    #[error("cast protocol error: {0}")]
    Protocol(String),
}

impl DeviceError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, DeviceError::Ambiguous { .. })
    }
}

/// Failures raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}
