use std::time::Duration;

/// Configuration problems found at startup. These are the only errors that
/// stop the process.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("Failed to read {path}: {source}")]
    DevicesFileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    DevicesFileParse {
        path: String,
        source: serde_json::Error,
    },
    #[error("No matching device in {0}")]
    NoDevice(String),
}

/// Failure of a single relay notification.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("connect to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
    #[error("write to {addr} failed: {source}")]
    Write {
        addr: String,
        source: std::io::Error,
    },
}

/// Device link failures. A session ending in one of these is retried with backoff.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device not found at {addr} within {timeout:?}")]
    NotFound { addr: String, timeout: Duration },
    #[error("device probe at {addr} failed: {source}")]
    Probe {
        addr: String,
        source: std::io::Error,
    },
    #[error("{0}")]
    Protocol(String),
    #[error("device channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("invalid power state: {0}")]
    InvalidPowerState(String),
}
