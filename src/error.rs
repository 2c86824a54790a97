//! Error taxonomy for the viewer core.
//!
//! Locally recoverable conditions (unknown speaker id, one dropped packet)
//! never surface here; they are absorbed at the component boundary. These
//! types cover the conditions that end or prevent a session.

use std::path::PathBuf;
use thiserror::Error;

/// Failures raised while bringing the process up or tearing it down.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// A second `AppContext` was constructed in the same process.
    #[error("application context already initialized")]
    DuplicateInitialization,

    #[error("another viewer instance is already running (pid {pid})")]
    SecondInstance { pid: i32 },

    #[error("user declined to continue after a previous crash")]
    PreviousCrashDeclined,

    #[error("window system init failed: {0}")]
    WindowInit(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cache directory unusable: {path}: {source}")]
    CacheDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Startup configuration failures. Fatal before the main loop is entered.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot resolve a settings directory for this platform")]
    NoSettingsDir,

    #[error("required settings file {path} is unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("settings file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}
