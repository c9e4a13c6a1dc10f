//! Error taxonomy for the supervisor

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Malformed or inconsistent manifest. Fatal at load time.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed manifest {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("app manifest not found for '{0}'")]
    MissingAppManifest(String),
    #[error("invalid app name '{0}': expected lowercase letters, digits and hyphens")]
    InvalidName(String),
    #[error("app '{name}' declared as '{found}' in its own manifest")]
    NameMismatch { name: String, found: String },
    #[error("duplicate app '{0}'")]
    Duplicate(String),
    #[error("startup order names unknown app '{0}'")]
    UnknownStartupEntry(String),
    #[error("app '{name}' has priority {priority}, expected 10-90")]
    InvalidPriority { name: String, priority: u32 },
    #[error("app '{name}' uses unknown shutdown signal '{signal}'")]
    InvalidSignal { name: String, signal: String },
    #[error("app '{0}' has an empty startup command")]
    MissingCommand(String),
    #[error("app '{0}' uses a script health check without a command")]
    MissingHealthCommand(String),
}

/// The application could not be launched.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("executable not found: {0}")]
    MissingExecutable(PathBuf),
    #[error("working directory not found: {0}")]
    MissingWorkingDir(PathBuf),
    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to exec {command}: {source}")]
    Exec {
        command: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single probe failed. Only ever changes status.
#[derive(Debug, Error)]
pub enum HealthCheckError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("expected status {expected}, got {actual}")]
    UnexpectedStatus { expected: u16, actual: u16 },
    #[error("script exited with {0}")]
    ScriptFailed(String),
    #[error("process not running")]
    ProcessGone,
}

/// Graceful stop did not finish in time; the caller escalates to SIGKILL.
#[derive(Debug, Error)]
#[error("'{name}' did not exit within {timeout:?} of {signal}")]
pub struct ShutdownTimeoutError {
    pub name: String,
    pub signal: String,
    pub timeout: Duration,
}

/// Delivering a signal failed for a reason other than the process being gone.
#[derive(Debug, Error)]
#[error("failed to send {signal} to pid {pid}: {source}")]
pub struct SignalError {
    pub pid: u32,
    pub signal: String,
    #[source]
    pub source: std::io::Error,
}

/// Errors returned to Control Surface callers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("app '{0}' not found")]
    NotFound(String),
    #[error("app '{0}' is busy with another operation")]
    Busy(String),
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("operation aborted: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}
