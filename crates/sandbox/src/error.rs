//! Error types for the sandbox harness

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    /// The caller handed the harness something it cannot use, e.g. a
    /// non-function to `evaluate`. Raised before any page interaction.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A patch race ended without a hot update or a reload.
    #[error("Inconsistent state: patch ended in '{state}'")]
    InconsistentState { state: String },

    /// The sandbox was already torn down. Raised before any I/O.
    #[error("Sandbox {0} has been disposed")]
    Disposed(String),

    /// Only ever logged; teardown never raises.
    #[error("Resource teardown failed: {0}")]
    TeardownFailure(String),

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Server health check failed after {0} attempts")]
    ServerHealthCheck(usize),

    #[error("Page driver error: {0}")]
    PageDriver(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type SandboxResult<T> = Result<T, SandboxError>;
