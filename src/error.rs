use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Invalid settings, target URLs or step definitions. Always reported before any step runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid target URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported scheme {0:?} (expected http or https)")]
    UnsupportedScheme(String),

    #[error("target URL {0:?} has no host")]
    MissingHost(String),

    #[error("port out of range: {0}")]
    PortOutOfRange(u32),

    #[error("unknown placeholder {{{name}}} in {template:?}")]
    UnknownPlaceholder { name: String, template: String },

    #[error("unterminated placeholder in {0:?}")]
    UnterminatedPlaceholder(String),

    #[error("failed to read steps file {path}: {source}")]
    StepsFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse steps file {path}: {source}")]
    StepsFileParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("step #{index} ({name:?}): {reason}")]
    InvalidStep {
        index: usize,
        name: String,
        reason: String,
    },

    #[error("could not resolve directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The target never answered. Fatal: nothing downstream should run.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(
        "readiness timeout: {endpoint} not reachable after {}s ({attempts} attempts)",
        waited.as_secs()
    )]
    TimedOut {
        endpoint: String,
        attempts: u32,
        waited: Duration,
    },

    #[error("failed to set up TLS for the readiness check: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("failed to write console output: {0}")]
    Console(#[source] std::io::Error),
}

/// Failures of the container runtime itself, as opposed to the tools it runs.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime {binary:?} is not available: {reason}")]
    Unavailable { binary: String, reason: String },

    #[error("`{command}` failed: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {code}: {stderr}")]
    Failed {
        command: String,
        code: i32,
        stderr: String,
    },
}

/// Conditions that make every remaining step meaningless.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to create reports directory {path}: {source}")]
    ReportsDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write console output: {0}")]
    Console(#[source] std::io::Error),
}
