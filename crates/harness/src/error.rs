//! Error types for the harness

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Test directory not found: {0}")]
    TestDirNotFound(PathBuf),

    #[error("Malformed test file name: {path} ({reason})")]
    Discovery { path: PathBuf, reason: String },

    #[error("Module '{module}' is misconfigured: {reason}")]
    ModuleConfig { module: String, reason: String },

    #[error("Pragma error in {path}: {source}")]
    Pragma {
        path: PathBuf,
        #[source]
        source: PragmaError,
    },

    #[error("Execution environment unavailable: {0}")]
    Environment(String),

    #[error("Process supervision failed: {0}")]
    Process(String),

    #[error("Test not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Problems found while reading `#pragma` lines out of a test file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PragmaError {
    #[error("line {line}: unsupported pragma '{name}'")]
    Unsupported { line: usize, name: String },

    #[error("line {line}: duplicate 'repy' pragma (first declared on line {first})")]
    DuplicateRepy { line: usize, first: usize },
}

pub type HarnessResult<T> = Result<T, HarnessError>;
