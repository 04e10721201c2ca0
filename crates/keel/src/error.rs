//! Error types.
//!
//! Each subsystem has its own enum; [`EngineError`] is what callers of
//! [`Engine`](crate::agent::engine::Engine) see. Only model and store
//! failures reach it: tool, summarization and hook failures are absorbed
//! and recorded where they happen.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of the model capability.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model API HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("model request failed: {0}")]
    Transport(String),

    #[error("failed to decode model response: {0}")]
    Decode(String),

    #[error("model API error: {0}")]
    Api(String),

    #[error("model call cancelled")]
    Cancelled,

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

impl ModelError {
    /// Whether the model layer may retry the request.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Http { status, .. } => *status == 429 || (500..600).contains(status),
            ModelError::Transport(_) => true,
            _ => false,
        }
    }
}

/// Failure of a single tool execution.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool call to {tool} was not approved")]
    Denied { tool: String },

    #[error("unknown tool: {tool}")]
    Unknown { tool: String },
}

impl ToolError {
    /// Only plain execution failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Failed(_))
    }
}

impl From<String> for ToolError {
    fn from(s: String) -> Self {
        ToolError::Failed(s)
    }
}

impl From<&str> for ToolError {
    fn from(s: &str) -> Self {
        ToolError::Failed(s.to_string())
    }
}

/// Failure of a state store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("state store error: {0}")]
    Backend(String),
}

/// Failure inside an extension hook. Logged, never retried.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl From<String> for HookError {
    fn from(s: String) -> Self {
        HookError(s)
    }
}

impl From<&str> for HookError {
    fn from(s: &str) -> Self {
        HookError(s.to_string())
    }
}

/// Failure loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Error returned by `generate` / `stream`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
