//! Configuration for the [`Engine`](super::engine::Engine).
//!
//! Every field has a default, so a config file only needs the keys it
//! changes:
//!
//! ```json
//! {
//!   "model": "anthropic/claude-sonnet-4",
//!   "max_context_messages": 40,
//!   "compaction": { "compression_threshold": 4000 },
//!   "ledger": { "dedup_window_secs": 120 },
//!   "tools": { "blocked": ["bash"], "approval": { "writeFile": true } }
//! }
//! ```
//!
//! Builder methods cover the common settings:
//!
//! ```ignore
//! let config = EngineConfig::default()
//!     .with_model("openai/gpt-4o")
//!     .with_max_steps(10)
//!     .with_custom_instructions("Answer in French.");
//! ```

use crate::DEFAULT_MODEL;
use crate::context::compactor::CompactionConfig;
use crate::context::ledger::LedgerConfig;
use crate::context::summarizer::SummarizerConfig;
use crate::error::ConfigError;
use crate::model::OpenRouterConfig;
use crate::tools::filter::ToolPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Instructions used when none are configured.
pub const DEFAULT_INSTRUCTIONS: &str = "\
You are a capable autonomous agent. Work step by step, use the available \
tools to inspect and change things rather than guessing, and verify your \
work before reporting that a task is done.";

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Model identifier, passed to the model capability.
    pub model: String,
    /// Base system instructions, rewritten by extension hooks.
    pub base_instructions: String,
    /// Caller instructions appended after the hook-modified ones.
    pub custom_instructions: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Think/act iterations the model may run per call.
    pub max_steps: u32,
    /// Message count above which compaction summarizes.
    pub max_context_messages: usize,
    /// Whole-call timeout for the model invocation.
    pub timeout_secs: Option<u64>,
    pub compaction: CompactionConfig,
    pub ledger: LedgerConfig,
    pub tools: ToolPolicy,
    pub summarizer: SummarizerConfig,
    /// Used when the model capability is built from this config.
    pub openrouter: OpenRouterConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_instructions: DEFAULT_INSTRUCTIONS.to_string(),
            custom_instructions: None,
            temperature: 0.7,
            max_tokens: None,
            max_steps: 20,
            max_context_messages: 30,
            timeout_secs: None,
            compaction: CompactionConfig::default(),
            ledger: LedgerConfig::default(),
            tools: ToolPolicy::default(),
            summarizer: SummarizerConfig::default(),
            openrouter: OpenRouterConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.base_instructions = instructions.into();
        self
    }

    pub fn with_custom_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.custom_instructions = Some(instructions.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_context_messages(mut self, max: usize) -> Self {
        self.max_context_messages = max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    pub fn with_tool_policy(mut self, tools: ToolPolicy) -> Self {
        self.tools = tools;
        self
    }

    /// Retries after the first failed tool execution.
    pub fn with_tool_retries(mut self, max_retries: u32) -> Self {
        self.tools.retry.max_retries = max_retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_steps, 20);
        assert_eq!(config.max_context_messages, 30);
        assert_eq!(config.compaction.compression_threshold, 3000);
        assert_eq!(config.compaction.token_budget, 100_000);
        assert_eq!(config.ledger.capacity, 20);
        assert_eq!(config.ledger.dedup_window_secs, 60);
        assert_eq!(config.tools.retry.max_retries, 2);
        assert!(config.tools.allowed.is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_steps": 5, "ledger": {{"dedup_window_secs": 10}}, "tools": {{"blocked": ["bash"]}}}}"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_steps, 5);
        assert_eq!(config.ledger.dedup_window_secs, 10);
        assert_eq!(config.ledger.capacity, 20);
        assert_eq!(config.tools.blocked, vec!["bash".to_string()]);
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn bad_json_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = EngineConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = EngineConfig::from_file("/nonexistent/keel.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn builders_set_fields() {
        let config = EngineConfig::default()
            .with_model("m")
            .with_custom_instructions("be brief")
            .with_tool_retries(0)
            .with_timeout(Duration::from_secs(30));
        assert_eq!(config.model, "m");
        assert_eq!(config.custom_instructions.as_deref(), Some("be brief"));
        assert_eq!(config.tools.retry.max_retries, 0);
        assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
    }
}
