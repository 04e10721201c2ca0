//! Agent execution engine for LLM tool-use loops with bounded context.
//!
//! `keel` drives a multi-step "think, call tool, observe" loop against a
//! tool-calling language model while keeping the conversation bounded across
//! arbitrarily long sessions. The central type is the
//! [`Engine`](agent::engine::Engine): one instance per session, holding the
//! error ledger, the resolved tool cache and the registered extensions.
//!
//! # Getting started
//!
//! ```ignore
//! use keel::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), EngineError> {
//!     let model = Arc::new(OpenRouterModel::from_env(OpenRouterConfig::default())?);
//!     let store = Arc::new(InMemoryStateStore::new());
//!
//!     let engine = Engine::new(model, store, "session-1", EngineConfig::default())
//!         .with_tool(FnTool::new(
//!             ToolDef::new(
//!                 "echo",
//!                 "Echo the input back",
//!                 serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}}),
//!             ),
//!             |args: serde_json::Value| async move {
//!                 Ok(ToolOutput::text(args["text"].to_string()))
//!             },
//!         ));
//!
//!     let result = engine
//!         .generate(CallRequest::new().with_message(Message::user("Say hi via echo")))
//!         .await?;
//!     println!("{}", result.text);
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Run a call:** [`Engine::generate`](agent::engine::Engine::generate) and
//!   [`Engine::stream`](agent::engine::Engine::stream).
//! - **Plug in behavior:** implement [`Extension`](agent::extension::Extension);
//!   every hook has a no-op default.
//! - **Keep context bounded:** [`Compactor`](context::compactor::Compactor) for
//!   the two compaction phases, [`ErrorLedger`](context::ledger::ErrorLedger)
//!   for failures that must survive summarization.
//! - **Define tools:** the [`Tool`](tools::core::Tool) trait and
//!   [`FnTool`](tools::core::FnTool); resolution and retry wrapping live in
//!   [`tools::resolver`] and [`tools::managed`].
//! - **Persist sessions:** the [`StateStore`](store::StateStore) trait with
//!   in-memory and file-backed implementations.
//! - **Talk to a model:** the [`LanguageModel`](model::LanguageModel)
//!   capability and its OpenRouter implementation.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | Engine (call driver), extensions, hook composition, events, config |
//! | [`context`] | Error ledger, restorable compression, summarization, compaction |
//! | [`tools`] | Tool trait, resolution, approval gating, retry wrapper |
//! | [`model`] | Model capability trait, streaming parts, OpenRouter implementation |
//! | [`api`] | OpenRouter wire types, SSE parsing, retry with backoff |
//! | [`store`] | Per-session state storage |

pub mod agent;
pub mod api;
pub mod context;
pub mod error;
pub mod model;
pub mod prelude;
pub mod store;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

// Re-export schemars for downstream crates.
pub use schemars;

// ── Constants ──────────────────────────────────────────────────────

/// Default model for all LLM calls.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

/// `name` carried by the synthetic system message that holds the rolling
/// conversation summary after compaction.
pub const SUMMARY_MESSAGE_NAME: &str = "conversation_summary";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use keel::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct ReadFileArgs {
///     path: String,
/// }
///
/// let schema = json_schema_for::<ReadFileArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"path".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// Message content: plain text or a list of structured parts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One part of structured message content.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

impl Content {
    /// The textual content. Text parts are joined with newlines; non-text
    /// parts contribute nothing.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            Content::Text(s) => Cow::Borrowed(s),
            Content::Parts(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => Some(text.as_str()),
                        ContentPart::ImageUrl { .. } => None,
                    })
                    .collect();
                Cow::Owned(texts.join("\n"))
            }
        }
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name on tool results; marker name on synthetic system messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Structured failure flag for tool results. `None` means the producer
    /// did not say, and classification falls back to a text heuristic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl Message {
    fn with_role(role: MessageRole, content: Option<Content>) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            name: None,
            is_error: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, Some(Content::Text(content.into())))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, Some(Content::Text(content.into())))
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, Some(Content::Text(content.into())))
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::with_role(MessageRole::Assistant, None)
        }
    }

    /// A tool result for `call_id`, produced by the tool called `tool_name`.
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            name: Some(tool_name.into()),
            ..Self::with_role(MessageRole::Tool, Some(Content::Text(content.into())))
        }
    }

    /// The synthetic system message carrying the rolling summary.
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            name: Some(SUMMARY_MESSAGE_NAME.to_string()),
            ..Self::system(format!(
                "Summary of the earlier conversation:\n{}",
                summary.into()
            ))
        }
    }

    /// Set the structured failure flag.
    pub fn with_error_flag(mut self, is_error: bool) -> Self {
        self.is_error = Some(is_error);
        self
    }

    /// Textual content, empty when there is none.
    pub fn text(&self) -> Cow<'_, str> {
        match &self.content {
            Some(content) => content.text(),
            None => Cow::Borrowed(""),
        }
    }

    /// Length of the textual content in characters.
    pub fn char_len(&self) -> usize {
        self.text().chars().count()
    }

    /// Whether this is the synthetic summary message.
    pub fn is_summary(&self) -> bool {
        self.role == MessageRole::System && self.name.as_deref() == Some(SUMMARY_MESSAGE_NAME)
    }

    /// Replace the content with plain text, keeping every other field.
    pub fn replace_text(&mut self, text: impl Into<String>) {
        self.content = Some(Content::Text(text.into()));
    }
}

/// Total character count of the textual content of `messages`.
pub fn total_chars(messages: &[Message]) -> usize {
    messages.iter().map(Message::char_len).sum()
}

/// Truncate `s` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s.get(..idx).unwrap_or(s),
        None => s,
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the model (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    /// Create a function-calling tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call returned by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Parsed arguments; `Null` when the model sent invalid JSON.
    pub fn parsed_arguments(&self) -> serde_json::Value {
        serde_json::from_str(&self.function.arguments).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}

// ── Usage ──────────────────────────────────────────────────────────

/// Token usage statistics.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl UsageInfo {
    /// Add another step's usage into this total.
    pub fn accumulate(&mut self, other: &UsageInfo) {
        fn add(a: Option<u32>, b: Option<u32>) -> Option<u32> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
            }
        }
        self.prompt_tokens = add(self.prompt_tokens, other.prompt_tokens);
        self.completion_tokens = add(self.completion_tokens, other.completion_tokens);
        self.total_tokens = add(self.total_tokens, other.total_tokens);
    }
}
