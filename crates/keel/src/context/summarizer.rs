//! Anchored incremental summarization for context compaction.
//!
//! When restorable compression isn't enough, the older part of the
//! conversation is formatted as a transcript and merged with the existing
//! running summary in a single LLM call. Errors never reach the summarizer:
//! they are extracted into the [`ErrorLedger`](super::ledger::ErrorLedger)
//! beforehand, and the prompt tells the model to leave out any that slip
//! through.

use crate::error::ModelError;
use crate::model::{LanguageModel, ModelRequest};
use crate::tools::core::ToolSet;
use crate::{Message, MessageRole, truncate_chars};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The prompt used for summarization.
pub const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation messages concisely. Focus on:
- What the user asked for and any constraints they stated
- What was accomplished (completed subtasks, files modified)
- Key findings and decisions made
- File paths and function names mentioned
- Current plan state and what remains to be done

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve file paths and function names verbatim.
- Omit error messages, stack traces and failed tool output entirely; they are tracked separately.
- Be concise — every token must earn its place.
- If there is an existing summary, merge the new information into it to produce a single \
  cohesive summary. Do not simply append — integrate, deduplicate, and update. The result \
  must be a standalone summary that replaces the existing one entirely.";

/// Characters of tool-call arguments shown in a transcript line.
const TRANSCRIPT_ARGS_CHARS: usize = 200;

/// Configuration for the model-backed summarizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Maximum tokens for the summarization response.
    pub max_tokens: u32,
    /// Sampling temperature for the summarization call.
    pub temperature: f32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.2,
        }
    }
}

/// Boxed future returned by [`Summarizer::summarize`].
pub type SummaryFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ModelError>> + Send + 'a>>;

/// Produces an updated running summary from the previous one and a span
/// of older messages.
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(
        &'a self,
        existing: Option<&'a str>,
        span: &'a [Message],
    ) -> SummaryFuture<'a>;
}

/// Render `span` as a readable transcript.
pub fn format_transcript(span: &[Message]) -> String {
    let mut out = String::new();
    for msg in span {
        match msg.role {
            MessageRole::Tool => {
                let name = msg.name.as_deref().unwrap_or("tool");
                out.push_str(&format!("[tool:{name}]: {}\n\n", msg.text()));
            }
            MessageRole::Assistant => {
                let text = msg.text();
                if !text.is_empty() {
                    out.push_str(&format!("[assistant]: {text}\n\n"));
                }
                for tc in msg.tool_calls.iter().flatten() {
                    out.push_str(&format!(
                        "[assistant called {}]: {}\n\n",
                        tc.function.name,
                        truncate_chars(&tc.function.arguments, TRANSCRIPT_ARGS_CHARS)
                    ));
                }
            }
            role => out.push_str(&format!("[{role}]: {}\n\n", msg.text())),
        }
    }
    out
}

/// Build the user message for a summarization call.
pub fn build_summarization_request(existing: Option<&str>, span: &[Message]) -> String {
    let mut content = String::new();
    if let Some(existing) = existing {
        content.push_str("=== EXISTING SUMMARY ===\n");
        content.push_str(existing);
        content.push_str("\n\n=== NEW MESSAGES TO SUMMARIZE ===\n");
    }
    content.push_str(&format_transcript(span));
    content
}

/// [`Summarizer`] backed by the engine's own model capability.
pub struct ModelSummarizer {
    model: Arc<dyn LanguageModel>,
    config: SummarizerConfig,
}

impl ModelSummarizer {
    pub fn new(model: Arc<dyn LanguageModel>, config: SummarizerConfig) -> Self {
        Self { model, config }
    }
}

impl Summarizer for ModelSummarizer {
    fn summarize<'a>(
        &'a self,
        existing: Option<&'a str>,
        span: &'a [Message],
    ) -> SummaryFuture<'a> {
        Box::pin(async move {
            let user = build_summarization_request(existing, span);
            debug!(
                "Summarizing {} message(s) ({} chars of transcript)",
                span.len(),
                user.len()
            );
            let request = ModelRequest {
                system_prompt: SUMMARIZATION_PROMPT.to_string(),
                messages: vec![Message::user(user)],
                tools: Arc::new(ToolSet::new()),
                temperature: self.config.temperature,
                max_tokens: Some(self.config.max_tokens),
                step_limit: 1,
                step_preparer: None,
                cancel: CancellationToken::new(),
                timeout: None,
            };
            let response = self.model.generate(request).await?;
            let summary = response.text.trim().to_string();
            if summary.is_empty() {
                return Err(ModelError::Other("summarizer returned empty text".into()));
            }
            Ok(summary)
        })
    }
}
