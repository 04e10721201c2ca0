//! OpenRouter wire layer: request/response types, SSE parsing and retry.
//!
//! - [`retry`]: exponential backoff shared by the tool wrapper and the
//!   model client. Transient HTTP failures (429, 5xx, network) are retried;
//!   400/401 never are.
//! - [`streaming`]: SSE parser for incremental text and tool-call deltas,
//!   producing [`StreamEvent`](streaming::StreamEvent) values.
//!
//! The types here mirror the OpenAI-compatible chat completions API. Engine
//! messages are converted with [`ChatMessage::from`] so engine-only fields
//! (the `is_error` flag) never go over the wire.

pub mod retry;
pub mod streaming;

pub use retry::RetryConfig;

use crate::{Content, Message, MessageRole, ToolCall, ToolDef, UsageInfo};
use serde::{Deserialize, Serialize};

/// OpenRouter chat completions endpoint.
pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body.
#[derive(Serialize, Debug, Default, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Serialize, Debug, Clone, Copy)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// A message as sent to the API.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        // Tool messages are matched by `tool_call_id`; some providers reject
        // a `name` on them.
        let name = match msg.role {
            MessageRole::Tool => None,
            _ => msg.name.clone(),
        };
        Self {
            role: msg.role,
            content: msg.content.clone(),
            tool_calls: msg.tool_calls.clone(),
            tool_call_id: msg.tool_call_id.clone(),
            name,
        }
    }
}

// ── Response types ─────────────────────────────────────────────────

/// Raw API response (internal deserialization target).
#[derive(Deserialize, Debug)]
pub(crate) struct RawChatResponse {
    pub choices: Option<Vec<RawChoice>>,
    pub error: Option<ApiErrorResponse>,
    #[serde(default)]
    pub usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct RawChoice {
    pub message: RawResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct RawResponseMessage {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ApiErrorResponse {
    pub message: String,
}

/// One model turn, as returned by a chat completion call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

impl ChatCompletion {
    /// The assistant message for this turn.
    pub fn to_message(&self) -> Message {
        let mut msg = if self.tool_calls.is_empty() {
            Message::assistant_text(self.content.clone().unwrap_or_default())
        } else {
            Message::assistant_tool_calls(self.tool_calls.clone())
        };
        if !self.tool_calls.is_empty()
            && let Some(text) = self.content.as_deref().filter(|t| !t.is_empty())
        {
            msg.content = Some(Content::Text(text.to_string()));
        }
        msg
    }
}

impl From<RawChatResponse> for ChatCompletion {
    fn from(parsed: RawChatResponse) -> Self {
        match parsed.choices.and_then(|c| c.into_iter().next()) {
            Some(c) => ChatCompletion {
                content: c.message.content,
                tool_calls: c.message.tool_calls.unwrap_or_default(),
                usage: parsed.usage,
                finish_reason: c.finish_reason,
            },
            None => ChatCompletion {
                usage: parsed.usage,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_fields_stay_off_the_wire() {
        let msg = Message::tool_result("c1", "bash", "exit 1").with_error_flag(true);
        let wire = serde_json::to_value(ChatMessage::from(&msg)).unwrap();
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c1");
        assert!(wire.get("is_error").is_none());
        assert!(wire.get("name").is_none());
    }

    #[test]
    fn request_omits_stream_when_false() {
        let body = ChatRequest {
            model: "m".into(),
            temperature: 0.5,
            ..Default::default()
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("stream").is_none());
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn tool_call_turn_keeps_text() {
        let completion = ChatCompletion {
            content: Some("Let me check.".into()),
            tool_calls: vec![ToolCall::new("c1", "bash", "{}")],
            ..Default::default()
        };
        let msg = completion.to_message();
        assert_eq!(msg.text(), "Let me check.");
        assert_eq!(msg.tool_calls.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn parses_raw_response() {
        let raw: RawChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"hi"},"finish_reason":"stop"}],
                "usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#,
        )
        .unwrap();
        let completion = ChatCompletion::from(raw);
        assert_eq!(completion.content.as_deref(), Some("hi"));
        assert_eq!(completion.finish_reason.as_deref(), Some("stop"));
        assert_eq!(completion.usage.unwrap().total_tokens, Some(4));
    }
}
