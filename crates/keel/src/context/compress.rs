//! Restorable compression: the first compaction phase.
//!
//! Oversized messages are replaced with short typed references that name
//! where the content came from (a file path, a command, a tool), so the
//! model can re-issue the same call to get the full content back. Nothing
//! is summarized and no LLM call is made.
//!
//! Rules, applied per message:
//!
//! - system and user messages are never touched;
//! - tool results classified as errors are reported to the caller (for the
//!   error ledger) and kept verbatim, whatever their size;
//! - any other message longer than the compression threshold is replaced by
//!   a reference, if the reference is actually shorter.

use super::classify::is_error_message;
use super::compactor::CompactionConfig;
use crate::{Message, MessageRole, ToolCall, truncate_chars};
use serde_json::Value;
use std::collections::HashMap;

/// Lines kept from each end of a digested message.
const DIGEST_EDGE_LINES: usize = 3;

/// Messages with more lines than this also keep their last lines.
const DIGEST_TAIL_THRESHOLD: usize = 10;

/// Characters of a shell command quoted in its placeholder.
const COMMAND_PREFIX_CHARS: usize = 50;

const PATH_KEYS: [&str; 3] = ["path", "file_path", "filePath"];
const COMMAND_KEYS: [&str; 2] = ["command", "cmd"];

/// Assistant tool calls keyed by call id, for finding the name and
/// arguments behind a tool result.
pub struct CallIndex<'a> {
    calls: HashMap<&'a str, &'a ToolCall>,
}

impl<'a> CallIndex<'a> {
    pub fn build(messages: &'a [Message]) -> Self {
        let calls = messages
            .iter()
            .filter(|m| m.role == MessageRole::Assistant)
            .filter_map(|m| m.tool_calls.as_ref())
            .flatten()
            .map(|tc| (tc.id.as_str(), tc))
            .collect();
        Self { calls }
    }

    pub fn get(&self, call_id: &str) -> Option<&'a ToolCall> {
        self.calls.get(call_id).copied()
    }
}

/// Run phase 1 over `messages`. `on_error` is called for every tool result
/// classified as an error, in order.
pub fn compress_messages(
    messages: &[Message],
    config: &CompactionConfig,
    mut on_error: impl FnMut(&Message),
) -> Vec<Message> {
    let index = CallIndex::build(messages);
    messages
        .iter()
        .map(|msg| {
            if is_error_message(msg) {
                on_error(msg);
                return msg.clone();
            }
            compress_message(msg, &index, config).unwrap_or_else(|| msg.clone())
        })
        .collect()
}

/// The compressed form of `msg`, or `None` when it stays as is.
pub fn compress_message(
    msg: &Message,
    index: &CallIndex<'_>,
    config: &CompactionConfig,
) -> Option<Message> {
    let text = msg.text();
    let len = text.chars().count();
    if len <= config.compression_threshold {
        return None;
    }

    let placeholder = match msg.role {
        MessageRole::System | MessageRole::User => return None,
        MessageRole::Assistant => assistant_placeholder(&text, len, config),
        MessageRole::Tool => {
            if is_error_message(msg) {
                return None;
            }
            let call = msg.tool_call_id.as_deref().and_then(|id| index.get(id));
            let name = msg
                .name
                .as_deref()
                .or(call.map(|c| c.function.name.as_str()))
                .unwrap_or("tool");
            let args = call.map(ToolCall::parsed_arguments).unwrap_or(Value::Null);
            tool_placeholder(name, &args, &text, len, config)
        }
    };

    if placeholder.chars().count() >= len {
        return None;
    }
    let mut compressed = msg.clone();
    compressed.replace_text(placeholder);
    Some(compressed)
}

/// Typed reference for a tool result of `len` characters.
pub fn tool_placeholder(
    tool_name: &str,
    args: &Value,
    text: &str,
    len: usize,
    config: &CompactionConfig,
) -> String {
    if config.file_read_tools.iter().any(|t| t == tool_name)
        && let Some(path) = string_arg(args, &PATH_KEYS)
    {
        return format!("[File: {path} — {len} chars read; re-read if needed]");
    }
    if config.command_tools.iter().any(|t| t == tool_name)
        && let Some(command) = string_arg(args, &COMMAND_KEYS)
    {
        let prefix = truncate_chars(command, COMMAND_PREFIX_CHARS);
        return format!("[Command \"{prefix}\" output: {len} chars; re-run if needed]");
    }
    format!(
        "[{tool_name} result: {len} chars; key info preserved]\n{}",
        digest(text, config.digest_line_chars)
    )
}

/// Digested placeholder for an oversized assistant message.
pub fn assistant_placeholder(text: &str, len: usize, config: &CompactionConfig) -> String {
    format!(
        "[Assistant message: {len} chars; key info preserved]\n{}",
        digest(text, config.digest_line_chars)
    )
}

/// First lines of `text`, plus its last lines when it is long.
fn digest(text: &str, line_chars: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let clip = |line: &&str| -> String {
        let shown = truncate_chars(line, line_chars);
        if shown.len() < line.len() {
            format!("{shown}...")
        } else {
            shown.to_string()
        }
    };

    let mut out: Vec<String> = lines.iter().take(DIGEST_EDGE_LINES).map(clip).collect();
    if lines.len() > DIGEST_TAIL_THRESHOLD {
        out.push(format!(
            "... ({} lines omitted) ...",
            lines.len() - 2 * DIGEST_EDGE_LINES
        ));
        out.extend(lines.iter().skip(lines.len() - DIGEST_EDGE_LINES).map(clip));
    }
    out.join("\n")
}

fn string_arg<'v>(args: &'v Value, keys: &[&str]) -> Option<&'v str> {
    keys.iter()
        .find_map(|k| args.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}
