//! Deciding whether a message reports a failure.
//!
//! A tool result's structured `is_error` flag wins when the producer set
//! it. Without one, tool output is matched case-insensitively against a few
//! failure markers. The heuristic over-matches: a successful `grep error`
//! counts as a failure and is kept verbatim.

use crate::{Message, MessageRole};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Substrings that mark unstructured tool output as a failure.
pub const FAILURE_MARKERS: [&str; 3] = ["error", "failed", "exception"];

/// Case-insensitive match against [`FAILURE_MARKERS`].
pub fn looks_like_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    FAILURE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Whether `msg` is a tool result reporting a failure.
pub fn is_error_message(msg: &Message) -> bool {
    if msg.role != MessageRole::Tool {
        return false;
    }
    match msg.is_error {
        Some(flag) => flag,
        None => looks_like_failure(&msg.text()),
    }
}

/// Stable identity of an error message, used to avoid logging the same
/// message to the ledger on every compaction.
pub fn error_fingerprint(msg: &Message) -> u64 {
    let mut hasher = DefaultHasher::new();
    msg.tool_call_id.hash(&mut hasher);
    msg.name.hash(&mut hasher);
    msg.text().hash(&mut hasher);
    hasher.finish()
}

/// Content identity of a whole message list, role and order included.
pub fn list_fingerprint(messages: &[Message]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for msg in messages {
        msg.role.hash(&mut hasher);
        msg.tool_call_id.hash(&mut hasher);
        msg.name.hash(&mut hasher);
        msg.text().hash(&mut hasher);
    }
    hasher.finish()
}
