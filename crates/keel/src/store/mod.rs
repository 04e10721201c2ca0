//! Per-session agent state storage.
//!
//! The engine reads the whole [`AgentState`] at the start of a call and
//! writes it back with [`StatePatch`]es: every field present in a patch
//! replaces the stored field, absent fields are left alone. Stores create a
//! default state on first access to a session id and never delete one on
//! their own.
//!
//! Two implementations ship with the crate:
//!
//! - [`InMemoryStateStore`]: a `HashMap` behind a `RwLock`, for tests and
//!   short-lived processes.
//! - [`FileStateStore`]: one directory per session with an append-only
//!   `messages.jsonl` log and an atomically replaced `state.json`.

pub mod file;
pub mod memory;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;

use crate::Message;
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`StateStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Everything the engine keeps about one session.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AgentState {
    pub messages: Vec<Message>,
    /// Rolling narrative summary of compacted history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Opaque state owned by extensions (task lists, todos, ...).
    #[serde(default)]
    pub extensions: Map<String, Value>,
}

/// Partial replacement of an [`AgentState`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatePatch {
    pub messages: Option<Vec<Message>>,
    /// `Some(None)` clears the summary.
    pub summary: Option<Option<String>>,
    pub metadata: Option<Map<String, Value>>,
    pub extensions: Option<Map<String, Value>>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn with_summary(mut self, summary: Option<String>) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_extensions(mut self, extensions: Map<String, Value>) -> Self {
        self.extensions = Some(extensions);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_none()
            && self.summary.is_none()
            && self.metadata.is_none()
            && self.extensions.is_none()
    }

    /// Apply this patch to `state` in place.
    pub fn apply_to(self, state: &mut AgentState) {
        if let Some(messages) = self.messages {
            state.messages = messages;
        }
        if let Some(summary) = self.summary {
            state.summary = summary;
        }
        if let Some(metadata) = self.metadata {
            state.metadata = metadata;
        }
        if let Some(extensions) = self.extensions {
            state.extensions = extensions;
        }
    }
}

/// Durable holder of per-session agent state.
///
/// Implementations must be safe to share between engine instances; each
/// engine only ever touches its own session id.
pub trait StateStore: Send + Sync {
    /// Load the state for `session_id`, creating an empty one on first access.
    fn get_state<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, AgentState>;

    /// Replace the fields present in `patch`.
    fn set_state<'a>(&'a self, session_id: &'a str, patch: StatePatch) -> StoreFuture<'a, ()>;
}
