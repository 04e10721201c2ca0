//! Convenience re-exports for common `keel` types.
//!
//! Meant to be glob-imported when embedding the engine:
//!
//! ```ignore
//! use keel::prelude::*;
//! ```
//!
//! This pulls in what most hosts need: the [`Engine`] and its request and
//! result types, [`Message`] constructors, the [`Tool`] trait and
//! [`ToolSet`], the extension and event interfaces, the state stores and
//! the OpenRouter model. Compaction internals and wire types are left out;
//! import those from their modules when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::error::{EngineError, HookError, ModelError, StoreError, ToolError};
pub use crate::{Message, MessageRole, ToolDef, UsageInfo, json_schema_for};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    CallRequest, CompositeEventHandler, Engine, EngineConfig, EngineEvent, EventHandler,
    EventResponse, Extension, FnEventHandler, GenerateResult, HookFuture, LoggingHandler,
    NoopHandler, StepContext, StepOverrides, StreamHandle,
};

// ── Context management ──────────────────────────────────────────────
pub use crate::context::{ErrorEntry, Summarizer};

// ── Model ───────────────────────────────────────────────────────────
pub use crate::model::{
    LanguageModel, OpenRouterConfig, OpenRouterModel, StreamPart, StreamWriter,
};

// ── Storage ─────────────────────────────────────────────────────────
pub use crate::store::{AgentState, FileStateStore, InMemoryStateStore, StatePatch, StateStore};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{
    ApprovalConfig, FnTool, Tool, ToolFailure, ToolFuture, ToolOutput, ToolPolicy, ToolSet,
    parse_tool_args,
};
