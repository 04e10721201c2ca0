//! Agent runtime: the [`Engine`] call driver and what plugs into it.
//!
//! - [`engine::Engine`]: runs `generate` / `stream` calls for one session.
//!   Start here.
//! - [`config::EngineConfig`]: model, step and context limits, plus the
//!   nested compaction, ledger and tool settings.
//! - [`extension`]: the [`Extension`] trait. Every hook is optional.
//! - [`hooks`]: [`HookComposer`], which applies extension hooks in
//!   registration order and assembles the system prompt.
//! - [`events`]: [`EventHandler`] and [`EngineEvent`] for observing calls
//!   and answering approval requests.
//! - [`prompt`]: [`SystemPromptBuilder`] for multi-section prompts.

pub mod config;
pub mod engine;
pub mod events;
pub mod extension;
pub mod hooks;
pub mod prompt;

// Re-export commonly used items at the module level.
pub use config::EngineConfig;
pub use engine::{CallRequest, Engine, GenerateResult, StreamHandle};
pub use events::{
    CompositeEventHandler, EngineEvent, EventHandler, EventResponse, FnEventHandler,
    LoggingHandler, NoopHandler,
};
pub use extension::{Extension, HookFuture, StepContext, StepOverrides};
pub use hooks::{HookComposer, PromptParts};
pub use prompt::SystemPromptBuilder;
