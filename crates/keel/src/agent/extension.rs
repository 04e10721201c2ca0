//! The extension interface.
//!
//! An [`Extension`] contributes tools and lifecycle hooks to an engine
//! without touching its internals. Every method has a no-op default;
//! implement only what you need. Extensions are composed in registration
//! order by the [`HookComposer`](super::hooks::HookComposer).

use crate::Message;
use crate::agent::engine::GenerateResult;
use crate::error::HookError;
use crate::model::StreamWriter;
use crate::store::AgentState;
use crate::tools::core::ToolSet;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by async hooks.
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, HookError>> + Send + 'a>>;

/// What a `prepare_step` hook can see.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// 0-based step number within the current call.
    pub step: u32,
    pub step_limit: u32,
    /// Messages the model will see this step, before overrides.
    pub messages: &'a [Message],
    /// The model used unless overridden.
    pub model: &'a str,
    /// Names of the tools available this call.
    pub tool_names: &'a [String],
}

/// Per-step overrides. Unset fields leave the call's value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOverrides {
    /// Restrict the step to these tools.
    pub active_tools: Option<Vec<String>>,
    pub model: Option<String>,
    /// Extra messages appended for this step only.
    pub injected_messages: Option<Vec<Message>>,
}

impl StepOverrides {
    /// Merge `later` into `self`. Fields set in `later` win.
    pub fn merge(&mut self, later: StepOverrides) {
        if later.active_tools.is_some() {
            self.active_tools = later.active_tools;
        }
        if later.model.is_some() {
            self.model = later.model;
        }
        if later.injected_messages.is_some() {
            self.injected_messages = later.injected_messages;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active_tools.is_none() && self.model.is_none() && self.injected_messages.is_none()
    }
}

/// A capability set plugged into the engine.
///
/// # Example
///
/// ```ignore
/// struct TodoExtension { todos: Arc<Mutex<Vec<String>>> }
///
/// impl Extension for TodoExtension {
///     fn name(&self) -> &str { "todos" }
///
///     fn tools(&self) -> ToolSet {
///         ToolSet::new().with(AddTodo::new(self.todos.clone()))
///     }
///
///     fn modify_system_prompt<'a>(&'a self, prompt: String) -> HookFuture<'a, String> {
///         Box::pin(async move {
///             let todos = self.todos.lock().await;
///             Ok(format!("{prompt}\n\nOpen todos:\n{}", todos.join("\n")))
///         })
///     }
/// }
/// ```
pub trait Extension: Send + Sync {
    /// Name used in logs and [`HookFailed`](super::events::EngineEvent::HookFailed) events.
    fn name(&self) -> &str;

    /// Tools this extension contributes.
    fn tools(&self) -> ToolSet {
        ToolSet::new()
    }

    /// Awaited once, before the extension is first used.
    fn wait_ready(&self) -> HookFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Rewrite the system prompt. Receives the previous extension's output.
    fn modify_system_prompt(&self, prompt: String) -> HookFuture<'_, String> {
        Box::pin(async move { Ok(prompt) })
    }

    /// Overrides for one step of the model's loop.
    fn prepare_step<'a>(&'a self, ctx: &'a StepContext<'a>) -> HookFuture<'a, StepOverrides> {
        let _ = ctx;
        Box::pin(async { Ok(StepOverrides::default()) })
    }

    /// Runs after a `generate` call's messages are persisted.
    fn after_model<'a>(
        &'a self,
        state: &'a AgentState,
        result: &'a GenerateResult,
    ) -> HookFuture<'a, ()> {
        let _ = (state, result);
        Box::pin(async { Ok(()) })
    }

    /// Called with the raw arguments before any resolved tool runs.
    fn on_input_available(&self, tool: &str, arguments: &Value) {
        let _ = (tool, arguments);
    }

    /// Called with the stream's writer before the first token.
    fn on_stream_ready(&self, writer: &StreamWriter) {
        let _ = writer;
    }

    /// Runs after a streamed call's messages are persisted.
    fn on_stream_finish<'a>(
        &'a self,
        state: &'a AgentState,
        result: &'a GenerateResult,
    ) -> HookFuture<'a, ()> {
        let _ = (state, result);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_overrides_win_per_field() {
        let mut merged = StepOverrides {
            active_tools: Some(vec!["a".into()]),
            model: Some("first".into()),
            ..Default::default()
        };
        merged.merge(StepOverrides {
            model: Some("second".into()),
            ..Default::default()
        });
        assert_eq!(merged.active_tools, Some(vec!["a".to_string()]));
        assert_eq!(merged.model.as_deref(), Some("second"));
        assert!(merged.injected_messages.is_none());
    }

    #[test]
    fn default_overrides_are_empty() {
        assert!(StepOverrides::default().is_empty());
    }
}
