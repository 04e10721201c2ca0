//! Ordered composition of extension hooks.
//!
//! [`HookComposer`] owns the engine's extension registry and applies each
//! hook across it in registration order:
//!
//! - `modify_system_prompt` is chained: every extension sees the previous
//!   extension's output.
//! - `prepare_step` results are merged left to right, later extensions
//!   winning on each field they set.
//! - `after_model`, `on_stream_finish`, `on_input_available` and
//!   `on_stream_ready` are notifications.
//!
//! A failing hook is logged and reported as
//! [`EngineEvent::HookFailed`]; it is never retried and never aborts the
//! call. A failed prompt rewrite leaves the prompt as it was.

use super::events::{EngineEvent, EventHandler};
use super::extension::{Extension, StepContext, StepOverrides};
use super::prompt::SystemPromptBuilder;
use crate::agent::engine::GenerateResult;
use crate::error::HookError;
use crate::model::{PrepareFuture, StepPreparer, StreamWriter};
use crate::store::AgentState;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// The pieces of a system prompt, in the order they are laid out.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptParts<'a> {
    pub base: &'a str,
    pub custom: Option<&'a str>,
    pub summary: Option<&'a str>,
    /// Output of [`ErrorLedger::format`](crate::context::ErrorLedger::format).
    pub errors: &'a str,
}

#[derive(Clone)]
struct Registered {
    extension: Arc<dyn Extension>,
    ready: Arc<OnceCell<()>>,
}

/// Applies extension hooks in registration order.
pub struct HookComposer {
    extensions: RwLock<Vec<Registered>>,
    events: Arc<dyn EventHandler>,
}

impl HookComposer {
    pub fn new(events: Arc<dyn EventHandler>) -> Self {
        Self {
            extensions: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn register(&self, extension: Arc<dyn Extension>) {
        debug!("Registering extension {}", extension.name());
        let mut extensions = self
            .extensions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        extensions.push(Registered {
            extension,
            ready: Arc::new(OnceCell::new()),
        });
    }

    /// Number of registered extensions.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The registered extensions, in order.
    pub fn extensions(&self) -> Vec<Arc<dyn Extension>> {
        self.read().iter().map(|r| r.extension.clone()).collect()
    }

    fn read(&self) -> Vec<Registered> {
        self.extensions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn report(&self, extension: &str, hook: &str, error: &HookError) {
        warn!("Extension {extension} failed in {hook}: {error}");
        self.events.on_event(&EngineEvent::HookFailed {
            extension,
            hook,
            error: &error.0,
        });
    }

    /// Await every extension's `wait_ready`, once per extension.
    pub async fn wait_ready(&self) {
        for registered in self.read() {
            let extension = registered.extension.clone();
            registered
                .ready
                .get_or_init(|| async {
                    if let Err(e) = extension.wait_ready().await {
                        self.report(extension.name(), "wait_ready", &e);
                    }
                })
                .await;
        }
    }

    /// Chain every extension's prompt rewrite.
    pub async fn modify_system_prompt(&self, prompt: String) -> String {
        let mut prompt = prompt;
        for registered in self.read() {
            let ext = &registered.extension;
            match ext.modify_system_prompt(prompt.clone()).await {
                Ok(modified) => prompt = modified,
                Err(e) => self.report(ext.name(), "modify_system_prompt", &e),
            }
        }
        prompt
    }

    /// Base instructions (rewritten by the hooks), then custom
    /// instructions, the running summary and the recent errors.
    pub async fn compose_system_prompt(&self, parts: PromptParts<'_>) -> String {
        let modified = self.modify_system_prompt(parts.base.to_string()).await;
        SystemPromptBuilder::new(modified)
            .section_opt("Additional Instructions", parts.custom)
            .section_opt("Summary of Earlier Conversation", parts.summary)
            .raw(parts.errors)
            .build()
    }

    /// Merge every extension's overrides for one step.
    pub async fn prepare_step(&self, ctx: &StepContext<'_>) -> StepOverrides {
        let mut merged = StepOverrides::default();
        for registered in self.read() {
            let ext = &registered.extension;
            match ext.prepare_step(ctx).await {
                Ok(overrides) => merged.merge(overrides),
                Err(e) => self.report(ext.name(), "prepare_step", &e),
            }
        }
        if !merged.is_empty() {
            debug!("Step {} overrides: {merged:?}", ctx.step);
        }
        merged
    }

    pub fn notify_input_available(&self, tool: &str, arguments: &Value) {
        for registered in self.read() {
            registered.extension.on_input_available(tool, arguments);
        }
    }

    pub fn notify_stream_ready(&self, writer: &StreamWriter) {
        for registered in self.read() {
            registered.extension.on_stream_ready(writer);
        }
    }

    pub async fn after_model(&self, state: &AgentState, result: &GenerateResult) {
        for registered in self.read() {
            let ext = &registered.extension;
            if let Err(e) = ext.after_model(state, result).await {
                self.report(ext.name(), "after_model", &e);
            }
        }
    }

    pub async fn on_stream_finish(&self, state: &AgentState, result: &GenerateResult) {
        for registered in self.read() {
            let ext = &registered.extension;
            if let Err(e) = ext.on_stream_finish(state, result).await {
                self.report(ext.name(), "on_stream_finish", &e);
            }
        }
    }
}

impl StepPreparer for HookComposer {
    fn prepare_step<'a>(&'a self, ctx: &'a StepContext<'a>) -> PrepareFuture<'a> {
        Box::pin(HookComposer::prepare_step(self, ctx))
    }
}
