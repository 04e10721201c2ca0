//! The model capability the engine drives.
//!
//! A [`LanguageModel`] takes a system prompt, messages and a tool set, and
//! runs up to `step_limit` think/act steps itself: call the model, execute
//! any requested tools, feed the results back. The engine never re-implements
//! that loop; it only prepares the request and persists what comes back.
//!
//! [`OpenRouterModel`] is the bundled implementation. Tests and hosts with
//! their own provider implement the trait directly.

pub mod openrouter;

pub use openrouter::{OpenRouterConfig, OpenRouterModel};

use crate::agent::extension::{StepContext, StepOverrides};
use crate::error::ModelError;
use crate::tools::core::ToolSet;
use crate::{Message, UsageInfo};
use futures::channel::{mpsc, oneshot};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by [`LanguageModel`] methods.
pub type ModelFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ModelError>> + Send + 'a>>;

/// Boxed future returned by [`StepPreparer::prepare_step`].
pub type PrepareFuture<'a> = Pin<Box<dyn Future<Output = StepOverrides> + Send + 'a>>;

/// Supplies per-step overrides to the model's internal loop.
pub trait StepPreparer: Send + Sync {
    fn prepare_step<'a>(&'a self, ctx: &'a StepContext<'a>) -> PrepareFuture<'a>;
}

/// One prepared invocation of the model capability.
#[derive(Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    /// Prior messages. Not repeated in the response.
    pub messages: Vec<Message>,
    pub tools: Arc<ToolSet>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Upper bound on think/act iterations.
    pub step_limit: u32,
    pub step_preparer: Option<Arc<dyn StepPreparer>>,
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for ModelRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRequest")
            .field("system_prompt_chars", &self.system_prompt.len())
            .field("messages", &self.messages.len())
            .field("tools", &self.tools)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("step_limit", &self.step_limit)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A completed model invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    /// Messages produced during this invocation, in order: assistant turns
    /// and tool results.
    pub messages: Vec<Message>,
    /// Text of the final assistant turn.
    pub text: String,
    pub steps: u32,
    pub usage: UsageInfo,
    pub finish_reason: Option<String>,
}

/// An incremental piece of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamPart {
    TextDelta {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        id: String,
        name: String,
        content: String,
        is_error: bool,
    },
    StepFinished {
        step: u32,
    },
    /// Data written by an extension through its [`StreamWriter`].
    Data {
        value: Value,
    },
    Finish {
        finish_reason: Option<String>,
    },
}

/// A streamed invocation: parts as they arrive, and the full response once
/// the model is done.
pub struct ModelStream {
    pub parts: BoxStream<'static, StreamPart>,
    pub response: ModelFuture<'static, ModelResponse>,
}

/// Receiving end of a [`StreamWriter`].
pub type StreamReceiver = mpsc::UnboundedReceiver<StreamPart>;

/// Sink for stream parts, handed to extensions before the first token.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    tx: mpsc::UnboundedSender<StreamPart>,
}

impl StreamWriter {
    pub fn channel() -> (Self, StreamReceiver) {
        let (tx, rx) = mpsc::unbounded();
        (Self { tx }, rx)
    }

    /// Send a part. Returns `false` once the receiver is gone.
    pub fn write(&self, part: StreamPart) -> bool {
        self.tx.unbounded_send(part).is_ok()
    }

    pub fn write_data(&self, value: Value) -> bool {
        self.write(StreamPart::Data { value })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A tool-calling language model that runs its own bounded step loop.
pub trait LanguageModel: Send + Sync {
    /// Model identifier, for logging.
    fn model_id(&self) -> &str;

    fn generate(&self, request: ModelRequest) -> ModelFuture<'_, ModelResponse>;

    fn stream(&self, request: ModelRequest) -> ModelFuture<'_, ModelStream>;
}

/// Build a [`ModelStream`] whose parts are fed by `tx` and whose response
/// resolves when `done` does.
pub fn channel_stream() -> (
    mpsc::UnboundedSender<StreamPart>,
    oneshot::Sender<Result<ModelResponse, ModelError>>,
    ModelStream,
) {
    let (tx, rx) = mpsc::unbounded();
    let (done_tx, done_rx) = oneshot::channel();
    let response: ModelFuture<'static, ModelResponse> = Box::pin(async move {
        done_rx
            .await
            .unwrap_or_else(|_| Err(ModelError::Other("stream producer dropped".into())))
    });
    let stream = ModelStream {
        parts: Box::pin(rx),
        response,
    };
    (tx, done_tx, stream)
}

/// Apply a step's overrides to the tool set and messages the model sees.
pub fn apply_step_overrides(
    overrides: &StepOverrides,
    tools: &Arc<ToolSet>,
    messages: &[Message],
) -> (Arc<ToolSet>, Vec<Message>) {
    let step_tools = match &overrides.active_tools {
        Some(active) => Arc::new(tools.subset(active.iter().map(String::as_str))),
        None => tools.clone(),
    };
    let mut step_messages = messages.to_vec();
    if let Some(injected) = &overrides.injected_messages {
        step_messages.extend(injected.iter().cloned());
    }
    (step_tools, step_messages)
}
