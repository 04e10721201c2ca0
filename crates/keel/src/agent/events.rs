//! Events and handlers for the [`Engine`](super::engine::Engine).
//!
//! The engine reports what it is doing through [`EngineEvent`] variants:
//! call lifecycle, compaction progress, tool execution and retries, hook
//! failures. Callers implement [`EventHandler`] to observe them for logging,
//! progress rendering or metrics, and to answer approval requests.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |
//! | Custom `impl EventHandler` | Full control (UI, metrics, approval gates) |

use crate::context::compactor::CompactionStatus;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by the engine during a call.
#[derive(Debug)]
pub enum EngineEvent<'a> {
    /// A `generate` or `stream` call is starting.
    CallStarted {
        session_id: &'a str,
        streaming: bool,
        message_count: usize,
    },
    /// Restorable compression replaced oversized messages.
    Compressed { replaced: usize, freed_chars: usize },
    /// Summarization lifecycle. Informational only.
    Compaction {
        status: CompactionStatus,
        folded_messages: usize,
    },
    /// A tool is about to run.
    ToolExecuting { name: &'a str, arguments: &'a Value },
    /// A tool attempt failed and will be retried after `delay_ms`.
    ToolRetry {
        name: &'a str,
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
        error: &'a str,
    },
    /// A tool failed for good.
    ToolFailed { name: &'a str, error: &'a str },
    /// A tool call requires approval before it runs. Only
    /// `Some(EventResponse::Approve)` lets it proceed.
    ApprovalRequired { name: &'a str, arguments: &'a Value },
    /// Incremental text delta (streaming mode only).
    TextDelta(&'a str),
    /// Token usage reported for the whole call.
    TokenUsage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// An extension hook returned an error. Not retried.
    HookFailed {
        extension: &'a str,
        hook: &'a str,
        error: &'a str,
    },
    /// The call finished and its messages are persisted.
    Finished {
        steps: u32,
        new_messages: usize,
        tool_errors: usize,
    },
}

/// Response from an event handler for events that support feedback.
#[derive(Debug, Clone, PartialEq)]
pub enum EventResponse {
    /// Approve the pending action.
    Approve,
    /// Deny the pending action with a reason (passed back to the model).
    Deny(String),
}

/// Handler for engine events.
///
/// Most events are informational and the return value is ignored. For
/// [`EngineEvent::ApprovalRequired`] the return value decides: only
/// `Some(EventResponse::Approve)` runs the tool, anything else denies it.
///
/// # Example
///
/// ```ignore
/// struct ShellGate;
///
/// impl EventHandler for ShellGate {
///     fn on_event(&self, event: &EngineEvent<'_>) -> Option<EventResponse> {
///         match event {
///             EngineEvent::ApprovalRequired { name, arguments } if *name == "bash" => {
///                 if arguments["command"].as_str().is_some_and(|c| c.starts_with("ls")) {
///                     return Some(EventResponse::Approve);
///                 }
///                 Some(EventResponse::Deny("only ls is allowed".into()))
///             }
///             _ => None,
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &EngineEvent<'_>) -> Option<EventResponse> {
        let _ = event;
        None
    }
}

/// A handler that ignores every event. Approval requests are denied.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
pub struct FnEventHandler<F>(F)
where
    F: Fn(&EngineEvent<'_>) -> Option<EventResponse> + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&EngineEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&EngineEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent<'_>) -> Option<EventResponse> {
        (self.0)(event)
    }
}

/// An event handler that delegates to multiple inner handlers.
///
/// Events are dispatched to all handlers in order. The first non-`None`
/// response is returned.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with(ShellGate);
/// ```
#[derive(Default)]
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler to the chain. Handlers are called in registration order.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add a handler from an `Option`. `None` is a no-op.
    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &EngineEvent<'_>) -> Option<EventResponse> {
        let mut response = None;
        for handler in &self.handlers {
            if let Some(r) = handler.on_event(event)
                && response.is_none()
            {
                response = Some(r);
            }
        }
        response
    }
}

/// An event handler that logs events via `tracing`. Never answers
/// approval requests.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &EngineEvent<'_>) -> Option<EventResponse> {
        match event {
            EngineEvent::CallStarted {
                session_id,
                streaming,
                message_count,
            } => {
                info!(
                    "[{session_id}] {} call with {message_count} message(s)",
                    if *streaming { "stream" } else { "generate" }
                );
            }
            EngineEvent::Compressed {
                replaced,
                freed_chars,
            } => {
                info!("Compressed {replaced} message(s), freed {freed_chars} chars");
            }
            EngineEvent::Compaction {
                status,
                folded_messages,
            } => match status {
                CompactionStatus::Failed => {
                    warn!("Summarization of {folded_messages} message(s) failed")
                }
                status => info!("Compaction {status:?}: {folded_messages} message(s)"),
            },
            EngineEvent::ToolExecuting { name, .. } => {
                debug!("Executing tool: {name}");
            }
            EngineEvent::ToolRetry {
                name,
                attempt,
                max_retries,
                delay_ms,
                error,
            } => {
                warn!("Tool {name} failed ({error}), retry {attempt}/{max_retries} in {delay_ms}ms");
            }
            EngineEvent::ToolFailed { name, error } => {
                warn!("Tool {name} failed after retries: {error}");
            }
            EngineEvent::ApprovalRequired { name, .. } => {
                info!("Approval required for tool: {name}");
            }
            EngineEvent::TextDelta(delta) => {
                let preview: String = delta.chars().take(80).collect();
                trace!("Stream text delta: {preview}");
            }
            EngineEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
            } => {
                debug!("Tokens: prompt={prompt_tokens}, completion={completion_tokens}");
            }
            EngineEvent::HookFailed {
                extension,
                hook,
                error,
            } => {
                warn!("Extension {extension} failed in {hook}: {error}");
            }
            EngineEvent::Finished {
                steps,
                new_messages,
                tool_errors,
            } => {
                info!(
                    "Call finished: {steps} step(s), {new_messages} new message(s), \
                     {tool_errors} tool error(s)"
                );
            }
        }
        None
    }
}
