//! The call driver.
//!
//! An [`Engine`] drives one session. Each call to [`Engine::generate`] or
//! [`Engine::stream`] goes through the same preparation:
//!
//! 1. await every extension's `wait_ready` (once per extension),
//! 2. merge the request's messages and state overrides into the stored
//!    [`AgentState`] and persist them,
//! 3. compact the history, persisting the new summary and the compacted
//!    list,
//! 4. compose the system prompt (hooks, custom instructions, summary,
//!    recent errors) and resolve the tool set,
//! 5. invoke the model capability, which runs up to `max_steps` think/act
//!    steps on its own.
//!
//! Once the model is done, only the newly produced messages are appended to
//! the stored state, tool failures go to the error ledger, and the
//! post-response hooks run. Hook failures never roll back persisted state.
//!
//! A streamed call returns as soon as the model starts producing output;
//! persistence and `on_stream_finish` run in a detached task whose failures
//! are logged, not propagated.
//!
//! One engine serves one session. Concurrent calls against the same session
//! must be serialized by the caller.

use super::config::EngineConfig;
use super::events::{EngineEvent, EventHandler, NoopHandler};
use super::extension::Extension;
use super::hooks::{HookComposer, PromptParts};
use crate::context::compactor::{CompactionRequest, Compactor};
use crate::context::ledger::{ErrorEntry, ErrorLedger};
use crate::context::summarizer::{ModelSummarizer, Summarizer};
use crate::error::EngineError;
use crate::model::{
    LanguageModel, ModelRequest, ModelResponse, StepPreparer, StreamPart, StreamReceiver,
    StreamWriter,
};
use crate::store::{AgentState, StatePatch, StateStore};
use crate::tools::core::{Tool, ToolSet};
use crate::tools::filter::ApprovalConfig;
use crate::tools::managed::{FailureLog, ToolFailure, ToolRuntime};
use crate::tools::resolver::ToolResolver;
use crate::{Message, UsageInfo};
use futures::StreamExt;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Input to one `generate` / `stream` call.
///
/// ```ignore
/// let request = CallRequest::new()
///     .with_message(Message::user("Fix the failing test"))
///     .with_timeout(Duration::from_secs(300))
///     .with_allowed_tools(["readFile", "bash"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallRequest {
    /// Appended to the stored history before the call.
    pub messages: Vec<Message>,
    /// Keys written into the stored metadata, replacing existing ones.
    pub metadata: Option<Map<String, Value>>,
    /// Keys written into the stored extension state.
    pub extensions: Option<Map<String, Value>>,
    pub cancel: Option<CancellationToken>,
    /// Overrides the configured timeout for this call.
    pub timeout: Option<Duration>,
    /// Restrict this call to these tools.
    pub allowed_tools: Option<Vec<String>>,
    /// Where stream parts go. Streaming only.
    pub writer: Option<StreamWriter>,
}

impl CallRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_messages(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_extension_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_allowed_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_writer(mut self, writer: StreamWriter) -> Self {
        self.writer = Some(writer);
        self
    }
}

/// Outcome of a finished call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateResult {
    /// Text of the final assistant turn.
    pub text: String,
    /// Messages produced by this call, in order.
    pub messages: Vec<Message>,
    /// The stored state after the call.
    pub state: AgentState,
    /// Tool executions that failed for good during the call.
    pub tool_errors: Vec<ToolFailure>,
    pub usage: UsageInfo,
    pub steps: u32,
    pub finish_reason: Option<String>,
}

/// A running streamed call.
pub struct StreamHandle {
    /// Parts as they are produced. `None` when the request brought its own
    /// writer.
    pub parts: Option<StreamReceiver>,
    /// Resolves once the call's messages are persisted and
    /// `on_stream_finish` has run. `None` when completion failed; the
    /// failure is logged.
    pub completion: JoinHandle<Option<GenerateResult>>,
}

/// Everything a call needs once preparation is done.
struct PreparedCall {
    state: AgentState,
    request: ModelRequest,
}

/// Agent execution engine for one session.
///
/// Clones share the session's ledger, tool cache and extensions.
///
/// ```ignore
/// let engine = Engine::new(model, store, "session-1", EngineConfig::default())
///     .with_event_handler(LoggingHandler)
///     .with_extension(TodoExtension::default())
///     .with_tool(echo_tool());
///
/// let result = engine
///     .generate(CallRequest::new().with_message(Message::user("hi")))
///     .await?;
/// ```
#[derive(Clone)]
pub struct Engine {
    model: Arc<dyn LanguageModel>,
    store: Arc<dyn StateStore>,
    session_id: String,
    config: Arc<EngineConfig>,
    events: Arc<dyn EventHandler>,
    hooks: Arc<HookComposer>,
    approval: ApprovalConfig,
    runtime: Arc<ToolRuntime>,
    resolver: Arc<ToolResolver>,
    custom: ToolSet,
    compactor: Arc<Compactor>,
    ledger: Arc<Mutex<ErrorLedger>>,
}

impl Engine {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn StateStore>,
        session_id: impl Into<String>,
        config: EngineConfig,
    ) -> Self {
        let events: Arc<dyn EventHandler> = Arc::new(NoopHandler);
        let hooks = Arc::new(HookComposer::new(events.clone()));
        let approval = ApprovalConfig::from(&config.tools.approval);
        let summarizer: Arc<dyn Summarizer> =
            Arc::new(ModelSummarizer::new(model.clone(), config.summarizer.clone()));
        let compactor = Arc::new(Compactor::new(config.compaction.clone(), summarizer));
        let ledger = Arc::new(Mutex::new(ErrorLedger::new(config.ledger.clone())));
        let (runtime, resolver) = build_tooling(&hooks, &events, &config, &approval);

        Self {
            model,
            store,
            session_id: session_id.into(),
            config: Arc::new(config),
            events,
            hooks,
            approval,
            runtime,
            resolver,
            custom: ToolSet::new(),
            compactor,
            ledger,
        }
    }

    /// Add a caller tool. Caller tools win every name collision.
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.custom.register(tool);
        self
    }

    pub fn with_tools(mut self, tools: &ToolSet) -> Self {
        self.custom.merge(tools);
        self
    }

    /// Register an extension. Hooks run in registration order.
    pub fn with_extension(self, extension: impl Extension + 'static) -> Self {
        self.hooks.register(Arc::new(extension));
        self
    }

    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.events = Arc::new(handler);
        let hooks = Arc::new(HookComposer::new(self.events.clone()));
        for extension in self.hooks.extensions() {
            hooks.register(extension);
        }
        self.hooks = hooks;
        self.rebuild_tooling();
        self
    }

    /// Add approval rules, including argument predicates. They win over
    /// configured rules for the same tool.
    pub fn with_approval(mut self, approval: ApprovalConfig) -> Self {
        self.approval.merge(approval);
        self.rebuild_tooling();
        self
    }

    /// Replace the model-backed summarizer.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.compactor = Arc::new(Compactor::new(self.config.compaction.clone(), summarizer));
        self
    }

    fn rebuild_tooling(&mut self) {
        let (runtime, resolver) =
            build_tooling(&self.hooks, &self.events, &self.config, &self.approval);
        self.runtime = runtime;
        self.resolver = resolver;
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The ledger's entries, oldest first.
    pub fn errors(&self) -> Vec<ErrorEntry> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entries()
            .cloned()
            .collect()
    }

    /// The stored state for this session.
    pub async fn state(&self) -> Result<AgentState, EngineError> {
        Ok(self.store.get_state(&self.session_id).await?)
    }

    /// Run one call to completion.
    pub async fn generate(&self, request: CallRequest) -> Result<GenerateResult, EngineError> {
        let PreparedCall { state, request } = self.prepare(request, false).await?;

        let response = match self.model.generate(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("[{}] Model call failed: {e}", self.session_id);
                self.absorb_failures();
                return Err(e.into());
            }
        };

        let result = self.finish(state, response).await?;
        self.hooks.after_model(&result.state, &result).await;
        Ok(result)
    }

    /// Start a streamed call.
    ///
    /// Parts go to the request's writer when it has one, and to
    /// [`StreamHandle::parts`] otherwise. The writer is handed to every
    /// extension before the first token.
    pub async fn stream(&self, mut request: CallRequest) -> Result<StreamHandle, EngineError> {
        let custom_writer = request.writer.take();
        let PreparedCall { state, request } = self.prepare(request, true).await?;

        let (writer, parts) = match custom_writer {
            Some(writer) => (writer, None),
            None => {
                let (writer, rx) = StreamWriter::channel();
                (writer, Some(rx))
            }
        };
        self.hooks.notify_stream_ready(&writer);

        let model_stream = match self.model.stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("[{}] Model stream failed to start: {e}", self.session_id);
                self.absorb_failures();
                return Err(e.into());
            }
        };

        let engine = self.clone();
        let completion = tokio::spawn(async move {
            let events = engine.events.clone();
            let forward = model_stream.parts.for_each(|part| {
                if let StreamPart::TextDelta { text } = &part {
                    events.on_event(&EngineEvent::TextDelta(text));
                }
                writer.write(part);
                futures::future::ready(())
            });
            let ((), response) = futures::join!(forward, model_stream.response);
            drop(writer);

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!("[{}] Streamed model call failed: {e}", engine.session_id);
                    engine.absorb_failures();
                    return None;
                }
            };
            match engine.finish(state, response).await {
                Ok(result) => {
                    engine.hooks.on_stream_finish(&result.state, &result).await;
                    Some(result)
                }
                Err(e) => {
                    warn!("[{}] Failed to persist streamed call: {e}", engine.session_id);
                    None
                }
            }
        });

        Ok(StreamHandle { parts, completion })
    }

    async fn prepare(
        &self,
        call: CallRequest,
        streaming: bool,
    ) -> Result<PreparedCall, EngineError> {
        self.hooks.wait_ready().await;

        let mut state = self.store.get_state(&self.session_id).await?;
        let mut patch = StatePatch::new();
        if !call.messages.is_empty() {
            state.messages.extend(call.messages);
            patch = patch.with_messages(state.messages.clone());
        }
        if let Some(metadata) = call.metadata {
            state.metadata.extend(metadata);
            patch = patch.with_metadata(state.metadata.clone());
        }
        if let Some(extensions) = call.extensions {
            state.extensions.extend(extensions);
            patch = patch.with_extensions(state.extensions.clone());
        }
        if !patch.is_empty() {
            self.store.set_state(&self.session_id, patch).await?;
        }

        self.events.on_event(&EngineEvent::CallStarted {
            session_id: &self.session_id,
            streaming,
            message_count: state.messages.len(),
        });

        let outcome = self
            .compactor
            .compact(
                CompactionRequest {
                    messages: &state.messages,
                    summary: state.summary.as_deref(),
                    max_messages: self.config.max_context_messages,
                    token_budget: self.config.compaction.token_budget,
                },
                &self.ledger,
                self.events.as_ref(),
            )
            .await;

        let mut patch = StatePatch::new();
        if !outcome.summary_failed && outcome.messages != state.messages {
            debug!(
                "[{}] Persisting compacted history: {} -> {} message(s)",
                self.session_id,
                state.messages.len(),
                outcome.messages.len()
            );
            state.messages = outcome.messages.clone();
            patch = patch.with_messages(state.messages.clone());
        }
        if outcome.summary != state.summary {
            state.summary = outcome.summary.clone();
            patch = patch.with_summary(state.summary.clone());
        }
        if !patch.is_empty() {
            self.store.set_state(&self.session_id, patch).await?;
        }

        let errors = self
            .ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .format();
        let system_prompt = self
            .hooks
            .compose_system_prompt(PromptParts {
                base: &self.config.base_instructions,
                custom: self.config.custom_instructions.as_deref(),
                summary: outcome.summary.as_deref(),
                errors: &errors,
            })
            .await;

        let tools = self
            .resolver
            .resolve(&self.hooks, &self.custom, call.allowed_tools.as_deref());

        // The summary travels in the system prompt.
        let messages: Vec<Message> = outcome
            .messages
            .into_iter()
            .filter(|m| !m.is_summary())
            .collect();

        info!(
            "[{}] Calling {} with {} message(s), {} tool(s)",
            self.session_id,
            self.model.model_id(),
            messages.len(),
            tools.len()
        );

        let step_preparer: Arc<dyn StepPreparer> = self.hooks.clone();
        let request = ModelRequest {
            system_prompt,
            messages,
            tools,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            step_limit: self.config.max_steps,
            step_preparer: Some(step_preparer),
            cancel: call.cancel.unwrap_or_default(),
            timeout: call.timeout.or_else(|| self.config.timeout()),
        };

        Ok(PreparedCall { state, request })
    }

    /// Persist the new messages and record the call's failures.
    async fn finish(
        &self,
        mut state: AgentState,
        response: ModelResponse,
    ) -> Result<GenerateResult, EngineError> {
        state.messages.extend(response.messages.iter().cloned());
        let failures = self.runtime.failures.drain();
        self.compactor
            .record_call_errors(&response.messages, &failures, &self.ledger);

        self.store
            .set_state(
                &self.session_id,
                StatePatch::new().with_messages(state.messages.clone()),
            )
            .await?;

        self.events.on_event(&EngineEvent::TokenUsage {
            prompt_tokens: response.usage.prompt_tokens.unwrap_or(0),
            completion_tokens: response.usage.completion_tokens.unwrap_or(0),
        });
        self.events.on_event(&EngineEvent::Finished {
            steps: response.steps,
            new_messages: response.messages.len(),
            tool_errors: failures.len(),
        });

        Ok(GenerateResult {
            text: response.text,
            messages: response.messages,
            state,
            tool_errors: failures,
            usage: response.usage,
            steps: response.steps,
            finish_reason: response.finish_reason,
        })
    }

    /// Move failures of an aborted call into the ledger.
    fn absorb_failures(&self) {
        let failures = self.runtime.failures.drain();
        if !failures.is_empty() {
            self.compactor
                .record_call_errors(&[], &failures, &self.ledger);
        }
    }
}

fn build_tooling(
    hooks: &Arc<HookComposer>,
    events: &Arc<dyn EventHandler>,
    config: &EngineConfig,
    approval: &ApprovalConfig,
) -> (Arc<ToolRuntime>, Arc<ToolResolver>) {
    let runtime = Arc::new(ToolRuntime {
        hooks: hooks.clone(),
        events: events.clone(),
        failures: FailureLog::new(),
        retry: config.tools.retry.clone(),
    });
    let resolver = Arc::new(ToolResolver::new(
        runtime.clone(),
        config.tools.clone(),
        approval.clone(),
    ));
    (runtime, resolver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolDef;
    use crate::agent::events::{EventResponse, FnEventHandler};
    use crate::agent::extension::HookFuture;
    use crate::context::summarizer::SummaryFuture;
    use crate::error::{HookError, ModelError, ToolError};
    use crate::model::{ModelFuture, ModelStream, channel_stream};
    use crate::store::InMemoryStateStore;
    use crate::tools::core::{FnTool, ToolOutput};
    use crate::ToolCall;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// One scripted model invocation.
    enum Turn {
        Reply(&'static str),
        /// Call a tool, then reply with the text.
        CallTool {
            tool: &'static str,
            arguments: &'static str,
            reply: &'static str,
        },
        Fail,
    }

    #[derive(Clone, Default)]
    struct ScriptedModel {
        turns: Arc<Mutex<VecDeque<Turn>>>,
        requests: Arc<Mutex<Vec<ModelRequest>>>,
    }

    impl ScriptedModel {
        fn new(turns: impl IntoIterator<Item = Turn>) -> Self {
            Self {
                turns: Arc::new(Mutex::new(turns.into_iter().collect())),
                requests: Arc::default(),
            }
        }

        fn requests(&self) -> Vec<ModelRequest> {
            self.requests.lock().unwrap().clone()
        }

        async fn run(
            &self,
            request: ModelRequest,
            parts: Option<&futures::channel::mpsc::UnboundedSender<StreamPart>>,
        ) -> Result<ModelResponse, ModelError> {
            self.requests.lock().unwrap().push(request.clone());
            let turn = self.turns.lock().unwrap().pop_front();
            let usage = UsageInfo {
                prompt_tokens: Some(10),
                completion_tokens: Some(5),
                total_tokens: Some(15),
            };
            match turn {
                Some(Turn::Reply(text)) => {
                    if let Some(tx) = parts {
                        let _ = tx.unbounded_send(StreamPart::TextDelta { text: text.into() });
                    }
                    Ok(ModelResponse {
                        messages: vec![Message::assistant_text(text)],
                        text: text.into(),
                        steps: 1,
                        usage,
                        finish_reason: Some("stop".into()),
                    })
                }
                Some(Turn::CallTool {
                    tool,
                    arguments,
                    reply,
                }) => {
                    let call = ToolCall::new("call-1", tool, arguments);
                    let result = match request.tools.execute(tool, arguments).await {
                        Ok(out) => Message::tool_result("call-1", tool, out.content),
                        Err(e) => Message::tool_result("call-1", tool, format!("Error: {e}"))
                            .with_error_flag(true),
                    };
                    Ok(ModelResponse {
                        messages: vec![
                            Message::assistant_tool_calls(vec![call]),
                            result,
                            Message::assistant_text(reply),
                        ],
                        text: reply.into(),
                        steps: 2,
                        usage,
                        finish_reason: Some("stop".into()),
                    })
                }
                Some(Turn::Fail) | None => Err(ModelError::Api("scripted failure".into())),
            }
        }
    }

    impl LanguageModel for ScriptedModel {
        fn model_id(&self) -> &str {
            "scripted"
        }

        fn generate(&self, request: ModelRequest) -> ModelFuture<'_, ModelResponse> {
            Box::pin(self.run(request, None))
        }

        fn stream(&self, request: ModelRequest) -> ModelFuture<'_, ModelStream> {
            Box::pin(async move {
                let (tx, done, stream) = channel_stream();
                let model = self.clone();
                tokio::spawn(async move {
                    let result = model.run(request, Some(&tx)).await;
                    let _ = done.send(result);
                });
                Ok(stream)
            })
        }
    }

    struct FixedSummarizer(Arc<AtomicU32>);

    impl Summarizer for FixedSummarizer {
        fn summarize<'a>(
            &'a self,
            _existing: Option<&'a str>,
            span: &'a [Message],
        ) -> SummaryFuture<'a> {
            self.0.fetch_add(1, Ordering::SeqCst);
            let len = span.len();
            Box::pin(async move { Ok(format!("summary of {len} messages")) })
        }
    }

    /// Records the text of every message it is asked to fold.
    #[derive(Default)]
    struct RecordingSummarizer {
        folded: Mutex<Vec<String>>,
    }

    impl Summarizer for RecordingSummarizer {
        fn summarize<'a>(
            &'a self,
            _existing: Option<&'a str>,
            span: &'a [Message],
        ) -> SummaryFuture<'a> {
            let mut folded = self.folded.lock().unwrap();
            folded.extend(span.iter().map(|m| m.text().into_owned()));
            let count = folded.len();
            Box::pin(async move { Ok(format!("summary after {count} folded messages")) })
        }
    }

    fn failing_tool(calls: Arc<AtomicU32>) -> FnTool {
        FnTool::new(
            ToolDef::new("bash", "Run a command", json!({"type": "object"})),
            move |_: Value| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ToolError::Failed("exit status 1".into())) }
            },
        )
    }

    fn engine(model: &ScriptedModel, store: Arc<InMemoryStateStore>) -> Engine {
        Engine::new(
            Arc::new(model.clone()),
            store,
            "s1",
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn generate_appends_only_new_messages() {
        let model = ScriptedModel::new([Turn::Reply("hello")]);
        let store = Arc::new(InMemoryStateStore::new());
        let engine = engine(&model, store.clone());

        let result = engine
            .generate(CallRequest::new().with_message(Message::user("hi")))
            .await
            .unwrap();

        assert_eq!(result.text, "hello");
        assert_eq!(result.messages.len(), 1);
        let stored = store.get_state("s1").await.unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[0].text(), "hi");
        assert_eq!(stored.messages[1].text(), "hello");
        assert_eq!(result.state, stored);

        let request = &model.requests()[0];
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.step_limit, 20);
        assert!(request.step_preparer.is_some());
    }

    #[tokio::test]
    async fn long_history_is_compacted_before_the_call() {
        let model = ScriptedModel::new([Turn::Reply("done")]);
        let store = Arc::new(InMemoryStateStore::new());
        let history: Vec<Message> = (0..39)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("question {i}"))
                } else {
                    Message::assistant_text(format!("answer {i}"))
                }
            })
            .collect();
        store
            .set_state("s1", StatePatch::new().with_messages(history))
            .await
            .unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let engine =
            engine(&model, store.clone()).with_summarizer(Arc::new(FixedSummarizer(calls.clone())));

        engine
            .generate(CallRequest::new().with_message(Message::user("question 39")))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let request = &model.requests()[0];
        assert_eq!(request.messages.len(), 15);
        assert_eq!(request.messages[14].text(), "question 39");
        assert!(request.system_prompt.contains("summary of 25 messages"));

        let stored = store.get_state("s1").await.unwrap();
        assert_eq!(stored.summary.as_deref(), Some("summary of 25 messages"));
        assert_eq!(stored.messages.len(), 17);
        assert!(stored.messages[0].is_summary());
    }

    #[tokio::test]
    async fn every_user_turn_is_kept_or_summarized_across_many_calls() {
        let model = ScriptedModel::new((0..40).map(|_| Turn::Reply("noted")));
        let store = Arc::new(InMemoryStateStore::new());
        let summarizer = Arc::new(RecordingSummarizer::default());
        let engine = engine(&model, store.clone()).with_summarizer(summarizer.clone());

        for i in 0..40 {
            engine
                .generate(CallRequest::new().with_message(Message::user(format!("turn {i}"))))
                .await
                .unwrap();
        }

        let stored = store.get_state("s1").await.unwrap();
        assert!(stored.messages.len() <= 32);
        let folded = summarizer.folded.lock().unwrap();
        let lost: Vec<usize> = (0..40)
            .filter(|i| {
                let turn = format!("turn {i}");
                !folded.contains(&turn) && !stored.messages.iter().any(|m| m.text() == turn)
            })
            .collect();
        assert!(lost.is_empty(), "user turns lost: {lost:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_tool_runs_retry_bound_and_reaches_ledger() {
        let model = ScriptedModel::new([
            Turn::CallTool {
                tool: "bash",
                arguments: r#"{"command": "make"}"#,
                reply: "the build is broken",
            },
            Turn::Reply("ok"),
        ]);
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine(&model, Arc::new(InMemoryStateStore::new()))
            .with_tool(failing_tool(calls.clone()));

        let result = engine
            .generate(CallRequest::new().with_message(Message::user("build it")))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.tool_errors.len(), 1);
        assert_eq!(result.tool_errors[0].tool, "bash");
        assert_eq!(result.tool_errors[0].attempts, 3);
        assert!(result.messages[1].text().contains("exit status 1"));

        let errors = engine.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].tool_name.as_deref(), Some("bash"));
        assert_eq!(errors[0].occurrence_count, 1);

        engine
            .generate(CallRequest::new().with_message(Message::user("again")))
            .await
            .unwrap();
        assert!(model.requests()[1].system_prompt.contains("exit status 1"));
    }

    #[tokio::test]
    async fn tool_error_results_stay_verbatim_through_compaction() {
        let model = ScriptedModel::new([
            Turn::CallTool {
                tool: "bash",
                arguments: "{}",
                reply: "failed",
            },
            Turn::Reply("ok"),
        ]);
        let store = Arc::new(InMemoryStateStore::new());
        let config = EngineConfig::default()
            .with_tool_retries(0)
            .with_max_context_messages(4);
        let engine = Engine::new(Arc::new(model.clone()), store.clone(), "s1", config)
            .with_tool(failing_tool(Arc::new(AtomicU32::new(0))))
            .with_summarizer(Arc::new(FixedSummarizer(Arc::new(AtomicU32::new(0)))));

        let first = engine
            .generate(CallRequest::new().with_message(Message::user("run it")))
            .await
            .unwrap();
        assert!(first.messages[1].text().contains("exit status 1"));

        engine
            .generate(
                CallRequest::new()
                    .with_message(Message::user("one"))
                    .with_message(Message::user("two")),
            )
            .await
            .unwrap();

        // The error fell out of the kept window but survives in the ledger.
        let second = &model.requests()[1];
        assert!(second.messages.iter().all(|m| !m.text().contains("exit status")));
        assert!(second.system_prompt.contains("exit status 1"));
        assert_eq!(engine.errors().len(), 1);
    }

    #[tokio::test]
    async fn approval_needs_explicit_approve() {
        let model = ScriptedModel::new([Turn::CallTool {
            tool: "bash",
            arguments: "{}",
            reply: "denied",
        }]);
        let calls = Arc::new(AtomicU32::new(0));
        let engine = engine(&model, Arc::new(InMemoryStateStore::new()))
            .with_tool(failing_tool(calls.clone()))
            .with_event_handler(FnEventHandler::new(|event| match event {
                EngineEvent::ApprovalRequired { .. } => {
                    Some(EventResponse::Deny("not now".into()))
                }
                _ => None,
            }))
            .with_approval(ApprovalConfig::from_names(["bash"]));

        let result = engine
            .generate(CallRequest::new().with_message(Message::user("go")))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.tool_errors[0].attempts, 0);
        assert!(result.messages[1].text().contains("not approved"));
    }

    #[tokio::test]
    async fn model_failure_propagates_and_keeps_merged_input() {
        let model = ScriptedModel::new([Turn::Fail]);
        let store = Arc::new(InMemoryStateStore::new());
        let engine = engine(&model, store.clone());

        let err = engine
            .generate(
                CallRequest::new()
                    .with_message(Message::user("hi"))
                    .with_metadata("task", json!("demo")),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Model(ModelError::Api(_))));
        let stored = store.get_state("s1").await.unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.metadata["task"], "demo");
    }

    #[tokio::test]
    async fn allow_list_restricts_the_call() {
        let model = ScriptedModel::new([Turn::Reply("ok")]);
        let echo = FnTool::new(ToolDef::new("echo", "Echo", json!({})), |_: Value| async {
            Ok(ToolOutput::text("echo"))
        });
        let engine = engine(&model, Arc::new(InMemoryStateStore::new()))
            .with_tool(failing_tool(Arc::new(AtomicU32::new(0))))
            .with_tool(echo);

        engine
            .generate(
                CallRequest::new()
                    .with_message(Message::user("hi"))
                    .with_allowed_tools(["echo"]),
            )
            .await
            .unwrap();

        let request = &model.requests()[0];
        assert_eq!(request.tools.names().collect::<Vec<_>>(), vec!["echo"]);
    }

    struct Recorder {
        finished: Arc<AtomicU32>,
        fail: bool,
    }

    impl Extension for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn modify_system_prompt(&self, prompt: String) -> HookFuture<'_, String> {
            Box::pin(async move { Ok(format!("{prompt}\n\nRecorder is active.")) })
        }

        fn on_stream_ready(&self, writer: &StreamWriter) {
            writer.write_data(json!({"recorder": "ready"}));
        }

        fn after_model<'a>(
            &'a self,
            _state: &'a AgentState,
            _result: &'a GenerateResult,
        ) -> HookFuture<'a, ()> {
            Box::pin(async move {
                self.finished.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    return Err(HookError::from("after_model exploded"));
                }
                Ok(())
            })
        }

        fn on_stream_finish<'a>(
            &'a self,
            state: &'a AgentState,
            _result: &'a GenerateResult,
        ) -> HookFuture<'a, ()> {
            let count = state.messages.len() as u32;
            Box::pin(async move {
                self.finished.store(count, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn failing_hook_does_not_roll_back() {
        let model = ScriptedModel::new([Turn::Reply("persisted")]);
        let store = Arc::new(InMemoryStateStore::new());
        let finished = Arc::new(AtomicU32::new(0));
        let hook_failures = Arc::new(AtomicU32::new(0));
        let seen = hook_failures.clone();
        let engine = engine(&model, store.clone())
            .with_extension(Recorder {
                finished: finished.clone(),
                fail: true,
            })
            .with_event_handler(FnEventHandler::new(move |event| {
                if let EngineEvent::HookFailed { hook, .. } = event {
                    assert_eq!(*hook, "after_model");
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                None
            }));

        let result = engine
            .generate(CallRequest::new().with_message(Message::user("hi")))
            .await
            .unwrap();

        assert_eq!(result.text, "persisted");
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(hook_failures.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_state("s1").await.unwrap().messages.len(), 2);
        assert!(model.requests()[0].system_prompt.contains("Recorder is active."));
    }

    #[tokio::test]
    async fn stream_forwards_parts_and_persists() {
        let model = ScriptedModel::new([Turn::Reply("streamed")]);
        let store = Arc::new(InMemoryStateStore::new());
        let finished = Arc::new(AtomicU32::new(0));
        let engine = engine(&model, store.clone()).with_extension(Recorder {
            finished: finished.clone(),
            fail: false,
        });

        let handle = engine
            .stream(CallRequest::new().with_message(Message::user("hi")))
            .await
            .unwrap();
        let parts: Vec<StreamPart> = handle.parts.unwrap().collect().await;
        let result = handle.completion.await.unwrap().unwrap();

        assert_eq!(
            parts[0],
            StreamPart::Data {
                value: json!({"recorder": "ready"})
            }
        );
        assert!(parts.contains(&StreamPart::TextDelta {
            text: "streamed".into()
        }));
        assert_eq!(result.text, "streamed");
        assert_eq!(store.get_state("s1").await.unwrap().messages.len(), 2);
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stream_with_custom_writer_has_no_parts() {
        let model = ScriptedModel::new([Turn::Reply("via writer")]);
        let engine = engine(&model, Arc::new(InMemoryStateStore::new()));
        let (writer, rx) = StreamWriter::channel();

        let handle = engine
            .stream(
                CallRequest::new()
                    .with_message(Message::user("hi"))
                    .with_writer(writer),
            )
            .await
            .unwrap();
        assert!(handle.parts.is_none());
        let result = handle.completion.await.unwrap();
        let parts: Vec<StreamPart> = rx.collect().await;

        assert_eq!(result.unwrap().text, "via writer");
        assert!(parts.contains(&StreamPart::TextDelta {
            text: "via writer".into()
        }));
    }

    #[tokio::test]
    async fn failed_stream_completion_is_absorbed() {
        let model = ScriptedModel::new([Turn::Fail]);
        let store = Arc::new(InMemoryStateStore::new());
        let engine = engine(&model, store.clone());

        let handle = engine
            .stream(CallRequest::new().with_message(Message::user("hi")))
            .await
            .unwrap();
        let _parts: Vec<StreamPart> = handle.parts.unwrap().collect().await;

        assert!(handle.completion.await.unwrap().is_none());
        assert_eq!(store.get_state("s1").await.unwrap().messages.len(), 1);
    }
}
