//! [`LanguageModel`] over the OpenRouter chat completions API.
//!
//! Each step sends one chat completion request (streamed over SSE in
//! streaming mode), executes any requested tools in order through the
//! request's [`ToolSet`], appends the results and goes again, until the
//! model answers without tool calls or the step limit is reached.
//!
//! Cancellation and the call timeout apply to model requests and to the
//! gaps between steps. A tool that is already running is awaited: tools
//! honour cancellation themselves.

use super::{
    LanguageModel, ModelFuture, ModelRequest, ModelResponse, ModelStream, StreamPart,
    apply_step_overrides, channel_stream,
};
use crate::agent::extension::{StepContext, StepOverrides};
use crate::api::retry::{RetryConfig, retry_api_call};
use crate::api::streaming::{SseDecoder, StreamEvent, assemble_completion};
use crate::api::{
    ChatCompletion, ChatMessage, ChatRequest, OPENROUTER_URL, RawChatResponse, StreamOptions,
};
use crate::error::ModelError;
use crate::{DEFAULT_MODEL, Message, ToolCall};
use futures::channel::mpsc::UnboundedSender;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Connection settings for [`OpenRouterModel`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OpenRouterConfig {
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Sent as `HTTP-Referer`.
    pub referer: String,
    /// Sent as `X-Title`.
    pub title: String,
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
    /// Backoff for transient HTTP failures.
    pub retry: RetryConfig,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: OPENROUTER_URL.to_string(),
            api_key_env: "OPENROUTER_KEY".to_string(),
            referer: "https://github.com/keel-rs/keel".to_string(),
            title: "keel".to_string(),
            request_timeout_secs: 120,
            retry: RetryConfig::for_model_api(),
        }
    }
}

impl OpenRouterConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// OpenRouter-backed model capability.
#[derive(Clone)]
pub struct OpenRouterModel {
    client: reqwest::Client,
    api_key: String,
    config: OpenRouterConfig,
}

impl std::fmt::Debug for OpenRouterModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterModel")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OpenRouterModel {
    pub fn new(api_key: impl Into<String>, config: OpenRouterConfig) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("keel/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ModelError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            config,
        })
    }

    /// Read the API key from `config.api_key_env`.
    pub fn from_env(config: OpenRouterConfig) -> Result<Self, ModelError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| ModelError::Other(format!("{} not set", config.api_key_env)))?;
        Self::new(api_key, config)
    }

    pub fn config(&self) -> &OpenRouterConfig {
        &self.config
    }

    async fn send(&self, body: &ChatRequest) -> Result<reqwest::Response, ModelError> {
        let resp = self
            .client
            .post(&self.config.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.config.referer)
            .header("X-Title", &self.config.title)
            .json(body)
            .send()
            .await
            .map_err(|e| ModelError::Transport(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    /// Send a chat completion request.
    async fn chat(&self, body: &ChatRequest) -> Result<ChatCompletion, ModelError> {
        debug!(
            "LLM request: model={}, messages={}, tools={}, temp={}",
            body.model,
            body.messages.len(),
            body.tools.as_ref().map_or(0, Vec::len),
            body.temperature,
        );
        let start = Instant::now();
        let resp = self.send(body).await?;
        let text = resp
            .text()
            .await
            .map_err(|e| ModelError::Transport(format!("failed to read response: {e}")))?;
        debug!(
            "LLM response in {:.1}s ({} bytes)",
            start.elapsed().as_secs_f64(),
            text.len()
        );

        let parsed: RawChatResponse = serde_json::from_str(&text)
            .map_err(|e| ModelError::Decode(format!("failed to parse response: {e}")))?;
        if let Some(err) = &parsed.error {
            return Err(ModelError::Api(err.message.clone()));
        }
        Ok(ChatCompletion::from(parsed))
    }

    /// Send a streaming chat request, invoking `on_event` for each event as
    /// it arrives off the wire. Only opening the stream is retried.
    async fn chat_stream_live(
        &self,
        body: &ChatRequest,
        mut on_event: impl FnMut(&StreamEvent),
    ) -> Result<ChatCompletion, ModelError> {
        let mut body = body.clone();
        body.stream = true;
        body.stream_options = Some(StreamOptions {
            include_usage: true,
        });
        debug!("Sending streaming chat request to {}", body.model);

        let mut resp = retry_api_call(&self.config.retry, || self.send(&body)).await?;
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();

        while !decoder.is_done() {
            let Some(chunk) = resp
                .chunk()
                .await
                .map_err(|e| ModelError::Transport(format!("failed to read stream: {e}")))?
            else {
                break;
            };
            let before = events.len();
            decoder.feed(&chunk, &mut events);
            for ev in &events[before..] {
                on_event(ev);
            }
        }
        let before = events.len();
        decoder.finish(&mut events);
        for ev in &events[before..] {
            on_event(ev);
        }

        debug!("Stream completed with {} events", events.len());
        Ok(assemble_completion(&events))
    }

    /// The bounded think/act loop shared by both call modes. Parts are sent
    /// to `parts` when streaming.
    async fn run_steps(
        &self,
        request: ModelRequest,
        parts: Option<&UnboundedSender<StreamPart>>,
    ) -> Result<ModelResponse, ModelError> {
        let deadline = request.timeout.map(|t| (Instant::now() + t, t));
        let tool_names: Vec<String> = request.tools.names().map(str::to_string).collect();
        let emit = |part: StreamPart| {
            if let Some(tx) = parts {
                // A dropped receiver only means nobody is listening.
                let _ = tx.unbounded_send(part);
            }
        };

        let mut history = request.messages.clone();
        let mut response = ModelResponse::default();

        for step in 0..request.step_limit.max(1) {
            if request.cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }

            let overrides = match &request.step_preparer {
                Some(preparer) => {
                    let ctx = StepContext {
                        step,
                        step_limit: request.step_limit,
                        messages: &history,
                        model: &self.config.model,
                        tool_names: &tool_names,
                    };
                    preparer.prepare_step(&ctx).await
                }
                None => StepOverrides::default(),
            };
            let (tools, step_messages) = apply_step_overrides(&overrides, &request.tools, &history);
            let model = overrides
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone());

            let mut wire = Vec::with_capacity(step_messages.len() + 1);
            wire.push(ChatMessage::from(&Message::system(request.system_prompt.as_str())));
            wire.extend(step_messages.iter().map(ChatMessage::from));
            let body = ChatRequest {
                model,
                messages: wire,
                max_tokens: request.max_tokens,
                temperature: request.temperature,
                tools: (!tools.is_empty()).then(|| tools.definitions()),
                ..Default::default()
            };

            let completion = if parts.is_some() {
                let call = self.chat_stream_live(&body, |ev| {
                    if let StreamEvent::TextDelta(text) = ev {
                        emit(StreamPart::TextDelta { text: text.clone() });
                    }
                });
                guard(&request.cancel, deadline, call).await?
            } else {
                let call = retry_api_call(&self.config.retry, || self.chat(&body));
                guard(&request.cancel, deadline, call).await?
            };

            if let Some(usage) = &completion.usage {
                response.usage.accumulate(usage);
            }
            response.steps = step + 1;
            response.finish_reason = completion.finish_reason.clone();

            let assistant = completion.to_message();
            response.text = completion.content.clone().unwrap_or_default();
            history.push(assistant.clone());
            response.messages.push(assistant);

            if completion.tool_calls.is_empty() {
                emit(StreamPart::StepFinished { step });
                break;
            }

            info!("Step {step}: {} tool call(s)", completion.tool_calls.len());
            for call in &completion.tool_calls {
                emit(StreamPart::ToolCall {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                });
                let result = execute_call(&tools, call).await;
                emit(StreamPart::ToolResult {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    content: result.text().into_owned(),
                    is_error: result.is_error.unwrap_or(false),
                });
                history.push(result.clone());
                response.messages.push(result);
            }
            emit(StreamPart::StepFinished { step });
        }

        emit(StreamPart::Finish {
            finish_reason: response.finish_reason.clone(),
        });
        debug!(
            "Model run finished: {} step(s), {} new message(s)",
            response.steps,
            response.messages.len()
        );
        Ok(response)
    }
}

/// Run one tool call and turn the outcome into a tool message.
async fn execute_call(tools: &crate::tools::ToolSet, call: &ToolCall) -> Message {
    let name = call.function.name.as_str();
    match tools.execute(name, &call.function.arguments).await {
        Ok(output) => {
            trace!("Tool {name} returned {} bytes", output.content.len());
            let msg = Message::tool_result(&call.id, name, output.content);
            match output.is_error {
                Some(flag) => msg.with_error_flag(flag),
                None => msg,
            }
        }
        Err(e) => Message::tool_result(&call.id, name, format!("Error: {e}")).with_error_flag(true),
    }
}

/// Await `fut` unless the token is cancelled or the deadline passes first.
async fn guard<T>(
    cancel: &CancellationToken,
    deadline: Option<(Instant, Duration)>,
    fut: impl Future<Output = Result<T, ModelError>>,
) -> Result<T, ModelError> {
    let bounded = async {
        match deadline {
            Some((at, limit)) => match tokio::time::timeout_at(at, fut).await {
                Ok(result) => result,
                Err(_) => Err(ModelError::Timeout(limit)),
            },
            None => fut.await,
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(ModelError::Cancelled),
        result = bounded => result,
    }
}

impl LanguageModel for OpenRouterModel {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    fn generate(&self, request: ModelRequest) -> ModelFuture<'_, ModelResponse> {
        Box::pin(self.run_steps(request, None))
    }

    fn stream(&self, request: ModelRequest) -> ModelFuture<'_, ModelStream> {
        Box::pin(async move {
            let (tx, done, stream) = channel_stream();
            let model = self.clone();
            tokio::spawn(async move {
                let result = model.run_steps(request, Some(&tx)).await;
                // The consumer may have stopped waiting for the response.
                let _ = done.send(result);
            });
            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolDef;
    use crate::tools::core::{FnTool, ToolOutput, ToolSet};
    use serde_json::{Value, json};

    #[test]
    fn default_config_targets_openrouter() {
        let config = OpenRouterConfig::default();
        assert_eq!(config.base_url, OPENROUTER_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn missing_key_is_reported() {
        let config = OpenRouterConfig {
            api_key_env: "KEEL_TEST_KEY_THAT_IS_NOT_SET".into(),
            ..Default::default()
        };
        let err = OpenRouterModel::from_env(config).unwrap_err();
        assert!(err.to_string().contains("KEEL_TEST_KEY_THAT_IS_NOT_SET"));
    }

    #[tokio::test]
    async fn tool_errors_become_flagged_results() {
        let tools = ToolSet::new().with(FnTool::new(
            ToolDef::new("fail", "always fails", json!({})),
            |_: Value| async { Err(crate::error::ToolError::Failed("disk full".into())) },
        ));
        let msg = execute_call(&tools, &ToolCall::new("c1", "fail", "{}")).await;
        assert_eq!(msg.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(msg.is_error, Some(true));
        assert!(msg.text().contains("disk full"));
    }

    #[tokio::test]
    async fn structured_flag_is_kept() {
        let tools = ToolSet::new().with(FnTool::new(
            ToolDef::new("grep", "search", json!({})),
            |_: Value| async { Ok(ToolOutput::text("error handling found in 3 files")) },
        ));
        let msg = execute_call(&tools, &ToolCall::new("c1", "grep", "{}")).await;
        assert_eq!(msg.is_error, Some(false));
    }

    #[tokio::test]
    async fn guard_reports_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), ModelError> = guard(&cancel, None, std::future::pending()).await;
        assert!(matches!(result, Err(ModelError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn guard_reports_timeout() {
        let limit = Duration::from_secs(5);
        let result: Result<(), ModelError> = guard(
            &CancellationToken::new(),
            Some((Instant::now() + limit, limit)),
            std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(ModelError::Timeout(d)) if d == limit));
    }
}
