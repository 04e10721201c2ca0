//! The execution wrapper every resolved tool runs inside.
//!
//! [`ManagedTool`] wraps an extension's tool without touching it. Each call:
//!
//! 1. validates the arguments against the tool's JSON schema,
//! 2. asks the event handler for approval when the tool's rule requires it,
//! 3. notifies every extension's `on_input_available` hook,
//! 4. runs the tool, retrying [`ToolError::Failed`] with exponential backoff,
//! 5. records the final error, if any, in the engine's [`FailureLog`].

use crate::agent::events::{EngineEvent, EventHandler, EventResponse};
use crate::agent::hooks::HookComposer;
use crate::api::retry::{RetryConfig, retry_with_backoff};
use crate::error::ToolError;
use crate::tools::core::{Tool, ToolFuture, validate_tool_arguments};
use crate::tools::filter::ApprovalRule;
use crate::{ToolDef, truncate_chars};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Characters of serialized arguments kept as failure context.
const FAILURE_CONTEXT_CHARS: usize = 200;

/// A tool execution that failed for good.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolFailure {
    pub tool: String,
    pub error: String,
    /// The arguments the tool was called with, abbreviated.
    pub context: Option<String>,
    /// How many times the tool ran. 0 when it never ran (invalid
    /// arguments, denied approval).
    pub attempts: u32,
}

/// Failures collected during a call, drained by the engine when it ends.
#[derive(Debug, Clone, Default)]
pub struct FailureLog(Arc<Mutex<Vec<ToolFailure>>>);

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, failure: ToolFailure) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(failure);
    }

    pub fn drain(&self) -> Vec<ToolFailure> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What every managed tool of one engine shares.
pub struct ToolRuntime {
    pub hooks: Arc<HookComposer>,
    pub events: Arc<dyn EventHandler>,
    pub failures: FailureLog,
    pub retry: RetryConfig,
}

/// A tool wrapped with validation, approval, notification and retry.
pub struct ManagedTool {
    inner: Arc<dyn Tool>,
    approval: Option<ApprovalRule>,
    runtime: Arc<ToolRuntime>,
}

impl ManagedTool {
    pub fn new(
        inner: Arc<dyn Tool>,
        approval: Option<ApprovalRule>,
        runtime: Arc<ToolRuntime>,
    ) -> Self {
        Self {
            inner,
            approval,
            runtime,
        }
    }

    fn approved(&self, name: &str, arguments: &Value) -> bool {
        let required = self
            .approval
            .as_ref()
            .is_some_and(|rule| rule.requires_approval(arguments));
        if !required {
            return true;
        }
        match self
            .runtime
            .events
            .on_event(&EngineEvent::ApprovalRequired { name, arguments })
        {
            Some(EventResponse::Approve) => {
                info!("Tool {name} approved");
                true
            }
            Some(EventResponse::Deny(reason)) => {
                info!("Tool {name} denied: {reason}");
                false
            }
            None => {
                info!("Tool {name} denied: no approval given");
                false
            }
        }
    }

    fn record(&self, name: &str, arguments: &Value, error: &ToolError, attempts: u32) {
        let args = arguments.to_string();
        self.runtime.events.on_event(&EngineEvent::ToolFailed {
            name,
            error: &error.to_string(),
        });
        self.runtime.failures.push(ToolFailure {
            tool: name.to_string(),
            error: error.to_string(),
            context: Some(format!("args: {}", truncate_chars(&args, FAILURE_CONTEXT_CHARS))),
            attempts,
        });
    }

    async fn run(&self, arguments: Value) -> Result<crate::tools::core::ToolOutput, ToolError> {
        let def = self.inner.definition();
        let name = def.function.name.as_str();

        if let Err(e) = validate_tool_arguments(&def, &arguments) {
            self.record(name, &arguments, &e, 0);
            return Err(e);
        }

        if !self.approved(name, &arguments) {
            let e = ToolError::Denied {
                tool: name.to_string(),
            };
            self.record(name, &arguments, &e, 0);
            return Err(e);
        }

        self.runtime.hooks.notify_input_available(name, &arguments);
        self.runtime.events.on_event(&EngineEvent::ToolExecuting {
            name,
            arguments: &arguments,
        });

        let retry = &self.runtime.retry;
        let mut attempts = 0;
        let result = retry_with_backoff(
            retry,
            ToolError::is_retryable,
            |attempt, delay, e: &ToolError| {
                self.runtime.events.on_event(&EngineEvent::ToolRetry {
                    name,
                    attempt,
                    max_retries: retry.max_retries,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error: &e.to_string(),
                });
            },
            || {
                attempts += 1;
                self.inner.execute(arguments.clone())
            },
        )
        .await;

        match result {
            Ok(output) => {
                if attempts > 1 {
                    debug!("Tool {name} succeeded after {attempts} attempts");
                }
                Ok(output)
            }
            Err(e) => {
                self.record(name, &arguments, &e, attempts);
                Err(e)
            }
        }
    }
}

impl Tool for ManagedTool {
    /// The wrapped tool's definition, unchanged.
    fn definition(&self) -> ToolDef {
        self.inner.definition()
    }

    fn execute(&self, arguments: Value) -> ToolFuture<'_> {
        Box::pin(self.run(arguments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::{FnEventHandler, NoopHandler};
    use crate::agent::extension::Extension;
    use crate::tools::core::{FnTool, ToolOutput};
    use schemars::JsonSchema;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Deserialize, JsonSchema)]
    struct CmdArgs {
        #[allow(dead_code)]
        command: String,
    }

    fn counting_tool(calls: Arc<AtomicU32>, fail_first: u32) -> Arc<dyn Tool> {
        Arc::new(FnTool::new(
            ToolDef::new("bash", "Run a command", crate::json_schema_for::<CmdArgs>()),
            move |_: CmdArgs| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < fail_first {
                        Err(ToolError::Failed(format!("attempt {n} failed")))
                    } else {
                        Ok(ToolOutput::text("done"))
                    }
                }
            },
        ))
    }

    fn runtime(events: Arc<dyn EventHandler>) -> Arc<ToolRuntime> {
        Arc::new(ToolRuntime {
            hooks: Arc::new(HookComposer::new(events.clone())),
            events,
            failures: FailureLog::new(),
            retry: RetryConfig::default(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_tool_runs_max_retries_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let rt = runtime(Arc::new(NoopHandler));
        let tool = ManagedTool::new(counting_tool(calls.clone(), u32::MAX), None, rt.clone());

        let err = tool.execute(json!({"command": "make"})).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let failures = rt.failures.drain();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 3);
        assert_eq!(failures[0].error, "attempt 2 failed");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_and_reports_each_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let seen = retries.clone();
        let rt = runtime(Arc::new(FnEventHandler::new(move |e| {
            if matches!(e, EngineEvent::ToolRetry { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            None
        })));
        let tool = ManagedTool::new(counting_tool(calls.clone(), 2), None, rt.clone());

        let out = tool.execute(json!({"command": "make"})).await.unwrap();
        assert_eq!(out.content, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
        assert!(rt.failures.is_empty());
    }

    #[tokio::test]
    async fn invalid_arguments_never_run() {
        let calls = Arc::new(AtomicU32::new(0));
        let rt = runtime(Arc::new(NoopHandler));
        let tool = ManagedTool::new(counting_tool(calls.clone(), 0), None, rt.clone());

        let err = tool.execute(json!({"command": 42})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(rt.failures.drain()[0].attempts, 0);
    }

    #[tokio::test]
    async fn approval_requires_explicit_approve() {
        let calls = Arc::new(AtomicU32::new(0));

        let silent = ManagedTool::new(
            counting_tool(calls.clone(), 0),
            Some(ApprovalRule::Always),
            runtime(Arc::new(NoopHandler)),
        );
        let err = silent.execute(json!({"command": "rm"})).await.unwrap_err();
        assert_eq!(err, ToolError::Denied { tool: "bash".into() });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let approving = ManagedTool::new(
            counting_tool(calls.clone(), 0),
            Some(ApprovalRule::Always),
            runtime(Arc::new(FnEventHandler::new(|e| match e {
                EngineEvent::ApprovalRequired { .. } => Some(EventResponse::Approve),
                _ => None,
            }))),
        );
        assert!(approving.execute(json!({"command": "rm"})).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn extensions_see_raw_arguments_first() {
        struct Watcher(Arc<Mutex<Vec<String>>>);
        impl Extension for Watcher {
            fn name(&self) -> &str {
                "watcher"
            }
            fn on_input_available(&self, tool: &str, arguments: &Value) {
                self.0.lock().unwrap().push(format!("{tool}:{arguments}"));
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let rt = runtime(Arc::new(NoopHandler));
        rt.hooks.register(Arc::new(Watcher(seen.clone())));
        let tool = ManagedTool::new(counting_tool(Arc::new(AtomicU32::new(0)), 0), None, rt);

        tool.execute(json!({"command": "ls"})).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![r#"bash:{"command":"ls"}"#.to_string()]);
    }

    #[test]
    fn definition_passes_through() {
        let tool = ManagedTool::new(
            counting_tool(Arc::new(AtomicU32::new(0)), 0),
            None,
            runtime(Arc::new(NoopHandler)),
        );
        assert_eq!(tool.definition().function.name, "bash");
    }
}
