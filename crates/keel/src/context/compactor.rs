//! Two-phase context compaction.
//!
//! Phase 1 ([`compress`](super::compress)) replaces oversized messages with
//! restorable references. If the list is still over budget (too many
//! messages, or too many estimated tokens), phase 2 keeps the most recent
//! half of `max_messages` verbatim and folds everything older into the
//! running summary with one summarizer call. Errors found on the way are
//! pushed into the [`ErrorLedger`] and never summarized.
//!
//! Compaction never fails: a summarizer error is logged, reported as
//! [`CompactionStatus::Failed`] and answered with the kept suffix alone.

use super::classify::{error_fingerprint, is_error_message, list_fingerprint};
use super::compress::compress_messages;
use super::ledger::ErrorLedger;
use super::summarizer::Summarizer;
use crate::agent::events::{EngineEvent, EventHandler};
use crate::tools::managed::ToolFailure;
use crate::{Message, MessageRole, total_chars, truncate_chars};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Compaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompactionConfig {
    /// Messages longer than this (in characters) are compressed in phase 1.
    pub compression_threshold: usize,
    /// Estimated token count above which phase 2 runs.
    pub token_budget: usize,
    /// Characters per token for estimation.
    pub chars_per_token: usize,
    /// Tools whose results are file contents, keyed by a `path` argument.
    pub file_read_tools: Vec<String>,
    /// Tools whose results are command output, keyed by a `command` argument.
    pub command_tools: Vec<String>,
    /// Maximum characters per line in a digest.
    pub digest_line_chars: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 3000,
            token_budget: 100_000,
            chars_per_token: 4,
            file_read_tools: vec!["readFile".into(), "read_file".into()],
            command_tools: vec![
                "bash".into(),
                "shell".into(),
                "executeCommand".into(),
                "execute_command".into(),
                "run_command".into(),
            ],
            digest_line_chars: 200,
        }
    }
}

impl CompactionConfig {
    /// Estimated tokens for `messages`.
    pub fn estimate_tokens(&self, messages: &[Message]) -> usize {
        total_chars(messages) / self.chars_per_token.max(1)
    }
}

/// Summarization lifecycle, reported through [`EngineEvent::Compaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionStatus {
    Starting,
    InProgress,
    Complete,
    Failed,
}

/// Input to [`Compactor::compact`].
#[derive(Debug, Clone, Copy)]
pub struct CompactionRequest<'a> {
    pub messages: &'a [Message],
    /// The stored running summary, if any.
    pub summary: Option<&'a str>,
    pub max_messages: usize,
    pub token_budget: usize,
}

/// Result of a compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionOutcome {
    /// The bounded list. Starts with the synthetic summary message when
    /// phase 2 produced or reused a summary.
    pub messages: Vec<Message>,
    /// The running summary to persist.
    pub summary: Option<String>,
    /// Messages replaced by phase 1.
    pub compressed: usize,
    /// Whether the summarizer was called.
    pub summarized: bool,
    /// The summarizer failed and `messages` is the kept suffix alone.
    pub summary_failed: bool,
}

/// Message count and content hash of a compaction input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InputKey {
    count: usize,
    hash: u64,
}

impl InputKey {
    fn of(messages: &[Message]) -> Self {
        Self {
            count: messages.len(),
            hash: list_fingerprint(messages),
        }
    }
}

/// Per-engine compaction state: configuration, the summarizer, the input
/// the previous call summarized and the error messages already logged.
pub struct Compactor {
    config: CompactionConfig,
    summarizer: Arc<dyn Summarizer>,
    /// Set only while the previous `compact` call summarized (or reused the
    /// summary for) exactly this input. Every other call clears it.
    last_summarized: Mutex<Option<InputKey>>,
    /// Fingerprints of logged error messages still present in the history.
    logged_errors: Mutex<HashSet<u64>>,
}

impl Compactor {
    pub fn new(config: CompactionConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            config,
            summarizer,
            last_summarized: Mutex::new(None),
            logged_errors: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Compact `request.messages` into a bounded list.
    pub async fn compact(
        &self,
        request: CompactionRequest<'_>,
        ledger: &Mutex<ErrorLedger>,
        events: &dyn EventHandler,
    ) -> CompactionOutcome {
        let input = request.messages;
        let input_chars = total_chars(input);
        let input_key = InputKey::of(input);
        let previous = self
            .last_summarized
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.retain_logged(input);

        // ── Phase 1: restorable compression ──
        let mut errors = Vec::new();
        let compressed_list = compress_messages(input, &self.config, |m| errors.push(m.clone()));
        self.log_errors(&errors, ledger);

        let compressed = input
            .iter()
            .zip(&compressed_list)
            .filter(|(a, b)| a != b)
            .count();
        if compressed > 0 {
            let freed = input_chars.saturating_sub(total_chars(&compressed_list));
            debug!("Phase 1 compressed {compressed} message(s), freed {freed} chars");
            events.on_event(&EngineEvent::Compressed {
                replaced: compressed,
                freed_chars: freed,
            });
        }

        let over_count = compressed_list.len() > request.max_messages;
        let over_tokens = self.config.estimate_tokens(&compressed_list) > request.token_budget;
        if !over_count && !over_tokens {
            return CompactionOutcome {
                messages: repair_tool_pairing(compressed_list),
                summary: request.summary.map(str::to_string),
                compressed,
                summarized: false,
                summary_failed: false,
            };
        }

        // ── Phase 2: summarization ──
        let keep = request.max_messages / 2;
        let mut split = compressed_list.len().saturating_sub(keep);
        while split < compressed_list.len() && compressed_list[split].role == MessageRole::Tool {
            split += 1;
        }
        if split == 0 {
            return CompactionOutcome {
                messages: repair_tool_pairing(compressed_list),
                summary: request.summary.map(str::to_string),
                compressed,
                summarized: false,
                summary_failed: false,
            };
        }

        let (prefix, suffix) = compressed_list.split_at(split);
        let suffix = suffix.to_vec();
        let suffix_chars = total_chars(&suffix);

        let prefix_errors: Vec<Message> = prefix
            .iter()
            .filter(|m| is_error_message(m))
            .cloned()
            .collect();
        self.log_errors(&prefix_errors, ledger);
        let span: Vec<Message> = prefix
            .iter()
            .filter(|m| !is_error_message(m) && !m.is_summary())
            .cloned()
            .collect();

        info!(
            "Compacting {} message(s): folding {}, keeping {}",
            input.len(),
            prefix.len(),
            suffix.len()
        );

        let already_summarized = previous == Some(input_key);

        let (summary, summarized) = match request.summary {
            Some(existing) if already_summarized || span.is_empty() => {
                debug!("Reusing stored summary for {} message(s)", input.len());
                self.remember_summarized(input_key);
                (Some(existing.to_string()), false)
            }
            None if span.is_empty() => (None, false),
            existing => {
                let folded = prefix.len();
                events.on_event(&EngineEvent::Compaction {
                    status: CompactionStatus::Starting,
                    folded_messages: folded,
                });
                events.on_event(&EngineEvent::Compaction {
                    status: CompactionStatus::InProgress,
                    folded_messages: folded,
                });
                match self.summarizer.summarize(existing, &span).await {
                    Ok(summary) => {
                        self.remember_summarized(input_key);
                        events.on_event(&EngineEvent::Compaction {
                            status: CompactionStatus::Complete,
                            folded_messages: folded,
                        });
                        (Some(summary), true)
                    }
                    Err(e) => {
                        warn!("Summarization failed, keeping recent messages only: {e}");
                        events.on_event(&EngineEvent::Compaction {
                            status: CompactionStatus::Failed,
                            folded_messages: folded,
                        });
                        return CompactionOutcome {
                            messages: repair_tool_pairing(suffix),
                            summary: existing.map(str::to_string),
                            compressed,
                            summarized: true,
                            summary_failed: true,
                        };
                    }
                }
            }
        };

        let mut messages = Vec::with_capacity(suffix.len() + 1);
        if let Some(summary) = &summary {
            let budget = input_chars.saturating_sub(suffix_chars);
            if let Some(msg) = bounded_summary_message(summary, budget) {
                messages.push(msg);
            }
        }
        messages.extend(suffix);

        CompactionOutcome {
            messages: repair_tool_pairing(messages),
            summary,
            compressed,
            summarized,
            summary_failed: false,
        }
    }

    /// Record the failures of a finished call in the ledger.
    ///
    /// Failures reported by the tool wrapper are logged with their clean
    /// error text. Error-classified tool results among `new_messages` are
    /// marked as logged so later compactions don't count them again; those
    /// from tools without a reported failure (a tool returning an error
    /// result instead of failing) are logged from their content.
    pub fn record_call_errors(
        &self,
        new_messages: &[Message],
        failures: &[ToolFailure],
        ledger: &Mutex<ErrorLedger>,
    ) {
        let failed_tools: HashSet<&str> = failures.iter().map(|f| f.tool.as_str()).collect();
        if let Ok(mut ledger) = ledger.lock() {
            for failure in failures {
                ledger.log(Some(&failure.tool), &failure.error, failure.context.as_deref());
            }
        }

        let unreported: Vec<Message> = new_messages
            .iter()
            .filter(|m| is_error_message(m))
            .filter(|m| {
                let reported = m.name.as_deref().is_some_and(|n| failed_tools.contains(n));
                if reported {
                    self.mark_logged(m);
                }
                !reported
            })
            .cloned()
            .collect();
        self.log_errors(&unreported, ledger);
    }

    fn remember_summarized(&self, key: InputKey) {
        *self
            .last_summarized
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(key);
    }

    /// Forget logged errors whose messages are no longer in `messages`.
    fn retain_logged(&self, messages: &[Message]) {
        let live: HashSet<u64> = messages
            .iter()
            .filter(|m| is_error_message(m))
            .map(error_fingerprint)
            .collect();
        self.logged_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|fp| live.contains(fp));
    }

    fn mark_logged(&self, msg: &Message) -> bool {
        match self.logged_errors.lock() {
            Ok(mut seen) => seen.insert(error_fingerprint(msg)),
            Err(_) => true,
        }
    }

    fn log_errors(&self, errors: &[Message], ledger: &Mutex<ErrorLedger>) {
        let fresh: Vec<&Message> = errors.iter().filter(|m| self.mark_logged(m)).collect();
        if fresh.is_empty() {
            return;
        }
        if let Ok(mut ledger) = ledger.lock() {
            for msg in fresh {
                ledger.log(msg.name.as_deref(), msg.text().trim(), None);
            }
        }
    }
}

/// The synthetic summary message, truncated to at most `budget` characters.
/// `None` when not even the header fits.
fn bounded_summary_message(summary: &str, budget: usize) -> Option<Message> {
    let header_len = Message::summary("").char_len();
    if budget <= header_len {
        debug!("No room for the summary message ({budget} chars available)");
        return None;
    }
    let full = Message::summary(summary);
    if full.char_len() <= budget {
        return Some(full);
    }
    Some(Message::summary(truncate_chars(summary, budget - header_len)))
}

/// Drop tool results whose call does not appear in an earlier assistant
/// message of the list.
pub fn repair_tool_pairing(messages: Vec<Message>) -> Vec<Message> {
    let mut known_calls: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.role {
            MessageRole::Assistant => {
                for tc in msg.tool_calls.iter().flatten() {
                    known_calls.insert(tc.id.clone());
                }
                out.push(msg);
            }
            MessageRole::Tool => {
                let paired = msg
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| known_calls.contains(id));
                if paired {
                    out.push(msg);
                } else {
                    debug!("Dropping orphan tool result {:?}", msg.tool_call_id);
                }
            }
            _ => out.push(msg),
        }
    }
    out
}

/// Whether every tool result in `messages` answers an earlier call.
pub fn is_well_paired(messages: &[Message]) -> bool {
    let mut seen = HashSet::new();
    for msg in messages {
        match msg.role {
            MessageRole::Assistant => {
                seen.extend(msg.tool_calls.iter().flatten().map(|tc| tc.id.as_str()));
            }
            MessageRole::Tool => {
                let paired = msg
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| seen.contains(id));
                if !paired {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::agent::events::{FnEventHandler, NoopHandler};
    use crate::context::summarizer::SummaryFuture;
    use crate::error::ModelError;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSummarizer {
        calls: AtomicU32,
        fail: bool,
        spans: Mutex<Vec<Vec<Message>>>,
    }

    impl CountingSummarizer {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail,
                spans: Mutex::new(Vec::new()),
            })
        }
    }

    impl Summarizer for CountingSummarizer {
        fn summarize<'a>(
            &'a self,
            existing: Option<&'a str>,
            span: &'a [Message],
        ) -> SummaryFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.spans.lock().unwrap().push(span.to_vec());
                if self.fail {
                    return Err(ModelError::Other("summarizer down".into()));
                }
                Ok(format!(
                    "{}summary of {} messages",
                    existing.map(|e| format!("{e}; ")).unwrap_or_default(),
                    span.len()
                ))
            })
        }
    }

    fn conversation(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("question {i} about the build"))
                } else {
                    Message::assistant_text(format!("answer {i} with some detail"))
                }
            })
            .collect()
    }

    fn request(messages: &[Message], max: usize) -> CompactionRequest<'_> {
        CompactionRequest {
            messages,
            summary: None,
            max_messages: max,
            token_budget: 100_000,
        }
    }

    #[tokio::test]
    async fn forty_messages_become_summary_plus_fifteen() {
        let summarizer = CountingSummarizer::new(false);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer.clone());
        let ledger = Mutex::new(ErrorLedger::default());
        let messages = conversation(40);

        let out = compactor
            .compact(request(&messages, 30), &ledger, &NoopHandler)
            .await;

        assert_eq!(out.messages.len(), 16);
        assert!(out.messages[0].is_summary());
        assert_eq!(out.messages[1..], messages[25..]);
        assert_eq!(out.summary.as_deref(), Some("summary of 25 messages"));
        assert_eq!(out.compressed, 0);
        assert!(out.summarized);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unchanged_list_is_summarized_once() {
        let summarizer = CountingSummarizer::new(false);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer.clone());
        let ledger = Mutex::new(ErrorLedger::default());
        let messages = conversation(40);

        let first = compactor
            .compact(request(&messages, 30), &ledger, &NoopHandler)
            .await;
        let second = compactor
            .compact(
                CompactionRequest {
                    summary: first.summary.as_deref(),
                    ..request(&messages, 30)
                },
                &ledger,
                &NoopHandler,
            )
            .await;

        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
        assert!(!second.summarized);
        assert_eq!(second.messages, first.messages);
    }

    #[tokio::test]
    async fn small_lists_pass_through() {
        let summarizer = CountingSummarizer::new(false);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer.clone());
        let ledger = Mutex::new(ErrorLedger::default());
        let messages = conversation(10);

        let out = compactor
            .compact(request(&messages, 30), &ledger, &NoopHandler)
            .await;
        assert_eq!(out.messages, messages);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn token_budget_triggers_summarization() {
        let summarizer = CountingSummarizer::new(false);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer.clone());
        let ledger = Mutex::new(ErrorLedger::default());
        let messages: Vec<Message> = (0..8).map(|_| Message::user("u".repeat(1000))).collect();

        let out = compactor
            .compact(
                CompactionRequest {
                    token_budget: 1000,
                    ..request(&messages, 6)
                },
                &ledger,
                &NoopHandler,
            )
            .await;
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.messages.len(), 4);
    }

    #[tokio::test]
    async fn kept_suffix_never_starts_with_tool_result() {
        let summarizer = CountingSummarizer::new(false);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer.clone());
        let ledger = Mutex::new(ErrorLedger::default());

        let mut messages = conversation(6);
        messages.push(Message::assistant_tool_calls(vec![ToolCall::new(
            "c1", "ls", "{}",
        )]));
        messages.push(Message::tool_result("c1", "ls", "a.txt"));
        messages.push(Message::tool_result("c1", "ls", "b.txt"));
        messages.push(Message::assistant_text("done listing"));
        messages.push(Message::user("thanks"));

        let out = compactor
            .compact(request(&messages, 8), &ledger, &NoopHandler)
            .await;

        assert!(out.messages[0].is_summary());
        assert_ne!(out.messages[1].role, MessageRole::Tool);
        assert!(is_well_paired(&out.messages));
        assert_eq!(out.messages.len(), 3);
    }

    #[tokio::test]
    async fn errors_go_to_ledger_not_summary() {
        let summarizer = CountingSummarizer::new(false);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer.clone());
        let ledger = Mutex::new(ErrorLedger::default());

        let mut messages = vec![
            Message::user("run the tests"),
            Message::assistant_tool_calls(vec![ToolCall::new("c1", "bash", r#"{"command":"cargo test"}"#)]),
            Message::tool_result("c1", "bash", "error[E0425]: cannot find value `x`"),
        ];
        messages.extend(conversation(10));

        compactor
            .compact(request(&messages, 4), &ledger, &NoopHandler)
            .await;

        let ledger = ledger.lock().unwrap();
        assert_eq!(ledger.len(), 1);
        let entry = ledger.entries().next().unwrap();
        assert_eq!(entry.tool_name.as_deref(), Some("bash"));
        assert!(entry.error.contains("E0425"));

        let spans = summarizer.spans.lock().unwrap();
        assert!(spans[0].iter().all(|m| !m.text().contains("E0425")));
    }

    #[tokio::test]
    async fn errors_are_logged_once_across_compactions() {
        let summarizer = CountingSummarizer::new(false);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer);
        let ledger = Mutex::new(ErrorLedger::default());
        let messages = vec![
            Message::assistant_tool_calls(vec![ToolCall::new("c1", "bash", "{}")]),
            Message::tool_result("c1", "bash", "exception: boom"),
        ];

        for _ in 0..3 {
            compactor
                .compact(request(&messages, 30), &ledger, &NoopHandler)
                .await;
        }
        let ledger = ledger.lock().unwrap();
        assert_eq!(ledger.entries().next().unwrap().occurrence_count, 1);
    }

    #[tokio::test]
    async fn error_messages_stay_byte_identical() {
        let summarizer = CountingSummarizer::new(false);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer);
        let ledger = Mutex::new(ErrorLedger::default());
        let huge_error = format!("Command failed\n{}", "stack frame\n".repeat(800));
        let mut messages = conversation(4);
        messages.push(Message::assistant_tool_calls(vec![ToolCall::new("c9", "bash", "{}")]));
        messages.push(Message::tool_result("c9", "bash", huge_error.clone()));

        let out = compactor
            .compact(request(&messages, 30), &ledger, &NoopHandler)
            .await;
        let kept = out
            .messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c9"))
            .unwrap();
        assert_eq!(kept.text(), huge_error);
    }

    #[tokio::test]
    async fn summarizer_failure_falls_back_to_suffix() {
        let summarizer = CountingSummarizer::new(true);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer);
        let ledger = Mutex::new(ErrorLedger::default());
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let recorded = statuses.clone();
        let handler = FnEventHandler::new(move |event| {
            if let EngineEvent::Compaction { status, .. } = event {
                recorded.lock().unwrap().push(*status);
            }
            None
        });
        let messages = conversation(40);

        let out = compactor
            .compact(
                CompactionRequest {
                    summary: Some("older summary"),
                    ..request(&messages, 30)
                },
                &ledger,
                &handler,
            )
            .await;

        assert_eq!(out.messages, messages[25..]);
        assert!(out.summary_failed);
        assert_eq!(out.summary.as_deref(), Some("older summary"));
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                CompactionStatus::Starting,
                CompactionStatus::InProgress,
                CompactionStatus::Failed
            ]
        );
    }

    #[tokio::test]
    async fn output_never_grows() {
        let summarizer = CountingSummarizer::new(false);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer);
        let ledger = Mutex::new(ErrorLedger::default());

        for n in [1usize, 5, 31, 40, 64] {
            for max in [2usize, 4, 30] {
                let messages: Vec<Message> = (0..n).map(|i| Message::user(i.to_string())).collect();
                let out = compactor
                    .compact(request(&messages, max), &ledger, &NoopHandler)
                    .await;
                assert!(out.messages.len() <= messages.len(), "n={n} max={max}");
                assert!(
                    total_chars(&out.messages) <= total_chars(&messages),
                    "n={n} max={max}"
                );
            }
        }
    }

    #[tokio::test]
    async fn call_errors_are_not_double_counted() {
        let summarizer = CountingSummarizer::new(false);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer);
        let ledger = Mutex::new(ErrorLedger::default());
        let new_messages = vec![
            Message::assistant_tool_calls(vec![ToolCall::new("c1", "bash", "{}")]),
            Message::tool_result("c1", "bash", "Error: exit 1").with_error_flag(true),
        ];
        let failures = vec![ToolFailure {
            tool: "bash".into(),
            error: "exit 1".into(),
            context: None,
            attempts: 3,
        }];

        compactor.record_call_errors(&new_messages, &failures, &ledger);
        compactor
            .compact(request(&new_messages, 30), &ledger, &NoopHandler)
            .await;

        let ledger = ledger.lock().unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.entries().next().unwrap().error, "exit 1");
    }

    #[tokio::test]
    async fn same_length_new_history_is_summarized_again() {
        let summarizer = CountingSummarizer::new(false);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer.clone());
        let ledger = Mutex::new(ErrorLedger::default());
        let first: Vec<Message> = conversation(40);
        let second: Vec<Message> = (0..40)
            .map(|i| Message::user(format!("later turn {i}")))
            .collect();

        let out = compactor
            .compact(request(&first, 30), &ledger, &NoopHandler)
            .await;
        let out = compactor
            .compact(
                CompactionRequest {
                    summary: out.summary.as_deref(),
                    ..request(&second, 30)
                },
                &ledger,
                &NoopHandler,
            )
            .await;

        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 2);
        assert!(out.summarized);
        let spans = summarizer.spans.lock().unwrap();
        assert!(spans[1].iter().any(|m| m.text() == "later turn 0"));
    }

    #[tokio::test]
    async fn reuse_only_spans_consecutive_calls() {
        let summarizer = CountingSummarizer::new(false);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer.clone());
        let ledger = Mutex::new(ErrorLedger::default());
        let long = conversation(40);
        let short = conversation(4);

        let out = compactor
            .compact(request(&long, 30), &ledger, &NoopHandler)
            .await;
        compactor
            .compact(request(&short, 30), &ledger, &NoopHandler)
            .await;
        compactor
            .compact(
                CompactionRequest {
                    summary: out.summary.as_deref(),
                    ..request(&long, 30)
                },
                &ledger,
                &NoopHandler,
            )
            .await;

        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn logged_errors_follow_the_history() {
        let summarizer = CountingSummarizer::new(false);
        let compactor = Compactor::new(CompactionConfig::default(), summarizer);
        let ledger = Mutex::new(ErrorLedger::default());
        let with_error = vec![
            Message::assistant_tool_calls(vec![ToolCall::new("c1", "bash", "{}")]),
            Message::tool_result("c1", "bash", "exception: boom"),
        ];

        compactor
            .compact(request(&with_error, 30), &ledger, &NoopHandler)
            .await;
        assert_eq!(compactor.logged_errors.lock().unwrap().len(), 1);

        compactor
            .compact(request(&conversation(4), 30), &ledger, &NoopHandler)
            .await;
        assert!(compactor.logged_errors.lock().unwrap().is_empty());
    }
}
