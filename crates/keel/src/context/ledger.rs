//! Deduplicated log of recent tool and step failures.
//!
//! The ledger lives beside the message history, not inside it. Errors are
//! pulled out of the message stream before summarization and rendered into
//! the system prompt on every call, so the model keeps seeing its recent
//! mistakes even after the messages that carried them are compacted away.
//!
//! Identity is `(tool_name, error)` within a trailing window: logging the
//! same pair again inside the window bumps `occurrence_count` and refreshes
//! the timestamp instead of adding an entry.

use crate::truncate_chars;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// Maximum characters of error text rendered per entry.
const FORMAT_ERROR_CHARS: usize = 500;

/// Ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    /// Entries kept; the oldest are dropped first.
    pub capacity: usize,
    /// Window in which identical errors are merged.
    pub dedup_window_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            dedup_window_secs: 60,
        }
    }
}

/// One deduplicated failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub tool_name: Option<String>,
    pub error: String,
    pub context: Option<String>,
    pub occurrence_count: u32,
}

/// Capped ring buffer of [`ErrorEntry`]s, ordered oldest to newest by
/// last occurrence.
#[derive(Debug, Default)]
pub struct ErrorLedger {
    entries: VecDeque<ErrorEntry>,
    config: LedgerConfig,
}

impl ErrorLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            entries: VecDeque::with_capacity(config.capacity),
            config,
        }
    }

    /// Record a failure now.
    pub fn log(&mut self, tool_name: Option<&str>, error: &str, context: Option<&str>) {
        self.log_at(Utc::now(), tool_name, error, context);
    }

    /// Record a failure observed at `now`.
    pub fn log_at(
        &mut self,
        now: DateTime<Utc>,
        tool_name: Option<&str>,
        error: &str,
        context: Option<&str>,
    ) {
        let window_secs = self.config.dedup_window_secs.min(u64::from(u32::MAX)) as i64;
        let window = Duration::seconds(window_secs);
        let existing = self.entries.iter().rposition(|e| {
            e.tool_name.as_deref() == tool_name
                && e.error == error
                && now.signed_duration_since(e.timestamp) <= window
        });

        let entry = match existing.and_then(|idx| self.entries.remove(idx)) {
            Some(mut entry) => {
                entry.occurrence_count += 1;
                entry.timestamp = now;
                if let Some(ctx) = context {
                    entry.context = Some(ctx.to_string());
                }
                debug!(
                    "Error ledger: repeated error from {} (x{})",
                    tool_name.unwrap_or("step"),
                    entry.occurrence_count
                );
                entry
            }
            None => {
                debug!("Error ledger: new error from {}", tool_name.unwrap_or("step"));
                ErrorEntry {
                    timestamp: now,
                    tool_name: tool_name.map(str::to_string),
                    error: error.to_string(),
                    context: context.map(str::to_string),
                    occurrence_count: 1,
                }
            }
        };

        self.entries.push_back(entry);
        while self.entries.len() > self.config.capacity {
            self.entries.pop_front();
        }
    }

    /// The `n` most recent entries, most repeated first, then newest first.
    pub fn recent(&self, n: usize) -> Vec<ErrorEntry> {
        let skip = self.entries.len().saturating_sub(n);
        let mut recent: Vec<ErrorEntry> = self.entries.iter().skip(skip).cloned().collect();
        recent.sort_by(|a, b| {
            b.occurrence_count
                .cmp(&a.occurrence_count)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        recent
    }

    /// Render the ledger as a prompt section. Empty when there are no entries.
    pub fn format(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Recent Errors — Do NOT Repeat These\n\n```\n");
        for entry in self.recent(self.entries.len()) {
            let tool = entry.tool_name.as_deref().unwrap_or("step");
            let error = entry.error.trim();
            let shown = truncate_chars(error, FORMAT_ERROR_CHARS);
            out.push_str(&format!("[{tool}] x{}: {shown}", entry.occurrence_count));
            if shown.len() < error.len() {
                out.push_str(" ...");
            }
            out.push('\n');
            if let Some(ctx) = &entry.context {
                out.push_str(&format!("  context: {}\n", truncate_chars(ctx, 200)));
            }
        }
        out.push_str("```");
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, oldest to newest.
    pub fn entries(&self) -> impl Iterator<Item = &ErrorEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
