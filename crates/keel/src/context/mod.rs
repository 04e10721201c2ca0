//! Context management: keeping the model's input bounded.
//!
//! 1. **[`compress`]**: replaces oversized messages with restorable
//!    references (file path, command, tool name). No LLM call.
//!
//! 2. **[`summarizer`]**: folds older messages into a running summary with
//!    one LLM call, when compression alone isn't enough.
//!
//! 3. **[`ledger`]**: failures pulled out of the message stream and kept
//!    separately, so summarization can never lose them.
//!
//! [`compactor`] runs the phases in order; [`classify`] decides which
//! messages are errors.

pub mod classify;
pub mod compactor;
pub mod compress;
pub mod ledger;
pub mod summarizer;

pub use compactor::{
    CompactionConfig, CompactionOutcome, CompactionRequest, CompactionStatus, Compactor,
};
pub use ledger::{ErrorEntry, ErrorLedger, LedgerConfig};
pub use summarizer::{ModelSummarizer, Summarizer, SummarizerConfig};
