//! File-backed [`StateStore`].
//!
//! Layout on disk:
//!
//! ```text
//! <root>/
//!   <session_id>/
//!     messages.jsonl   # one Message per line, in conversation order
//!     state.json       # summary, metadata, extension state
//! ```
//!
//! Messages are an append log: when a patch only extends the stored list,
//! the new tail is appended. Anything else (compaction replacing a prefix)
//! rewrites the log. Full rewrites and `state.json` go through a temp file
//! and a rename so readers never see a half-written file.

use super::{AgentState, StatePatch, StateStore, StoreFuture};
use crate::Message;
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

const MESSAGES_FILE: &str = "messages.jsonl";
const STATE_FILE: &str = "state.json";

/// Everything except messages, stored as a single JSON document.
#[derive(Serialize, Deserialize, Default)]
struct StateRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    extensions: Map<String, Value>,
}

/// Sessions stored as directories under a root directory.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !session_id.is_empty()
            && session_id != "."
            && session_id != ".."
            && !session_id.contains(['/', '\\']);
        if !valid {
            return Err(StoreError::Backend(format!(
                "invalid session id: {session_id:?}"
            )));
        }
        Ok(self.root.join(session_id))
    }

    async fn read_messages(dir: &Path) -> Result<Vec<Message>, StoreError> {
        let path = dir.join(MESSAGES_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }

    async fn read_row(dir: &Path) -> Result<StateRow, StoreError> {
        match tokio::fs::read_to_string(dir.join(STATE_FILE)).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateRow::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn encode_lines(messages: &[Message]) -> Result<String, StoreError> {
        let mut out = String::new();
        for msg in messages {
            out.push_str(&serde_json::to_string(msg)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// Atomic write: write to a temp file, then rename into place.
    async fn write_atomic(dir: &Path, file_name: &str, contents: &str) -> Result<(), StoreError> {
        let tmp_path = dir.join(format!(".{file_name}.tmp"));
        tokio::fs::write(&tmp_path, contents).await?;
        tokio::fs::rename(&tmp_path, dir.join(file_name)).await?;
        Ok(())
    }

    async fn write_messages(dir: &Path, messages: &[Message]) -> Result<(), StoreError> {
        let existing = Self::read_messages(dir).await?;
        if messages.len() >= existing.len() && messages[..existing.len()] == existing[..] {
            let tail = &messages[existing.len()..];
            if tail.is_empty() {
                return Ok(());
            }
            trace!("Appending {} message(s) to {}", tail.len(), dir.display());
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(MESSAGES_FILE))
                .await?;
            file.write_all(Self::encode_lines(tail)?.as_bytes()).await?;
            file.flush().await?;
            return Ok(());
        }
        debug!(
            "Rewriting message log in {} ({} -> {} messages)",
            dir.display(),
            existing.len(),
            messages.len()
        );
        Self::write_atomic(dir, MESSAGES_FILE, &Self::encode_lines(messages)?).await
    }
}

impl StateStore for FileStateStore {
    fn get_state<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, AgentState> {
        Box::pin(async move {
            let dir = self.session_dir(session_id)?;
            tokio::fs::create_dir_all(&dir).await?;
            let messages = Self::read_messages(&dir).await?;
            let row = Self::read_row(&dir).await?;
            Ok(AgentState {
                messages,
                summary: row.summary,
                metadata: row.metadata,
                extensions: row.extensions,
            })
        })
    }

    fn set_state<'a>(&'a self, session_id: &'a str, patch: StatePatch) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let dir = self.session_dir(session_id)?;
            tokio::fs::create_dir_all(&dir).await?;

            let StatePatch {
                messages,
                summary,
                metadata,
                extensions,
            } = patch;

            if let Some(messages) = messages {
                Self::write_messages(&dir, &messages).await?;
            }

            if summary.is_some() || metadata.is_some() || extensions.is_some() {
                let mut row = Self::read_row(&dir).await?;
                if let Some(summary) = summary {
                    row.summary = summary;
                }
                if let Some(metadata) = metadata {
                    row.metadata = metadata;
                }
                if let Some(extensions) = extensions {
                    row.extensions = extensions;
                }
                let json = serde_json::to_string_pretty(&row)?;
                Self::write_atomic(&dir, STATE_FILE, &json).await?;
            }
            Ok(())
        })
    }
}
