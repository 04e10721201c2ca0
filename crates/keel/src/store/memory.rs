//! In-memory [`StateStore`].

use super::{AgentState, StatePatch, StateStore, StoreFuture};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Sessions held in a `HashMap`. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    sessions: Arc<RwLock<HashMap<String, AgentState>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions created so far.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl StateStore for InMemoryStateStore {
    fn get_state<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, AgentState> {
        Box::pin(async move {
            if let Some(state) = self.sessions.read().await.get(session_id) {
                return Ok(state.clone());
            }
            let mut sessions = self.sessions.write().await;
            Ok(sessions.entry(session_id.to_string()).or_default().clone())
        })
    }

    fn set_state<'a>(&'a self, session_id: &'a str, patch: StatePatch) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut sessions = self.sessions.write().await;
            patch.apply_to(sessions.entry(session_id.to_string()).or_default());
            Ok(())
        })
    }
}
