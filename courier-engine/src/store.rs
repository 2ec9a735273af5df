//! Session store contract and the in-memory implementation.

use crate::types::SessionId;
use crate::workflow::Workflow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("workflow encoding: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Per-session workflow persistence.
///
/// The engine loads before processing a turn and saves (or removes) after,
/// while holding that session's turn lock.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session: &SessionId) -> Result<Option<Workflow>, StoreError>;

    async fn save(&self, session: &SessionId, workflow: &Workflow) -> Result<(), StoreError>;

    async fn remove(&self, session: &SessionId) -> Result<(), StoreError>;

    /// Drops workflows whose `updated_at` is before `cutoff`. Returns how many.
    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    workflows: DashMap<SessionId, Workflow>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session: &SessionId) -> Result<Option<Workflow>, StoreError> {
        Ok(self.workflows.get(session).map(|entry| entry.value().clone()))
    }

    async fn save(&self, session: &SessionId, workflow: &Workflow) -> Result<(), StoreError> {
        self.workflows.insert(session.clone(), workflow.clone());
        Ok(())
    }

    async fn remove(&self, session: &SessionId) -> Result<(), StoreError> {
        self.workflows.remove(session);
        Ok(())
    }

    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.workflows.len();
        self.workflows
            .retain(|_, workflow| workflow.updated_at >= cutoff);
        Ok(before - self.workflows.len())
    }
}
