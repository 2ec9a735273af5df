//! SQLite-backed session store. Workflows are stored as JSON documents keyed
//! by session id; every call runs on the blocking pool.

use crate::store::{SessionStore, StoreError};
use crate::types::SessionId;
use crate::workflow::Workflow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS courier_workflows (
    session_id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    state TEXT NOT NULL,
    workflow_json TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL
)
"#;

#[derive(Clone)]
pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await?
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, session: &SessionId) -> Result<Option<Workflow>, StoreError> {
        let session = session.to_string();
        let json: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT workflow_json FROM courier_workflows WHERE session_id = ?1",
                        params![session],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, session: &SessionId, workflow: &Workflow) -> Result<(), StoreError> {
        let session = session.to_string();
        let workflow_id = workflow.id.to_string();
        let state = workflow.state.as_str();
        let json = serde_json::to_string(workflow)?;
        let updated_at_ms = workflow.updated_at.timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
INSERT INTO courier_workflows (session_id, workflow_id, state, workflow_json, updated_at_ms)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(session_id) DO UPDATE
SET workflow_id = excluded.workflow_id,
    state = excluded.state,
    workflow_json = excluded.workflow_json,
    updated_at_ms = excluded.updated_at_ms
"#,
                params![session, workflow_id, state, json, updated_at_ms],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, session: &SessionId) -> Result<(), StoreError> {
        let session = session.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM courier_workflows WHERE session_id = ?1",
                params![session],
            )?;
            Ok(())
        })
        .await
    }

    async fn purge_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff_ms = cutoff.timestamp_millis();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM courier_workflows WHERE updated_at_ms < ?1",
                params![cutoff_ms],
            )?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowState;

    #[tokio::test]
    async fn workflow_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.db");
        let session = SessionId::new("local");
        let mut wf = Workflow::new(session.clone(), "archive all emails from x", Utc::now());
        wf.context.set("draft_id", "draft-1");

        SqliteSessionStore::open(&path)
            .expect("open")
            .save(&session, &wf)
            .await
            .expect("save");

        let reopened = SqliteSessionStore::open(&path).expect("reopen");
        let loaded = reopened.load(&session).await.expect("load").expect("present");
        assert_eq!(loaded, wf);
        assert_eq!(loaded.state, WorkflowState::Proposed);
    }

    #[tokio::test]
    async fn save_overwrites_and_remove_deletes() {
        let store = SqliteSessionStore::open_in_memory().expect("open");
        let session = SessionId::new("s");
        let mut wf = Workflow::new(session.clone(), "a", Utc::now());
        store.save(&session, &wf).await.expect("save");
        wf.context.set("k", "v");
        store.save(&session, &wf).await.expect("save again");
        let loaded = store.load(&session).await.expect("load").expect("present");
        assert_eq!(loaded.context.version, 1);

        store.remove(&session).await.expect("remove");
        assert!(store.load(&session).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn purge_uses_updated_at() {
        let store = SqliteSessionStore::open_in_memory().expect("open");
        let now = Utc::now();
        let stale = Workflow::new(SessionId::new("stale"), "a", now - chrono::Duration::hours(48));
        let live = Workflow::new(SessionId::new("live"), "b", now);
        store.save(&stale.session_id, &stale).await.expect("save");
        store.save(&live.session_id, &live).await.expect("save");
        let purged = store
            .purge_stale(now - chrono::Duration::hours(24))
            .await
            .expect("purge");
        assert_eq!(purged, 1);
        assert!(store.load(&live.session_id).await.expect("load").is_some());
    }
}
