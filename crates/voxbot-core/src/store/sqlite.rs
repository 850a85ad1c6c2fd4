use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};

use super::{AttemptRow, IncidentRow, LlmCallRow, Store};
use crate::coord::LockEvent;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    config_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    bot_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bot_state (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bot_id TEXT NOT NULL,
    snapshot_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subgoal_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bot_id TEXT NOT NULL,
    subgoal_id INTEGER NOT NULL,
    subgoal_name TEXT NOT NULL,
    params_json TEXT NOT NULL,
    result_json TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    started_at_ms INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attempts_bot ON subgoal_attempts(bot_id, id);

CREATE TABLE IF NOT EXISTS llm_calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bot_id TEXT NOT NULL,
    status TEXT NOT NULL,
    tokens_in INTEGER NOT NULL,
    tokens_out INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    notes_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS locks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_key TEXT NOT NULL,
    owner_bot_id TEXT NOT NULL,
    action TEXT NOT NULL CHECK (action IN ('ACQUIRE','RELEASE','EXPIRE')),
    at_ms INTEGER NOT NULL,
    details_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS incidents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bot_id TEXT NOT NULL,
    category TEXT NOT NULL,
    details TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// SQLite-backed store. The connection lives behind a mutex and every write
/// hops to the blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open(path: PathBuf) -> anyhow::Result<Self> {
        let conn = tokio::task::spawn_blocking(move || -> anyhow::Result<Connection> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn exec<F>(&self, write: F) -> anyhow::Result<()>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<usize> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection poisoned");
            write(&conn)?;
            anyhow::Ok(())
        })
        .await?
    }

    pub fn count_rows(&self, table: &str) -> anyhow::Result<i64> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        let sql = format!("SELECT COUNT(*) FROM {table}");
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    }
}

fn now_string() -> String {
    Utc::now().to_rfc3339()
}

#[async_trait]
impl Store for SqliteStore {
    async fn record_run(&self, run_id: &str, config_json: &str) -> anyhow::Result<()> {
        let (run_id, config_json) = (run_id.to_string(), config_json.to_string());
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO runs (run_id, started_at, config_json) VALUES (?1, ?2, ?3)",
                params![run_id, now_string(), config_json],
            )
        })
        .await
    }

    async fn record_bot(&self, run_id: &str, bot_id: &str) -> anyhow::Result<()> {
        let (run_id, bot_id) = (run_id.to_string(), bot_id.to_string());
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO bots (run_id, bot_id, created_at) VALUES (?1, ?2, ?3)",
                params![run_id, bot_id, now_string()],
            )
        })
        .await
    }

    async fn record_bot_state(&self, bot_id: &str, snapshot_json: &str) -> anyhow::Result<()> {
        let (bot_id, snapshot_json) = (bot_id.to_string(), snapshot_json.to_string());
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO bot_state (bot_id, snapshot_json, created_at) VALUES (?1, ?2, ?3)",
                params![bot_id, snapshot_json, now_string()],
            )
        })
        .await
    }

    async fn record_attempt(&self, attempt: &AttemptRow) -> anyhow::Result<()> {
        let attempt = attempt.clone();
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO subgoal_attempts \
                 (bot_id, subgoal_id, subgoal_name, params_json, result_json, retry_count, started_at_ms, duration_ms, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    attempt.bot_id,
                    attempt.subgoal_id,
                    attempt.subgoal_name,
                    attempt.params_json,
                    attempt.result_json,
                    attempt.retry_count,
                    attempt.started_at_ms,
                    attempt.duration_ms,
                    now_string()
                ],
            )
        })
        .await
    }

    async fn record_llm_call(&self, call: &LlmCallRow) -> anyhow::Result<()> {
        let call = call.clone();
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO llm_calls (bot_id, status, tokens_in, tokens_out, duration_ms, notes_json, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    call.bot_id,
                    call.status,
                    call.tokens_in,
                    call.tokens_out,
                    call.duration_ms,
                    call.notes_json,
                    now_string()
                ],
            )
        })
        .await
    }

    async fn record_lock_event(&self, event: &LockEvent) -> anyhow::Result<()> {
        let event = event.clone();
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO locks (resource_key, owner_bot_id, action, at_ms, details_json, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.resource_key,
                    event.owner_bot_id,
                    event.action.as_str(),
                    event.at_ms,
                    event.details.to_string(),
                    now_string()
                ],
            )
        })
        .await
    }

    async fn record_incident(&self, incident: &IncidentRow) -> anyhow::Result<()> {
        let incident = incident.clone();
        self.exec(move |conn| {
            conn.execute(
                "INSERT INTO incidents (bot_id, category, details, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![incident.bot_id, incident.category, incident.details, now_string()],
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::LockAction;

    #[tokio::test]
    async fn rows_land_in_their_tables() -> anyhow::Result<()> {
        let store = SqliteStore::open_in_memory()?;
        store.record_run("run-1", "{}").await?;
        store.record_bot("run-1", "alpha").await?;
        store.record_bot_state("alpha", "{\"tick\":1}").await?;
        store
            .record_attempt(&AttemptRow {
                bot_id: "alpha".to_string(),
                subgoal_id: 1,
                subgoal_name: "collect".to_string(),
                params_json: "{}".to_string(),
                result_json: "{\"outcome\":\"success\"}".to_string(),
                retry_count: 0,
                started_at_ms: 1_000,
                duration_ms: 250,
            })
            .await?;
        store
            .record_llm_call(&LlmCallRow {
                bot_id: "alpha".to_string(),
                status: "SUCCESS".to_string(),
                tokens_in: 100,
                tokens_out: 40,
                duration_ms: 900,
                notes_json: "[]".to_string(),
            })
            .await?;
        store
            .record_lock_event(&LockEvent {
                resource_key: "resource:oak_log".to_string(),
                owner_bot_id: "alpha".to_string(),
                action: LockAction::Acquire,
                at_ms: 1_000,
                details: serde_json::json!({}),
            })
            .await?;
        store
            .record_incident(&IncidentRow {
                bot_id: "alpha".to_string(),
                category: "connection_end".to_string(),
                details: "kicked".to_string(),
            })
            .await?;

        for table in [
            "runs",
            "bots",
            "bot_state",
            "subgoal_attempts",
            "llm_calls",
            "locks",
            "incidents",
        ] {
            assert_eq!(store.count_rows(table)?, 1, "table {table}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn lock_action_check_constraint_holds() -> anyhow::Result<()> {
        let store = SqliteStore::open_in_memory()?;
        for action in [LockAction::Acquire, LockAction::Release, LockAction::Expire] {
            store
                .record_lock_event(&LockEvent {
                    resource_key: "k".to_string(),
                    owner_bot_id: "a".to_string(),
                    action,
                    at_ms: 0,
                    details: serde_json::Value::Null,
                })
                .await?;
        }
        assert_eq!(store.count_rows("locks")?, 3);
        Ok(())
    }
}
