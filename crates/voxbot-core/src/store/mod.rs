//! Append-only persistence for runs, attempts, planner calls, lock events
//! and incidents. Controllers treat writes as fire-and-forget in ordering
//! terms, but each attempt is persisted before its successor dispatches.

mod memory;
mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::coord::LockEvent;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AttemptRow {
    pub bot_id: String,
    pub subgoal_id: u64,
    pub subgoal_name: String,
    pub params_json: String,
    pub result_json: String,
    pub retry_count: u32,
    pub started_at_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LlmCallRow {
    pub bot_id: String,
    pub status: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub duration_ms: u64,
    pub notes_json: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct IncidentRow {
    pub bot_id: String,
    pub category: String,
    pub details: String,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn record_run(&self, run_id: &str, config_json: &str) -> anyhow::Result<()>;
    async fn record_bot(&self, run_id: &str, bot_id: &str) -> anyhow::Result<()>;
    async fn record_bot_state(&self, bot_id: &str, snapshot_json: &str) -> anyhow::Result<()>;
    async fn record_attempt(&self, attempt: &AttemptRow) -> anyhow::Result<()>;
    async fn record_llm_call(&self, call: &LlmCallRow) -> anyhow::Result<()>;
    async fn record_lock_event(&self, event: &LockEvent) -> anyhow::Result<()>;
    async fn record_incident(&self, incident: &IncidentRow) -> anyhow::Result<()>;
}
