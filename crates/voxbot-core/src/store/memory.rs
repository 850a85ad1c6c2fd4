use std::sync::Mutex;

use async_trait::async_trait;

use super::{AttemptRow, IncidentRow, LlmCallRow, Store};
use crate::coord::LockEvent;

/// Store kept entirely in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub runs: Mutex<Vec<(String, String)>>,
    pub bots: Mutex<Vec<(String, String)>>,
    pub bot_states: Mutex<Vec<(String, String)>>,
    pub attempts: Mutex<Vec<AttemptRow>>,
    pub llm_calls: Mutex<Vec<LlmCallRow>>,
    pub lock_events: Mutex<Vec<LockEvent>>,
    pub incidents: Mutex<Vec<IncidentRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn incident_categories(&self) -> Vec<String> {
        self.incidents
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.category.clone())
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn record_run(&self, run_id: &str, config_json: &str) -> anyhow::Result<()> {
        self.runs
            .lock()
            .unwrap()
            .push((run_id.to_string(), config_json.to_string()));
        Ok(())
    }

    async fn record_bot(&self, run_id: &str, bot_id: &str) -> anyhow::Result<()> {
        self.bots
            .lock()
            .unwrap()
            .push((run_id.to_string(), bot_id.to_string()));
        Ok(())
    }

    async fn record_bot_state(&self, bot_id: &str, snapshot_json: &str) -> anyhow::Result<()> {
        self.bot_states
            .lock()
            .unwrap()
            .push((bot_id.to_string(), snapshot_json.to_string()));
        Ok(())
    }

    async fn record_attempt(&self, attempt: &AttemptRow) -> anyhow::Result<()> {
        self.attempts.lock().unwrap().push(attempt.clone());
        Ok(())
    }

    async fn record_llm_call(&self, call: &LlmCallRow) -> anyhow::Result<()> {
        self.llm_calls.lock().unwrap().push(call.clone());
        Ok(())
    }

    async fn record_lock_event(&self, event: &LockEvent) -> anyhow::Result<()> {
        self.lock_events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn record_incident(&self, incident: &IncidentRow) -> anyhow::Result<()> {
        self.incidents.lock().unwrap().push(incident.clone());
        Ok(())
    }
}
