use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::subgoal::{FailureCode, Params, SkillResult, SubgoalName};

use std::collections::BTreeMap;

/// One completed subgoal attempt, append-only.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HistoryEntry {
    pub timestamp_ms: u64,
    pub subgoal_name: SubgoalName,
    #[serde(default)]
    pub params: Params,
    pub outcome: String,
    #[serde(default)]
    pub error_code: Option<FailureCode>,
    #[serde(default)]
    pub error_details: Option<String>,
    #[serde(default)]
    pub inventory_delta: Option<BTreeMap<String, i64>>,
    pub health_delta: f64,
    pub duration_ms: u64,
}

impl HistoryEntry {
    pub fn from_result(
        timestamp_ms: u64,
        name: SubgoalName,
        params: Params,
        result: &SkillResult,
        inventory_delta: Option<BTreeMap<String, i64>>,
        health_delta: f64,
        duration_ms: u64,
    ) -> Self {
        let (outcome, error_code, error_details) = match result {
            SkillResult::Success { .. } => ("success".to_string(), None, None),
            SkillResult::Failure {
                error_code,
                details,
                ..
            } => ("failure".to_string(), Some(*error_code), Some(details.clone())),
        };
        Self {
            timestamp_ms,
            subgoal_name: name,
            params,
            outcome,
            error_code,
            error_details,
            inventory_delta,
            health_delta,
            duration_ms,
        }
    }
}

/// Bounded FIFO of recent attempts, oldest evicted first.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryBuffer {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(20)
    }
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn recent(&self, limit: usize) -> Vec<&HistoryEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::subgoal::Subgoal;

    fn entry(ts: u64) -> HistoryEntry {
        HistoryEntry::from_result(
            ts,
            SubgoalName::Collect,
            Subgoal::new(SubgoalName::Collect).params,
            &SkillResult::success("ok"),
            None,
            0.0,
            100,
        )
    }

    #[test]
    fn buffer_evicts_oldest_beyond_capacity() {
        let mut buf = HistoryBuffer::new(3);
        for ts in 0..5 {
            buf.push(entry(ts));
        }
        assert_eq!(buf.len(), 3);
        let stamps: Vec<u64> = buf.entries().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, vec![2, 3, 4]);
    }

    #[test]
    fn recent_returns_tail_in_order() {
        let mut buf = HistoryBuffer::new(10);
        for ts in 0..6 {
            buf.push(entry(ts));
        }
        let tail: Vec<u64> = buf.recent(2).iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(tail, vec![4, 5]);
    }

    #[test]
    fn failure_entry_carries_code_and_details() {
        let res = SkillResult::failure(FailureCode::PathfindFailed, "no path", true);
        let e = HistoryEntry::from_result(
            1,
            SubgoalName::Goto,
            Params::new(),
            &res,
            None,
            -2.0,
            50,
        );
        assert_eq!(e.outcome, "failure");
        assert_eq!(e.error_code, Some(FailureCode::PathfindFailed));
        assert_eq!(e.error_details.as_deref(), Some("no path"));
    }
}
