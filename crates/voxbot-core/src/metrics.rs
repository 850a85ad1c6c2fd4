//! Fleet metrics: atomic counters plus a JSON export surface. Collection
//! is always on; exposition (HTTP or otherwise) is the embedder's problem.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct PlannerMetrics {
    pub success: AtomicU64,
    pub rate_limited: AtomicU64,
    pub fallback: AtomicU64,
    pub tokens_in: AtomicU64,
    pub tokens_out: AtomicU64,
    pub total_latency_ms: AtomicU64,
}

#[derive(Debug, Default)]
pub struct SkillMetrics {
    pub executions: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub total_duration_ms: AtomicU64,
    failures_by_code: Mutex<BTreeMap<String, u64>>,
    duration_by_name_ms: Mutex<BTreeMap<String, u64>>,
}

#[derive(Debug, Default)]
pub struct FleetGauges {
    pub bots_connected: AtomicU64,
    pub bots_busy: AtomicU64,
    pub queue_depth_total: AtomicU64,
    pub reconnects: AtomicU64,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    pub planner: PlannerMetrics,
    pub skills: SkillMetrics,
    pub fleet: FleetGauges,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_planner_outcome(&self, status: &str, tokens_in: u32, tokens_out: u32, latency_ms: u64) {
        match status {
            "SUCCESS" => self.planner.success.fetch_add(1, Ordering::Relaxed),
            "RATE_LIMITED" => self.planner.rate_limited.fetch_add(1, Ordering::Relaxed),
            _ => self.planner.fallback.fetch_add(1, Ordering::Relaxed),
        };
        self.planner
            .tokens_in
            .fetch_add(u64::from(tokens_in), Ordering::Relaxed);
        self.planner
            .tokens_out
            .fetch_add(u64::from(tokens_out), Ordering::Relaxed);
        self.planner
            .total_latency_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_subgoal_duration(&self, name: &str, duration_ms: u64, success: bool) {
        self.skills.executions.fetch_add(1, Ordering::Relaxed);
        if success {
            self.skills.successes.fetch_add(1, Ordering::Relaxed);
        }
        self.skills
            .total_duration_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        let mut by_name = self
            .skills
            .duration_by_name_ms
            .lock()
            .expect("metrics poisoned");
        *by_name.entry(name.to_string()).or_insert(0) += duration_ms;
    }

    pub fn record_subgoal_failure(&self, error_code: &str) {
        self.skills.failures.fetch_add(1, Ordering::Relaxed);
        let mut by_code = self
            .skills
            .failures_by_code
            .lock()
            .expect("metrics poisoned");
        *by_code.entry(error_code.to_string()).or_insert(0) += 1;
    }

    pub fn set_fleet_gauges(&self, connected: u64, busy: u64, queue_depth: u64) {
        self.fleet.bots_connected.store(connected, Ordering::Relaxed);
        self.fleet.bots_busy.store(busy, Ordering::Relaxed);
        self.fleet
            .queue_depth_total
            .store(queue_depth, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.fleet.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn to_json(&self) -> serde_json::Value {
        let failures_by_code = self
            .skills
            .failures_by_code
            .lock()
            .expect("metrics poisoned")
            .clone();
        let duration_by_name = self
            .skills
            .duration_by_name_ms
            .lock()
            .expect("metrics poisoned")
            .clone();
        serde_json::json!({
            "planner": {
                "success": self.planner.success.load(Ordering::Relaxed),
                "rate_limited": self.planner.rate_limited.load(Ordering::Relaxed),
                "fallback": self.planner.fallback.load(Ordering::Relaxed),
                "tokens_in": self.planner.tokens_in.load(Ordering::Relaxed),
                "tokens_out": self.planner.tokens_out.load(Ordering::Relaxed),
                "total_latency_ms": self.planner.total_latency_ms.load(Ordering::Relaxed),
            },
            "skills": {
                "executions": self.skills.executions.load(Ordering::Relaxed),
                "successes": self.skills.successes.load(Ordering::Relaxed),
                "failures": self.skills.failures.load(Ordering::Relaxed),
                "total_duration_ms": self.skills.total_duration_ms.load(Ordering::Relaxed),
                "failures_by_code": failures_by_code,
                "duration_by_name_ms": duration_by_name,
            },
            "fleet": {
                "bots_connected": self.fleet.bots_connected.load(Ordering::Relaxed),
                "bots_busy": self.fleet.bots_busy.load(Ordering::Relaxed),
                "queue_depth_total": self.fleet.queue_depth_total.load(Ordering::Relaxed),
                "reconnects": self.fleet.reconnects.load(Ordering::Relaxed),
            },
        })
    }
}
