//! Typed configuration. Every recognized option has a default so a partial
//! TOML file works; out-of-range values are clamped with a note rather than
//! rejected.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::agent::adapter::Position;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    pub bot_count: u32,
    pub bot_start_stagger_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_jitter_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            bot_count: 2,
            bot_start_stagger_ms: 1_500,
            reconnect_base_delay_ms: 5_000,
            reconnect_jitter_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub orch_tick_ms: u64,
    pub snapshot_refresh_ms: u64,
    pub snapshot_nearby_cache_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            orch_tick_ms: 50,
            snapshot_refresh_ms: 800,
            snapshot_nearby_cache_ms: 2_500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SkillsConfig {
    pub max_concurrent_skills: u32,
    pub subgoal_exec_timeout_ms: u64,
    pub subgoal_idle_stall_ms: u64,
    pub subgoal_retry_limit: u32,
    pub subgoal_retry_base_delay_ms: u64,
    pub subgoal_retry_max_delay_ms: u64,
    pub subgoal_loop_guard_repeats: u32,
    pub subgoal_failure_streak_window_ms: u64,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_skills: 2,
            subgoal_exec_timeout_ms: 180_000,
            subgoal_idle_stall_ms: 5_000,
            subgoal_retry_limit: 2,
            subgoal_retry_base_delay_ms: 1_500,
            subgoal_retry_max_delay_ms: 15_000,
            subgoal_loop_guard_repeats: 8,
            subgoal_failure_streak_window_ms: 180_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PlannerConfig {
    pub llm_history_limit: usize,
    pub planner_timeout_ms: u64,
    pub planner_max_retries: u32,
    pub planner_cooldown_ms: u64,
    pub planner_feasibility_reprompt_enabled: bool,
    pub planner_feasibility_reprompt_max_attempts: u32,
    pub llm_per_bot_hourly_cap: u32,
    pub llm_global_hourly_cap: u32,
    pub plan_prefetch_enabled: bool,
    pub plan_prefetch_min_interval_ms: u64,
    pub plan_prefetch_max_age_ms: u64,
    pub plan_prefetch_reserve_calls: u32,
    pub game_version: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            llm_history_limit: 8,
            planner_timeout_ms: 30_000,
            planner_max_retries: 2,
            planner_cooldown_ms: 4_000,
            planner_feasibility_reprompt_enabled: true,
            planner_feasibility_reprompt_max_attempts: 1,
            llm_per_bot_hourly_cap: 40,
            llm_global_hourly_cap: 160,
            plan_prefetch_enabled: true,
            plan_prefetch_min_interval_ms: 6_000,
            plan_prefetch_max_age_ms: 20_000,
            plan_prefetch_reserve_calls: 2,
            game_version: "1.20".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CoordinationConfig {
    pub max_concurrent_explorers: u32,
    pub lock_lease_ms: u64,
    pub lock_heartbeat_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            max_concurrent_explorers: 2,
            lock_lease_ms: 30_000,
            lock_heartbeat_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BaseConfig {
    pub base_x: i64,
    pub base_y: i64,
    pub base_z: i64,
    pub base_radius: u32,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            base_x: 0,
            base_y: 64,
            base_z: 0,
            base_radius: 16,
        }
    }
}

impl BaseConfig {
    pub fn position(&self) -> Position {
        Position::new(self.base_x as f64, self.base_y as f64, self.base_z as f64)
    }
}

/// Reflex thresholds kept configurable rather than retuned; defaults match
/// the long-observed values.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ReflexConfig {
    pub reflex_nightfall_dedup_ms: u64,
    pub reflex_stall_ticks: u32,
    pub reflex_probe_interval_ms: u64,
}

impl Default for ReflexConfig {
    fn default() -> Self {
        Self {
            reflex_nightfall_dedup_ms: 120_000,
            reflex_stall_ticks: 20,
            reflex_probe_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434/api/generate".to_string(),
            model: "mock".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Empty means in-memory only.
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub fleet: FleetConfig,
    #[serde(rename = "loop")]
    pub loop_cfg: LoopConfig,
    pub skills: SkillsConfig,
    pub planner: PlannerConfig,
    pub coordination: CoordinationConfig,
    pub base: BaseConfig,
    pub reflex: ReflexConfig,
    pub llm: LlmConfig,
    pub store: StoreConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let mut cfg: Config = toml::from_str(text).context("Failed to parse TOML")?;
        for note in cfg.clamp() {
            tracing::warn!(note, "config.clamped");
        }
        Ok(cfg)
    }

    /// Clamps out-of-range values in place, returning a note per change.
    pub fn clamp(&mut self) -> Vec<String> {
        let mut notes = Vec::new();
        let mut clamp_u32 = |value: &mut u32, lo: u32, hi: u32, name: &str| {
            let clamped = (*value).clamp(lo, hi);
            if clamped != *value {
                notes.push(format!("{name} clamped from {value} to {clamped}"));
                *value = clamped;
            }
        };
        clamp_u32(&mut self.fleet.bot_count, 1, 5, "bot_count");
        clamp_u32(
            &mut self.skills.max_concurrent_skills,
            1,
            5,
            "max_concurrent_skills",
        );
        if self.loop_cfg.orch_tick_ms == 0 {
            notes.push("orch_tick_ms clamped from 0 to 50".to_string());
            self.loop_cfg.orch_tick_ms = 50;
        }
        notes
    }
}

/// TOML config loader. Search order:
/// 1) `VOXBOT_CONFIG_DIR/<relative_path>`
/// 2) `./<relative_path>`
/// 3) `<crate_root>/../../config/<relative_path>` (repo-local convenience)
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn parse_from_file(relative_path: &str) -> anyhow::Result<Config> {
        let path = Self::resolve_path(relative_path)?;
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Config::from_toml_str(&text)
    }

    fn resolve_path(relative_path: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(relative_path);

        if let Some(root) = env::var_os("VOXBOT_CONFIG_DIR") {
            let candidate = PathBuf::from(root).join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        if let Ok(cwd) = env::current_dir() {
            let candidate = cwd.join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        let candidate = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .ancestors()
            .nth(2)
            .ok_or_else(|| anyhow::anyhow!("CARGO_MANIFEST_DIR has insufficient ancestors"))?
            .join("config")
            .join(rel);
        if candidate.is_file() {
            return Ok(candidate);
        }

        anyhow::bail!("Config file not found for {:?}", rel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.fleet.bot_count, 2);
        assert_eq!(cfg.loop_cfg.orch_tick_ms, 50);
        assert_eq!(cfg.skills.subgoal_exec_timeout_ms, 180_000);
        assert_eq!(cfg.skills.subgoal_idle_stall_ms, 5_000);
        assert_eq!(cfg.skills.subgoal_loop_guard_repeats, 8);
        assert_eq!(cfg.reflex.reflex_nightfall_dedup_ms, 120_000);
        assert_eq!(cfg.reflex.reflex_stall_ticks, 20);
    }

    #[test]
    fn sections_parse_with_spec_names() {
        let cfg = Config::from_toml_str(
            r#"
            [fleet]
            bot_count = 3
            bot_start_stagger_ms = 500

            [loop]
            orch_tick_ms = 25

            [skills]
            max_concurrent_skills = 4
            subgoal_retry_limit = 3

            [planner]
            llm_per_bot_hourly_cap = 24
            plan_prefetch_enabled = false

            [coordination]
            lock_lease_ms = 12000

            [base]
            base_x = 100
            base_y = 70
            base_z = -40
            "#,
        )
        .unwrap();
        assert_eq!(cfg.fleet.bot_count, 3);
        assert_eq!(cfg.loop_cfg.orch_tick_ms, 25);
        assert_eq!(cfg.skills.max_concurrent_skills, 4);
        assert_eq!(cfg.planner.llm_per_bot_hourly_cap, 24);
        assert!(!cfg.planner.plan_prefetch_enabled);
        assert_eq!(cfg.coordination.lock_lease_ms, 12_000);
        assert_eq!(cfg.base.position(), Position::new(100.0, 70.0, -40.0));
    }

    #[test]
    fn out_of_range_values_clamp_with_notes() {
        let mut cfg = Config::default();
        cfg.fleet.bot_count = 12;
        cfg.skills.max_concurrent_skills = 0;
        let notes = cfg.clamp();
        assert_eq!(cfg.fleet.bot_count, 5);
        assert_eq!(cfg.skills.max_concurrent_skills, 1);
        assert_eq!(notes.len(), 2);
    }
}
