use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of subgoal names the planner may emit.
///
/// Anything outside this set is rejected at the planner response boundary;
/// the normalizer only rewrites parameter aliases, never names.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubgoalName {
    Explore,
    Goto,
    GotoNearest,
    Collect,
    Craft,
    Smelt,
    Deposit,
    Withdraw,
    BuildBlueprint,
    CombatEngage,
    CombatGuard,
}

pub static SUBGOAL_NAMES: &[SubgoalName] = &[
    SubgoalName::Explore,
    SubgoalName::Goto,
    SubgoalName::GotoNearest,
    SubgoalName::Collect,
    SubgoalName::Craft,
    SubgoalName::Smelt,
    SubgoalName::Deposit,
    SubgoalName::Withdraw,
    SubgoalName::BuildBlueprint,
    SubgoalName::CombatEngage,
    SubgoalName::CombatGuard,
];

impl SubgoalName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubgoalName::Explore => "explore",
            SubgoalName::Goto => "goto",
            SubgoalName::GotoNearest => "goto_nearest",
            SubgoalName::Collect => "collect",
            SubgoalName::Craft => "craft",
            SubgoalName::Smelt => "smelt",
            SubgoalName::Deposit => "deposit",
            SubgoalName::Withdraw => "withdraw",
            SubgoalName::BuildBlueprint => "build_blueprint",
            SubgoalName::CombatEngage => "combat_engage",
            SubgoalName::CombatGuard => "combat_guard",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        SUBGOAL_NAMES.iter().copied().find(|n| n.as_str() == name)
    }
}

impl fmt::Display for SubgoalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Params = BTreeMap<String, serde_json::Value>;

/// A single bounded task: a name from the closed set plus canonical params.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Subgoal {
    pub name: SubgoalName,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub success_criteria: Params,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub constraints: Params,
}

impl Subgoal {
    pub fn new(name: SubgoalName) -> Self {
        Self {
            name,
            params: Params::new(),
            success_criteria: Params::new(),
            risk_flags: Vec::new(),
            constraints: Params::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_u32(&self, key: &str) -> Option<u32> {
        self.params.get(key).and_then(|v| v.as_u64()).map(|v| v as u32)
    }

    pub fn param_i64(&self, key: &str) -> Option<i64> {
        self.params.get(key).and_then(|v| v.as_i64())
    }

    /// Canonical identity used for dedup and guard-rewrite comparison:
    /// name plus params plus success criteria, ignoring advisory fields.
    pub fn canonical_eq(&self, other: &Subgoal) -> bool {
        self.name == other.name
            && self.params == other.params
            && self.success_criteria == other.success_criteria
    }
}

/// A queued subgoal. A retry re-enqueues under a fresh id.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RuntimeSubgoal {
    pub id: u64,
    pub subgoal: Subgoal,
    pub assigned_at_ms: u64,
    #[serde(default)]
    pub retry_count: u32,
    /// Skipped by the queue until this wall-clock instant (ms since run start).
    #[serde(default)]
    pub not_before_ms: u64,
}

impl RuntimeSubgoal {
    pub fn ready(&self, now_ms: u64) -> bool {
        self.not_before_ms <= now_ms
    }
}

/// Closed set of structured skill failure codes.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    ResourceNotFound,
    PathfindFailed,
    NoToolAvailable,
    InventoryFull,
    InterruptedByHostiles,
    PlacementFailed,
    StuckTimeout,
    DependsOnItem,
    CombatLostTarget,
    BotDied,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            FailureCode::PathfindFailed => "PATHFIND_FAILED",
            FailureCode::NoToolAvailable => "NO_TOOL_AVAILABLE",
            FailureCode::InventoryFull => "INVENTORY_FULL",
            FailureCode::InterruptedByHostiles => "INTERRUPTED_BY_HOSTILES",
            FailureCode::PlacementFailed => "PLACEMENT_FAILED",
            FailureCode::StuckTimeout => "STUCK_TIMEOUT",
            FailureCode::DependsOnItem => "DEPENDS_ON_ITEM",
            FailureCode::CombatLostTarget => "COMBAT_LOST_TARGET",
            FailureCode::BotDied => "BOT_DIED",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one skill execution. A failure is data, not an `Err`:
/// the retry machinery needs the code and the retryable hint intact.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SkillResult {
    Success {
        details: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<serde_json::Value>,
    },
    Failure {
        error_code: FailureCode,
        details: String,
        retryable: bool,
    },
}

impl SkillResult {
    pub fn success(details: impl Into<String>) -> Self {
        SkillResult::Success {
            details: details.into(),
            metrics: None,
        }
    }

    pub fn failure(code: FailureCode, details: impl Into<String>, retryable: bool) -> Self {
        SkillResult::Failure {
            error_code: code,
            details: details.into(),
            retryable,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SkillResult::Success { .. })
    }

    pub fn error_code(&self) -> Option<FailureCode> {
        match self {
            SkillResult::Success { .. } => None,
            SkillResult::Failure { error_code, .. } => Some(*error_code),
        }
    }
}

/// Events that make the controller ask the planner for a new plan.
///
/// Set semantics: duplicates collapse. DEATH additionally clears the queue.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    Idle,
    SubgoalCompleted,
    SubgoalFailed,
    Attacked,
    Death,
    Stuck,
    Nightfall,
    InventoryFull,
    ToolMissing,
    Reconnect,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Idle => "IDLE",
            Trigger::SubgoalCompleted => "SUBGOAL_COMPLETED",
            Trigger::SubgoalFailed => "SUBGOAL_FAILED",
            Trigger::Attacked => "ATTACKED",
            Trigger::Death => "DEATH",
            Trigger::Stuck => "STUCK",
            Trigger::Nightfall => "NIGHTFALL",
            Trigger::InventoryFull => "INVENTORY_FULL",
            Trigger::ToolMissing => "TOOL_MISSING",
            Trigger::Reconnect => "RECONNECT",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subgoal_names_round_trip_via_parse() {
        for name in SUBGOAL_NAMES {
            assert_eq!(SubgoalName::parse(name.as_str()), Some(*name));
        }
        assert_eq!(SubgoalName::parse("teleport"), None);
    }

    #[test]
    fn subgoal_name_serde_uses_snake_case() {
        let v = serde_json::to_value(SubgoalName::GotoNearest).unwrap();
        assert_eq!(v, serde_json::json!("goto_nearest"));
    }

    #[test]
    fn failure_code_serde_uses_screaming_snake_case() {
        let v = serde_json::to_value(FailureCode::ResourceNotFound).unwrap();
        assert_eq!(v, serde_json::json!("RESOURCE_NOT_FOUND"));
    }

    #[test]
    fn canonical_eq_ignores_risk_flags() {
        let mut a = Subgoal::new(SubgoalName::Collect)
            .with_param("block", serde_json::json!("stone"))
            .with_param("count", serde_json::json!(10));
        let mut b = a.clone();
        a.risk_flags.push("LOW_HEALTH".to_string());
        assert!(a.canonical_eq(&b));
        b.params.insert("count".to_string(), serde_json::json!(11));
        assert!(!a.canonical_eq(&b));
    }

    #[test]
    fn runtime_subgoal_ready_gate() {
        let rt = RuntimeSubgoal {
            id: 1,
            subgoal: Subgoal::new(SubgoalName::Explore),
            assigned_at_ms: 0,
            retry_count: 0,
            not_before_ms: 500,
        };
        assert!(!rt.ready(499));
        assert!(rt.ready(500));
    }
}
