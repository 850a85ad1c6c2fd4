//! Deterministic fallback planner: a pure function of the snapshot used
//! whenever the LLM is unavailable, rate limited, or produced garbage.

use serde_json::json;

use super::schema::PlanResponse;
use crate::agent::adapter::Position;
use crate::agent::guard::{FeasibilityGuard, DEFAULT_DESIRED_INCREMENT};
use crate::agent::snapshot::Snapshot;
use crate::agent::subgoal::{Subgoal, SubgoalName};

const LOW_HEALTH_THRESHOLD: f64 = 8.0;
const INVENTORY_PRESSURE_LOAD: u32 = 120;
const HOSTILE_PANIC_DISTANCE: f64 = 10.0;

pub fn fallback_plan(
    guard: &FeasibilityGuard,
    snapshot: &Snapshot,
    reason: &str,
    base_position: Position,
    game_version: &str,
) -> PlanResponse {
    let mut response = if snapshot.player.health <= LOW_HEALTH_THRESHOLD {
        PlanResponse {
            next_goal: "retreat to base and recover".to_string(),
            subgoals: vec![
                goto_base(base_position),
                Subgoal::new(SubgoalName::CombatGuard)
                    .with_param("radius", json!(12))
                    .with_param("duration", json!(6_000)),
            ],
            risk_flags: vec!["LOW_HEALTH".to_string()],
            constraints: Default::default(),
        }
    } else if snapshot.inventory_summary.load() >= INVENTORY_PRESSURE_LOAD {
        PlanResponse {
            next_goal: "return to base and deposit".to_string(),
            subgoals: vec![
                goto_base(base_position),
                Subgoal::new(SubgoalName::Deposit)
                    .with_param("strategy", json!("all_non_essential")),
            ],
            risk_flags: vec!["INVENTORY_PRESSURE".to_string()],
            constraints: Default::default(),
        }
    } else if snapshot
        .nearest_hostile_distance()
        .is_some_and(|d| d < HOSTILE_PANIC_DISTANCE)
    {
        PlanResponse {
            next_goal: "clear nearby hostiles".to_string(),
            subgoals: vec![Subgoal::new(SubgoalName::CombatEngage)
                .with_param("max_targets", json!(2))
                .with_param("max_distance", json!(18))],
            risk_flags: vec!["HOSTILES_NEARBY".to_string()],
            constraints: Default::default(),
        }
    } else {
        let progression = guard.progression_plan(snapshot, DEFAULT_DESIRED_INCREMENT);
        PlanResponse {
            next_goal: progression.reason,
            subgoals: progression.subgoals,
            risk_flags: vec![],
            constraints: Default::default(),
        }
    };

    response
        .constraints
        .insert("fallback_reason".to_string(), json!(reason));
    response
        .constraints
        .insert("game_version".to_string(), json!(game_version));
    response
}

fn goto_base(base: Position) -> Subgoal {
    Subgoal::new(SubgoalName::Goto)
        .with_param("x", json!(base.x.round() as i64))
        .with_param("y", json!(base.y.round() as i64))
        .with_param("z", json!(base.z.round() as i64))
        .with_param("range", json!(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::test_support::{hostile, inventory_with, resource, snapshot};
    use std::sync::Arc;

    fn guard() -> FeasibilityGuard {
        FeasibilityGuard::new(Arc::new(Catalog::builtin()))
    }

    fn base() -> Position {
        Position::new(10.0, 64.0, -20.0)
    }

    #[test]
    fn low_health_retreats_and_guards() {
        let mut snap = snapshot("alpha");
        snap.player.health = 6.0;
        // Low health wins even with hostiles close by.
        snap.nearby_summary.hostiles.push(hostile("zombie", 4.0));
        let plan = fallback_plan(&guard(), &snap, "PLANNER_ERROR:test", base(), "1.20");
        assert!(plan.risk_flags.contains(&"LOW_HEALTH".to_string()));
        assert_eq!(plan.subgoals[0].name, SubgoalName::Goto);
        assert_eq!(plan.subgoals[0].param_i64("x"), Some(10));
        assert_eq!(plan.subgoals[1].name, SubgoalName::CombatGuard);
        assert_eq!(plan.subgoals[1].param_i64("duration"), Some(6_000));
        assert_eq!(
            plan.constraints.get("fallback_reason"),
            Some(&json!("PLANNER_ERROR:test"))
        );
    }

    #[test]
    fn inventory_pressure_deposits() {
        let mut snap = snapshot("alpha");
        snap.inventory_summary = inventory_with(&[("cobblestone", 0)]);
        snap.inventory_summary.blocks = 90;
        snap.inventory_summary
            .key_items
            .insert("oak_log".to_string(), 40);
        let plan = fallback_plan(&guard(), &snap, "RATE_LIMIT_BOT_CAP", base(), "1.20");
        assert!(plan.risk_flags.contains(&"INVENTORY_PRESSURE".to_string()));
        assert_eq!(plan.subgoals[1].name, SubgoalName::Deposit);
        assert_eq!(
            plan.subgoals[1].param_str("strategy"),
            Some("all_non_essential")
        );
    }

    #[test]
    fn close_hostiles_trigger_engage() {
        let mut snap = snapshot("alpha");
        snap.nearby_summary.hostiles.push(hostile("skeleton", 7.5));
        let plan = fallback_plan(&guard(), &snap, "RATE_LIMIT_GLOBAL_CAP", base(), "1.20");
        assert!(plan.risk_flags.contains(&"HOSTILES_NEARBY".to_string()));
        assert_eq!(plan.subgoals.len(), 1);
        assert_eq!(plan.subgoals[0].name, SubgoalName::CombatEngage);
        assert_eq!(plan.subgoals[0].param_i64("max_distance"), Some(18));
    }

    #[test]
    fn distant_hostiles_fall_through_to_progression() {
        let mut snap = snapshot("alpha");
        snap.nearby_summary.hostiles.push(hostile("creeper", 15.0));
        snap.nearby_summary.resources.push(resource("oak_log", 5.0));
        let plan = fallback_plan(&guard(), &snap, "PLANNER_ERROR:x", base(), "1.20");
        assert!(plan.risk_flags.is_empty());
        assert_eq!(plan.next_goal, "gather_oak_log");
    }

    #[test]
    fn empty_world_explores() {
        let snap = snapshot("alpha");
        let plan = fallback_plan(&guard(), &snap, "PLANNER_ERROR:x", base(), "1.20");
        assert_eq!(plan.next_goal, "explore_for_resources");
        assert_eq!(plan.subgoals[0].name, SubgoalName::Explore);
    }
}
