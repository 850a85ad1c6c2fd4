//! Shared builders for unit tests. Compiled only for `cfg(test)`.

use crate::agent::adapter::Position;
use crate::agent::planner::schema::PlanRequest;
use crate::agent::snapshot::{
    DayPhase, HostileView, InventorySummary, NearbySummary, PlayerView, ResourceView, Snapshot,
    TaskContext, TimeView,
};

pub fn snapshot(bot_id: &str) -> Snapshot {
    Snapshot {
        bot_id: bot_id.to_string(),
        time: TimeView {
            tick: 100,
            phase: DayPhase::Day,
            time_of_day: 2_000,
        },
        player: PlayerView {
            position: Position::default(),
            dimension: "overworld".to_string(),
            health: 20.0,
            hunger: 20,
            effects: vec![],
        },
        inventory_summary: InventorySummary::default(),
        nearby_summary: NearbySummary::default(),
        task_context: TaskContext::default(),
    }
}

pub fn resource(kind: &str, distance: f64) -> ResourceView {
    ResourceView {
        kind: kind.to_string(),
        distance,
        position: Position::new(distance, 64.0, 0.0),
    }
}

pub fn hostile(kind: &str, distance: f64) -> HostileView {
    HostileView {
        kind: kind.to_string(),
        distance,
    }
}

pub fn inventory_with(items: &[(&str, u32)]) -> InventorySummary {
    let mut inv = InventorySummary::default();
    inv.empty_slots = 20;
    for (name, count) in items {
        if name.contains("_pickaxe") || name.contains("_axe") || name.contains("_shovel") {
            inv.tools.insert(name.to_string(), *count);
        } else {
            inv.key_items.insert(name.to_string(), *count);
        }
    }
    inv
}

pub fn minimal_request(bot_id: &str) -> PlanRequest {
    PlanRequest {
        bot_id: bot_id.to_string(),
        snapshot: snapshot(bot_id),
        history: vec![],
        available_subgoals: crate::agent::subgoal::SUBGOAL_NAMES
            .iter()
            .map(|n| n.as_str().to_string())
            .collect(),
    }
}
