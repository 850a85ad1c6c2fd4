use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::agent::adapter::{AgentAdapter, EntityKind, Position};
use crate::catalog::Catalog;

/// Hard caps to keep prompts stable.
const RESOURCE_CAP: usize = 8;
const HOSTILE_CAP: usize = 6;
const POI_CAP: usize = 6;

const RESOURCE_SCAN_DISTANCE: f64 = 32.0;
const ENTITY_SCAN_DISTANCE: f64 = 24.0;

static POI_BLOCKS: &[&str] = &["crafting_table", "furnace", "chest"];

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DayPhase {
    Dawn,
    Day,
    Dusk,
    Night,
}

impl DayPhase {
    pub fn from_time(time_of_day: u32) -> Self {
        match time_of_day % 24_000 {
            23_000..=23_999 => DayPhase::Dawn,
            0..=11_999 => DayPhase::Day,
            12_000..=12_999 => DayPhase::Dusk,
            _ => DayPhase::Night,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TimeView {
    pub tick: u64,
    pub phase: DayPhase,
    pub time_of_day: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PlayerView {
    pub position: Position,
    pub dimension: String,
    pub health: f64,
    pub hunger: u32,
    #[serde(default)]
    pub effects: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct InventorySummary {
    pub food_total: u32,
    /// Tool item name -> count.
    #[serde(default)]
    pub tools: BTreeMap<String, u32>,
    /// Total count of placeable block items carried.
    pub blocks: u32,
    /// Non-block key items (recipe inputs/outputs, drops) -> count.
    #[serde(default)]
    pub key_items: BTreeMap<String, u32>,
    pub empty_slots: u32,
}

impl InventorySummary {
    /// Pressure metric: carried blocks plus all tracked key items.
    pub fn load(&self) -> u32 {
        self.blocks + self.key_items.values().sum::<u32>()
    }

    /// Starting point for the guard's projected inventory.
    pub fn projected_items(&self) -> BTreeMap<String, i64> {
        let mut out: BTreeMap<String, i64> = BTreeMap::new();
        for (name, count) in self.key_items.iter().chain(self.tools.iter()) {
            *out.entry(name.clone()).or_insert(0) += i64::from(*count);
        }
        out
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HostileView {
    #[serde(rename = "type")]
    pub kind: String,
    pub distance: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ResourceView {
    #[serde(rename = "type")]
    pub kind: String,
    pub distance: f64,
    pub position: Position,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct NearbySummary {
    #[serde(default)]
    pub hostiles: Vec<HostileView>,
    #[serde(default)]
    pub resources: Vec<ResourceView>,
    #[serde(default)]
    pub points_of_interest: Vec<ResourceView>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct TaskContext {
    #[serde(default)]
    pub current_goal: Option<String>,
    #[serde(default)]
    pub current_subgoal: Option<String>,
    #[serde(default)]
    pub progress_counters: BTreeMap<String, u64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Immutable compact world view handed to the planner and the guard.
///
/// Lists are sorted by ascending distance and hard-capped; distances are
/// always non-negative by construction.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Snapshot {
    pub bot_id: String,
    pub time: TimeView,
    pub player: PlayerView,
    pub inventory_summary: InventorySummary,
    pub nearby_summary: NearbySummary,
    #[serde(default)]
    pub task_context: TaskContext,
}

impl Snapshot {
    pub fn nearest_hostile_distance(&self) -> Option<f64> {
        self.nearby_summary.hostiles.first().map(|h| h.distance)
    }

    pub fn nearest_resource(&self, kind: &str) -> Option<&ResourceView> {
        self.nearby_summary
            .resources
            .iter()
            .find(|r| r.kind == kind)
    }

    pub fn poi_within(&self, kind: &str, distance: f64) -> bool {
        self.nearby_summary
            .points_of_interest
            .iter()
            .any(|p| p.kind == kind && p.distance <= distance)
    }
}

/// Derives snapshots from the adapter, caching the expensive nearby scans.
pub struct SnapshotBuilder {
    adapter: Arc<dyn AgentAdapter>,
    catalog: Arc<Catalog>,
    bot_id: String,
    refresh: Duration,
    nearby_cache: Duration,
    cached: Option<(Instant, Snapshot)>,
    cached_nearby: Option<(Instant, NearbySummary)>,
}

impl SnapshotBuilder {
    pub fn new(
        adapter: Arc<dyn AgentAdapter>,
        catalog: Arc<Catalog>,
        bot_id: impl Into<String>,
        refresh_ms: u64,
        nearby_cache_ms: u64,
    ) -> Self {
        Self {
            adapter,
            catalog,
            bot_id: bot_id.into(),
            refresh: Duration::from_millis(refresh_ms),
            nearby_cache: Duration::from_millis(nearby_cache_ms),
            cached: None,
            cached_nearby: None,
        }
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
        self.cached_nearby = None;
    }

    pub async fn build(&mut self, force: bool, task: TaskContext) -> anyhow::Result<Snapshot> {
        let now = Instant::now();
        if !force {
            if let Some((at, snap)) = &self.cached {
                if now.duration_since(*at) < self.refresh {
                    let mut snap = snap.clone();
                    snap.task_context = task;
                    return Ok(snap);
                }
            }
        }

        let state = self.adapter.state().await?;
        let inventory = self.adapter.inventory().await?;

        let nearby_fresh = !force
            && self
                .cached_nearby
                .as_ref()
                .is_some_and(|(at, _)| now.duration_since(*at) < self.nearby_cache);
        let nearby = if nearby_fresh {
            self.cached_nearby
                .as_ref()
                .map(|(_, nearby)| nearby.clone())
                .unwrap_or_default()
        } else {
            let nearby = self.scan_nearby(state.position).await?;
            self.cached_nearby = Some((now, nearby.clone()));
            nearby
        };

        let snap = Snapshot {
            bot_id: self.bot_id.clone(),
            time: TimeView {
                tick: state.tick,
                phase: DayPhase::from_time(state.time_of_day),
                time_of_day: state.time_of_day,
            },
            player: PlayerView {
                position: state.position,
                dimension: state.dimension,
                health: state.health,
                hunger: state.hunger,
                effects: state.effects,
            },
            inventory_summary: summarize_inventory(&self.catalog, &inventory),
            nearby_summary: nearby,
            task_context: task,
        };
        self.cached = Some((now, snap.clone()));
        Ok(snap)
    }

    async fn scan_nearby(&self, origin: Position) -> anyhow::Result<NearbySummary> {
        let entities = self
            .adapter
            .nearby_entities(ENTITY_SCAN_DISTANCE, 32)
            .await?;
        let mut hostiles: Vec<HostileView> = entities
            .iter()
            .filter(|e| e.kind == EntityKind::Hostile)
            .map(|e| HostileView {
                kind: e.name.clone(),
                distance: origin.distance_to(&e.position),
            })
            .collect();
        hostiles.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hostiles.truncate(HOSTILE_CAP);

        let resource_names: Vec<String> = self
            .catalog
            .block_names()
            .filter(|n| !POI_BLOCKS.contains(&n.as_str()))
            .cloned()
            .collect();
        let found = self
            .adapter
            .find_blocks(&resource_names, RESOURCE_SCAN_DISTANCE, 32)
            .await?;
        let mut resources: Vec<ResourceView> = found
            .into_iter()
            .map(|b| ResourceView {
                distance: origin.distance_to(&b.position),
                kind: b.name,
                position: b.position,
            })
            .collect();
        resources.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        resources.truncate(RESOURCE_CAP);

        let poi_names: Vec<String> = POI_BLOCKS.iter().map(|n| n.to_string()).collect();
        let found = self
            .adapter
            .find_blocks(&poi_names, RESOURCE_SCAN_DISTANCE, 16)
            .await?;
        let mut pois: Vec<ResourceView> = found
            .into_iter()
            .map(|b| ResourceView {
                distance: origin.distance_to(&b.position),
                kind: b.name,
                position: b.position,
            })
            .collect();
        pois.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        pois.truncate(POI_CAP);

        Ok(NearbySummary {
            hostiles,
            resources,
            points_of_interest: pois,
        })
    }
}

pub fn summarize_inventory(
    catalog: &Catalog,
    inventory: &crate::agent::adapter::InventoryView,
) -> InventorySummary {
    let mut summary = InventorySummary {
        empty_slots: inventory.empty_slots,
        ..InventorySummary::default()
    };
    for stack in &inventory.items {
        if catalog.is_food(&stack.name) {
            summary.food_total += stack.count;
        }
        if catalog.is_tool_item(&stack.name) {
            *summary.tools.entry(stack.name.clone()).or_insert(0) += stack.count;
            continue;
        }
        if catalog.block(&stack.name).is_some() {
            summary.blocks += stack.count;
            continue;
        }
        if catalog.is_key_item(&stack.name) {
            *summary.key_items.entry(stack.name.clone()).or_insert(0) += stack.count;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::adapter::{InventoryView, ItemStack};

    fn stacks(items: &[(&str, u32)]) -> InventoryView {
        InventoryView {
            items: items
                .iter()
                .map(|(name, count)| ItemStack {
                    name: name.to_string(),
                    count: *count,
                })
                .collect(),
            empty_slots: 10,
        }
    }

    #[test]
    fn day_phase_boundaries() {
        assert_eq!(DayPhase::from_time(0), DayPhase::Day);
        assert_eq!(DayPhase::from_time(11_999), DayPhase::Day);
        assert_eq!(DayPhase::from_time(12_500), DayPhase::Dusk);
        assert_eq!(DayPhase::from_time(13_000), DayPhase::Night);
        assert_eq!(DayPhase::from_time(22_999), DayPhase::Night);
        assert_eq!(DayPhase::from_time(23_400), DayPhase::Dawn);
    }

    #[test]
    fn inventory_summary_partitions_items() {
        let cat = Catalog::builtin();
        let inv = stacks(&[
            ("bread", 3),
            ("wooden_pickaxe", 1),
            ("cobblestone", 20),
            ("stick", 4),
            ("mystery_trinket", 2),
        ]);
        let sum = summarize_inventory(&cat, &inv);
        assert_eq!(sum.food_total, 3);
        assert_eq!(sum.tools.get("wooden_pickaxe"), Some(&1));
        assert_eq!(sum.blocks, 20);
        assert_eq!(sum.key_items.get("stick"), Some(&4));
        assert!(!sum.key_items.contains_key("mystery_trinket"));
        assert_eq!(sum.load(), 24);
    }

    #[test]
    fn projected_items_union_tools_and_key_items() {
        let cat = Catalog::builtin();
        let inv = stacks(&[("wooden_pickaxe", 1), ("oak_log", 5)]);
        let projected = summarize_inventory(&cat, &inv).projected_items();
        assert_eq!(projected.get("wooden_pickaxe"), Some(&1));
        assert_eq!(projected.get("oak_log"), Some(&5));
    }
}
