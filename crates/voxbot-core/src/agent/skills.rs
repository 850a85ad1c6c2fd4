//! Skill engine: dispatches subgoals to deterministic handlers over the
//! adapter, with resource lock acquisition and lease heartbeats around the
//! handlers that touch contended world state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use crate::agent::adapter::{AgentAdapter, EntityKind, PathfindOutcome, Position};
use crate::agent::subgoal::{FailureCode, SkillResult, Subgoal, SubgoalName};
use crate::catalog::Catalog;
use crate::coord::{ExplorerLimiter, LockManager};
use crate::util::now_ms;

const DEFAULT_EXPLORE_RADIUS: f64 = 24.0;
const DEFAULT_COMBAT_GUARD_RADIUS: f64 = 12.0;
const DEFAULT_COMBAT_GUARD_DURATION_MS: u64 = 6_000;
const DEFAULT_ENGAGE_TARGETS: usize = 2;
const DEFAULT_ENGAGE_DISTANCE: f64 = 18.0;
const CONTAINER_REACH: f64 = 8.0;
const FUEL_ITEMS_PER_SMELT_BATCH: u32 = 8;

pub struct SkillEngine {
    catalog: Arc<Catalog>,
    locks: Arc<Mutex<LockManager>>,
    explorers: Arc<Mutex<ExplorerLimiter>>,
    lock_heartbeat_ms: u64,
    base_position: Position,
}

impl SkillEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        locks: Arc<Mutex<LockManager>>,
        explorers: Arc<Mutex<ExplorerLimiter>>,
        lock_heartbeat_ms: u64,
        base_position: Position,
    ) -> Self {
        Self {
            catalog,
            locks,
            explorers,
            lock_heartbeat_ms,
            base_position,
        }
    }

    pub async fn execute(
        &self,
        bot_id: &str,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> SkillResult {
        let key = lock_key(subgoal);
        if let Some(key) = &key {
            let acquired = self
                .locks
                .lock()
                .expect("lock manager poisoned")
                .acquire(key, bot_id, now_ms());
            if !acquired {
                return SkillResult::failure(
                    FailureCode::DependsOnItem,
                    format!("resource locked: {key}"),
                    true,
                );
            }
        }

        let ticker = key.as_ref().map(|k| self.spawn_heartbeat(k, bot_id));
        let outcome = self.dispatch(bot_id, adapter, subgoal).await;
        if let Some(ticker) = ticker {
            ticker.abort();
        }
        if let Some(key) = &key {
            self.locks
                .lock()
                .expect("lock manager poisoned")
                .release(key, bot_id, now_ms());
        }

        match outcome {
            Ok(result) => result,
            // Unstructured adapter errors are not retried blindly; the
            // planner gets to see them instead.
            Err(err) => SkillResult::failure(
                FailureCode::DependsOnItem,
                format!("{err:#}"),
                false,
            ),
        }
    }

    fn spawn_heartbeat(&self, key: &str, owner: &str) -> JoinHandle<()> {
        let locks = Arc::clone(&self.locks);
        let key = key.to_string();
        let owner = owner.to_string();
        let period = Duration::from_millis(self.lock_heartbeat_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let ok = locks
                    .lock()
                    .expect("lock manager poisoned")
                    .heartbeat(&key, &owner, now_ms());
                if !ok {
                    break;
                }
            }
        })
    }

    async fn dispatch(
        &self,
        bot_id: &str,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> anyhow::Result<SkillResult> {
        let state = adapter.state().await?;
        if state.health <= 0.0 {
            return Ok(SkillResult::failure(
                FailureCode::BotDied,
                "agent is dead",
                false,
            ));
        }

        match subgoal.name {
            SubgoalName::Explore => self.explore(bot_id, adapter, subgoal).await,
            SubgoalName::Goto => self.goto(adapter, subgoal).await,
            SubgoalName::GotoNearest => self.goto_nearest(adapter, subgoal).await,
            SubgoalName::Collect => self.collect(adapter, subgoal).await,
            SubgoalName::Craft => self.craft(adapter, subgoal).await,
            SubgoalName::Smelt => self.smelt(adapter, subgoal).await,
            SubgoalName::Deposit => self.deposit(adapter, subgoal).await,
            SubgoalName::Withdraw => self.withdraw(adapter, subgoal).await,
            SubgoalName::BuildBlueprint => self.build_blueprint(adapter, subgoal).await,
            SubgoalName::CombatEngage => self.combat_engage(adapter, subgoal).await,
            SubgoalName::CombatGuard => self.combat_guard(adapter, subgoal).await,
        }
    }

    async fn explore(
        &self,
        bot_id: &str,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> anyhow::Result<SkillResult> {
        let admitted = self
            .explorers
            .lock()
            .expect("explorer limiter poisoned")
            .try_enter(bot_id);
        if !admitted {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                "exploration capacity reached",
                true,
            ));
        }
        let result = self.explore_inner(adapter, subgoal).await;
        self.explorers
            .lock()
            .expect("explorer limiter poisoned")
            .leave(bot_id);
        result
    }

    async fn explore_inner(
        &self,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> anyhow::Result<SkillResult> {
        let radius = subgoal
            .param_i64("radius")
            .map(|r| r as f64)
            .unwrap_or(DEFAULT_EXPLORE_RADIUS)
            .max(4.0);
        let state = adapter.state().await?;
        // Deterministic heading: eight compass directions keyed by tick.
        let heading = (state.tick % 8) as f64 * std::f64::consts::FRAC_PI_4;
        let target = Position::new(
            state.position.x + radius * heading.cos(),
            state.position.y,
            state.position.z + radius * heading.sin(),
        );
        match adapter.pathfind_to(target, 3.0).await? {
            PathfindOutcome::Reached => {}
            PathfindOutcome::NoPath => {
                return Ok(SkillResult::failure(
                    FailureCode::PathfindFailed,
                    "no path to exploration target",
                    true,
                ));
            }
            PathfindOutcome::Interrupted => {
                return Ok(SkillResult::failure(
                    FailureCode::InterruptedByHostiles,
                    "exploration interrupted",
                    true,
                ));
            }
        }

        let mut sighted = 0usize;
        if let Some(hint) = subgoal.param_str("resource_hint") {
            sighted = adapter
                .find_blocks(&[hint.to_string()], radius, 8)
                .await?
                .len();
        }
        if subgoal
            .params
            .get("return_to_base")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            adapter.pathfind_to(self.base_position, 3.0).await?;
        }
        Ok(SkillResult::Success {
            details: format!("explored radius {radius:.0}"),
            metrics: Some(json!({ "hinted_resources_sighted": sighted })),
        })
    }

    async fn goto(
        &self,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> anyhow::Result<SkillResult> {
        let (Some(x), Some(y), Some(z)) = (
            subgoal.param_i64("x"),
            subgoal.param_i64("y"),
            subgoal.param_i64("z"),
        ) else {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                "goto requires x, y, z",
                false,
            ));
        };
        let range = subgoal.param_i64("range").unwrap_or(2).max(1) as f64;
        let target = Position::new(x as f64, y as f64, z as f64);
        Ok(pathfind_result(
            adapter.pathfind_to(target, range).await?,
            &format!("reached {x},{y},{z}"),
        ))
    }

    async fn goto_nearest(
        &self,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> anyhow::Result<SkillResult> {
        let Some(block) = subgoal.param_str("block").map(str::to_string) else {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                "goto_nearest requires a block",
                false,
            ));
        };
        let max_distance = subgoal.param_i64("max_distance").unwrap_or(48).max(1) as f64;
        let found = adapter.find_blocks(&[block.clone()], max_distance, 4).await?;
        let Some(nearest) = found.first() else {
            return Ok(SkillResult::failure(
                FailureCode::ResourceNotFound,
                format!("no {block} within {max_distance:.0}"),
                true,
            ));
        };
        Ok(pathfind_result(
            adapter.pathfind_to(nearest.position, 2.0).await?,
            &format!("reached {block}"),
        ))
    }

    async fn collect(
        &self,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> anyhow::Result<SkillResult> {
        let target = subgoal
            .param_str("block")
            .or_else(|| subgoal.param_str("item"))
            .map(str::to_string);
        let Some(target) = target else {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                "collect requires a block or item",
                false,
            ));
        };
        let count = subgoal.param_i64("count").unwrap_or(1).max(1) as u32;

        // Resolve which physical blocks to break and what lands in the bag.
        // Any block dropping the expected item is acceptable.
        let expected_item = if subgoal.param_str("item").is_some() {
            target.clone()
        } else {
            self.catalog.primary_drop(&target).to_string()
        };
        let mut candidates: Vec<String> = self
            .catalog
            .source_blocks_for(&expected_item)
            .iter()
            .map(|b| b.name.clone())
            .collect();
        candidates.sort();
        if self.catalog.block(&target).is_some() && !candidates.contains(&target) {
            candidates.insert(0, target.clone());
        }
        if candidates.is_empty() {
            candidates.push(target.clone());
        }

        let found = adapter.find_blocks(&candidates, 48.0, 16).await?;
        let Some(nearest) = found.first() else {
            return Ok(SkillResult::failure(
                FailureCode::ResourceNotFound,
                format!("no source of {target} nearby"),
                true,
            ));
        };
        let block_name = nearest.name.clone();

        let inventory = adapter.inventory().await?;
        if let Some(block) = self.catalog.block(&block_name) {
            if let Some(tool) = &block.harvest_tool {
                let owned = inventory
                    .items
                    .iter()
                    .find(|s| s.count > 0 && tool.satisfied_by(&s.name));
                let Some(owned) = owned else {
                    return Ok(SkillResult::failure(
                        FailureCode::NoToolAvailable,
                        format!("need a {} tier {} for {}", tool.min_material, tool.class, target),
                        false,
                    ));
                };
                adapter.equip(&owned.name).await?;
            }
        }

        let before = inventory.count_of(&expected_item);
        adapter.collect_blocks(&block_name, count).await?;
        let after_view = adapter.inventory().await?;
        let gained = after_view.count_of(&expected_item).saturating_sub(before);

        if gained >= count {
            return Ok(SkillResult::Success {
                details: format!("collected {gained} {expected_item}"),
                metrics: Some(json!({ "collected": gained })),
            });
        }
        if after_view.empty_slots == 0 {
            return Ok(SkillResult::failure(
                FailureCode::InventoryFull,
                format!("inventory full after {gained}/{count} {expected_item}"),
                true,
            ));
        }
        Ok(SkillResult::failure(
            FailureCode::ResourceNotFound,
            format!("collected {gained}/{count} {expected_item}"),
            true,
        ))
    }

    async fn craft(
        &self,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> anyhow::Result<SkillResult> {
        let Some(item) = subgoal.param_str("item").map(str::to_string) else {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                "craft requires an item",
                false,
            ));
        };
        let count = subgoal.param_i64("count").unwrap_or(1).max(1) as u32;
        let Some(recipe) = self.catalog.recipes_for(&item).first().cloned() else {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                format!("no recipe for {item}"),
                false,
            ));
        };

        let inventory = adapter.inventory().await?;
        let crafts = count.div_ceil(recipe.result_count.max(1));
        for ing in recipe.requirements() {
            let need = ing.count * crafts;
            let have = inventory.count_of(&ing.item);
            if have < need {
                return Ok(SkillResult::failure(
                    FailureCode::DependsOnItem,
                    format!("missing {} ({have}/{need})", ing.item),
                    false,
                ));
            }
        }

        let table_at = if recipe.requires_table() {
            match self.ensure_table(adapter).await? {
                Ok(pos) => Some(pos),
                Err(failure) => return Ok(failure),
            }
        } else {
            None
        };

        let before = inventory.count_of(&item);
        adapter.craft(&item, count, table_at).await?;
        let after = adapter.inventory().await?.count_of(&item);
        let gained = after.saturating_sub(before);
        // Byproducts never count; only the requested item's delta does.
        if gained >= count {
            Ok(SkillResult::Success {
                details: format!("crafted {gained} {item}"),
                metrics: Some(json!({ "crafted": gained })),
            })
        } else {
            Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                format!("craft produced {gained}/{count} {item}"),
                false,
            ))
        }
    }

    /// Finds a reachable crafting table, placing a carried one if needed.
    async fn ensure_table(
        &self,
        adapter: &Arc<dyn AgentAdapter>,
    ) -> anyhow::Result<Result<Position, SkillResult>> {
        let found = adapter
            .find_blocks(&["crafting_table".to_string()], CONTAINER_REACH, 1)
            .await?;
        if let Some(table) = found.first() {
            return Ok(Ok(table.position));
        }
        let inventory = adapter.inventory().await?;
        if inventory.count_of("crafting_table") == 0 {
            return Ok(Err(SkillResult::failure(
                FailureCode::DependsOnItem,
                "crafting table required but none reachable or carried",
                false,
            )));
        }
        let state = adapter.state().await?;
        let spot = Position::new(
            state.position.x + 1.0,
            state.position.y,
            state.position.z,
        );
        if !adapter.place_block(spot, "crafting_table").await? {
            return Ok(Err(SkillResult::failure(
                FailureCode::PlacementFailed,
                "could not place crafting table",
                true,
            )));
        }
        Ok(Ok(spot))
    }

    async fn smelt(
        &self,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> anyhow::Result<SkillResult> {
        let Some(input) = subgoal.param_str("input").map(str::to_string) else {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                "smelt requires an input",
                false,
            ));
        };
        let count = subgoal.param_i64("count").unwrap_or(1).max(1) as u32;
        let fuel = subgoal.param_str("fuel").unwrap_or("coal").to_string();
        let Some(output) = self.catalog.smelt_output(&input).map(str::to_string) else {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                format!("{input} is not smeltable"),
                false,
            ));
        };

        let furnaces = adapter
            .find_blocks(&["furnace".to_string()], CONTAINER_REACH, 1)
            .await?;
        let Some(furnace) = furnaces.first() else {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                "no furnace reachable",
                false,
            ));
        };

        let inventory = adapter.inventory().await?;
        if inventory.count_of(&input) < count {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                format!("missing {input} ({}/{count})", inventory.count_of(&input)),
                false,
            ));
        }

        adapter.open_container(furnace.position).await?;
        adapter.transfer_to_container(&input, count).await?;
        let fuel_needed = count.div_ceil(FUEL_ITEMS_PER_SMELT_BATCH);
        adapter.transfer_to_container(&fuel, fuel_needed).await?;
        let got = adapter.take_from_container(&output, count).await?;
        adapter.close_container().await?;

        if got >= count {
            Ok(SkillResult::Success {
                details: format!("smelted {got} {output}"),
                metrics: Some(json!({ "smelted": got })),
            })
        } else {
            Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                format!("smelted {got}/{count} {output}"),
                false,
            ))
        }
    }

    async fn deposit(
        &self,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> anyhow::Result<SkillResult> {
        let chest = match self.reach_base_chest(adapter).await? {
            Ok(pos) => pos,
            Err(failure) => return Ok(failure),
        };
        adapter.open_container(chest).await?;
        let inventory = adapter.inventory().await?;
        let strategy = subgoal.param_str("strategy").unwrap_or("all_non_essential");
        let mut moved = 0u32;
        for stack in &inventory.items {
            if strategy == "all_non_essential"
                && (self.catalog.is_tool_item(&stack.name) || self.catalog.is_food(&stack.name))
            {
                continue;
            }
            moved += adapter
                .transfer_to_container(&stack.name, stack.count)
                .await?;
        }
        adapter.close_container().await?;
        Ok(SkillResult::Success {
            details: format!("deposited {moved} items"),
            metrics: Some(json!({ "deposited": moved })),
        })
    }

    async fn withdraw(
        &self,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> anyhow::Result<SkillResult> {
        let Some(item) = subgoal.param_str("item").map(str::to_string) else {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                "withdraw requires an item",
                false,
            ));
        };
        let count = subgoal.param_i64("count").unwrap_or(1).max(1) as u32;
        let chest = match self.reach_base_chest(adapter).await? {
            Ok(pos) => pos,
            Err(failure) => return Ok(failure),
        };
        adapter.open_container(chest).await?;
        let got = adapter.take_from_container(&item, count).await?;
        adapter.close_container().await?;
        if got >= count {
            Ok(SkillResult::success(format!("withdrew {got} {item}")))
        } else {
            Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                format!("storage short on {item} ({got}/{count})"),
                false,
            ))
        }
    }

    async fn reach_base_chest(
        &self,
        adapter: &Arc<dyn AgentAdapter>,
    ) -> anyhow::Result<Result<Position, SkillResult>> {
        match adapter.pathfind_to(self.base_position, 3.0).await? {
            PathfindOutcome::Reached => {}
            outcome => return Ok(Err(pathfind_result(outcome, ""))),
        }
        let chests = adapter
            .find_blocks(&["chest".to_string()], CONTAINER_REACH, 1)
            .await?;
        match chests.first() {
            Some(chest) => Ok(Ok(chest.position)),
            None => Ok(Err(SkillResult::failure(
                FailureCode::DependsOnItem,
                "no storage chest at base",
                false,
            ))),
        }
    }

    async fn build_blueprint(
        &self,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> anyhow::Result<SkillResult> {
        let anchor = blueprint_anchor(subgoal);
        let Some(anchor) = anchor else {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                "build_blueprint requires an integer anchor",
                false,
            ));
        };
        let Some(entries) = subgoal.params.get("blocks").and_then(|v| v.as_array()) else {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                "build_blueprint requires a blocks list",
                false,
            ));
        };
        if entries.is_empty() {
            return Ok(SkillResult::failure(
                FailureCode::DependsOnItem,
                "blueprint is empty",
                false,
            ));
        }

        match adapter.pathfind_to(anchor, 3.0).await? {
            PathfindOutcome::Reached => {}
            outcome => return Ok(pathfind_result(outcome, "")),
        }

        let mut placed = 0u32;
        for entry in entries {
            let (Some(dx), Some(dy), Some(dz), Some(item)) = (
                entry.get("dx").and_then(|v| v.as_i64()),
                entry.get("dy").and_then(|v| v.as_i64()),
                entry.get("dz").and_then(|v| v.as_i64()),
                entry.get("item").and_then(|v| v.as_str()),
            ) else {
                return Ok(SkillResult::failure(
                    FailureCode::DependsOnItem,
                    "malformed blueprint entry",
                    false,
                ));
            };
            let pos = Position::new(
                anchor.x + dx as f64,
                anchor.y + dy as f64,
                anchor.z + dz as f64,
            );
            if !adapter.place_block(pos, item).await? {
                return Ok(SkillResult::failure(
                    FailureCode::PlacementFailed,
                    format!("placement rejected at offset {dx},{dy},{dz}"),
                    true,
                ));
            }
            placed += 1;
        }
        Ok(SkillResult::Success {
            details: format!("placed {placed} blocks"),
            metrics: Some(json!({ "placed": placed })),
        })
    }

    async fn combat_engage(
        &self,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> anyhow::Result<SkillResult> {
        let max_targets = subgoal
            .param_i64("max_targets")
            .map(|v| v.max(1) as usize)
            .unwrap_or(DEFAULT_ENGAGE_TARGETS);
        let max_distance = subgoal
            .param_i64("max_distance")
            .map(|v| v as f64)
            .unwrap_or(DEFAULT_ENGAGE_DISTANCE);

        let hostiles: Vec<_> = adapter
            .nearby_entities(max_distance, 16)
            .await?
            .into_iter()
            .filter(|e| e.kind == EntityKind::Hostile)
            .take(max_targets)
            .collect();
        if hostiles.is_empty() {
            return Ok(SkillResult::success("no hostiles in range"));
        }

        let mut engaged = 0u32;
        for hostile in hostiles {
            if let Err(err) = adapter.attack_entity(hostile.entity_id).await {
                adapter.stop_combat().await.ok();
                return Ok(SkillResult::failure(
                    FailureCode::CombatLostTarget,
                    format!("lost {}: {err:#}", hostile.name),
                    true,
                ));
            }
            engaged += 1;
        }
        adapter.stop_combat().await?;
        Ok(SkillResult::Success {
            details: format!("engaged {engaged} hostiles"),
            metrics: Some(json!({ "engaged": engaged })),
        })
    }

    async fn combat_guard(
        &self,
        adapter: &Arc<dyn AgentAdapter>,
        subgoal: &Subgoal,
    ) -> anyhow::Result<SkillResult> {
        let radius = subgoal
            .param_i64("radius")
            .map(|v| v as f64)
            .unwrap_or(DEFAULT_COMBAT_GUARD_RADIUS);
        let duration = Duration::from_millis(
            subgoal
                .param_i64("duration")
                .map(|v| v.max(0) as u64)
                .unwrap_or(DEFAULT_COMBAT_GUARD_DURATION_MS),
        );
        let deadline = tokio::time::Instant::now() + duration;
        let mut repelled = 0u32;

        while tokio::time::Instant::now() < deadline {
            let hostile = adapter
                .nearby_entities(radius, 8)
                .await?
                .into_iter()
                .find(|e| e.kind == EntityKind::Hostile);
            match hostile {
                Some(h) => {
                    if adapter.attack_entity(h.entity_id).await.is_ok() {
                        repelled += 1;
                    }
                }
                None => tokio::time::sleep(Duration::from_millis(250)).await,
            }
        }
        adapter.stop_combat().await?;
        Ok(SkillResult::Success {
            details: format!("guard complete, repelled {repelled}"),
            metrics: Some(json!({ "repelled": repelled })),
        })
    }
}

fn pathfind_result(outcome: PathfindOutcome, success_details: &str) -> SkillResult {
    match outcome {
        PathfindOutcome::Reached => SkillResult::success(success_details),
        PathfindOutcome::NoPath => {
            SkillResult::failure(FailureCode::PathfindFailed, "no path", true)
        }
        PathfindOutcome::Interrupted => SkillResult::failure(
            FailureCode::InterruptedByHostiles,
            "movement interrupted",
            true,
        ),
    }
}

fn blueprint_anchor(subgoal: &Subgoal) -> Option<Position> {
    let anchor = subgoal.params.get("anchor")?.as_object()?;
    let x = anchor.get("x")?.as_i64()?;
    let y = anchor.get("y")?.as_i64()?;
    let z = anchor.get("z")?.as_i64()?;
    Some(Position::new(x as f64, y as f64, z as f64))
}

/// Lock keys for subgoals that touch contended world state.
pub fn lock_key(subgoal: &Subgoal) -> Option<String> {
    match subgoal.name {
        SubgoalName::Collect => subgoal
            .param_str("block")
            .or_else(|| subgoal.param_str("item"))
            .map(|t| format!("resource:{t}")),
        SubgoalName::BuildBlueprint => blueprint_anchor(subgoal)
            .map(|a| format!("build:{},{},{}", a.x as i64, a.y as i64, a.z as i64)),
        SubgoalName::Deposit | SubgoalName::Withdraw => Some("storage:base".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimAdapter;
    use serde_json::json;

    fn engine() -> (SkillEngine, Arc<Mutex<LockManager>>) {
        let locks = Arc::new(Mutex::new(LockManager::new(30_000, None)));
        let engine = SkillEngine::new(
            Arc::new(Catalog::builtin()),
            Arc::clone(&locks),
            Arc::new(Mutex::new(ExplorerLimiter::new(2))),
            5_000,
            Position::new(0.0, 64.0, 0.0),
        );
        (engine, locks)
    }

    fn sim() -> Arc<dyn AgentAdapter> {
        Arc::new(SimAdapter::with_default_world(Arc::new(Catalog::builtin())))
    }

    fn collect(target_key: &str, target: &str, count: u32) -> Subgoal {
        Subgoal::new(SubgoalName::Collect)
            .with_param(target_key, json!(target))
            .with_param("count", json!(count))
    }

    #[tokio::test]
    async fn collect_lock_key_and_contention() {
        let (engine, locks) = engine();
        let adapter = sim();
        locks
            .lock()
            .unwrap()
            .acquire("resource:oak_log", "other", now_ms());

        let result = engine
            .execute("alpha", &adapter, &collect("block", "oak_log", 2))
            .await;
        match result {
            SkillResult::Failure {
                error_code,
                retryable,
                details,
            } => {
                assert_eq!(error_code, FailureCode::DependsOnItem);
                assert!(retryable);
                assert!(details.contains("resource locked"));
            }
            other => panic!("expected lock failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn collect_succeeds_and_releases_lock() {
        let (engine, locks) = engine();
        let adapter = sim();
        let result = engine
            .execute("alpha", &adapter, &collect("block", "oak_log", 3))
            .await;
        assert!(result.is_success(), "{result:?}");
        assert_eq!(
            locks.lock().unwrap().owner_of("resource:oak_log", now_ms()),
            None
        );
    }

    #[tokio::test]
    async fn collect_stone_without_pickaxe_reports_missing_tool() {
        let (engine, _) = engine();
        let adapter = sim();
        let result = engine
            .execute("alpha", &adapter, &collect("block", "stone", 2))
            .await;
        assert_eq!(result.error_code(), Some(FailureCode::NoToolAvailable));
        if let SkillResult::Failure { retryable, .. } = result {
            assert!(!retryable);
        }
    }

    #[tokio::test]
    async fn collect_by_item_resolves_source_block() {
        let (engine, _) = engine();
        let sim_adapter = Arc::new(SimAdapter::with_default_world(Arc::new(Catalog::builtin())));
        sim_adapter.place_world_block("coal_ore", Position::new(3.0, 60.0, 2.0));
        sim_adapter.place_world_block("coal_ore", Position::new(3.0, 60.0, 3.0));
        sim_adapter.give("wooden_pickaxe", 1);
        let adapter: Arc<dyn AgentAdapter> = sim_adapter.clone();
        let result = engine
            .execute("alpha", &adapter, &collect("item", "coal", 2))
            .await;
        assert!(result.is_success(), "{result:?}");
        assert_eq!(sim_adapter.inventory_count("coal"), 2);
    }

    #[tokio::test]
    async fn collect_missing_resource_fails_retryable() {
        let (engine, _) = engine();
        let adapter = sim();
        let result = engine
            .execute("alpha", &adapter, &collect("block", "iron_ore", 1))
            .await;
        match result {
            SkillResult::Failure {
                error_code,
                retryable,
                ..
            } => {
                assert_eq!(error_code, FailureCode::ResourceNotFound);
                assert!(retryable);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn craft_places_carried_table_when_needed() {
        let (engine, _) = engine();
        let sim_adapter = Arc::new(SimAdapter::with_default_world(Arc::new(Catalog::builtin())));
        sim_adapter.give("oak_planks", 3);
        sim_adapter.give("stick", 2);
        sim_adapter.give("crafting_table", 1);
        let adapter: Arc<dyn AgentAdapter> = sim_adapter.clone();

        let subgoal = Subgoal::new(SubgoalName::Craft)
            .with_param("item", json!("wooden_pickaxe"))
            .with_param("count", json!(1));
        let result = engine.execute("alpha", &adapter, &subgoal).await;
        assert!(result.is_success(), "{result:?}");
        assert_eq!(sim_adapter.inventory_count("wooden_pickaxe"), 1);
    }

    #[tokio::test]
    async fn craft_missing_ingredients_is_not_retryable() {
        let (engine, _) = engine();
        let adapter = sim();
        let subgoal = Subgoal::new(SubgoalName::Craft)
            .with_param("item", json!("stick"))
            .with_param("count", json!(4));
        let result = engine.execute("alpha", &adapter, &subgoal).await;
        match result {
            SkillResult::Failure {
                error_code,
                retryable,
                details,
            } => {
                assert_eq!(error_code, FailureCode::DependsOnItem);
                assert!(!retryable);
                assert!(details.contains("oak_planks"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn smelt_produces_output_via_furnace() {
        let (engine, _) = engine();
        let sim_adapter = Arc::new(SimAdapter::with_default_world(Arc::new(Catalog::builtin())));
        sim_adapter.place_world_block("furnace", Position::new(1.0, 64.0, 0.0));
        sim_adapter.give("raw_iron", 2);
        sim_adapter.give("coal", 2);
        let adapter: Arc<dyn AgentAdapter> = sim_adapter.clone();

        let subgoal = Subgoal::new(SubgoalName::Smelt)
            .with_param("input", json!("raw_iron"))
            .with_param("count", json!(2));
        let result = engine.execute("alpha", &adapter, &subgoal).await;
        assert!(result.is_success(), "{result:?}");
        assert_eq!(sim_adapter.inventory_count("iron_ingot"), 2);
    }

    #[tokio::test]
    async fn deposit_keeps_tools_and_food() {
        let (engine, _) = engine();
        let sim_adapter = Arc::new(SimAdapter::with_default_world(Arc::new(Catalog::builtin())));
        sim_adapter.give("cobblestone", 20);
        sim_adapter.give("wooden_pickaxe", 1);
        sim_adapter.give("bread", 3);
        let adapter: Arc<dyn AgentAdapter> = sim_adapter.clone();

        let subgoal = Subgoal::new(SubgoalName::Deposit)
            .with_param("strategy", json!("all_non_essential"));
        let result = engine.execute("alpha", &adapter, &subgoal).await;
        assert!(result.is_success(), "{result:?}");
        assert_eq!(sim_adapter.inventory_count("cobblestone"), 0);
        assert_eq!(sim_adapter.inventory_count("wooden_pickaxe"), 1);
        assert_eq!(sim_adapter.inventory_count("bread"), 3);
    }

    #[tokio::test]
    async fn withdraw_shortfall_is_depends_on_item() {
        let (engine, _) = engine();
        let sim_adapter = Arc::new(SimAdapter::with_default_world(Arc::new(Catalog::builtin())));
        sim_adapter.stock_container("oak_planks", 2);
        let adapter: Arc<dyn AgentAdapter> = sim_adapter.clone();

        let subgoal = Subgoal::new(SubgoalName::Withdraw)
            .with_param("item", json!("oak_planks"))
            .with_param("count", json!(6));
        let result = engine.execute("alpha", &adapter, &subgoal).await;
        assert_eq!(result.error_code(), Some(FailureCode::DependsOnItem));
        // Partial withdrawal still happened.
        assert_eq!(sim_adapter.inventory_count("oak_planks"), 2);
    }

    #[tokio::test]
    async fn explorer_capacity_is_enforced() {
        let locks = Arc::new(Mutex::new(LockManager::new(30_000, None)));
        let explorers = Arc::new(Mutex::new(ExplorerLimiter::new(1)));
        explorers.lock().unwrap().try_enter("other");
        let engine = SkillEngine::new(
            Arc::new(Catalog::builtin()),
            locks,
            explorers,
            5_000,
            Position::default(),
        );
        let adapter = sim();
        let subgoal = Subgoal::new(SubgoalName::Explore).with_param("radius", json!(16));
        let result = engine.execute("alpha", &adapter, &subgoal).await;
        match result {
            SkillResult::Failure {
                error_code,
                retryable,
                ..
            } => {
                assert_eq!(error_code, FailureCode::DependsOnItem);
                assert!(retryable);
            }
            other => panic!("expected admission failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn goto_nearest_missing_block_is_resource_not_found() {
        let (engine, _) = engine();
        let adapter = sim();
        let subgoal = Subgoal::new(SubgoalName::GotoNearest)
            .with_param("block", json!("iron_ore"))
            .with_param("max_distance", json!(32));
        let result = engine.execute("alpha", &adapter, &subgoal).await;
        assert_eq!(result.error_code(), Some(FailureCode::ResourceNotFound));
    }

    #[tokio::test]
    async fn pathfind_failure_maps_to_code() {
        let (engine, _) = engine();
        let sim_adapter = Arc::new(SimAdapter::with_default_world(Arc::new(Catalog::builtin())));
        sim_adapter.fail_pathfinding(true);
        let adapter: Arc<dyn AgentAdapter> = sim_adapter;
        let subgoal = Subgoal::new(SubgoalName::Goto)
            .with_param("x", json!(30))
            .with_param("y", json!(64))
            .with_param("z", json!(0))
            .with_param("range", json!(2));
        let result = engine.execute("alpha", &adapter, &subgoal).await;
        assert_eq!(result.error_code(), Some(FailureCode::PathfindFailed));
    }

    #[tokio::test]
    async fn combat_engage_clears_hostiles() {
        use crate::agent::adapter::EntityObs;
        let (engine, _) = engine();
        let sim_adapter = Arc::new(SimAdapter::with_default_world(Arc::new(Catalog::builtin())));
        sim_adapter.add_entity(EntityObs {
            entity_id: 7,
            kind: EntityKind::Hostile,
            name: "zombie".to_string(),
            position: Position::new(4.0, 64.0, 0.0),
        });
        let adapter: Arc<dyn AgentAdapter> = sim_adapter;
        let subgoal = Subgoal::new(SubgoalName::CombatEngage)
            .with_param("max_targets", json!(2))
            .with_param("max_distance", json!(18));
        let result = engine.execute("alpha", &adapter, &subgoal).await;
        assert!(result.is_success(), "{result:?}");
    }

    #[test]
    fn lock_key_table() {
        assert_eq!(
            lock_key(&collect("block", "oak_log", 1)).as_deref(),
            Some("resource:oak_log")
        );
        let bp = Subgoal::new(SubgoalName::BuildBlueprint)
            .with_param("anchor", json!({"x": 1, "y": 64, "z": -2}))
            .with_param("blocks", json!([]));
        assert_eq!(lock_key(&bp).as_deref(), Some("build:1,64,-2"));
        assert_eq!(
            lock_key(&Subgoal::new(SubgoalName::Deposit)).as_deref(),
            Some("storage:base")
        );
        assert_eq!(lock_key(&Subgoal::new(SubgoalName::Explore)), None);
    }
}
