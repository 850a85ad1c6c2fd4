//! Deterministic in-memory world adapter.
//!
//! Backs the runner's dry-run mode and the control-loop tests: every action
//! mutates a small scripted world, so loops can be exercised end-to-end
//! without a game server. Tests can freeze movement or fail pathfinding to
//! drive the recovery paths.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::agent::adapter::{
    ActivityFlags, AdapterEvent, AgentAdapter, AgentStateRaw, BlockObs, EntityObs, InventoryView,
    ItemStack, PathfindOutcome, Position,
};
use crate::catalog::Catalog;

const SIM_SLOTS: u32 = 36;
const STACK_SIZE: u32 = 64;

#[derive(Debug)]
struct SimState {
    position: Position,
    health: f64,
    hunger: u32,
    time_of_day: u32,
    tick: u64,
    dimension: String,
    inventory: BTreeMap<String, u32>,
    blocks: Vec<BlockObs>,
    entities: Vec<EntityObs>,
    container: BTreeMap<String, u32>,
    /// When set, pathfinding fails and movement freezes (stall injection).
    frozen: bool,
    pathfind_fails: bool,
    /// When set, `collect_blocks` blocks until cleared (stall injection).
    hang_collect: bool,
    activity: ActivityFlags,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            position: Position::new(0.0, 64.0, 0.0),
            health: 20.0,
            hunger: 20,
            time_of_day: 1_000,
            tick: 0,
            dimension: "overworld".to_string(),
            inventory: BTreeMap::new(),
            blocks: Vec::new(),
            entities: Vec::new(),
            container: BTreeMap::new(),
            frozen: false,
            pathfind_fails: false,
            hang_collect: false,
            activity: ActivityFlags::default(),
        }
    }
}

pub struct SimAdapter {
    catalog: Arc<Catalog>,
    state: Mutex<SimState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AdapterEvent>>>,
}

impl SimAdapter {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            state: Mutex::new(SimState::default()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Seeds a small default world: a stand of oak, exposed stone, a chest.
    pub fn with_default_world(catalog: Arc<Catalog>) -> Self {
        let sim = Self::new(catalog);
        {
            let mut st = sim.state.lock().unwrap();
            for i in 0..6 {
                st.blocks.push(BlockObs {
                    name: "oak_log".to_string(),
                    position: Position::new(5.0 + f64::from(i), 64.0, 3.0),
                });
            }
            for i in 0..12 {
                st.blocks.push(BlockObs {
                    name: "stone".to_string(),
                    position: Position::new(-8.0, 60.0, f64::from(i)),
                });
            }
            st.blocks.push(BlockObs {
                name: "chest".to_string(),
                position: Position::new(0.0, 64.0, 1.0),
            });
        }
        sim
    }

    pub fn place_world_block(&self, name: &str, pos: Position) {
        self.state.lock().unwrap().blocks.push(BlockObs {
            name: name.to_string(),
            position: pos,
        });
    }

    pub fn add_entity(&self, entity: EntityObs) {
        self.state.lock().unwrap().entities.push(entity);
    }

    pub fn give(&self, item: &str, count: u32) {
        let mut st = self.state.lock().unwrap();
        *st.inventory.entry(item.to_string()).or_insert(0) += count;
    }

    pub fn stock_container(&self, item: &str, count: u32) {
        let mut st = self.state.lock().unwrap();
        *st.container.entry(item.to_string()).or_insert(0) += count;
    }

    pub fn set_health(&self, health: f64) {
        self.state.lock().unwrap().health = health;
    }

    pub fn set_time_of_day(&self, time: u32) {
        self.state.lock().unwrap().time_of_day = time;
    }

    pub fn advance_tick(&self, ticks: u64) {
        let mut st = self.state.lock().unwrap();
        st.tick += ticks;
        st.time_of_day = ((u64::from(st.time_of_day) + ticks) % 24_000) as u32;
    }

    /// Freezes all movement and collection so idle-stall detection fires.
    pub fn freeze(&self, frozen: bool) {
        self.state.lock().unwrap().frozen = frozen;
    }

    pub fn fail_pathfinding(&self, fail: bool) {
        self.state.lock().unwrap().pathfind_fails = fail;
    }

    pub fn set_activity(&self, activity: ActivityFlags) {
        self.state.lock().unwrap().activity = activity;
    }

    pub fn set_hang_collect(&self, hang: bool) {
        self.state.lock().unwrap().hang_collect = hang;
    }

    pub fn inventory_count(&self, item: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .inventory
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    pub fn push_event(&self, event: AdapterEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn used_slots(inventory: &BTreeMap<String, u32>) -> u32 {
        inventory
            .values()
            .map(|c| c.div_ceil(STACK_SIZE))
            .sum::<u32>()
    }
}

#[async_trait]
impl AgentAdapter for SimAdapter {
    async fn connect(&self) -> anyhow::Result<()> {
        self.push_event(AdapterEvent::Spawned);
        Ok(())
    }

    async fn quit(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn state(&self) -> anyhow::Result<AgentStateRaw> {
        let mut st = self.state.lock().unwrap();
        st.tick += 1;
        Ok(AgentStateRaw {
            position: st.position,
            dimension: st.dimension.clone(),
            health: st.health,
            hunger: st.hunger,
            effects: vec![],
            time_of_day: st.time_of_day,
            tick: st.tick,
        })
    }

    async fn activity(&self) -> anyhow::Result<ActivityFlags> {
        Ok(self.state.lock().unwrap().activity)
    }

    async fn inventory(&self) -> anyhow::Result<InventoryView> {
        let st = self.state.lock().unwrap();
        let items = st
            .inventory
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(name, count)| ItemStack {
                name: name.clone(),
                count: *count,
            })
            .collect();
        let empty = SIM_SLOTS.saturating_sub(Self::used_slots(&st.inventory));
        Ok(InventoryView {
            items,
            empty_slots: empty,
        })
    }

    async fn nearby_entities(
        &self,
        max_distance: f64,
        limit: usize,
    ) -> anyhow::Result<Vec<EntityObs>> {
        let st = self.state.lock().unwrap();
        let origin = st.position;
        let mut found: Vec<EntityObs> = st
            .entities
            .iter()
            .filter(|e| origin.distance_to(&e.position) <= max_distance)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            origin
                .distance_to(&a.position)
                .total_cmp(&origin.distance_to(&b.position))
        });
        found.truncate(limit);
        Ok(found)
    }

    async fn find_blocks(
        &self,
        names: &[String],
        max_distance: f64,
        limit: usize,
    ) -> anyhow::Result<Vec<BlockObs>> {
        let st = self.state.lock().unwrap();
        let origin = st.position;
        let mut found: Vec<BlockObs> = st
            .blocks
            .iter()
            .filter(|b| names.contains(&b.name) && origin.distance_to(&b.position) <= max_distance)
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            origin
                .distance_to(&a.position)
                .total_cmp(&origin.distance_to(&b.position))
        });
        found.truncate(limit);
        Ok(found)
    }

    async fn pathfind_to(&self, pos: Position, range: f64) -> anyhow::Result<PathfindOutcome> {
        let mut st = self.state.lock().unwrap();
        if st.pathfind_fails {
            return Ok(PathfindOutcome::NoPath);
        }
        if st.frozen {
            return Ok(PathfindOutcome::Interrupted);
        }
        // Teleport to just inside the requested range.
        let dist = st.position.distance_to(&pos);
        if dist > range {
            st.position = pos;
        }
        st.tick += 1;
        Ok(PathfindOutcome::Reached)
    }

    async fn clear_pathfinding(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn look_at(&self, _pos: Position) -> anyhow::Result<()> {
        Ok(())
    }

    async fn clear_control_states(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn dig(&self, pos: Position) -> anyhow::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.blocks.retain(|b| b.position != pos);
        Ok(())
    }

    async fn place_block(&self, pos: Position, item: &str) -> anyhow::Result<bool> {
        let mut st = self.state.lock().unwrap();
        let held = st.inventory.get(item).copied().unwrap_or(0);
        if held == 0 {
            return Ok(false);
        }
        *st.inventory.get_mut(item).unwrap() -= 1;
        st.blocks.push(BlockObs {
            name: item.to_string(),
            position: pos,
        });
        Ok(true)
    }

    async fn equip(&self, item: &str) -> anyhow::Result<bool> {
        let st = self.state.lock().unwrap();
        Ok(st.inventory.get(item).copied().unwrap_or(0) > 0)
    }

    async fn craft(&self, item: &str, count: u32, _table_at: Option<Position>) -> anyhow::Result<()> {
        let recipe = self
            .catalog
            .recipes_for(item)
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no recipe for {item}"))?;
        let crafts = count.div_ceil(recipe.result_count.max(1));
        let mut st = self.state.lock().unwrap();
        for ing in recipe.requirements() {
            let need = ing.count * crafts;
            let have = st.inventory.get(&ing.item).copied().unwrap_or(0);
            if have < need {
                anyhow::bail!("missing ingredient {} ({have}/{need})", ing.item);
            }
        }
        for ing in recipe.requirements() {
            *st.inventory.get_mut(&ing.item).unwrap() -= ing.count * crafts;
        }
        *st.inventory.entry(item.to_string()).or_insert(0) += crafts * recipe.result_count;
        Ok(())
    }

    async fn collect_blocks(&self, block: &str, count: u32) -> anyhow::Result<u32> {
        loop {
            let hanging = self.state.lock().unwrap().hang_collect;
            if !hanging {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        let (drop_item, collected) = {
            let mut st = self.state.lock().unwrap();
            if st.frozen {
                return Ok(0);
            }
            let origin = st.position;
            let mut indices: Vec<usize> = st
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, b)| b.name == block)
                .map(|(i, _)| i)
                .collect();
            indices.sort_by(|a, b| {
                origin
                    .distance_to(&st.blocks[*a].position)
                    .total_cmp(&origin.distance_to(&st.blocks[*b].position))
            });
            let take = indices.len().min(count as usize);
            // Remove from the back so earlier indices stay valid.
            let mut chosen: Vec<usize> = indices.into_iter().take(take).collect();
            chosen.sort_unstable_by(|a, b| b.cmp(a));
            for i in &chosen {
                st.blocks.remove(*i);
            }
            st.tick += take as u64;
            (self.catalog.primary_drop(block).to_string(), take as u32)
        };
        if collected > 0 {
            let mut st = self.state.lock().unwrap();
            *st.inventory.entry(drop_item).or_insert(0) += collected;
        }
        Ok(collected)
    }

    async fn stop_collecting(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn open_container(&self, _pos: Position) -> anyhow::Result<()> {
        Ok(())
    }

    async fn transfer_to_container(&self, item: &str, count: u32) -> anyhow::Result<u32> {
        let mut st = self.state.lock().unwrap();
        let have = st.inventory.get(item).copied().unwrap_or(0);
        let moved = have.min(count);
        if moved > 0 {
            *st.inventory.get_mut(item).unwrap() -= moved;
            *st.container.entry(item.to_string()).or_insert(0) += moved;
        }
        Ok(moved)
    }

    async fn take_from_container(&self, item: &str, count: u32) -> anyhow::Result<u32> {
        let mut st = self.state.lock().unwrap();
        // Furnace shorthand: stocked smeltable inputs convert on demand.
        if st.container.get(item).copied().unwrap_or(0) < count {
            let input = st.container.keys().cloned().find(|i| {
                self.catalog.smelt_output(i) == Some(item)
                    && st.container.get(i).copied().unwrap_or(0) > 0
            });
            if let Some(input) = input {
                let available = st.container.get(&input).copied().unwrap_or(0);
                let convert = available.min(count);
                *st.container.get_mut(&input).unwrap() -= convert;
                *st.container.entry(item.to_string()).or_insert(0) += convert;
            }
        }
        let have = st.container.get(item).copied().unwrap_or(0);
        let moved = have.min(count);
        if moved > 0 {
            *st.container.get_mut(item).unwrap() -= moved;
            *st.inventory.entry(item.to_string()).or_insert(0) += moved;
        }
        Ok(moved)
    }

    async fn close_container(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn attack_entity(&self, entity_id: u64) -> anyhow::Result<()> {
        let mut st = self.state.lock().unwrap();
        st.entities.retain(|e| e.entity_id != entity_id);
        st.tick += 1;
        Ok(())
    }

    async fn stop_combat(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn chat(&self, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn subscribe_events(&self) -> mpsc::UnboundedReceiver<AdapterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}
