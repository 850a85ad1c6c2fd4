use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ItemStack {
    pub name: String,
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct InventoryView {
    pub items: Vec<ItemStack>,
    pub empty_slots: u32,
}

impl InventoryView {
    pub fn count_of(&self, name: &str) -> u32 {
        self.items
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.count)
            .sum()
    }

    pub fn total_items(&self) -> u32 {
        self.items.iter().map(|s| s.count).sum()
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Hostile,
    Animal,
    Player,
    Other,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EntityObs {
    pub entity_id: u64,
    pub kind: EntityKind,
    pub name: String,
    pub position: Position,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BlockObs {
    pub name: String,
    pub position: Position,
}

/// Raw per-tick agent state as the game client reports it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AgentStateRaw {
    pub position: Position,
    pub dimension: String,
    pub health: f64,
    pub hunger: u32,
    #[serde(default)]
    pub effects: Vec<String>,
    /// Game time of day in ticks, 0..24000.
    pub time_of_day: u32,
    pub tick: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathfindOutcome {
    Reached,
    NoPath,
    Interrupted,
}

/// What the client is busy doing right now, as far as its plugins report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivityFlags {
    pub pathing: bool,
    pub digging: bool,
    pub placing: bool,
}

/// Connection-lifecycle events pushed by the game client.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Spawned,
    Hurt { health: f64, source: Option<String> },
    Death,
    Kicked { reason: String },
    End { reason: String },
}

/// Boundary the control core uses to read game state and act on the world.
///
/// The core never assumes how an action is decomposed into protocol steps;
/// pathfinding, block placement micro-steps and combat swings all live on
/// the other side of this trait.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;
    async fn quit(&self) -> anyhow::Result<()>;

    async fn state(&self) -> anyhow::Result<AgentStateRaw>;
    async fn activity(&self) -> anyhow::Result<ActivityFlags>;
    async fn inventory(&self) -> anyhow::Result<InventoryView>;
    async fn nearby_entities(
        &self,
        max_distance: f64,
        limit: usize,
    ) -> anyhow::Result<Vec<EntityObs>>;

    /// Predicate scan for blocks by name, sorted by ascending distance.
    /// The single-name lookup is the one-element case.
    async fn find_blocks(
        &self,
        names: &[String],
        max_distance: f64,
        limit: usize,
    ) -> anyhow::Result<Vec<BlockObs>>;

    async fn pathfind_to(&self, pos: Position, range: f64) -> anyhow::Result<PathfindOutcome>;
    async fn clear_pathfinding(&self) -> anyhow::Result<()>;
    async fn look_at(&self, pos: Position) -> anyhow::Result<()>;
    async fn clear_control_states(&self) -> anyhow::Result<()>;

    async fn dig(&self, pos: Position) -> anyhow::Result<()>;
    /// Returns false when the server rejected the placement.
    async fn place_block(&self, pos: Position, item: &str) -> anyhow::Result<bool>;
    async fn equip(&self, item: &str) -> anyhow::Result<bool>;
    async fn craft(&self, item: &str, count: u32, table_at: Option<Position>) -> anyhow::Result<()>;

    /// Collect-block plugin: gathers up to `count` of the named block,
    /// returning how many were actually collected.
    async fn collect_blocks(&self, block: &str, count: u32) -> anyhow::Result<u32>;
    async fn stop_collecting(&self) -> anyhow::Result<()>;

    async fn open_container(&self, pos: Position) -> anyhow::Result<()>;
    async fn transfer_to_container(&self, item: &str, count: u32) -> anyhow::Result<u32>;
    async fn take_from_container(&self, item: &str, count: u32) -> anyhow::Result<u32>;
    async fn close_container(&self) -> anyhow::Result<()>;

    async fn attack_entity(&self, entity_id: u64) -> anyhow::Result<()>;
    async fn stop_combat(&self) -> anyhow::Result<()>;

    async fn chat(&self, message: &str) -> anyhow::Result<()>;

    /// Registers a listener for connection/damage events. Each call returns
    /// an independent receiver.
    fn subscribe_events(&self) -> mpsc::UnboundedReceiver<AdapterEvent>;
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LlmReply {
    pub text: String,
    #[serde(default)]
    pub tokens_in: Option<u32>,
    #[serde(default)]
    pub tokens_out: Option<u32>,
}

/// Narrow LLM boundary: a prompt and a budget in, text and token counts out.
/// Fails with a single error kind when the call cannot produce text.
pub trait LlmClient: Send + Sync {
    fn generate<'a>(
        &'a self,
        prompt: String,
        timeout_ms: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<LlmReply>> + Send + 'a>>;
}
