//! Feasibility guard: rewrites planner output so every subgoal is actually
//! executable given projected inventory and the recipe/source graph.
//!
//! The guard copies the inventory projection at entry and mutates only its
//! own copy; the public projection never decreases. Internally a separate
//! consumable ledger tracks what planned crafts will use up, so transitive
//! raw-material shortages aggregate into single collect steps.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use crate::agent::snapshot::Snapshot;
use crate::agent::subgoal::{Subgoal, SubgoalName};
use crate::catalog::{Catalog, Recipe};

const ACQUISITION_DEPTH_LIMIT: usize = 8;
const TABLE_REACH: f64 = 8.0;
const EXPLORE_FALLBACK_RADIUS: i64 = 28;
const EXPLORE_PROGRESSION_RADIUS: i64 = 26;
const TABLE_PENALTY: i64 = 3;
pub const DEFAULT_DESIRED_INCREMENT: u32 = 8;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardOutcome {
    pub subgoals: Vec<Subgoal>,
    pub notes: Vec<String>,
    /// True when the output differs from the input under canonical
    /// comparison; drives the feasibility reprompt.
    pub rewritten: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressionPlan {
    pub reason: String,
    pub subgoals: Vec<Subgoal>,
}

#[derive(Debug, Clone, PartialEq)]
enum PlanFail {
    Unresolvable(String),
    DepthExceeded,
    Cycle(String),
}

impl PlanFail {
    fn describe(&self) -> String {
        match self {
            PlanFail::Unresolvable(item) => format!("unresolvable_{item}"),
            PlanFail::DepthExceeded => "depth_exceeded".to_string(),
            PlanFail::Cycle(item) => format!("recipe_cycle_{item}"),
        }
    }
}

pub struct FeasibilityGuard {
    catalog: Arc<Catalog>,
}

impl FeasibilityGuard {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub fn apply(&self, snapshot: &Snapshot, plan: &[Subgoal]) -> GuardOutcome {
        let mut projected = snapshot.inventory_summary.projected_items();
        let mut table_access = has_table_access(&projected, snapshot);
        let mut out: Vec<Subgoal> = Vec::new();
        let mut notes: Vec<String> = Vec::new();

        for (index, subgoal) in plan.iter().enumerate() {
            match subgoal.name {
                SubgoalName::Collect | SubgoalName::GotoNearest => {
                    self.guard_collect_like(
                        index,
                        subgoal,
                        snapshot,
                        &mut projected,
                        &mut table_access,
                        &mut out,
                        &mut notes,
                    );
                }
                SubgoalName::Craft => {
                    self.guard_craft(
                        index,
                        subgoal,
                        snapshot,
                        &mut projected,
                        &mut table_access,
                        &mut out,
                        &mut notes,
                    );
                }
                _ => {
                    push_deduped(&mut out, subgoal.clone(), index, &mut notes);
                    apply_projected_outcome(&self.catalog, &mut projected, &mut table_access, subgoal);
                }
            }
        }

        let rewritten = out.len() != plan.len()
            || out.iter().zip(plan.iter()).any(|(a, b)| !a.canonical_eq(b));
        GuardOutcome {
            subgoals: out,
            notes,
            rewritten,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn guard_collect_like(
        &self,
        index: usize,
        subgoal: &Subgoal,
        snapshot: &Snapshot,
        projected: &mut BTreeMap<String, i64>,
        table_access: &mut bool,
        out: &mut Vec<Subgoal>,
        notes: &mut Vec<String>,
    ) {
        let Some(target) = collect_target(subgoal) else {
            push_deduped(out, subgoal.clone(), index, notes);
            return;
        };

        let resolved_block = self.resolve_block_for(&target);
        let Some(block_name) = resolved_block else {
            // Rule 1: no block resolves. Craftable items get a full
            // acquisition plan; everything else becomes an explore probe.
            let qty = subgoal.param_i64("count").unwrap_or(1).max(1) as u32;
            if self.catalog.has_recipe(&target) {
                let mut planner =
                    AcquisitionPlanner::new(&self.catalog, snapshot, projected.clone(), *table_access);
                match planner.plan(&target, qty) {
                    Ok(()) => {
                        notes.push(format!("guard_acquisition_for_{target}"));
                        for sg in planner.into_subgoals() {
                            apply_projected_outcome(&self.catalog, projected, table_access, &sg);
                            push_deduped(out, sg, index, notes);
                        }
                        return;
                    }
                    Err(fail) => {
                        notes.push(format!("guard_acquisition_failed_{}", fail.describe()));
                    }
                }
            }
            notes.push(format!("guard_explore_fallback_{target}"));
            let sg = explore_fallback(&target, EXPLORE_FALLBACK_RADIUS);
            push_deduped(out, sg, index, notes);
            return;
        };

        // Rule 2: block resolved; ensure a harvest tool exists first.
        if let Some(block) = self.catalog.block(&block_name) {
            if let Some(tool) = &block.harvest_tool {
                let owned = projected
                    .iter()
                    .any(|(item, count)| *count > 0 && tool.satisfied_by(item));
                if !owned {
                    let mut planned = false;
                    for candidate in tool.acceptable_items() {
                        let mut planner = AcquisitionPlanner::new(
                            &self.catalog,
                            snapshot,
                            projected.clone(),
                            *table_access,
                        );
                        if planner.plan(&candidate, 1).is_ok() {
                            notes.push(format!("guard_tool_plan_{candidate}_for_{block_name}"));
                            for sg in planner.into_subgoals() {
                                apply_projected_outcome(&self.catalog, projected, table_access, &sg);
                                push_deduped(out, sg, index, notes);
                            }
                            planned = true;
                            break;
                        }
                    }
                    if !planned {
                        notes.push(format!("guard_no_acquirable_tool_for_{block_name}"));
                    }
                }
            }
        }

        let mut kept = subgoal.clone();
        // Canonicalize the block key when the plan addressed a block; item
        // keyed collects are already acquisition-shaped and stay as-is.
        if kept.params.contains_key("block") {
            kept.params
                .insert("block".to_string(), json!(block_name));
        }
        apply_projected_outcome(&self.catalog, projected, table_access, &kept);
        push_deduped(out, kept, index, notes);
    }

    #[allow(clippy::too_many_arguments)]
    fn guard_craft(
        &self,
        index: usize,
        subgoal: &Subgoal,
        snapshot: &Snapshot,
        projected: &mut BTreeMap<String, i64>,
        table_access: &mut bool,
        out: &mut Vec<Subgoal>,
        notes: &mut Vec<String>,
    ) {
        let Some(item) = subgoal.param_str("item").map(str::to_string) else {
            push_deduped(out, subgoal.clone(), index, notes);
            return;
        };
        let qty = subgoal.param_i64("count").unwrap_or(1).max(1) as u32;

        if !self.catalog.has_recipe(&item) {
            // Rule 3, no recipe: treat like an unresolvable collect.
            let mut planner =
                AcquisitionPlanner::new(&self.catalog, snapshot, projected.clone(), *table_access);
            match planner.plan(&item, qty) {
                Ok(()) => {
                    notes.push(format!("guard_acquisition_for_{item}"));
                    for sg in planner.into_subgoals() {
                        apply_projected_outcome(&self.catalog, projected, table_access, &sg);
                        push_deduped(out, sg, index, notes);
                    }
                }
                Err(_) => {
                    notes.push(format!("guard_explore_fallback_{item}"));
                    let sg = explore_fallback(&item, EXPLORE_FALLBACK_RADIUS);
                    push_deduped(out, sg, index, notes);
                }
            }
            return;
        }

        // Rule 3, recipe exists: prepend the missing prerequisites, then
        // keep the craft itself.
        let mut planner =
            AcquisitionPlanner::new(&self.catalog, snapshot, projected.clone(), *table_access);
        match planner.plan_prerequisites(&item, qty) {
            Ok(()) => {
                let prereqs = planner.into_subgoals();
                if !prereqs.is_empty() {
                    notes.push(format!("guard_prereqs_for_{item}"));
                }
                for sg in prereqs {
                    apply_projected_outcome(&self.catalog, projected, table_access, &sg);
                    push_deduped(out, sg, index, notes);
                }
            }
            Err(fail) => {
                notes.push(format!("guard_prereqs_failed_{}", fail.describe()));
            }
        }
        apply_projected_outcome(&self.catalog, projected, table_access, subgoal);
        push_deduped(out, subgoal.clone(), index, notes);
    }

    fn resolve_block_for(&self, target: &str) -> Option<String> {
        if self.catalog.block(target).is_some() {
            return Some(target.to_string());
        }
        let mut sources = self.catalog.source_blocks_for(target);
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        sources.first().map(|b| b.name.clone())
    }

    /// Deterministic plan used when the fleet must make progress without
    /// the LLM: unlock missing harvest tools first, then top up the most
    /// depleted nearby resource, else explore.
    pub fn progression_plan(
        &self,
        snapshot: &Snapshot,
        desired_increment: u32,
    ) -> ProgressionPlan {
        let projected = snapshot.inventory_summary.projected_items();
        let table_access = has_table_access(&projected, snapshot);

        // Capability gaps: nearest-first resources whose tool is missing.
        for resource in &snapshot.nearby_summary.resources {
            let Some(block) = self.catalog.block(&resource.kind) else {
                continue;
            };
            let Some(tool) = &block.harvest_tool else {
                continue;
            };
            let owned = projected
                .iter()
                .any(|(item, count)| *count > 0 && tool.satisfied_by(item));
            if owned {
                continue;
            }
            for candidate in tool.acceptable_items() {
                let mut planner =
                    AcquisitionPlanner::new(&self.catalog, snapshot, projected.clone(), table_access);
                if planner.plan(&candidate, 1).is_ok() {
                    return ProgressionPlan {
                        reason: format!("unlock_{candidate}_for_{}", resource.kind),
                        subgoals: planner.into_subgoals(),
                    };
                }
            }
        }

        // Top up the nearest actionable resource with the largest shortage.
        let mut candidates: Vec<(u32, f64, String)> = Vec::new();
        for resource in &snapshot.nearby_summary.resources {
            let Some(block) = self.catalog.block(&resource.kind) else {
                continue;
            };
            if let Some(tool) = &block.harvest_tool {
                let owned = projected
                    .iter()
                    .any(|(item, count)| *count > 0 && tool.satisfied_by(item));
                if !owned {
                    continue;
                }
            }
            let item = self.catalog.primary_drop(&resource.kind).to_string();
            let have = projected.get(&item).copied().unwrap_or(0);
            let shortage = i64::from(desired_increment) - have;
            if shortage > 0 {
                candidates.push((shortage as u32, resource.distance, item));
            }
        }
        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.total_cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });
        for (shortage, _, item) in candidates {
            let mut planner =
                AcquisitionPlanner::new(&self.catalog, snapshot, projected.clone(), table_access);
            if planner.plan(&item, shortage).is_ok() {
                return ProgressionPlan {
                    reason: format!("gather_{item}"),
                    subgoals: planner.into_subgoals(),
                };
            }
        }

        ProgressionPlan {
            reason: "explore_for_resources".to_string(),
            subgoals: vec![Subgoal::new(SubgoalName::Explore)
                .with_param("radius", json!(EXPLORE_PROGRESSION_RADIUS))
                .with_param("return_to_base", json!(false))],
        }
    }
}

fn collect_target(subgoal: &Subgoal) -> Option<String> {
    subgoal
        .param_str("block")
        .or_else(|| subgoal.param_str("item"))
        .map(str::to_string)
}

fn explore_fallback(target: &str, radius: i64) -> Subgoal {
    Subgoal::new(SubgoalName::Explore)
        .with_param("radius", json!(radius))
        .with_param("return_to_base", json!(false))
        .with_param("resource_hint", json!(target))
}

fn has_table_access(projected: &BTreeMap<String, i64>, snapshot: &Snapshot) -> bool {
    projected.get("crafting_table").copied().unwrap_or(0) > 0
        || snapshot.poi_within("crafting_table", TABLE_REACH)
}

/// Rule 4: projected counts only ever grow as subgoals are accepted.
fn apply_projected_outcome(
    catalog: &Catalog,
    projected: &mut BTreeMap<String, i64>,
    table_access: &mut bool,
    subgoal: &Subgoal,
) {
    let gained: Option<(String, i64)> = match subgoal.name {
        SubgoalName::Craft | SubgoalName::Withdraw => subgoal
            .param_str("item")
            .map(str::to_string)
            .zip(subgoal.param_i64("count")),
        SubgoalName::Collect => {
            let count = subgoal.param_i64("count").unwrap_or(1);
            if let Some(item) = subgoal.param_str("item") {
                Some((item.to_string(), count))
            } else {
                subgoal
                    .param_str("block")
                    .map(|b| (catalog.primary_drop(b).to_string(), count))
            }
        }
        _ => None,
    };
    if let Some((item, count)) = gained {
        if count > 0 {
            *projected.entry(item.clone()).or_insert(0) += count;
            if item == "crafting_table" {
                *table_access = true;
            }
        }
    }
}

/// Rule 5: adjacent identical subgoals collapse.
fn push_deduped(out: &mut Vec<Subgoal>, subgoal: Subgoal, index: usize, notes: &mut Vec<String>) {
    if out.last().is_some_and(|last| last.canonical_eq(&subgoal)) {
        notes.push(format!("guard_dedup_adjacent_{index}"));
        return;
    }
    out.push(subgoal);
}

/// Recursive acquisition planning with a consumable ledger.
struct AcquisitionPlanner<'a> {
    catalog: &'a Catalog,
    snapshot: &'a Snapshot,
    /// Consumable view of the projection; internal only.
    avail: BTreeMap<String, i64>,
    table_access: bool,
    /// item -> (total shortage, source block), first-demand ordered.
    raw_needs: Vec<(String, u32, String)>,
    craft_steps: Vec<(String, u32)>,
}

impl<'a> AcquisitionPlanner<'a> {
    fn new(
        catalog: &'a Catalog,
        snapshot: &'a Snapshot,
        avail: BTreeMap<String, i64>,
        table_access: bool,
    ) -> Self {
        Self {
            catalog,
            snapshot,
            avail,
            table_access,
            raw_needs: Vec::new(),
            craft_steps: Vec::new(),
        }
    }

    fn plan(&mut self, item: &str, qty: u32) -> Result<(), PlanFail> {
        let mut stack = Vec::new();
        self.explode(item, qty, 0, &mut stack)
    }

    /// Like `plan`, but the final craft of `item` itself is left to the
    /// caller; only table access and ingredient shortages are expanded.
    fn plan_prerequisites(&mut self, item: &str, qty: u32) -> Result<(), PlanFail> {
        let recipe = self
            .select_recipe(item, qty)
            .ok_or_else(|| PlanFail::Unresolvable(item.to_string()))?
            .clone();
        let crafts = qty.div_ceil(recipe.result_count.max(1));
        let mut stack = vec![item.to_string()];
        if recipe.requires_table() && !self.table_access {
            self.table_access = true;
            self.explode("crafting_table", 1, 1, &mut stack)?;
        }
        for ing in recipe.requirements() {
            self.explode(&ing.item, crafts * ing.count, 1, &mut stack)?;
        }
        Ok(())
    }

    fn explode(
        &mut self,
        item: &str,
        qty: u32,
        depth: usize,
        stack: &mut Vec<String>,
    ) -> Result<(), PlanFail> {
        let have = self.avail.get(item).copied().unwrap_or(0).max(0);
        let take = have.min(i64::from(qty));
        if take > 0 {
            *self.avail.entry(item.to_string()).or_insert(0) -= take;
        }
        let need = qty - take as u32;
        if need == 0 {
            return Ok(());
        }
        if depth >= ACQUISITION_DEPTH_LIMIT {
            return Err(PlanFail::DepthExceeded);
        }
        if stack.iter().any(|s| s == item) {
            return Err(PlanFail::Cycle(item.to_string()));
        }

        if let Some(recipe) = self.select_recipe(item, need).cloned() {
            stack.push(item.to_string());
            if recipe.requires_table() && !self.table_access {
                self.table_access = true;
                self.explode("crafting_table", 1, depth + 1, stack)?;
            }
            let crafts = need.div_ceil(recipe.result_count.max(1));
            for ing in recipe.requirements() {
                self.explode(&ing.item, crafts * ing.count, depth + 1, stack)?;
            }
            stack.pop();
            self.craft_steps.push((item.to_string(), need));
            let leftover = i64::from(crafts * recipe.result_count) - i64::from(need);
            *self.avail.entry(item.to_string()).or_insert(0) += leftover;
            return Ok(());
        }

        let source = self
            .select_source_block(item)
            .ok_or_else(|| PlanFail::Unresolvable(item.to_string()))?;
        match self.raw_needs.iter_mut().find(|(i, _, _)| i == item) {
            Some((_, count, _)) => *count += need,
            None => self.raw_needs.push((item.to_string(), need, source)),
        }
        Ok(())
    }

    /// Recipe scoring: fewest missing ingredient units, plus a penalty when
    /// the recipe needs a table we do not have access to.
    fn select_recipe(&self, item: &str, qty: u32) -> Option<&'a Recipe> {
        self.catalog
            .recipes_for(item)
            .iter()
            .min_by_key(|recipe| {
                let crafts = qty.div_ceil(recipe.result_count.max(1));
                let missing: i64 = recipe
                    .requirements()
                    .iter()
                    .map(|ing| {
                        let needed = i64::from(crafts * ing.count);
                        let have = self.avail.get(&ing.item).copied().unwrap_or(0).max(0);
                        (needed - have).max(0)
                    })
                    .sum();
                let penalty = if recipe.requires_table() && !self.table_access {
                    TABLE_PENALTY
                } else {
                    0
                };
                missing + penalty
            })
    }

    /// Raw sources: prefer actionable blocks (tool already in the ledger),
    /// then nearby distance, then name.
    fn select_source_block(&self, item: &str) -> Option<String> {
        let mut candidates: Vec<(bool, f64, String)> = self
            .catalog
            .source_blocks_for(item)
            .into_iter()
            .map(|block| {
                let actionable = match &block.harvest_tool {
                    None => true,
                    Some(tool) => self
                        .avail
                        .iter()
                        .any(|(i, c)| *c > 0 && tool.satisfied_by(i)),
                };
                let distance = self
                    .snapshot
                    .nearest_resource(&block.name)
                    .map(|r| r.distance)
                    .unwrap_or(f64::INFINITY);
                (actionable, distance, block.name.clone())
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.total_cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });
        candidates.first().map(|(_, _, name)| name.clone())
    }

    fn into_subgoals(self) -> Vec<Subgoal> {
        let mut out = Vec::new();
        for (item, count, source_block) in &self.raw_needs {
            out.push(
                Subgoal::new(SubgoalName::GotoNearest)
                    .with_param("block", json!(source_block))
                    .with_param("max_distance", json!(48)),
            );
            out.push(
                Subgoal::new(SubgoalName::Collect)
                    .with_param("item", json!(item))
                    .with_param("count", json!(count)),
            );
        }
        // Merge repeated crafts of the same item into the first position.
        let mut merged: Vec<(String, u32)> = Vec::new();
        for (item, count) in self.craft_steps {
            match merged.iter_mut().find(|(i, _)| *i == item) {
                Some((_, total)) => *total += count,
                None => merged.push((item, count)),
            }
        }
        for (item, count) in merged {
            out.push(
                Subgoal::new(SubgoalName::Craft)
                    .with_param("item", json!(item))
                    .with_param("count", json!(count)),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::snapshot::{
        DayPhase, InventorySummary, NearbySummary, PlayerView, ResourceView, Snapshot, TaskContext,
        TimeView,
    };
    use crate::agent::adapter::Position;

    fn snapshot_with(resources: Vec<ResourceView>, inventory: InventorySummary) -> Snapshot {
        Snapshot {
            bot_id: "alpha".to_string(),
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
            inventory_summary: inventory,
            nearby_summary: NearbySummary {
                hostiles: vec![],
                resources,
                points_of_interest: vec![],
            },
            task_context: TaskContext::default(),
        }
    }

    fn resource(kind: &str, distance: f64) -> ResourceView {
        ResourceView {
            kind: kind.to_string(),
            distance,
            position: Position::new(distance, 64.0, 0.0),
        }
    }

    fn inventory_with(items: &[(&str, u32)]) -> InventorySummary {
        let mut inv = InventorySummary::default();
        for (name, count) in items {
            if name.ends_with("_pickaxe") || name.ends_with("_axe") {
                inv.tools.insert(name.to_string(), *count);
            } else {
                inv.key_items.insert(name.to_string(), *count);
            }
        }
        inv
    }

    fn guard() -> FeasibilityGuard {
        FeasibilityGuard::new(Arc::new(Catalog::builtin()))
    }

    fn collect(block: &str, count: i64) -> Subgoal {
        Subgoal::new(SubgoalName::Collect)
            .with_param("block", json!(block))
            .with_param("count", json!(count))
    }

    #[test]
    fn stone_request_without_pickaxe_expands_full_chain() {
        let g = guard();
        let snap = snapshot_with(
            vec![resource("oak_log", 5.0), resource("stone", 9.0)],
            InventorySummary::default(),
        );
        let out = g.apply(&snap, &[collect("stone", 10)]);
        assert!(out.rewritten);

        let names: Vec<String> = out
            .subgoals
            .iter()
            .map(|sg| {
                format!(
                    "{}:{}",
                    sg.name,
                    sg.param_str("block")
                        .or(sg.param_str("item"))
                        .unwrap_or("-")
                )
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "goto_nearest:oak_log",
                "collect:oak_log",
                "craft:oak_planks",
                "craft:crafting_table",
                "craft:stick",
                "craft:wooden_pickaxe",
                "collect:stone",
            ]
        );
        // The gather covers planks for the table, the pickaxe head and the
        // sticks: three logs.
        assert!(out.subgoals[1].param_i64("count").unwrap() >= 3);
        assert_eq!(out.subgoals.last().unwrap().param_i64("count"), Some(10));
    }

    #[test]
    fn owned_tool_passes_through_untouched() {
        let g = guard();
        let snap = snapshot_with(
            vec![resource("stone", 4.0)],
            inventory_with(&[("wooden_pickaxe", 1)]),
        );
        let plan = vec![collect("stone", 10)];
        let out = g.apply(&snap, &plan);
        assert!(!out.rewritten);
        assert_eq!(out.subgoals, plan);
    }

    #[test]
    fn guard_is_idempotent() {
        let g = guard();
        let snap = snapshot_with(
            vec![resource("oak_log", 5.0), resource("stone", 9.0)],
            InventorySummary::default(),
        );
        let once = g.apply(&snap, &[collect("stone", 10)]);
        let twice = g.apply(&snap, &once.subgoals);
        assert!(!twice.rewritten, "second pass rewrote: {:?}", twice.notes);
        assert_eq!(once.subgoals, twice.subgoals);
    }

    #[test]
    fn unknown_target_emits_explore_fallback() {
        let g = guard();
        let snap = snapshot_with(vec![], InventorySummary::default());
        let out = g.apply(&snap, &[collect("ender_pearl", 2)]);
        assert_eq!(out.subgoals.len(), 1);
        let sg = &out.subgoals[0];
        assert_eq!(sg.name, SubgoalName::Explore);
        assert_eq!(sg.param_i64("radius"), Some(28));
        assert_eq!(sg.param_str("resource_hint"), Some("ender_pearl"));
        assert!(out
            .notes
            .iter()
            .any(|n| n == "guard_explore_fallback_ender_pearl"));
    }

    #[test]
    fn craft_with_recipe_prepends_missing_ingredients() {
        let g = guard();
        let snap = snapshot_with(
            vec![resource("oak_log", 3.0)],
            InventorySummary::default(),
        );
        let plan = vec![Subgoal::new(SubgoalName::Craft)
            .with_param("item", json!("stick"))
            .with_param("count", json!(4))];
        let out = g.apply(&snap, &plan);
        assert!(out.rewritten);
        // Ends with the original craft; starts with gathering logs.
        assert_eq!(out.subgoals.last().unwrap().param_str("item"), Some("stick"));
        assert_eq!(out.subgoals[0].name, SubgoalName::GotoNearest);
        assert!(out.notes.iter().any(|n| n == "guard_prereqs_for_stick"));
    }

    #[test]
    fn craft_with_satisfied_ingredients_is_untouched() {
        let g = guard();
        let snap = snapshot_with(vec![], inventory_with(&[("oak_planks", 4)]));
        let plan = vec![Subgoal::new(SubgoalName::Craft)
            .with_param("item", json!("stick"))
            .with_param("count", json!(4))];
        let out = g.apply(&snap, &plan);
        assert!(!out.rewritten);
    }

    #[test]
    fn projected_inventory_feeds_later_subgoals() {
        let g = guard();
        let snap = snapshot_with(
            vec![resource("oak_log", 5.0)],
            InventorySummary::default(),
        );
        // First subgoal gathers logs; the craft then needs no second gather.
        let plan = vec![
            collect("oak_log", 4),
            Subgoal::new(SubgoalName::Craft)
                .with_param("item", json!("oak_planks"))
                .with_param("count", json!(4)),
        ];
        let out = g.apply(&snap, &plan);
        assert!(!out.rewritten, "notes: {:?}", out.notes);
    }

    #[test]
    fn adjacent_duplicates_collapse() {
        let g = guard();
        let snap = snapshot_with(vec![], inventory_with(&[("wooden_pickaxe", 1)]));
        let plan = vec![collect("stone", 5), collect("stone", 5)];
        let out = g.apply(&snap, &plan);
        assert_eq!(out.subgoals.len(), 1);
        assert!(out.notes.iter().any(|n| n.starts_with("guard_dedup_adjacent")));
    }

    #[test]
    fn progression_unlocks_tool_for_nearby_stone() {
        let g = guard();
        let snap = snapshot_with(
            vec![resource("stone", 6.0), resource("oak_log", 8.0)],
            InventorySummary::default(),
        );
        let plan = g.progression_plan(&snap, DEFAULT_DESIRED_INCREMENT);
        assert_eq!(plan.reason, "unlock_wooden_pickaxe_for_stone");
        assert!(plan
            .subgoals
            .iter()
            .any(|sg| sg.name == SubgoalName::Craft
                && sg.param_str("item") == Some("wooden_pickaxe")));
    }

    #[test]
    fn progression_gathers_largest_shortage_when_tools_ok() {
        let g = guard();
        let mut inv = inventory_with(&[("wooden_pickaxe", 1)]);
        inv.key_items.insert("cobblestone".to_string(), 6);
        let snap = snapshot_with(
            vec![resource("stone", 4.0), resource("oak_log", 5.0)],
            inv,
        );
        let plan = g.progression_plan(&snap, 8);
        // oak_log shortage 8 beats cobblestone shortage 2.
        assert_eq!(plan.reason, "gather_oak_log");
        let last = plan.subgoals.last().unwrap();
        assert_eq!(last.param_str("item"), Some("oak_log"));
        assert_eq!(last.param_i64("count"), Some(8));
    }

    #[test]
    fn progression_explores_when_nothing_actionable() {
        let g = guard();
        let snap = snapshot_with(vec![], InventorySummary::default());
        let plan = g.progression_plan(&snap, 8);
        assert_eq!(plan.reason, "explore_for_resources");
        assert_eq!(plan.subgoals[0].name, SubgoalName::Explore);
        assert_eq!(plan.subgoals[0].param_i64("radius"), Some(26));
    }

    #[test]
    fn projected_counts_never_decrease() {
        let g = guard();
        let snap = snapshot_with(
            vec![resource("oak_log", 5.0), resource("stone", 9.0)],
            InventorySummary::default(),
        );
        // Run the guard over a plan that crafts through several layers and
        // verify the public projection stayed monotonic by re-applying.
        let out = g.apply(&snap, &[collect("stone", 10)]);
        let again = g.apply(&snap, &out.subgoals);
        assert_eq!(out.subgoals, again.subgoals);
    }
}
