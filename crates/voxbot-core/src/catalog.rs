//! Read-only game-data lookup: blocks, drops, recipes, harvest tools.
//!
//! Injected into the guard/planner as a shared handle. The built-in dataset
//! covers the early progression chain; full dumps load through `from_json`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tool material preference order. Lower rank is preferred when choosing the
/// minimal acquisition target; golden sorts after everything else.
pub static TOOL_MATERIALS: &[&str] = &["wooden", "stone", "iron", "diamond", "netherite", "golden"];

pub fn material_rank(material: &str) -> Option<usize> {
    TOOL_MATERIALS.iter().position(|m| *m == material)
}

/// Harvest requirement for a block: a tool class and the minimum material.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HarvestTool {
    /// Tool class suffix, e.g. "pickaxe", "axe", "shovel".
    pub class: String,
    pub min_material: String,
}

impl HarvestTool {
    /// Item names that satisfy this requirement, lowest tier first.
    pub fn acceptable_items(&self) -> Vec<String> {
        let min_rank = material_rank(&self.min_material).unwrap_or(0);
        TOOL_MATERIALS
            .iter()
            .enumerate()
            .filter(|(rank, _)| *rank >= min_rank)
            .map(|(_, m)| format!("{m}_{}", self.class))
            .collect()
    }

    pub fn satisfied_by(&self, item: &str) -> bool {
        let Some(material) = item.strip_suffix(&format!("_{}", self.class)) else {
            return false;
        };
        match (material_rank(material), material_rank(&self.min_material)) {
            (Some(have), Some(need)) => have >= need,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BlockDef {
    pub name: String,
    /// Items dropped on harvest; the first entry is the primary drop.
    #[serde(default)]
    pub drops: Vec<String>,
    #[serde(default)]
    pub harvest_tool: Option<HarvestTool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Ingredient {
    pub item: String,
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Recipe {
    pub result: String,
    pub result_count: u32,
    /// Shaped grid; `None` cells are empty slots.
    #[serde(default)]
    pub in_shape: Option<Vec<Vec<Option<String>>>>,
    /// Shapeless ingredient list.
    #[serde(default)]
    pub ingredients: Option<Vec<Ingredient>>,
}

impl Recipe {
    /// A recipe needs the 3x3 grid when its shape exceeds 2x2 or it uses
    /// more than four ingredient units.
    pub fn requires_table(&self) -> bool {
        if let Some(shape) = &self.in_shape {
            let rows = shape.len();
            let cols = shape.iter().map(|r| r.len()).max().unwrap_or(0);
            if rows > 2 || cols > 2 {
                return true;
            }
        }
        self.ingredient_units() > 4
    }

    fn ingredient_units(&self) -> u32 {
        if let Some(shape) = &self.in_shape {
            return shape
                .iter()
                .flat_map(|row| row.iter())
                .filter(|c| c.is_some())
                .count() as u32;
        }
        self.ingredients
            .as_ref()
            .map(|ings| ings.iter().map(|i| i.count).sum())
            .unwrap_or(0)
    }

    /// Flattened (item, count) requirements regardless of recipe shape.
    pub fn requirements(&self) -> Vec<Ingredient> {
        if let Some(ings) = &self.ingredients {
            return ings.clone();
        }
        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        if let Some(shape) = &self.in_shape {
            for cell in shape.iter().flat_map(|row| row.iter()).flatten() {
                *counts.entry(cell.clone()).or_insert(0) += 1;
            }
        }
        counts
            .into_iter()
            .map(|(item, count)| Ingredient { item, count })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Catalog {
    blocks: BTreeMap<String, BlockDef>,
    /// Recipes keyed by result item. Multiple recipes per item are allowed.
    recipes: BTreeMap<String, Vec<Recipe>>,
    #[serde(default)]
    foods: Vec<String>,
    /// Furnace input -> output.
    #[serde(default)]
    smelts: BTreeMap<String, String>,
}

impl Catalog {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn block(&self, name: &str) -> Option<&BlockDef> {
        self.blocks.get(name)
    }

    pub fn block_names(&self) -> impl Iterator<Item = &String> {
        self.blocks.keys()
    }

    pub fn recipes_for(&self, item: &str) -> &[Recipe] {
        self.recipes.get(item).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_recipe(&self, item: &str) -> bool {
        !self.recipes_for(item).is_empty()
    }

    pub fn primary_drop<'a>(&'a self, block: &'a str) -> &'a str {
        self.blocks
            .get(block)
            .and_then(|b| b.drops.first())
            .map(String::as_str)
            .unwrap_or(block)
    }

    /// Blocks whose primary or secondary drops include `item`, name-sorted.
    pub fn source_blocks_for(&self, item: &str) -> Vec<&BlockDef> {
        self.blocks
            .values()
            .filter(|b| b.drops.iter().any(|d| d == item))
            .collect()
    }

    pub fn is_food(&self, item: &str) -> bool {
        self.foods.iter().any(|f| f == item)
    }

    pub fn smelt_output(&self, input: &str) -> Option<&str> {
        self.smelts.get(input).map(String::as_str)
    }

    /// Items the inventory summary tracks individually: recipe results,
    /// recipe inputs, and block drops.
    pub fn is_key_item(&self, item: &str) -> bool {
        if self.recipes.contains_key(item) {
            return true;
        }
        if self
            .recipes
            .values()
            .flatten()
            .any(|r| r.requirements().iter().any(|i| i.item == item))
        {
            return true;
        }
        self.blocks.values().any(|b| b.drops.iter().any(|d| d == item))
    }

    pub fn is_tool_item(&self, item: &str) -> bool {
        TOOL_MATERIALS.iter().any(|m| {
            item.strip_prefix(m)
                .and_then(|rest| rest.strip_prefix('_'))
                .is_some()
        })
    }

    /// Early-progression dataset used by the fallback planner and tests.
    pub fn builtin() -> Self {
        let mut blocks = BTreeMap::new();
        let mut add_block = |name: &str, drops: &[&str], tool: Option<(&str, &str)>| {
            blocks.insert(
                name.to_string(),
                BlockDef {
                    name: name.to_string(),
                    drops: drops.iter().map(|d| d.to_string()).collect(),
                    harvest_tool: tool.map(|(class, min)| HarvestTool {
                        class: class.to_string(),
                        min_material: min.to_string(),
                    }),
                },
            );
        };
        add_block("oak_log", &["oak_log"], None);
        add_block("birch_log", &["birch_log"], None);
        add_block("dirt", &["dirt"], None);
        add_block("sand", &["sand"], None);
        add_block("stone", &["cobblestone"], Some(("pickaxe", "wooden")));
        add_block("cobblestone", &["cobblestone"], Some(("pickaxe", "wooden")));
        add_block("coal_ore", &["coal"], Some(("pickaxe", "wooden")));
        add_block("iron_ore", &["raw_iron"], Some(("pickaxe", "stone")));
        add_block("crafting_table", &["crafting_table"], None);
        add_block("furnace", &["furnace"], Some(("pickaxe", "wooden")));

        let mut recipes: BTreeMap<String, Vec<Recipe>> = BTreeMap::new();
        let mut add_shapeless = |result: &str, count: u32, ings: &[(&str, u32)]| {
            recipes.entry(result.to_string()).or_default().push(Recipe {
                result: result.to_string(),
                result_count: count,
                in_shape: None,
                ingredients: Some(
                    ings.iter()
                        .map(|(item, count)| Ingredient {
                            item: item.to_string(),
                            count: *count,
                        })
                        .collect(),
                ),
            });
        };
        add_shapeless("oak_planks", 4, &[("oak_log", 1)]);
        add_shapeless("stick", 4, &[("oak_planks", 2)]);
        add_shapeless("crafting_table", 1, &[("oak_planks", 4)]);
        add_shapeless("torch", 4, &[("coal", 1), ("stick", 1)]);

        let pickaxe_shape = |head: &str| {
            Some(vec![
                vec![
                    Some(head.to_string()),
                    Some(head.to_string()),
                    Some(head.to_string()),
                ],
                vec![None, Some("stick".to_string()), None],
                vec![None, Some("stick".to_string()), None],
            ])
        };
        recipes.entry("wooden_pickaxe".to_string()).or_default().push(Recipe {
            result: "wooden_pickaxe".to_string(),
            result_count: 1,
            in_shape: pickaxe_shape("oak_planks"),
            ingredients: None,
        });
        recipes.entry("stone_pickaxe".to_string()).or_default().push(Recipe {
            result: "stone_pickaxe".to_string(),
            result_count: 1,
            in_shape: pickaxe_shape("cobblestone"),
            ingredients: None,
        });
        recipes.entry("wooden_axe".to_string()).or_default().push(Recipe {
            result: "wooden_axe".to_string(),
            result_count: 1,
            in_shape: Some(vec![
                vec![Some("oak_planks".to_string()), Some("oak_planks".to_string())],
                vec![Some("oak_planks".to_string()), Some("stick".to_string())],
                vec![None, Some("stick".to_string())],
            ]),
            ingredients: None,
        });
        recipes.entry("furnace".to_string()).or_default().push(Recipe {
            result: "furnace".to_string(),
            result_count: 1,
            in_shape: Some(vec![
                vec![
                    Some("cobblestone".to_string()),
                    Some("cobblestone".to_string()),
                    Some("cobblestone".to_string()),
                ],
                vec![Some("cobblestone".to_string()), None, Some("cobblestone".to_string())],
                vec![
                    Some("cobblestone".to_string()),
                    Some("cobblestone".to_string()),
                    Some("cobblestone".to_string()),
                ],
            ]),
            ingredients: None,
        });

        let foods = ["bread", "apple", "cooked_beef", "cooked_porkchop", "baked_potato"]
            .iter()
            .map(|f| f.to_string())
            .collect();

        let smelts = [
            ("raw_iron", "iron_ingot"),
            ("cobblestone", "stone"),
            ("sand", "glass"),
            ("beef", "cooked_beef"),
        ]
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect();

        Self {
            blocks,
            recipes,
            foods,
            smelts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harvest_tool_accepts_higher_tiers_and_ranks_golden_last() {
        let tool = HarvestTool {
            class: "pickaxe".to_string(),
            min_material: "wooden".to_string(),
        };
        assert!(tool.satisfied_by("wooden_pickaxe"));
        assert!(tool.satisfied_by("netherite_pickaxe"));
        assert!(!tool.satisfied_by("wooden_axe"));

        let items = tool.acceptable_items();
        assert_eq!(items.first().map(String::as_str), Some("wooden_pickaxe"));
        assert_eq!(items.last().map(String::as_str), Some("golden_pickaxe"));
    }

    #[test]
    fn stone_tier_rejects_wooden() {
        let tool = HarvestTool {
            class: "pickaxe".to_string(),
            min_material: "stone".to_string(),
        };
        assert!(!tool.satisfied_by("wooden_pickaxe"));
        assert!(tool.satisfied_by("iron_pickaxe"));
    }

    #[test]
    fn pickaxe_recipe_requires_table() {
        let cat = Catalog::builtin();
        let recipe = &cat.recipes_for("wooden_pickaxe")[0];
        assert!(recipe.requires_table());
        let reqs = recipe.requirements();
        assert!(reqs.contains(&Ingredient {
            item: "oak_planks".to_string(),
            count: 3
        }));
        assert!(reqs.contains(&Ingredient {
            item: "stick".to_string(),
            count: 2
        }));
    }

    #[test]
    fn small_recipes_do_not_require_table() {
        let cat = Catalog::builtin();
        assert!(!cat.recipes_for("oak_planks")[0].requires_table());
        assert!(!cat.recipes_for("crafting_table")[0].requires_table());
    }

    #[test]
    fn stone_drops_cobblestone() {
        let cat = Catalog::builtin();
        assert_eq!(cat.primary_drop("stone"), "cobblestone");
        let sources: Vec<_> = cat
            .source_blocks_for("cobblestone")
            .iter()
            .map(|b| b.name.clone())
            .collect();
        assert!(sources.contains(&"stone".to_string()));
    }

    #[test]
    fn key_item_covers_recipe_chain() {
        let cat = Catalog::builtin();
        for item in ["oak_log", "oak_planks", "stick", "crafting_table", "wooden_pickaxe"] {
            assert!(cat.is_key_item(item), "{item} should be a key item");
        }
        assert!(!cat.is_key_item("suspicious_stew"));
    }
}
