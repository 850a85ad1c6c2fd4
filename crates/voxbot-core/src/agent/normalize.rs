//! Canonicalizes planner-emitted subgoal parameters.
//!
//! LLM output is loose about key names; this pass rewrites the accepted
//! aliases into the canonical shapes, fills documented defaults, and drops
//! entries whose mandatory fields are missing or invalid. Every rewrite or
//! drop produces a human-readable note for the planner transcript.

use serde_json::Value;

use super::subgoal::{Params, Subgoal, SubgoalName};

const DEFAULT_GOTO_NEAREST_DISTANCE: i64 = 48;
const DEFAULT_GOTO_RANGE: i64 = 2;

static TARGET_ALIASES: &[&str] = &["block", "item", "resource", "resource_type", "type"];
static COUNT_ALIASES: &[&str] = &["count", "amount", "qty"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizeOutcome {
    pub subgoals: Vec<Subgoal>,
    pub notes: Vec<String>,
}

pub fn normalize_plan(input: &[Subgoal]) -> NormalizeOutcome {
    let mut out = NormalizeOutcome::default();
    for (index, subgoal) in input.iter().enumerate() {
        match normalize_subgoal(subgoal) {
            Normalized::Kept(normalized) => {
                if normalized.params != subgoal.params {
                    out.notes
                        .push(format!("normalized_subgoal_{index}_{}", subgoal.name));
                }
                out.subgoals.push(normalized);
            }
            Normalized::Dropped(reason) => {
                out.notes.push(format!(
                    "dropped_subgoal_{index}_{}_{reason}",
                    subgoal.name
                ));
            }
        }
    }
    out
}

enum Normalized {
    Kept(Subgoal),
    Dropped(&'static str),
}

fn normalize_subgoal(subgoal: &Subgoal) -> Normalized {
    let mut normalized = subgoal.clone();
    match subgoal.name {
        SubgoalName::Collect => {
            let Some(target) = first_string(&subgoal.params, TARGET_ALIASES) else {
                return Normalized::Dropped("missing_block");
            };
            let Some(count) = first_int(&subgoal.params, COUNT_ALIASES).filter(|c| *c >= 1) else {
                return Normalized::Dropped("missing_count");
            };
            normalized.params = strip_aliases(&subgoal.params, &[TARGET_ALIASES, COUNT_ALIASES]);
            normalized.params.insert("block".to_string(), Value::from(target));
            normalized.params.insert("count".to_string(), Value::from(count));
        }
        SubgoalName::GotoNearest => {
            let Some(target) = first_string(&subgoal.params, TARGET_ALIASES) else {
                return Normalized::Dropped("missing_block");
            };
            let max_distance = first_int(&subgoal.params, &["max_distance", "distance", "radius"])
                .filter(|d| *d > 0)
                .unwrap_or(DEFAULT_GOTO_NEAREST_DISTANCE);
            normalized.params = strip_aliases(
                &subgoal.params,
                &[TARGET_ALIASES, &["max_distance", "distance", "radius"]],
            );
            normalized.params.insert("block".to_string(), Value::from(target));
            normalized
                .params
                .insert("max_distance".to_string(), Value::from(max_distance));
        }
        SubgoalName::Craft | SubgoalName::Withdraw => {
            let Some(item) = first_string(&subgoal.params, TARGET_ALIASES) else {
                return Normalized::Dropped("missing_item");
            };
            let Some(count) = first_int(&subgoal.params, COUNT_ALIASES).filter(|c| *c >= 1) else {
                return Normalized::Dropped("missing_count");
            };
            normalized.params = strip_aliases(&subgoal.params, &[TARGET_ALIASES, COUNT_ALIASES]);
            normalized.params.insert("item".to_string(), Value::from(item));
            normalized.params.insert("count".to_string(), Value::from(count));
        }
        SubgoalName::Smelt => {
            let Some(input) =
                first_string(&subgoal.params, &["input", "item", "block", "resource", "type"])
            else {
                return Normalized::Dropped("missing_input");
            };
            let Some(count) = first_int(&subgoal.params, COUNT_ALIASES).filter(|c| *c >= 1) else {
                return Normalized::Dropped("missing_count");
            };
            let fuel = first_string(&subgoal.params, &["fuel"]);
            normalized.params = strip_aliases(
                &subgoal.params,
                &[&["input", "item", "block", "resource", "type"], COUNT_ALIASES, &["fuel"]],
            );
            normalized.params.insert("input".to_string(), Value::from(input));
            normalized.params.insert("count".to_string(), Value::from(count));
            if let Some(fuel) = fuel {
                normalized.params.insert("fuel".to_string(), Value::from(fuel));
            }
        }
        SubgoalName::Goto => {
            let coords = extract_coords(&subgoal.params);
            let Some((x, y, z)) = coords else {
                return Normalized::Dropped("missing_coordinates");
            };
            let range = first_int(&subgoal.params, &["range"])
                .filter(|r| *r >= 1)
                .unwrap_or(DEFAULT_GOTO_RANGE);
            normalized.params = strip_aliases(
                &subgoal.params,
                &[&["x", "y", "z", "location", "position", "range"]],
            );
            normalized.params.insert("x".to_string(), Value::from(x));
            normalized.params.insert("y".to_string(), Value::from(y));
            normalized.params.insert("z".to_string(), Value::from(z));
            normalized.params.insert("range".to_string(), Value::from(range));
        }
        // Explore, deposit, blueprint and combat subgoals pass through.
        _ => {}
    }
    Normalized::Kept(normalized)
}

fn first_string(params: &Params, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        params
            .get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_ascii_lowercase())
    })
}

fn first_int(params: &Params, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| params.get(*k).and_then(coerce_int))
}

/// Accepts integers, floats (rounded) and numeric strings.
fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok().or_else(|| {
            s.trim().parse::<f64>().ok().map(|f| f.round() as i64)
        }),
        _ => None,
    }
}

fn extract_coords(params: &Params) -> Option<(i64, i64, i64)> {
    let from = |map: &Params| -> Option<(i64, i64, i64)> {
        Some((
            map.get("x").and_then(coerce_int)?,
            map.get("y").and_then(coerce_int)?,
            map.get("z").and_then(coerce_int)?,
        ))
    };
    if let Some(coords) = from(params) {
        return Some(coords);
    }
    for key in ["location", "position"] {
        if let Some(Value::Object(nested)) = params.get(key) {
            let nested: Params = nested.clone().into_iter().collect();
            if let Some(coords) = from(&nested) {
                return Some(coords);
            }
        }
    }
    None
}

fn strip_aliases(params: &Params, alias_sets: &[&[&str]]) -> Params {
    params
        .iter()
        .filter(|(k, _)| !alias_sets.iter().any(|set| set.contains(&k.as_str())))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subgoal(name: SubgoalName, params: serde_json::Value) -> Subgoal {
        let mut sg = Subgoal::new(name);
        if let Value::Object(map) = params {
            sg.params = map.into_iter().collect();
        }
        sg
    }

    #[test]
    fn collect_aliases_rewrite_with_note() {
        let input = vec![subgoal(
            SubgoalName::Collect,
            json!({"type": "stone", "amount": 10}),
        )];
        let out = normalize_plan(&input);
        assert_eq!(out.subgoals.len(), 1);
        assert_eq!(out.subgoals[0].param_str("block"), Some("stone"));
        assert_eq!(out.subgoals[0].param_i64("count"), Some(10));
        assert!(out.notes.contains(&"normalized_subgoal_0_collect".to_string()));
    }

    #[test]
    fn canonical_input_produces_no_notes() {
        let input = vec![subgoal(
            SubgoalName::Collect,
            json!({"block": "stone", "count": 10}),
        )];
        let out = normalize_plan(&input);
        assert!(out.notes.is_empty());
    }

    #[test]
    fn normalize_is_idempotent() {
        let input = vec![
            subgoal(SubgoalName::Collect, json!({"resource": "oak_log", "qty": "3"})),
            subgoal(SubgoalName::Goto, json!({"location": {"x": 1.4, "y": 64, "z": -3.6}})),
            subgoal(SubgoalName::CombatEngage, json!({"max_targets": 2})),
        ];
        let once = normalize_plan(&input);
        let twice = normalize_plan(&once.subgoals);
        assert_eq!(once.subgoals, twice.subgoals);
        assert!(twice.notes.is_empty());
    }

    #[test]
    fn invalid_mandatory_field_drops_entry_with_note() {
        let input = vec![
            subgoal(SubgoalName::Collect, json!({"count": 4})),
            subgoal(SubgoalName::Craft, json!({"item": "stick", "count": 0})),
            subgoal(SubgoalName::Collect, json!({"block": "stone", "count": 2})),
        ];
        let out = normalize_plan(&input);
        assert_eq!(out.subgoals.len(), 1);
        assert!(out
            .notes
            .iter()
            .any(|n| n == "dropped_subgoal_0_collect_missing_block"));
        assert!(out
            .notes
            .iter()
            .any(|n| n == "dropped_subgoal_1_craft_missing_count"));
    }

    #[test]
    fn goto_accepts_nested_location_and_rounds() {
        let input = vec![subgoal(
            SubgoalName::Goto,
            json!({"location": {"x": 10.6, "y": 64.2, "z": -3.2}}),
        )];
        let out = normalize_plan(&input);
        let sg = &out.subgoals[0];
        assert_eq!(sg.param_i64("x"), Some(11));
        assert_eq!(sg.param_i64("y"), Some(64));
        assert_eq!(sg.param_i64("z"), Some(-3));
        assert_eq!(sg.param_i64("range"), Some(2));
    }

    #[test]
    fn goto_nearest_defaults_max_distance() {
        let input = vec![subgoal(SubgoalName::GotoNearest, json!({"resource": "iron_ore"}))];
        let out = normalize_plan(&input);
        assert_eq!(out.subgoals[0].param_str("block"), Some("iron_ore"));
        assert_eq!(out.subgoals[0].param_i64("max_distance"), Some(48));
    }

    #[test]
    fn smelt_keeps_optional_fuel() {
        let input = vec![subgoal(
            SubgoalName::Smelt,
            json!({"item": "raw_iron", "qty": 4, "fuel": "coal"}),
        )];
        let out = normalize_plan(&input);
        let sg = &out.subgoals[0];
        assert_eq!(sg.param_str("input"), Some("raw_iron"));
        assert_eq!(sg.param_i64("count"), Some(4));
        assert_eq!(sg.param_str("fuel"), Some("coal"));
    }

    #[test]
    fn passthrough_subgoals_keep_params() {
        let input = vec![subgoal(
            SubgoalName::Explore,
            json!({"radius": 28, "return_to_base": false}),
        )];
        let out = normalize_plan(&input);
        assert_eq!(out.subgoals[0].params, input[0].params);
        assert!(out.notes.is_empty());
    }
}
