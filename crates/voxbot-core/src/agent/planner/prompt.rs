use serde_json::json;

use super::schema::PlanRequest;
use crate::agent::subgoal::{Subgoal, SUBGOAL_NAMES};

const REPAIR_NOTE_CAP: usize = 24;

/// Stable prompt sections. Downstream parsing depends on the model keeping
/// to the [CONTRACT]; change these strings deliberately.
const PARAM_RULES: &str = "Parameter rules:\n\
- collect {\"block\":\"<block>\",\"count\":<int >= 1>}\n\
- goto_nearest {\"block\":\"<block>\",\"max_distance\":<int > 0, default 48>}\n\
- craft {\"item\":\"<item>\",\"count\":<int >= 1>}\n\
- smelt {\"input\":\"<item>\",\"count\":<int >= 1>,\"fuel\":\"<item, optional>\"}\n\
- deposit {\"strategy\":\"all_non_essential\"} | withdraw {\"item\":\"<item>\",\"count\":<int>}\n\
- goto {\"x\":<int>,\"y\":<int>,\"z\":<int>,\"range\":<int >= 1, default 2>}\n\
- explore {\"radius\":<int>,\"return_to_base\":<bool>,\"resource_hint\":\"<optional>\"}\n\
- build_blueprint {\"name\":\"<id>\",\"anchor\":{\"x\":..,\"y\":..,\"z\":..},\"blocks\":[..]}\n\
- combat_engage {\"max_targets\":<int>,\"max_distance\":<int>} | combat_guard {\"radius\":<int>,\"duration\":<ms>}";

const EXECUTION_SEMANTICS: &str = "Execution semantics:\n\
Subgoals run strictly in order; each either succeeds or fails with a coded error.\n\
A failed subgoal invalidates the rest of the queue, so order prerequisites first.\n\
Crafting consumes ingredients from inventory; collecting requires the right harvest tool.";

const REASONING_PROTOCOL: &str = "Before answering, reason through four steps:\n\
1. Build a projected inventory from the snapshot (key items plus tools).\n\
2. Validate each subgoal's preconditions against the projection.\n\
3. Prepend any missing prerequisites (tools, ingredients, crafting table).\n\
4. Re-simulate the final sequence and confirm every step is feasible.";

const RESPONSE_CONTRACT: &str = "Respond with exactly one JSON object and nothing else:\n\
{\"next_goal\":\"<short description>\",\"subgoals\":[{\"name\":\"...\",\"params\":{...}}],\"risk_flags\":[]}";

pub fn build_plan_prompt(req: &PlanRequest) -> String {
    let allowed: Vec<&str> = SUBGOAL_NAMES.iter().map(|n| n.as_str()).collect();
    let payload = serde_json::to_string_pretty(&json!({
        "bot_id": req.bot_id,
        "snapshot": req.snapshot,
        "history": req.history,
        "available_subgoals": req.available_subgoals,
    }))
    .unwrap_or_else(|_| "{}".to_string());

    format!(
        "You plan the next actions for a survival game agent.\n\n\
[ALLOWED_SUBGOALS]\n{}\n\n\
[PARAM_RULES]\n{PARAM_RULES}\n\n\
[EXECUTION]\n{EXECUTION_SEMANTICS}\n\n\
[REASONING]\n{REASONING_PROTOCOL}\n\n\
[REQUEST_JSON]\n{payload}\n\n\
[CONTRACT]\n{RESPONSE_CONTRACT}\n",
        allowed.join(", ")
    )
}

/// Repair prompt for the feasibility loop: shows the model its own plan,
/// the guard-adjusted plan, and the guard notes, then asks for a plan that
/// needs no adjustment.
pub fn build_repair_prompt(
    req: &PlanRequest,
    previous: &[Subgoal],
    adjusted: &[Subgoal],
    notes: &[String],
) -> String {
    let base = build_plan_prompt(req);
    let prev_json = serde_json::to_string_pretty(previous).unwrap_or_else(|_| "[]".to_string());
    let adj_json = serde_json::to_string_pretty(adjusted).unwrap_or_else(|_| "[]".to_string());
    let capped: Vec<&str> = notes
        .iter()
        .take(REPAIR_NOTE_CAP)
        .map(String::as_str)
        .collect();

    format!(
        "{base}\n\
[PREVIOUS_SUBGOALS]\n{prev_json}\n\n\
[ADJUSTED_SUBGOALS]\n{adj_json}\n\n\
[FEASIBILITY_NOTES]\n{}\n\n\
[REPAIR]\nYour previous plan was not feasible as written; the adjusted plan shows\n\
the dependency-correct expansion. Produce a plan that already satisfies its\n\
own prerequisites so no adjustment is needed.\n",
        capped.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::minimal_request;
    use crate::agent::subgoal::{Subgoal, SubgoalName};

    #[test]
    fn plan_prompt_contains_all_sections_and_names() {
        let prompt = build_plan_prompt(&minimal_request("alpha"));
        for section in [
            "[ALLOWED_SUBGOALS]",
            "[PARAM_RULES]",
            "[EXECUTION]",
            "[REASONING]",
            "[REQUEST_JSON]",
            "[CONTRACT]",
        ] {
            assert!(prompt.contains(section), "missing {section}");
        }
        for name in crate::agent::subgoal::SUBGOAL_NAMES {
            assert!(prompt.contains(name.as_str()));
        }
        assert!(prompt.contains("\"bot_id\": \"alpha\""));
    }

    #[test]
    fn repair_prompt_caps_notes() {
        let req = minimal_request("alpha");
        let prev = vec![Subgoal::new(SubgoalName::Collect)];
        let adj = vec![Subgoal::new(SubgoalName::Explore)];
        let notes: Vec<String> = (0..40).map(|i| format!("note_{i}")).collect();
        let prompt = build_repair_prompt(&req, &prev, &adj, &notes);
        assert!(prompt.contains("[PREVIOUS_SUBGOALS]"));
        assert!(prompt.contains("[ADJUSTED_SUBGOALS]"));
        assert!(prompt.contains("note_23"));
        assert!(!prompt.contains("note_24"));
    }
}
