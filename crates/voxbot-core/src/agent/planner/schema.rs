use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::history::HistoryEntry;
use crate::agent::snapshot::Snapshot;
use crate::agent::subgoal::{Params, Subgoal, SubgoalName};

/// Planner input, schema-validated at the service boundary.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PlanRequest {
    pub bot_id: String,
    pub snapshot: Snapshot,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub available_subgoals: Vec<String>,
}

/// Planner output after validation and normalization.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PlanResponse {
    pub next_goal: String,
    pub subgoals: Vec<Subgoal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub constraints: Params,
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("plan request fails with SCHEMA: {0}")]
    Request(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum PlanParseError {
    #[error("no JSON object found in model output")]
    NoJson,
    #[error("invalid plan JSON: {0}")]
    InvalidJson(String),
    #[error("unknown subgoal name: {0}")]
    UnknownSubgoal(String),
    #[error("plan contains no subgoals")]
    EmptyPlan,
}

pub fn validate_request(req: &PlanRequest) -> Result<(), SchemaError> {
    if req.bot_id.trim().is_empty() {
        return Err(SchemaError::Request("bot_id is empty".to_string()));
    }
    if req.available_subgoals.is_empty() {
        return Err(SchemaError::Request("available_subgoals is empty".to_string()));
    }
    for name in &req.available_subgoals {
        if SubgoalName::parse(name).is_none() {
            return Err(SchemaError::Request(format!(
                "unknown subgoal in available_subgoals: {name}"
            )));
        }
    }
    Ok(())
}

/// Loose wire shape for one subgoal as the model emits it.
#[derive(Debug, Deserialize)]
struct WireSubgoal {
    name: String,
    #[serde(default)]
    params: Params,
    #[serde(default)]
    success_criteria: Params,
    #[serde(default)]
    risk_flags: Vec<String>,
    #[serde(default)]
    constraints: Params,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    next_goal: String,
    #[serde(default)]
    subgoals: Vec<WireSubgoal>,
    #[serde(default)]
    risk_flags: Vec<String>,
    #[serde(default)]
    constraints: Params,
}

/// Parses raw model text into a validated response: strips code fences,
/// otherwise bracket-matches the first JSON object, then checks the closed
/// subgoal-name set.
pub fn parse_response(raw: &str) -> Result<PlanResponse, PlanParseError> {
    let json_text = extract_json(raw).ok_or(PlanParseError::NoJson)?;
    let wire: WireResponse = serde_json::from_str(&json_text)
        .map_err(|e| PlanParseError::InvalidJson(e.to_string()))?;

    let mut subgoals = Vec::with_capacity(wire.subgoals.len());
    for sg in wire.subgoals {
        let name = SubgoalName::parse(&sg.name)
            .ok_or_else(|| PlanParseError::UnknownSubgoal(sg.name.clone()))?;
        subgoals.push(Subgoal {
            name,
            params: sg.params,
            success_criteria: sg.success_criteria,
            risk_flags: sg.risk_flags,
            constraints: sg.constraints,
        });
    }
    if subgoals.is_empty() {
        return Err(PlanParseError::EmptyPlan);
    }

    Ok(PlanResponse {
        next_goal: wire.next_goal,
        subgoals,
        risk_flags: wire.risk_flags,
        constraints: wire.constraints,
    })
}

/// Fenced block first; failing that, the first brace-balanced object.
pub fn extract_json(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip an optional language tag on the fence line.
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            let candidate = body[..end].trim();
            if !candidate.is_empty() {
                return Some(candidate.to_string());
            }
        }
    }
    brace_match(trimmed)
}

fn brace_match(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
