//! Planner service: prompt build, LLM call with retries, validation,
//! normalization, feasibility guard, repair reprompts, and deterministic
//! fallback. Rate limits are consulted before any model call.

pub mod fallback;
pub mod prompt;
pub mod schema;

use std::sync::{Arc, Mutex};

use anyhow::Context;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::agent::adapter::{LlmClient, Position};
use crate::agent::guard::FeasibilityGuard;
use crate::agent::normalize::normalize_plan;
use crate::agent::subgoal::Subgoal;
use crate::coord::RateLimiter;

pub use fallback::fallback_plan;
pub use schema::{PlanRequest, PlanResponse, SchemaError};

const RETRY_BASE_DELAY_MS: u64 = 80;
const RETRY_JITTER_MS: u64 = 40;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Success,
    RateLimited,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    pub status: PlanStatus,
    pub response: PlanResponse,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PlannerServiceConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub feasibility_reprompt_enabled: bool,
    pub feasibility_reprompt_max_attempts: u32,
    pub base_position: Position,
    pub game_version: String,
}

impl Default for PlannerServiceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_retries: 2,
            feasibility_reprompt_enabled: true,
            feasibility_reprompt_max_attempts: 1,
            base_position: Position::default(),
            game_version: "1.20".to_string(),
        }
    }
}

pub struct PlannerService {
    llm: Arc<dyn LlmClient>,
    rate: Arc<Mutex<RateLimiter>>,
    guard: Arc<FeasibilityGuard>,
    cfg: PlannerServiceConfig,
}

impl PlannerService {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        rate: Arc<Mutex<RateLimiter>>,
        guard: Arc<FeasibilityGuard>,
        cfg: PlannerServiceConfig,
    ) -> Self {
        Self {
            llm,
            rate,
            guard,
            cfg,
        }
    }

    pub fn rate_limiter(&self) -> &Arc<Mutex<RateLimiter>> {
        &self.rate
    }

    /// Schema failures are fatal to the caller; everything else degrades to
    /// a rate-limited or fallback outcome with a deterministic plan.
    pub async fn plan(&self, req: &PlanRequest, now_ms: u64) -> Result<PlanOutcome, SchemaError> {
        schema::validate_request(req)?;

        let decision = {
            let mut rate = self.rate.lock().expect("rate limiter poisoned");
            rate.consume(&req.bot_id, now_ms)
        };
        if !decision.allowed {
            let reason = decision
                .reason
                .map(|r| r.as_str())
                .unwrap_or("UNKNOWN");
            let response = fallback_plan(
                &self.guard,
                &req.snapshot,
                &format!("RATE_LIMIT_{reason}"),
                self.cfg.base_position,
                &self.cfg.game_version,
            );
            tracing::info!(bot = %req.bot_id, reason, "planner.rate_limited");
            return Ok(PlanOutcome {
                status: PlanStatus::RateLimited,
                response,
                tokens_in: 0,
                tokens_out: 0,
                notes: vec![format!("rate_limited_{reason}")],
            });
        }

        match self.try_plan(req, now_ms).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(bot = %req.bot_id, error = %message, "planner.fallback");
                let response = fallback_plan(
                    &self.guard,
                    &req.snapshot,
                    &format!("PLANNER_ERROR:{message}"),
                    self.cfg.base_position,
                    &self.cfg.game_version,
                );
                Ok(PlanOutcome {
                    status: PlanStatus::Fallback,
                    response,
                    tokens_in: 0,
                    tokens_out: 0,
                    notes: vec![format!("planner_error: {message}")],
                })
            }
        }
    }

    async fn try_plan(&self, req: &PlanRequest, now_ms: u64) -> anyhow::Result<PlanOutcome> {
        let mut tokens_in = 0u32;
        let mut tokens_out = 0u32;
        let mut notes: Vec<String> = Vec::new();

        let prompt_text = prompt::build_plan_prompt(req);
        let reply = self.generate_with_retries(prompt_text).await?;
        tokens_in += reply.tokens_in.unwrap_or(0);
        tokens_out += reply.tokens_out.unwrap_or(0);

        let parsed = schema::parse_response(&reply.text).context("parse plan response")?;
        let normalized = normalize_plan(&parsed.subgoals);
        notes.extend(normalized.notes.iter().cloned());
        if normalized.subgoals.is_empty() {
            anyhow::bail!("no valid subgoals after normalization");
        }

        let mut model_plan: Vec<Subgoal> = normalized.subgoals;
        let mut guarded = self.guard.apply(&req.snapshot, &model_plan);
        notes.extend(guarded.notes.iter().cloned());
        let mut next_goal = parsed.next_goal;
        let mut risk_flags = parsed.risk_flags;
        let mut constraints = parsed.constraints;

        if guarded.rewritten && self.cfg.feasibility_reprompt_enabled {
            for attempt in 0..self.cfg.feasibility_reprompt_max_attempts {
                let decision = {
                    let mut rate = self.rate.lock().expect("rate limiter poisoned");
                    rate.consume(&req.bot_id, now_ms)
                };
                if !decision.allowed {
                    notes.push("feasibility_reprompt_rate_limited".to_string());
                    break;
                }

                let repair = prompt::build_repair_prompt(
                    req,
                    &model_plan,
                    &guarded.subgoals,
                    &guarded.notes,
                );
                // A broken repair round keeps the guarded plan we already
                // have rather than failing the whole call.
                let attempt_result = async {
                    let reply = self.generate_with_retries(repair).await?;
                    let parsed = schema::parse_response(&reply.text)?;
                    anyhow::Ok((reply, parsed))
                }
                .await;

                let (reply, reparsed) = match attempt_result {
                    Ok(ok) => ok,
                    Err(err) => {
                        notes.push(format!("feasibility_reprompt_failed: {err:#}"));
                        break;
                    }
                };
                tokens_in += reply.tokens_in.unwrap_or(0);
                tokens_out += reply.tokens_out.unwrap_or(0);

                let renormalized = normalize_plan(&reparsed.subgoals);
                notes.extend(renormalized.notes.iter().cloned());
                if renormalized.subgoals.is_empty() {
                    notes.push("feasibility_reprompt_empty".to_string());
                    break;
                }
                model_plan = renormalized.subgoals;
                guarded = self.guard.apply(&req.snapshot, &model_plan);
                notes.extend(guarded.notes.iter().cloned());
                next_goal = reparsed.next_goal;
                risk_flags = reparsed.risk_flags;
                constraints = reparsed.constraints;

                if !guarded.rewritten {
                    notes.push("feasibility_reprompt_resolved".to_string());
                    break;
                }
                notes.push(format!("feasibility_reprompt_attempt_{attempt}_rewritten"));
            }
        }

        Ok(PlanOutcome {
            status: PlanStatus::Success,
            response: PlanResponse {
                next_goal,
                subgoals: guarded.subgoals,
                risk_flags,
                constraints,
            },
            tokens_in,
            tokens_out,
            notes,
        })
    }

    async fn generate_with_retries(
        &self,
        prompt_text: String,
    ) -> anyhow::Result<crate::agent::adapter::LlmReply> {
        let mut attempt = 0u32;
        loop {
            match self
                .llm
                .generate(prompt_text.clone(), self.cfg.timeout_ms)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(err) if attempt < self.cfg.max_retries => {
                    let jitter: u64 = rand::thread_rng().gen_range(0..=RETRY_JITTER_MS);
                    let delay = RETRY_BASE_DELAY_MS * u64::from(attempt + 1) + jitter;
                    tracing::debug!(attempt, error = %format!("{err:#}"), "planner.llm_retry");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
