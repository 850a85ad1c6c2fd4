//! Fleet-shared coordination state: LLM rate budgets, resource leases, and
//! admission limits. Every type here sits behind a mutex owned by the
//! orchestrator; each has a single public mutation surface.

pub mod admission;
pub mod locks;
pub mod ratelimit;

pub use admission::{ExplorerLimiter, SkillLimiter};
pub use locks::{LockAction, LockEvent, LockManager};
pub use ratelimit::{RateDecision, RateLimitReason, RateLimiter};
