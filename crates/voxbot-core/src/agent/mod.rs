//! Per-agent control core: data model, snapshotting, planning, guarding,
//! skill execution, reflexes and the controller that ties them together.
//!
//! The adapter and LLM traits in [`adapter`] are the only boundaries to the
//! outside world; everything else is deterministic given their outputs.

pub mod adapter;
pub mod controller;
pub mod guard;
pub mod history;
pub mod normalize;
pub mod planner;
pub mod reflex;
pub mod skills;
pub mod snapshot;
pub mod subgoal;

pub use controller::{AgentController, ControllerContext, ControllerState};
pub use subgoal::{FailureCode, RuntimeSubgoal, SkillResult, Subgoal, SubgoalName, Trigger};
