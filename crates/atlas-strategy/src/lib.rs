//! Strategy lifecycle for Atlas.
//!
//! - `state_machine`: guarded, persisted state transitions
//! - `decision`: the decision agent boundary and the threshold agent
//! - `evaluator`: periodic evaluation that turns approvals into intents
//! - `config`: per-strategy configuration

pub mod config;
pub mod decision;
pub mod error;
pub mod evaluator;
pub mod state_machine;

pub use config::{AgentConfig, StrategyConfig};
pub use decision::{
    Decision, DecisionAgent, DecisionInput, DecisionParams, RecentPattern, ThresholdAgent, Verdict,
};
pub use error::{StrategyError, StrategyResult};
pub use evaluator::{EvaluationOutcome, StrategyEvaluator};
pub use state_machine::StrategyStateMachine;
