//! Risk enforcement for Atlas.
//!
//! - `gate`: ordered pre-trade checks (kill switch, cooldown, daily loss,
//!   trade count, position size)
//! - `state`: per-account daily risk rows (`RiskLedger`)
//! - `events`: severity-ordered display of the current risk event

pub mod error;
pub mod events;
pub mod gate;
pub mod state;

pub use error::{RiskError, RiskResult};
pub use events::RiskEventBoard;
pub use gate::{GateResult, RiskDecision, RiskDenial, RiskGate};
pub use state::RiskLedger;
