//! Strategy lifecycle state machine.
//!
//! ```text
//! IDLE -> SETUP -> TRIGGERED -> ORDERING -> IN_POSITION -> EXITING -> COOLDOWN -> IDLE
//!          |           |            |                        |
//!          +-> IDLE    +-> IDLE     +-> IDLE                 +-> IN_POSITION
//! ```
//!
//! Transitions are checked against the table in `StrategyState` and
//! persisted with one conditional write guarded by the expected current
//! state. There are no timeout-driven transitions.

use crate::error::{StrategyError, StrategyResult};
use atlas_core::{Clock, Strategy, StrategyState};
use atlas_store::{StoreError, Tables};
use atlas_telemetry::Metrics;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Guarded strategy state transitions.
#[derive(Clone)]
pub struct StrategyStateMachine {
    tables: Tables,
    clock: Arc<dyn Clock>,
}

impl StrategyStateMachine {
    pub fn new(tables: Tables, clock: Arc<dyn Clock>) -> Self {
        Self { tables, clock }
    }

    /// Check a transition without touching the store.
    pub fn validate(from: StrategyState, to: StrategyState) -> StrategyResult<()> {
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(StrategyError::InvalidTransition {
                current: from,
                requested: to,
                allowed: from.allowed_transitions().to_vec(),
            })
        }
    }

    /// Move `strategy_id` from `expected_from` to `requested`.
    ///
    /// Illegal moves fail with `InvalidTransition` and write nothing. A
    /// legal move is one compare-and-swap on `current_state`; losing the
    /// race yields `StateConflict` with the state actually stored.
    pub async fn transition(
        &self,
        strategy_id: &str,
        expected_from: StrategyState,
        requested: StrategyState,
        metadata: Value,
    ) -> StrategyResult<Strategy> {
        if let Err(e) = Self::validate(expected_from, requested) {
            Metrics::strategy_transition_rejected("invalid");
            warn!(
                strategy_id,
                from = %expected_from,
                to = %requested,
                "Rejected illegal strategy transition"
            );
            return Err(e);
        }

        if expected_from == StrategyState::Idle && requested == StrategyState::Setup {
            let strategy = self
                .tables
                .get_strategy(strategy_id)
                .await?
                .ok_or_else(|| StrategyError::NotFound(strategy_id.to_string()))?;
            if strategy.is_disabled() {
                Metrics::strategy_transition_rejected("disabled");
                return Err(StrategyError::Disabled(strategy_id.to_string()));
            }
        }

        let now = self.clock.now();
        match self
            .tables
            .compare_and_set_state(strategy_id, expected_from, requested, now, metadata)
            .await
        {
            Ok(strategy) => {
                Metrics::strategy_transition(expected_from.as_str(), requested.as_str());
                info!(
                    strategy_id,
                    from = %expected_from,
                    to = %requested,
                    "Strategy transition"
                );
                Ok(strategy)
            }
            Err(StoreError::PreconditionFailed { .. }) => {
                let actual = self.current_state(strategy_id).await?;
                Metrics::strategy_transition_rejected("conflict");
                debug!(
                    strategy_id,
                    expected = %expected_from,
                    actual = %actual,
                    "Strategy transition lost a race"
                );
                Err(StrategyError::StateConflict {
                    expected: expected_from,
                    actual,
                })
            }
            Err(StoreError::NotFound { .. }) => {
                Err(StrategyError::NotFound(strategy_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn current_state(&self, strategy_id: &str) -> StrategyResult<StrategyState> {
        self.tables
            .get_strategy(strategy_id)
            .await?
            .map(|s| s.current_state)
            .ok_or_else(|| StrategyError::NotFound(strategy_id.to_string()))
    }
}
