//! Currently displayed risk event per account.

use atlas_core::{RiskEvent, Severity};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Keeps the one risk event shown per account.
///
/// A new event replaces the displayed one only when it supersedes it
/// (strictly more severe, or equally severe and not older).
#[derive(Debug, Default)]
pub struct RiskEventBoard {
    displayed: RwLock<HashMap<String, RiskEvent>>,
}

impl RiskEventBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an event for display. Returns true if it is now displayed.
    pub fn offer(&self, event: RiskEvent) -> bool {
        let mut displayed = self.displayed.write();
        let replace = displayed
            .get(&event.account)
            .map_or(true, |current| event.supersedes(current));
        if replace {
            debug!(
                account = %event.account,
                code = %event.code,
                severity = %event.severity,
                "Displaying risk event"
            );
            displayed.insert(event.account.clone(), event);
        }
        replace
    }

    pub fn current(&self, account: &str) -> Option<RiskEvent> {
        self.displayed.read().get(account).cloned()
    }

    /// Dismiss the displayed event.
    pub fn clear(&self, account: &str) -> Option<RiskEvent> {
        self.displayed.write().remove(account)
    }

    /// Highest displayed severity across accounts.
    pub fn max_severity(&self) -> Option<Severity> {
        self.displayed.read().values().map(|e| e.severity).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::RiskCode;
    use chrono::{DateTime, Duration, Utc};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-05T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn event(code: RiskCode, at: DateTime<Utc>) -> RiskEvent {
        RiskEvent::new("acct", code, code.as_str(), at)
    }

    #[test]
    fn test_more_severe_replaces() {
        let board = RiskEventBoard::new();
        assert!(board.offer(event(RiskCode::CooldownActive, t0())));
        assert!(board.offer(event(RiskCode::DailyLossExceeded, t0())));
        assert_eq!(
            board.current("acct").unwrap().code,
            RiskCode::DailyLossExceeded
        );
    }

    #[test]
    fn test_less_severe_ignored() {
        let board = RiskEventBoard::new();
        board.offer(event(RiskCode::KillSwitchActive, t0()));
        assert!(!board.offer(event(RiskCode::MaxTradesExceeded, t0() + Duration::minutes(1))));
        assert_eq!(board.max_severity(), Some(Severity::Fatal));
    }

    #[test]
    fn test_equal_severity_newer_replaces_older_does_not() {
        let board = RiskEventBoard::new();
        board.offer(event(RiskCode::MaxTradesExceeded, t0()));
        assert!(board.offer(event(RiskCode::PositionSizeExceeded, t0() + Duration::seconds(1))));
        assert!(!board.offer(event(RiskCode::MaxTradesExceeded, t0() - Duration::seconds(1))));
        assert_eq!(
            board.current("acct").unwrap().code,
            RiskCode::PositionSizeExceeded
        );
    }

    #[test]
    fn test_clear() {
        let board = RiskEventBoard::new();
        board.offer(event(RiskCode::CooldownActive, t0()));
        assert!(board.clear("acct").is_some());
        assert!(board.current("acct").is_none());
    }
}
