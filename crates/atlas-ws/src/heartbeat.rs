//! Keepalive bookkeeping.
//!
//! A `{"method":"ping"}` goes out every interval while connected. With a
//! pong timeout configured, the connection counts as dead once the oldest
//! unanswered ping is older than the timeout.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Default)]
struct PingState {
    /// Send time of the oldest unanswered ping.
    awaiting_since: Option<Instant>,
    last_rtt: Option<Duration>,
}

pub struct HeartbeatManager {
    interval: Duration,
    /// `None` disables liveness enforcement.
    pong_timeout: Option<Duration>,
    state: Mutex<PingState>,
}

impl HeartbeatManager {
    /// `timeout_ms = 0` disables the pong deadline.
    pub fn new(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms.max(1)),
            pong_timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            state: Mutex::new(PingState::default()),
        }
    }

    /// Forget pings of a previous connection.
    pub fn reset(&self) {
        *self.state.lock() = PingState::default();
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn enforces_timeout(&self) -> bool {
        self.pong_timeout.is_some()
    }

    /// Only the first of several unanswered pings starts the deadline.
    pub fn record_ping(&self) {
        self.record_ping_at(Instant::now());
    }

    fn record_ping_at(&self, now: Instant) {
        let mut state = self.state.lock();
        if state.awaiting_since.is_none() {
            state.awaiting_since = Some(now);
        }
    }

    pub fn record_pong(&self) {
        let mut state = self.state.lock();
        if let Some(sent) = state.awaiting_since.take() {
            let rtt = sent.elapsed();
            state.last_rtt = Some(rtt);
            debug!(rtt_ms = rtt.as_millis() as u64, "Pong received");
        }
    }

    pub fn awaiting_pong(&self) -> bool {
        self.state.lock().awaiting_since.is_some()
    }

    /// Round trip of the last answered ping.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.state.lock().last_rtt
    }

    pub fn is_timed_out(&self) -> bool {
        self.is_timed_out_at(Instant::now())
    }

    fn is_timed_out_at(&self, now: Instant) -> bool {
        let Some(timeout) = self.pong_timeout else {
            return false;
        };
        self.state
            .lock()
            .awaiting_since
            .is_some_and(|sent| now.saturating_duration_since(sent) > timeout)
    }
}
