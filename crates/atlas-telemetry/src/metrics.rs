//! Prometheus metrics for the Atlas engine.
//!
//! Covers:
//! - Stream connection state and reconnects
//! - Frame dispatch, drops and decode errors
//! - Risk denials
//! - Orders by status, paper fallbacks, broker latency
//! - Strategy transitions
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which must crash at startup. This only happens
//! during static initialization.

use crate::error::TelemetryResult;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    register_int_gauge, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, IntGauge, TextEncoder,
};

/// Stream connection state (1 = connected, 0 = disconnected).
pub static WS_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("atlas_ws_connected", "Stream connection state (1=connected)").unwrap()
});

/// Reconnection attempts.
pub static WS_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "atlas_ws_reconnect_total",
        "Total stream reconnection attempts",
        &["reason"]
    )
    .unwrap()
});

/// Subscriptions currently held by the registry.
pub static SUBSCRIPTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "atlas_subscriptions_active",
        "Channel keys held by the subscription registry"
    )
    .unwrap()
});

/// Frames delivered to at least one handler.
pub static FRAMES_DISPATCHED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "atlas_frames_dispatched_total",
        "Inbound frames dispatched to handlers",
        &["channel"]
    )
    .unwrap()
});

/// Frames dropped before reaching a handler.
pub static FRAMES_DROPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "atlas_frames_dropped_total",
        "Inbound frames dropped",
        &["reason"]
    )
    .unwrap()
});

/// Payloads that failed to decode.
pub static DECODE_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "atlas_decode_errors_total",
        "Payload decode errors",
        &["channel"]
    )
    .unwrap()
});

/// Market data staleness in milliseconds.
pub static MARKET_STALENESS_MS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "atlas_market_staleness_ms",
        "Milliseconds since the last market update",
        &["symbol"]
    )
    .unwrap()
});

/// Risk gate denials.
pub static RISK_DENIALS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "atlas_risk_denials_total",
        "Risk gate denials by reason code",
        &["code"]
    )
    .unwrap()
});

/// Orders recorded, by final status and venue.
pub static ORDERS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "atlas_orders_total",
        "Orders recorded by status",
        &["status", "venue"]
    )
    .unwrap()
});

/// Orders that fell back to a paper fill.
pub static PAPER_FALLBACK_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "atlas_paper_fallback_total",
        "Orders filled on paper after a broker failure",
        &["reason"]
    )
    .unwrap()
});

/// Broker call latency.
pub static BROKER_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "atlas_broker_latency_ms",
        "Broker call latency in milliseconds",
        &["broker", "op"],
        vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap()
});

/// Strategy state transitions.
pub static STRATEGY_TRANSITIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "atlas_strategy_transitions_total",
        "Strategy state transitions",
        &["from", "to"]
    )
    .unwrap()
});

/// Transition attempts rejected as illegal or lost to a concurrent writer.
pub static STRATEGY_TRANSITION_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "atlas_strategy_transition_rejected_total",
        "Rejected strategy transitions",
        &["reason"]
    )
    .unwrap()
});

/// Realized PnL per closed position.
pub static REALIZED_PNL_USD: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "atlas_realized_pnl_usd",
        "Realized PnL of the last closed position",
        &["symbol"]
    )
    .unwrap()
});

/// Metric helper functions.
pub struct Metrics;

impl Metrics {
    pub fn ws_connected() {
        WS_CONNECTED.set(1.0);
    }

    pub fn ws_disconnected() {
        WS_CONNECTED.set(0.0);
    }

    pub fn ws_reconnect(reason: &str) {
        WS_RECONNECT_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn subscriptions_active(count: usize) {
        SUBSCRIPTIONS_ACTIVE.set(count as i64);
    }

    pub fn frame_dispatched(channel: &str) {
        FRAMES_DISPATCHED_TOTAL.with_label_values(&[channel]).inc();
    }

    pub fn frame_dropped(reason: &str) {
        FRAMES_DROPPED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn decode_error(channel: &str) {
        DECODE_ERRORS_TOTAL.with_label_values(&[channel]).inc();
    }

    pub fn market_staleness(symbol: &str, age_ms: f64) {
        MARKET_STALENESS_MS.with_label_values(&[symbol]).set(age_ms);
    }

    pub fn risk_denied(code: &str) {
        RISK_DENIALS_TOTAL.with_label_values(&[code]).inc();
    }

    /// Record an order outcome. `venue` is `paper` or `live`.
    pub fn order_recorded(status: &str, is_paper: bool) {
        let venue = if is_paper { "paper" } else { "live" };
        ORDERS_TOTAL.with_label_values(&[status, venue]).inc();
    }

    pub fn paper_fallback(reason: &str) {
        PAPER_FALLBACK_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn broker_latency(broker: &str, op: &str, latency_ms: f64) {
        BROKER_LATENCY_MS
            .with_label_values(&[broker, op])
            .observe(latency_ms);
    }

    pub fn strategy_transition(from: &str, to: &str) {
        STRATEGY_TRANSITIONS_TOTAL
            .with_label_values(&[from, to])
            .inc();
    }

    pub fn strategy_transition_rejected(reason: &str) {
        STRATEGY_TRANSITION_REJECTED_TOTAL
            .with_label_values(&[reason])
            .inc();
    }

    pub fn realized_pnl(symbol: &str, pnl_usd: f64) {
        REALIZED_PNL_USD.with_label_values(&[symbol]).set(pnl_usd);
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_update_metrics() {
        Metrics::ws_connected();
        assert_eq!(WS_CONNECTED.get(), 1.0);
        Metrics::ws_disconnected();
        assert_eq!(WS_CONNECTED.get(), 0.0);

        let before = RISK_DENIALS_TOTAL
            .with_label_values(&["COOLDOWN_ACTIVE"])
            .get();
        Metrics::risk_denied("COOLDOWN_ACTIVE");
        let after = RISK_DENIALS_TOTAL
            .with_label_values(&["COOLDOWN_ACTIVE"])
            .get();
        assert_eq!(after - before, 1.0);
    }

    #[test]
    fn test_render_contains_registered_metrics() {
        Metrics::order_recorded("filled", true);
        Metrics::strategy_transition("IDLE", "SETUP");
        let text = Metrics::render().unwrap();
        assert!(text.contains("atlas_orders_total"));
        assert!(text.contains("venue=\"paper\""));
        assert!(text.contains("atlas_strategy_transitions_total"));
    }
}
