//! Subscription registry for multiplexed WebSocket channels.
//!
//! Many logical listeners share one wire subscription per channel key.
//! The registry ref-counts handlers per key, emits a wire subscribe on the
//! 0→1 transition and a wire unsubscribe on 1→0, and routes decoded frames
//! to the handlers of the matching key.
//!
//! Connection state lives under the same lock as the handler table, so a
//! subscribe racing a reconnect is sent exactly once: either immediately
//! (already connected) or by the replay in `on_connected`.

use crate::error::WsResult;
use crate::message::{StreamFrame, WsRequest};
use crate::ws_write_handle::WsWriteHandle;
use atlas_core::{ChannelKey, SubscriptionSpec};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Error type returned by frame handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Frame handler invoked synchronously on the dispatch path.
pub type FrameHandler = Arc<dyn Fn(&StreamFrame) -> Result<(), HandlerError> + Send + Sync>;

/// Handle identifying exactly one registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    id: u64,
    key: ChannelKey,
}

impl SubscriptionToken {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct HandlerSlot {
    id: u64,
    handler: FrameHandler,
    /// Cleared on unsubscribe so an in-flight dispatch skips the handler.
    active: Arc<AtomicBool>,
}

struct KeyEntry {
    spec: SubscriptionSpec,
    handlers: Vec<HandlerSlot>,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<ChannelKey, KeyEntry>,
    /// Insertion order of keys, used for deterministic replay.
    order: Vec<ChannelKey>,
    connected: bool,
    outbound: Option<WsWriteHandle>,
}

impl RegistryInner {
    fn send(&self, request: WsRequest) {
        let Some(outbound) = self.outbound.as_ref() else {
            return;
        };
        if let Err(e) = outbound.send_request(&request) {
            warn!(?e, method = %request.method, "Failed to queue subscription frame");
        }
    }
}

fn lacks_context(frame: &StreamFrame) -> bool {
    (frame.channel_type.requires_user() && frame.user.is_none())
        || (frame.channel_type.requires_interval() && frame.key.as_str().matches(':').count() < 2)
}

/// Result of dispatching one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers invoked.
    pub invoked: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

impl DispatchOutcome {
    pub fn is_unrouted(&self) -> bool {
        self.invoked == 0
    }
}

/// Ref-counted subscription registry shared between the transport and
/// consumers.
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attach the outbound channel of a transport.
    pub fn attach(&self, outbound: WsWriteHandle) {
        self.inner.lock().outbound = Some(outbound);
    }

    /// Register `handler` for `spec`.
    ///
    /// The first handler for a key emits a wire subscribe when connected;
    /// otherwise the subscribe is deferred to the next replay.
    pub fn subscribe<F>(&self, spec: SubscriptionSpec, handler: F) -> WsResult<SubscriptionToken>
    where
        F: Fn(&StreamFrame) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        spec.validate()?;
        let key = spec.key();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = HandlerSlot {
            id,
            handler: Arc::new(handler),
            active: Arc::new(AtomicBool::new(true)),
        };

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.entries.get_mut(&key) {
            Some(entry) => {
                entry.handlers.push(slot);
                debug!(%key, handlers = entry.handlers.len(), "Added handler to existing subscription");
            }
            None => {
                inner.entries.insert(
                    key.clone(),
                    KeyEntry {
                        spec: spec.clone(),
                        handlers: vec![slot],
                    },
                );
                inner.order.push(key.clone());
                if inner.connected {
                    inner.send(WsRequest::subscribe(&spec));
                    info!(%key, "Subscribed");
                } else {
                    debug!(%key, "Subscription deferred until connected");
                }
            }
        }

        Ok(SubscriptionToken { id, key })
    }

    /// Remove exactly the handler identified by `token`.
    ///
    /// Returns `false` when the token was already removed. Removing the last
    /// handler of a key deletes the key and emits a wire unsubscribe when
    /// connected.
    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.entries.get_mut(&token.key) else {
            return false;
        };
        let Some(pos) = entry.handlers.iter().position(|h| h.id == token.id) else {
            return false;
        };

        let slot = entry.handlers.remove(pos);
        slot.active.store(false, Ordering::Release);

        if entry.handlers.is_empty() {
            if let Some(entry) = inner.entries.remove(&token.key) {
                inner.order.retain(|k| k != &token.key);
                if inner.connected {
                    inner.send(WsRequest::unsubscribe(&entry.spec));
                    info!(key = %token.key, "Unsubscribed");
                }
            }
        }
        true
    }

    /// Mark the transport connected and queue a subscribe for every held key.
    ///
    /// Returns the number of subscriptions replayed.
    pub fn on_connected(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.connected = true;
        let requests: Vec<WsRequest> = inner
            .order
            .iter()
            .filter_map(|key| inner.entries.get(key))
            .map(|entry| WsRequest::subscribe(&entry.spec))
            .collect();
        for request in &requests {
            inner.send(request.clone());
        }
        requests.len()
    }

    /// Mark the transport disconnected. Subscriptions are kept for replay.
    pub fn on_disconnected(&self) {
        self.inner.lock().connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Dispatch a frame to its handlers.
    ///
    /// Handlers for the exact key run first, then those registered on the
    /// coin-qualified fallback key, each group in registration order. A
    /// failing or panicking handler does not stop its siblings.
    pub fn dispatch(&self, frame: &StreamFrame) -> DispatchOutcome {
        let handlers: Vec<(u64, FrameHandler, Arc<AtomicBool>)> = {
            let inner = self.inner.lock();
            let fallback = frame.fallback_key();
            let mut matched: Vec<&KeyEntry> = std::iter::once(&frame.key)
                .chain(fallback.as_ref())
                .filter_map(|key| inner.entries.get(key))
                .collect();

            // Frames that omit the interval or user (e.g. `orderUpdates`)
            // go to every key that extends the frame's key.
            if matched.is_empty() && lacks_context(frame) {
                let prefix = format!("{}:", frame.key);
                matched = inner
                    .order
                    .iter()
                    .filter(|key| key.as_str().starts_with(&prefix))
                    .filter_map(|key| inner.entries.get(key))
                    .collect();
            }

            matched
                .into_iter()
                .flat_map(|entry| entry.handlers.iter())
                .map(|slot| (slot.id, slot.handler.clone(), slot.active.clone()))
                .collect()
        };

        let mut outcome = DispatchOutcome::default();
        for (id, handler, active) in handlers {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            outcome.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    warn!(key = %frame.key, handler_id = id, error = %e, "Frame handler failed");
                }
                Err(_) => {
                    outcome.failed += 1;
                    error!(key = %frame.key, handler_id = id, "Frame handler panicked");
                }
            }
        }
        outcome
    }

    /// Specs currently held, in subscription order.
    pub fn active_specs(&self) -> Vec<SubscriptionSpec> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|key| inner.entries.get(key))
            .map(|entry| entry.spec.clone())
            .collect()
    }

    pub fn handler_count(&self, key: &ChannelKey) -> usize {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.handlers.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::message::{route_frame, ChannelMessage};
    use crate::ws_write_handle::WsOutbound;
    use atlas_core::ChannelType;
    use parking_lot::RwLock;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn registry_with_outbound() -> (SubscriptionRegistry, mpsc::UnboundedReceiver<WsOutbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = SubscriptionRegistry::new();
        registry.attach(WsWriteHandle::new(
            tx,
            Arc::new(RwLock::new(ConnectionState::Connected)),
        ));
        (registry, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WsOutbound>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(WsOutbound::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn noop(_: &StreamFrame) -> Result<(), HandlerError> {
        Ok(())
    }

    fn frame(channel: &str, data: serde_json::Value) -> StreamFrame {
        route_frame(ChannelMessage {
            channel: channel.to_string(),
            data,
        })
        .unwrap()
    }

    #[test]
    fn test_subscribe_then_unsubscribe_leaves_no_handler() {
        let (registry, _rx) = registry_with_outbound();
        let spec = SubscriptionSpec::l2_book("BTC");
        let key = spec.key();

        let token = registry.subscribe(spec, noop).unwrap();
        assert_eq!(registry.handler_count(&key), 1);

        assert!(registry.unsubscribe(&token));
        assert_eq!(registry.handler_count(&key), 0);
        assert!(!registry.contains(&key));
        assert!(!registry.unsubscribe(&token));
    }

    #[test]
    fn test_wire_frames_only_on_zero_one_transitions() {
        let (registry, mut rx) = registry_with_outbound();
        registry.on_connected();

        let t1 = registry.subscribe(SubscriptionSpec::l2_book("BTC"), noop).unwrap();
        let t2 = registry.subscribe(SubscriptionSpec::l2_book("btc"), noop).unwrap();
        let t3 = registry.subscribe(SubscriptionSpec::l2_book("BTC"), noop).unwrap();

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["method"], "subscribe");

        registry.unsubscribe(&t1);
        registry.unsubscribe(&t2);
        assert!(drain(&mut rx).is_empty());

        registry.unsubscribe(&t3);
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["method"], "unsubscribe");
        assert_eq!(sent[0]["subscription"]["coin"], "BTC");
    }

    #[test]
    fn test_subscribe_while_disconnected_is_deferred_to_replay() {
        let (registry, mut rx) = registry_with_outbound();

        registry.subscribe(SubscriptionSpec::l2_book("BTC"), noop).unwrap();
        registry.subscribe(SubscriptionSpec::candle("ETH", "1m"), noop).unwrap();
        assert!(drain(&mut rx).is_empty());

        assert_eq!(registry.on_connected(), 2);
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["subscription"]["type"], "l2Book");
        assert_eq!(sent[1]["subscription"]["interval"], "1m");
    }

    #[test]
    fn test_unsubscribe_while_disconnected_sends_nothing() {
        let (registry, mut rx) = registry_with_outbound();
        let token = registry.subscribe(SubscriptionSpec::all_mids(), noop).unwrap();
        registry.unsubscribe(&token);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(registry.on_connected(), 0);
    }

    #[test]
    fn test_invalid_spec_rejected() {
        let registry = SubscriptionRegistry::new();
        let spec = SubscriptionSpec::coin(ChannelType::Candle, "BTC");
        assert!(registry.subscribe(spec, noop).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let registry = SubscriptionRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let log = log.clone();
            registry
                .subscribe(SubscriptionSpec::candle("ETH", "1m"), move |_| {
                    log.lock().push(name);
                    Ok(())
                })
                .unwrap();
        }
        let log_other = log.clone();
        registry
            .subscribe(SubscriptionSpec::candle("ETH", "5m"), move |_| {
                log_other.lock().push("other-interval");
                Ok(())
            })
            .unwrap();

        let outcome = registry.dispatch(&frame("candle", json!({"s": "ETH", "i": "1m"})));
        assert_eq!(outcome.invoked, 2);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_frame_without_user_reaches_user_subscriptions() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        registry
            .subscribe(
                SubscriptionSpec::user(ChannelType::OrderUpdates, "0xAbC"),
                move |_| {
                    hits_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .unwrap();

        let outcome = registry.dispatch(&frame(
            "orderUpdates",
            json!([{"order": {"coin": "BTC", "oid": 1}, "status": "filled"}]),
        ));
        assert_eq!(outcome.invoked, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_uses_coin_fallback_key() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        registry
            .subscribe(SubscriptionSpec::l2_book("BTC"), move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let mut f = frame("l2Book", json!({"coin": "BTC"}));
        // Frame carrying extra context still reaches the coin-scoped handler.
        f.key = ChannelKey::build(ChannelType::L2Book, Some("BTC"), Some("5"), None);
        let outcome = registry.dispatch(&f);
        assert_eq!(outcome.invoked, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_and_panicking_handlers_do_not_stop_siblings() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry
            .subscribe(SubscriptionSpec::l2_book("BTC"), |_| Err("boom".into()))
            .unwrap();
        registry
            .subscribe(SubscriptionSpec::l2_book("BTC"), |_| panic!("handler panic"))
            .unwrap();
        let hits_clone = hits.clone();
        registry
            .subscribe(SubscriptionSpec::l2_book("BTC"), move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let outcome = registry.dispatch(&frame("l2Book", json!({"coin": "BTC"})));
        assert_eq!(outcome.invoked, 3);
        assert_eq!(outcome.failed, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_unsubscribed_mid_dispatch_is_skipped() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let second_token: Arc<Mutex<Option<SubscriptionToken>>> = Arc::new(Mutex::new(None));
        let second_hits = Arc::new(AtomicUsize::new(0));

        let reg = registry.clone();
        let tok = second_token.clone();
        registry
            .subscribe(SubscriptionSpec::l2_book("BTC"), move |_| {
                if let Some(token) = tok.lock().as_ref() {
                    reg.unsubscribe(token);
                }
                Ok(())
            })
            .unwrap();

        let hits = second_hits.clone();
        let token = registry
            .subscribe(SubscriptionSpec::l2_book("BTC"), move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        *second_token.lock() = Some(token);

        let outcome = registry.dispatch(&frame("l2Book", json!({"coin": "BTC"})));
        assert_eq!(outcome.invoked, 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unrouted_frame() {
        let registry = SubscriptionRegistry::new();
        let outcome = registry.dispatch(&frame("l2Book", json!({"coin": "DOGE"})));
        assert!(outcome.is_unrouted());
    }
}
