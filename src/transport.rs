//! Message transport seam
//!
//! Models talk to the outside world only through `Transport`: subscribe a
//! callback to a topic, publish a JSON payload, and check whether the link
//! is up. `MemoryTransport` is the in-process implementation used by the
//! replay binary and by tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Callback invoked with the raw payload of every message on a topic.
pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives every successful publish, e.g. to echo it somewhere.
pub type PublishSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

pub trait Transport: Send + Sync {
    fn subscribe(&self, topic: &str, callback: MessageCallback);

    /// Remove a callback previously passed to `subscribe` (matched by identity).
    fn unsubscribe(&self, topic: &str, callback: &MessageCallback);

    /// Publishing while disconnected is a silent no-op.
    fn publish(&self, topic: &str, payload: &str);

    fn is_connected(&self) -> bool;
}

#[derive(Default)]
struct MemoryState {
    subscriptions: HashMap<String, Vec<MessageCallback>>,
    published: Vec<(String, String)>,
    connected: bool,
}

/// In-process broker: delivery is synchronous on the caller's thread.
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    sink: Option<PublishSink>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                connected: true,
                ..MemoryState::default()
            }),
            sink: None,
        }
    }

    pub fn with_sink(sink: PublishSink) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    /// Hand `payload` to every subscriber of `topic`. Returns how many got it.
    ///
    /// Callbacks run after the internal lock is released, so a callback may
    /// publish or (un)subscribe itself.
    pub fn deliver(&self, topic: &str, payload: &str) -> usize {
        let callbacks: Vec<MessageCallback> = self
            .lock()
            .subscriptions
            .get(topic)
            .cloned()
            .unwrap_or_default();

        if callbacks.is_empty() {
            log::debug!("No subscribers for {}", topic);
        }
        for callback in &callbacks {
            callback(payload);
        }
        callbacks.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().subscriptions.get(topic).map_or(0, Vec::len)
    }

    /// Every `(topic, payload)` published so far, oldest first.
    pub fn published(&self) -> Vec<(String, String)> {
        self.lock().published.clone()
    }

    pub fn take_published(&self) -> Vec<(String, String)> {
        std::mem::take(&mut self.lock().published)
    }
}

impl Transport for MemoryTransport {
    fn subscribe(&self, topic: &str, callback: MessageCallback) {
        log::debug!("Subscribing to {}", topic);
        self.lock()
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(callback);
    }

    fn unsubscribe(&self, topic: &str, callback: &MessageCallback) {
        let mut state = self.lock();
        if let Some(callbacks) = state.subscriptions.get_mut(topic) {
            callbacks.retain(|existing| !Arc::ptr_eq(existing, callback));
            if callbacks.is_empty() {
                state.subscriptions.remove(topic);
            }
        }
    }

    fn publish(&self, topic: &str, payload: &str) {
        {
            let mut state = self.lock();
            if !state.connected {
                log::debug!("Transport disconnected, dropping publish to {}", topic);
                return;
            }
            state.published.push((topic.to_string(), payload.to_string()));
        }
        if let Some(sink) = &self.sink {
            sink(topic, payload);
        }
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, MessageCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let callback: MessageCallback = Arc::new(move |_payload: &str| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (hits, callback)
    }

    #[test]
    fn test_deliver_reaches_subscribers() {
        let transport = MemoryTransport::new();
        let (hits, callback) = counter();
        transport.subscribe("room/set", callback);

        assert_eq!(transport.deliver("room/set", "[]"), 1);
        assert_eq!(transport.deliver("other/set", "[]"), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_by_identity() {
        let transport = MemoryTransport::new();
        let (_, first) = counter();
        let (hits, second) = counter();
        transport.subscribe("t", Arc::clone(&first));
        transport.subscribe("t", second);

        transport.unsubscribe("t", &first);
        assert_eq!(transport.subscriber_count("t"), 1);
        transport.deliver("t", "x");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_publish_when_disconnected_is_dropped() {
        let transport = MemoryTransport::new();
        transport.set_connected(false);
        transport.publish("t/state", "{}");
        assert!(transport.published().is_empty());

        transport.set_connected(true);
        transport.publish("t/state", "{}");
        assert_eq!(transport.take_published().len(), 1);
        assert!(transport.published().is_empty());
    }

    #[test]
    fn test_sink_sees_publishes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let sink: PublishSink = Arc::new(move |topic: &str, payload: &str| {
            captured.lock().unwrap().push(format!("{} {}", topic, payload));
        });
        let transport = MemoryTransport::with_sink(sink);
        transport.publish("a/state", "1");
        assert_eq!(seen.lock().unwrap().as_slice(), ["a/state 1".to_string()]);
    }
}
