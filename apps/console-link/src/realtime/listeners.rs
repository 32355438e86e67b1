use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callbacks keyed by subscription id. Independent of connection state, so
/// listeners can be registered before a subscription is ever confirmed.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<String, Vec<(ListenerId, Listener)>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, subscription_id: &str, callback: F) -> ListenerHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let listener_id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .write()
            .entry(subscription_id.to_string())
            .or_default()
            .push((listener_id, Arc::new(callback)));
        ListenerHandle {
            registry: self.clone(),
            subscription_id: subscription_id.to_string(),
            listener_id,
        }
    }

    /// Removes one listener; others on the same id are untouched.
    pub fn remove(&self, subscription_id: &str, listener_id: ListenerId) -> bool {
        let mut guard = self.inner.listeners.write();
        let Some(entries) = guard.get_mut(subscription_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(id, _)| *id != listener_id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            guard.remove(subscription_id);
        }
        removed
    }

    pub fn count(&self, subscription_id: &str) -> usize {
        self.inner
            .listeners
            .read()
            .get(subscription_id)
            .map_or(0, Vec::len)
    }

    /// Calls every listener registered for `subscription_id` at this moment
    /// and returns how many ran. The lock is released before callbacks run,
    /// so a callback may add or remove listeners.
    pub fn dispatch(&self, subscription_id: &str, frame: &Value) -> usize {
        let targets: Vec<Listener> = match self.inner.listeners.read().get(subscription_id) {
            Some(entries) => entries.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return 0,
        };
        for callback in &targets {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
                tracing::error!(
                    target: "console_link::realtime",
                    subscription_id,
                    "listener panicked while handling a message"
                );
            }
        }
        targets.len()
    }
}

/// Returned by [`ListenerRegistry::add`]; unregisters exactly the listener it
/// was created for.
pub struct ListenerHandle {
    registry: ListenerRegistry,
    subscription_id: String,
    listener_id: ListenerId,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.listener_id
    }

    pub fn unregister(self) -> bool {
        self.registry
            .remove(&self.subscription_id, self.listener_id)
    }
}
