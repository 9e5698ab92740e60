//! In-process observer bus for kernel results.
//!
//! [`Broadcaster`] keeps an ordered list of observer callbacks. `emit`
//! snapshots that list before calling anyone, so observers that subscribe or
//! unsubscribe from inside a callback only affect later emits. Nothing is
//! buffered: an observer never sees events emitted before it subscribed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use q8s_core::types::Timestamp;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ResultEvent
// ---------------------------------------------------------------------------

/// A result delivered by the kernel over the comm channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    /// Opaque value taken from `content.data.result`.
    pub value: serde_json::Value,

    /// When the message was received (UTC).
    pub received_at: Timestamp,
}

impl ResultEvent {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            received_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    observers: Vec<(u64, Observer<T>)>,
}

/// Synchronous multi-observer fan-out.
///
/// Cheap to clone; clones share the same observer list.
///
/// ```rust
/// use q8s_events::{ResultBroadcaster, ResultEvent};
///
/// let results = ResultBroadcaster::default();
/// let _sub = results.subscribe(|event| println!("result: {}", event.value));
///
/// results.emit(&ResultEvent::new(serde_json::json!(2)));
/// ```
pub struct Broadcaster<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

/// Broadcaster specialised to kernel results.
pub type ResultBroadcaster = Broadcaster<ResultEvent>;

impl<T> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                observers: Vec::new(),
            })),
        }
    }

    /// Register `observer` for every future emit.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.observers.push((id, Arc::new(observer)));

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            id,
            remove: Some(Box::new(move |id| {
                if let Some(registry) = weak.upgrade() {
                    // Drop the observer outside the lock; it may own other
                    // subscriptions on this broadcaster.
                    let removed = {
                        let mut registry = lock(&registry);
                        registry
                            .observers
                            .iter()
                            .position(|(oid, _)| *oid == id)
                            .map(|pos| registry.observers.remove(pos))
                    };
                    drop(removed);
                }
            })),
        }
    }

    /// Deliver `value` to every observer subscribed when the call starts.
    ///
    /// Returns the number of observers notified.
    pub fn emit(&self, value: &T) -> usize {
        let snapshot: Vec<Observer<T>> = lock(&self.registry)
            .observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in &snapshot {
            observer(value);
        }

        tracing::trace!(observers = snapshot.len(), "Broadcast result");
        snapshot.len()
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.registry).observers.len()
    }
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

// Observers are plain callbacks, so a panic inside one cannot leave the list
// half-updated; recover the guard instead of propagating poison.
fn lock<T>(registry: &Mutex<Registry<T>>) -> MutexGuard<'_, Registry<T>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Unsubscribe handle returned by [`Broadcaster::subscribe`].
///
/// The observer is removed when the handle is dropped, unless
/// [`detach`](Self::detach) was called.
pub struct Subscription {
    id: u64,
    remove: Option<Box<dyn FnOnce(u64) + Send + Sync>>,
}

impl Subscription {
    /// Remove the observer now.
    pub fn unsubscribe(mut self) {
        self.run_remove();
    }

    /// Keep the observer registered for the broadcaster's lifetime.
    pub fn detach(mut self) {
        self.remove = None;
    }

    fn run_remove(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_remove();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.remove.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
