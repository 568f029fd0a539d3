//! Trailing-edge debounce combinator.
//!
//! A [`Debouncer`] wraps an async action and a window. Every `call` for a key
//! restarts that key's timer; the action runs once, with the last value,
//! after the key has been quiet for the whole window. Keys are independent,
//! so one user's presence flapping never delays another user's publish.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::trace;

type Action<K, T> = Arc<dyn Fn(K, T) -> BoxFuture<'static, ()> + Send + Sync>;

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Cancellable, keyed, trailing-edge debounce handle.
pub struct Debouncer<K, T> {
    window: Duration,
    action: Action<K, T>,
    pending: Arc<Mutex<HashMap<K, Slot>>>,
    generation: AtomicU64,
}

impl<K, T> Debouncer<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    pub fn new<F, Fut>(window: Duration, action: F) -> Self
    where
        F: Fn(K, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let action: Action<K, T> = Arc::new(move |key, value| Box::pin(action(key, value)));
        Self {
            window,
            action,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Schedule `value` for `key`, replacing whatever was still waiting.
    ///
    /// An action that already started is left to finish.
    pub fn call(&self, key: K, value: T) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let mut pending = lock(&self.pending);
        if let Some(previous) = pending.remove(&key) {
            previous.handle.abort();
            trace!(generation = previous.generation, "debounced call superseded");
        }

        let window = self.window;
        let action = self.action.clone();
        let slots = self.pending.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Detach before running so a call made while the action is
            // in flight schedules a new timer instead of aborting it.
            if !claim(&slots, &task_key, generation) {
                trace!(generation, "debounced call went stale before firing");
                return;
            }
            action(task_key, value).await;
        });

        pending.insert(key, Slot { generation, handle });
    }

    /// Drop the waiting call for `key`, if any. Returns whether one was dropped.
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.pending).remove(key) {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, slot) in lock(&self.pending).drain() {
            slot.handle.abort();
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.pending).contains_key(key)
    }
}

impl<K, T> Drop for Debouncer<K, T> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            for (_, slot) in pending.drain() {
                slot.handle.abort();
            }
        }
    }
}

/// Remove `key`'s slot if it still belongs to `generation`. A timer that
/// loses here was superseded or cancelled while it woke up.
fn claim<K: Eq + Hash>(slots: &Mutex<HashMap<K, Slot>>, key: &K, generation: u64) -> bool {
    let mut slots = lock(slots);
    match slots.get(key) {
        Some(slot) if slot.generation == generation => {
            slots.remove(key);
            true
        }
        _ => false,
    }
}

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
