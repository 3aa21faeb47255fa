//! Listener registry with unsubscribe-on-drop handles.
//!
//! Callbacks are cloned out of the registry before being invoked, so a
//! listener may subscribe, unsubscribe or emit again without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Callback<E>)>>,
}

impl<E> Registry<E> {
    fn entries(&self) -> MutexGuard<'_, Vec<(u64, Callback<E>)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A set of listeners for events of type `E`.
pub struct EventListeners<E> {
    registry: Arc<Registry<E>>,
}

impl<E: 'static> EventListeners<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a listener. It stays registered until the handle is dropped
    /// or [`ListenerHandle::unsubscribe`] is called.
    pub fn subscribe<F>(&self, f: F) -> ListenerHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.entries().push((id, Arc::new(f)));

        let weak: Weak<Registry<E>> = Arc::downgrade(&self.registry);
        ListenerHandle {
            detach: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.entries().retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Invoke every registered listener with `event`.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self
            .registry
            .entries()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(event);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventListeners<E> {
    fn clone(&self) -> Self {
        Self { registry: self.registry.clone() }
    }
}

/// Unsubscribes its listener when dropped.
#[must_use = "dropping the handle unsubscribes the listener"]
pub struct ListenerHandle {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}
