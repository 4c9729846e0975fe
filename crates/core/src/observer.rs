//! Observer primitives.
//!
//! A [`Subject`] holds a set of handlers; [`Subject::subscribe`] returns a
//! [`Subscription`] whose `cancel()` removes the handler again. Handlers are
//! invoked outside the registry lock so a handler may subscribe or cancel
//! without deadlocking.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    handlers: Vec<(u64, Handler<T>)>,
}

/// A multi-subscriber event source.
pub struct Subject<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Subject<T> {
    /// Create a subject with no subscribers
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// Register a handler, returning the handle that removes it
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.handlers.push((id, Arc::new(handler)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.lock().handlers.retain(|(handler_id, _)| *handler_id != id);
            }
        })
    }

    /// Deliver a value to every current subscriber
    pub fn emit(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self
            .registry
            .lock()
            .handlers
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(value);
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().handlers.len()
    }

    /// Drop every subscriber
    pub fn clear(&self) {
        self.registry.lock().handlers.clear();
    }
}

impl<T: 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("subscribers", &self.registry.lock().handlers.len())
            .finish()
    }
}

/// Handle returned by `subscribe`. Dropping it keeps the handler registered;
/// call [`Subscription::cancel`] to remove it.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap an arbitrary cancellation action
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    /// Combine several subscriptions into one that cancels them all
    pub fn merge(subscriptions: Vec<Subscription>) -> Self {
        Self::new(move || {
            for subscription in subscriptions {
                subscription.cancel();
            }
        })
    }

    /// Remove the handler
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
