//! Named-event fan-out to listener callbacks.
//!
//! Listeners are stored per event name in registration order and identified
//! by their `Arc` pointer. `emit` snapshots the list before invoking anything,
//! so listeners may subscribe or unsubscribe while an emit is in progress;
//! the change applies from the next emit on.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::error;

/// Callback invoked with the payload of an emitted event.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Wraps a closure as a [`Listener`].
///
/// Keep a clone of the returned handle to unsubscribe later.
pub fn listener<F>(callback: F) -> Listener
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    Arc::new(callback)
}

/// Shared map from event name to ordered listeners.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct EventRegistry {
    listeners: Arc<RwLock<HashMap<String, Vec<Listener>>>>,
}

impl EventRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `listener` for `event`. Registering the same listener twice
    /// makes it fire twice.
    pub fn subscribe(&self, event: impl Into<String>, listener: Listener) {
        let mut guard = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.entry(event.into()).or_default().push(listener);
    }

    /// Removes the first registration of `listener` for `event`.
    ///
    /// Returns `false` when nothing matched.
    pub fn unsubscribe(&self, event: &str, listener: &Listener) -> bool {
        let mut guard = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(listeners) = guard.get_mut(event) else {
            return false;
        };
        let Some(index) = listeners
            .iter()
            .position(|existing| Arc::ptr_eq(existing, listener))
        else {
            return false;
        };
        listeners.remove(index);
        if listeners.is_empty() {
            guard.remove(event);
        }
        true
    }

    /// Invokes every listener registered for `event`, in order, on the
    /// calling task. A panicking listener is logged and skipped.
    pub fn emit(&self, event: &str, payload: &Value) {
        let snapshot = self.snapshot(event);
        for listener in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(payload)));
            if let Err(panic) = outcome {
                error!(
                    event = "listener_panicked",
                    name = event,
                    reason = panic_message(panic.as_ref())
                );
            }
        }
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }

    fn snapshot(&self, event: &str) -> Vec<Listener> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .cloned()
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<String, usize> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, listeners)| (name.clone(), listeners.len()))
            .collect();
        f.debug_struct("EventRegistry")
            .field("listeners", &counts)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::{json, Value};

    use super::{listener, EventRegistry, Listener};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> Listener {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        listener(move |_| log.lock().expect("log").push(tag.clone()))
    }

    fn entries(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().expect("log").clone()
    }

    #[test]
    fn emit_calls_listeners_in_registration_order() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.subscribe("task.updated", recorder(&log, "a"));
        registry.subscribe("task.updated", recorder(&log, "b"));
        registry.subscribe("task.created", recorder(&log, "other"));

        registry.emit("task.updated", &Value::Null);

        assert_eq!(entries(&log), vec!["a", "b"]);
    }

    #[test]
    fn emit_without_listeners_is_noop() {
        let registry = EventRegistry::new();
        registry.emit("nobody.listens", &json!({"id": 1}));
        assert_eq!(registry.listener_count("nobody.listens"), 0);
    }

    #[test]
    fn listener_receives_payload() {
        let registry = EventRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.subscribe(
            "comment.created",
            listener(move |payload| sink.lock().expect("seen").push(payload.clone())),
        );

        registry.emit("comment.created", &json!({"id": 9}));

        assert_eq!(*seen.lock().expect("seen"), vec![json!({"id": 9})]);
    }

    #[test]
    fn duplicate_registration_fires_twice_and_unsubscribe_removes_one() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let callback = recorder(&log, "dup");
        registry.subscribe("task.deleted", Arc::clone(&callback));
        registry.subscribe("task.deleted", Arc::clone(&callback));

        registry.emit("task.deleted", &Value::Null);
        assert_eq!(entries(&log).len(), 2);

        assert!(registry.unsubscribe("task.deleted", &callback));
        registry.emit("task.deleted", &Value::Null);
        assert_eq!(entries(&log).len(), 3);
        assert_eq!(registry.listener_count("task.deleted"), 1);
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let registered = recorder(&log, "registered");
        let stranger = recorder(&log, "stranger");
        registry.subscribe("task.updated", Arc::clone(&registered));

        assert!(!registry.unsubscribe("never.registered", &registered));
        assert!(!registry.unsubscribe("task.updated", &stranger));
        assert_eq!(registry.listener_count("task.updated"), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_siblings() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.subscribe("task.updated", recorder(&log, "before"));
        registry.subscribe(
            "task.updated",
            listener(|_| panic!("listener failure")),
        );
        registry.subscribe("task.updated", recorder(&log, "after"));

        registry.emit("task.updated", &Value::Null);
        registry.emit("task.updated", &Value::Null);

        assert_eq!(entries(&log), vec!["before", "after", "before", "after"]);
    }

    #[test]
    fn unsubscribe_during_emit_applies_to_next_pass() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let second = recorder(&log, "second");

        let first = {
            let registry = registry.clone();
            let second = Arc::clone(&second);
            let log = Arc::clone(&log);
            listener(move |_| {
                log.lock().expect("log").push("first".to_string());
                registry.unsubscribe("project.updated", &second);
            })
        };
        registry.subscribe("project.updated", first);
        registry.subscribe("project.updated", Arc::clone(&second));

        registry.emit("project.updated", &Value::Null);
        assert_eq!(entries(&log), vec!["first", "second"]);

        registry.emit("project.updated", &Value::Null);
        assert_eq!(entries(&log), vec!["first", "second", "first"]);
    }

    #[test]
    fn subscribe_during_emit_does_not_deadlock() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let late = recorder(&log, "late");

        let adder = {
            let registry = registry.clone();
            let late = Arc::clone(&late);
            listener(move |_| registry.subscribe("notification.new", Arc::clone(&late)))
        };
        registry.subscribe("notification.new", adder);

        registry.emit("notification.new", &Value::Null);
        assert!(entries(&log).is_empty());

        registry.emit("notification.new", &Value::Null);
        assert_eq!(entries(&log), vec!["late"]);
        assert_eq!(registry.listener_count("notification.new"), 3);
    }
}
