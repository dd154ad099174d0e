use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::models::TaskStatus;

/// Events emitted after a store transaction commits.
///
/// Emission is best-effort: a listener failure never affects the
/// originating operation. Events produced by a single tool call are
/// delivered in the order they were produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    CheckpointCreated {
        checkpoint_id: String,
        task_id: String,
        sequence: i64,
    },
    #[serde(rename_all = "camelCase")]
    CheckpointResumed {
        checkpoint_id: String,
        task_id: String,
    },
    #[serde(rename_all = "camelCase")]
    TaskStatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[serde(rename_all = "camelCase")]
    IterationAdvanced {
        iteration_id: String,
        task_id: String,
        iteration_number: u32,
    },
    #[serde(rename_all = "camelCase")]
    IterationCompleted {
        iteration_id: String,
        task_id: String,
    },
}

type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// In-process single-threaded cooperative pub/sub.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .expect("event bus lock poisoned")
            .push(Box::new(listener));
    }

    pub fn emit(&self, event: Event) {
        let listeners = self.listeners.read().expect("event bus lock poisoned");
        for listener in listeners.iter() {
            listener(&event);
        }
    }

    /// Drop all listeners; test hook.
    pub fn reset(&self) {
        self.listeners
            .write()
            .expect("event bus lock poisoned")
            .clear();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.listeners.read().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_emit_reaches_all_listeners_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            bus.subscribe(move |event| {
                if let Event::CheckpointResumed { checkpoint_id, .. } = event {
                    seen.lock().unwrap().push(format!("{tag}:{checkpoint_id}"));
                }
            });
        }

        bus.emit(Event::CheckpointResumed {
            checkpoint_id: "CP-1".into(),
            task_id: "TASK-1".into(),
        });

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec!["first:CP-1".to_string(), "second:CP-1".to_string()]);
    }

    #[test]
    fn test_reset_clears_listeners() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        bus.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.reset();
        bus.emit(Event::IterationCompleted {
            iteration_id: "IT-1".into(),
            task_id: "TASK-1".into(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
