//! Per-task completion signals for interactive sessions.
//!
//! A session registers before it spawns and is resolved at most once by
//! whoever receives the model's `complete_task` report. The registration is
//! removed when its guard drops, so nothing outlives a single execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::state::schema::TaskId;

struct Slot {
    generation: u64,
    sender: oneshot::Sender<Value>,
}

#[derive(Default)]
struct Inner {
    next_generation: u64,
    slots: HashMap<TaskId, Slot>,
}

#[derive(Clone, Default)]
pub struct CompletionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start listening for `task_id`. Replaces any earlier registration for the same task.
    pub fn register(&self, task_id: TaskId) -> Registration {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.slots.insert(task_id, Slot { generation, sender });
        Registration {
            task_id,
            generation,
            receiver,
            registry: self.clone(),
        }
    }

    /// Deliver the completion payload. Returns false if nobody is waiting on `task_id`.
    pub fn complete(&self, task_id: TaskId, output: Value) -> bool {
        let slot = self.lock().slots.remove(&task_id);
        match slot {
            Some(slot) => {
                let delivered = slot.sender.send(output).is_ok();
                debug!(task_id, delivered, "completion signalled");
                delivered
            }
            None => false,
        }
    }

    pub fn is_waiting(&self, task_id: TaskId) -> bool {
        self.lock().slots.contains_key(&task_id)
    }

    pub fn waiting(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.lock().slots.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Guard for one registration. Dropping it deregisters the task.
pub struct Registration {
    task_id: TaskId,
    generation: u64,
    pub(crate) receiver: oneshot::Receiver<Value>,
    registry: CompletionRegistry,
}

impl Registration {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Non-blocking check for a payload that already arrived.
    pub fn try_take(&mut self) -> Option<Value> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut inner = self.registry.lock();
        if inner
            .slots
            .get(&self.task_id)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            inner.slots.remove(&self.task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_resolves_registration() {
        let registry = CompletionRegistry::new();
        let mut registration = registry.register(7);
        assert!(registry.is_waiting(7));

        assert!(registry.complete(7, json!({"summary": "done"})));
        let payload = (&mut registration.receiver).await.unwrap();
        assert_eq!(payload, json!({"summary": "done"}));
        assert!(!registry.is_waiting(7));
    }

    #[test]
    fn test_complete_without_listener() {
        let registry = CompletionRegistry::new();
        assert!(!registry.complete(1, json!({})));
    }

    #[test]
    fn test_completes_only_once() {
        let registry = CompletionRegistry::new();
        let _registration = registry.register(3);
        assert!(registry.complete(3, json!(1)));
        assert!(!registry.complete(3, json!(2)));
    }

    #[test]
    fn test_drop_deregisters() {
        let registry = CompletionRegistry::new();
        {
            let _registration = registry.register(5);
            assert_eq!(registry.waiting(), vec![5]);
        }
        assert!(registry.waiting().is_empty());
        assert!(!registry.complete(5, json!({})));
    }

    #[test]
    fn test_stale_guard_keeps_newer_registration() {
        let registry = CompletionRegistry::new();
        let old = registry.register(9);
        let mut new = registry.register(9);
        drop(old);

        assert!(registry.is_waiting(9));
        assert!(registry.complete(9, json!("late")));
        assert_eq!(new.try_take(), Some(json!("late")));
    }
}
