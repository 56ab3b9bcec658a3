#![expect(
    clippy::module_name_repetitions,
    reason = "Type names carry their role when re-exported from the ws module"
)]

//! Task subscriptions: which callbacks want which task's updates, and which
//! tasks still have to be announced to the backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use super::connection::Command;

/// Callback invoked with the `data` of every `task_update` for a task.
///
/// Identity is the `Arc` allocation: registering a clone of the same `Arc`
/// twice is a no-op, while two separately allocated closures are distinct
/// even if they are textually identical.
pub type TaskCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Returned by [`ConnectionManager::subscribe_to_task`](super::ConnectionManager::subscribe_to_task).
///
/// Dropping the handle keeps the callback registered.
#[must_use = "dropping the handle keeps the subscription; call `unsubscribe` to end it"]
pub struct TaskSubscription {
    task_id: String,
    callback: Option<TaskCallback>,
    commands: mpsc::UnboundedSender<Command>,
}

impl TaskSubscription {
    pub(crate) fn new(
        task_id: String,
        callback: TaskCallback,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            task_id,
            callback: Some(callback),
            commands,
        }
    }

    /// A handle for a subscription that was never registered.
    pub(crate) fn inert(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            task_id: String::new(),
            callback: None,
            commands,
        }
    }

    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// `false` for handles returned from a rejected subscription.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.callback.is_some()
    }

    /// Remove this callback. When it was the task's last one, the backend is
    /// sent `unsubscribe_task` if connected.
    pub fn unsubscribe(self) {
        if let Some(callback) = self.callback {
            _ = self.commands.send(Command::Unsubscribe {
                task_id: self.task_id,
                callback,
            });
        }
    }
}

impl fmt::Debug for TaskSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSubscription")
            .field("task_id", &self.task_id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Outcome of [`SubscriptionRegistry::register`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The callback was added
    Added {
        /// No other callback was registered for this task before
        first_for_task: bool,
    },
    /// The callback was already registered for this task
    Duplicate,
}

/// Outcome of [`SubscriptionRegistry::unregister`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The callback was not registered for this task
    NotFound,
    /// The callback was removed; others remain
    Removed,
    /// The last callback was removed and the task entry deleted
    LastRemoved,
}

/// Callbacks of one task, in registration order.
#[derive(Default)]
struct TaskEntry {
    callbacks: BTreeMap<u64, TaskCallback>,
    by_identity: HashMap<usize, u64>,
}

fn identity(callback: &TaskCallback) -> usize {
    Arc::as_ptr(callback).cast::<()>().addr()
}

/// Maps task ids to their ordered callbacks and tracks pending announcements.
#[derive(Default)]
pub struct SubscriptionRegistry {
    tasks: HashMap<String, TaskEntry>,
    pending: BTreeSet<String>,
    next_seq: u64,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_id: &str, callback: TaskCallback) -> Registration {
        let key = identity(&callback);
        let first_for_task = !self.tasks.contains_key(task_id);
        let entry = self.tasks.entry(task_id.to_owned()).or_default();

        if entry.by_identity.contains_key(&key) {
            return Registration::Duplicate;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        entry.by_identity.insert(key, seq);
        entry.callbacks.insert(seq, callback);

        Registration::Added { first_for_task }
    }

    /// Remove `callback` from `task_id`. Deleting the last callback also
    /// drops the task from the pending set.
    pub fn unregister(&mut self, task_id: &str, callback: &TaskCallback) -> Removal {
        let Some(entry) = self.tasks.get_mut(task_id) else {
            return Removal::NotFound;
        };
        let Some(seq) = entry.by_identity.remove(&identity(callback)) else {
            return Removal::NotFound;
        };
        entry.callbacks.remove(&seq);

        if entry.callbacks.is_empty() {
            self.tasks.remove(task_id);
            self.pending.remove(task_id);
            Removal::LastRemoved
        } else {
            Removal::Removed
        }
    }

    /// Callbacks for `task_id` in registration order.
    pub fn callbacks(&self, task_id: &str) -> impl Iterator<Item = &TaskCallback> {
        self.tasks
            .get(task_id)
            .into_iter()
            .flat_map(|entry| entry.callbacks.values())
    }

    #[must_use]
    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Number of tasks with at least one callback.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Remember that the backend has not been told about `task_id`.
    pub fn mark_pending(&mut self, task_id: &str) {
        if self.contains(task_id) {
            self.pending.insert(task_id.to_owned());
        }
    }

    /// Every registered task must be announced again, e.g. after the
    /// transport was lost.
    pub fn mark_all_pending(&mut self) {
        self.pending.extend(self.tasks.keys().cloned());
    }

    /// Drain the pending set, keeping only tasks that still have callbacks.
    pub fn take_pending(&mut self) -> Vec<String> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .filter(|task_id| self.tasks.contains_key(task_id))
            .collect()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn noop() -> TaskCallback {
        Arc::new(|_: &Value| {})
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let mut registry = SubscriptionRegistry::new();
        let callback = noop();

        assert_eq!(
            registry.register("t-1", Arc::clone(&callback)),
            Registration::Added {
                first_for_task: true
            }
        );
        assert_eq!(
            registry.register("t-1", Arc::clone(&callback)),
            Registration::Duplicate
        );
        assert_eq!(registry.callbacks("t-1").count(), 1);
    }

    #[test]
    fn same_callback_on_different_tasks_is_allowed() {
        let mut registry = SubscriptionRegistry::new();
        let callback = noop();

        registry.register("a", Arc::clone(&callback));
        registry.register("b", Arc::clone(&callback));

        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn callbacks_are_returned_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();

        for n in 0..4 {
            let seen = Arc::clone(&seen);
            registry.register("t", Arc::new(move |_: &Value| seen.lock().unwrap().push(n)));
        }
        for callback in registry.callbacks("t") {
            callback(&Value::Null);
        }

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn second_registration_is_not_first_for_task() {
        let mut registry = SubscriptionRegistry::new();
        registry.register("t", noop());
        assert_eq!(
            registry.register("t", noop()),
            Registration::Added {
                first_for_task: false
            }
        );
    }

    #[test]
    fn removing_last_callback_deletes_entry_and_pending() {
        let mut registry = SubscriptionRegistry::new();
        let first = noop();
        let second = noop();
        registry.register("t", Arc::clone(&first));
        registry.register("t", Arc::clone(&second));
        registry.mark_pending("t");

        assert_eq!(registry.unregister("t", &first), Removal::Removed);
        assert!(registry.contains("t"));
        assert_eq!(registry.pending_len(), 1);

        assert_eq!(registry.unregister("t", &second), Removal::LastRemoved);
        assert!(!registry.contains("t"));
        assert_eq!(registry.pending_len(), 0);
    }

    #[test]
    fn unregister_unknown_is_not_found() {
        let mut registry = SubscriptionRegistry::new();
        registry.register("t", noop());

        assert_eq!(registry.unregister("t", &noop()), Removal::NotFound);
        assert_eq!(registry.unregister("other", &noop()), Removal::NotFound);
    }

    #[test]
    fn pending_is_drained_once() {
        let mut registry = SubscriptionRegistry::new();
        registry.register("a", noop());
        registry.register("b", noop());
        registry.mark_all_pending();

        assert_eq!(registry.take_pending(), vec!["a".to_owned(), "b".to_owned()]);
        assert!(registry.take_pending().is_empty());
    }

    #[test]
    fn pending_only_tracks_registered_tasks() {
        let mut registry = SubscriptionRegistry::new();
        registry.mark_pending("ghost");
        assert_eq!(registry.pending_len(), 0);
    }
}
