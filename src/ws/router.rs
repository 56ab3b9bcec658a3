#![expect(
    clippy::module_name_repetitions,
    reason = "Type names carry their role when re-exported from the ws module"
)]

//! Inbound dispatch: parse each frame, update liveness, then fan the
//! resulting messages out to task callbacks and global handlers.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::connection::Command;
use super::heartbeat::HeartbeatMonitor;
use super::registry::SubscriptionRegistry;
use crate::types::{ServerMessage, parse_frame};

/// Handler invoked with every parsed inbound message.
pub type MessageHandler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Identifies a registered [`MessageHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(pub(crate) u64);

/// Returned by [`ConnectionManager::add_message_handler`](super::ConnectionManager::add_message_handler).
///
/// Dropping the registration leaves the handler installed.
#[must_use = "dropping the registration keeps the handler installed; call `remove` to uninstall it"]
pub struct HandlerRegistration {
    id: HandlerId,
    commands: mpsc::UnboundedSender<Command>,
}

impl HandlerRegistration {
    pub(crate) fn new(id: HandlerId, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { id, commands }
    }

    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Uninstall the handler. Messages routed after the driver processes
    /// this request no longer reach it.
    pub fn remove(self) {
        _ = self.commands.send(Command::RemoveHandler { id: self.id });
    }
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// What happened to one inbound frame.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Messages parsed from the frame
    pub messages: usize,
    /// Callback and handler invocations that returned normally
    pub delivered: usize,
    /// Callback and handler invocations that panicked
    pub failed: usize,
    /// The frame could not be parsed and was dropped
    pub malformed: bool,
}

/// Global handlers, in registration order.
#[derive(Default)]
pub struct MessageRouter {
    handlers: BTreeMap<HandlerId, MessageHandler>,
}

impl MessageRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&mut self, id: HandlerId, handler: MessageHandler) {
        self.handlers.insert(id, handler);
    }

    pub fn remove_handler(&mut self, id: HandlerId) -> bool {
        self.handlers.remove(&id).is_some()
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Route one text frame.
    ///
    /// Liveness messages refresh `heartbeat` before any dispatch. Each
    /// `task_update` reaches its task's callbacks first, then every message
    /// reaches every global handler. A panicking callback or handler is logged
    /// and does not prevent the remaining ones from running.
    pub fn route_frame(
        &self,
        text: &str,
        registry: &SubscriptionRegistry,
        heartbeat: &mut HeartbeatMonitor,
    ) -> RouteOutcome {
        let messages = match parse_frame(text) {
            Ok(messages) => messages,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, frame = %text, "Dropping malformed frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return RouteOutcome {
                    malformed: true,
                    ..RouteOutcome::default()
                };
            }
        };

        let mut outcome = RouteOutcome {
            messages: messages.len(),
            ..RouteOutcome::default()
        };
        for message in &messages {
            if message.is_liveness() {
                heartbeat.record_pong(Instant::now());
            }
            #[cfg(feature = "tracing")]
            log_notice(message);
            self.dispatch(message, registry, &mut outcome);
        }
        outcome
    }

    fn dispatch(
        &self,
        message: &ServerMessage,
        registry: &SubscriptionRegistry,
        outcome: &mut RouteOutcome,
    ) {
        if let ServerMessage::TaskUpdate(update) = message
            && let Some(task_id) = update.routable_task_id()
        {
            for callback in registry.callbacks(task_id) {
                record(outcome, isolate(|| callback(&update.data)), message);
            }
        }

        for handler in self.handlers.values() {
            record(outcome, isolate(|| handler(message)), message);
        }
    }
}

#[cfg(feature = "tracing")]
fn log_notice(message: &ServerMessage) {
    match message {
        ServerMessage::ConnectionEstablished(established) => tracing::info!(
            client_id = ?established.client_id,
            message = ?established.message,
            "Backend acknowledged connection"
        ),
        ServerMessage::Error(error) => {
            tracing::warn!(message = %error.message, "Backend reported an error");
        }
        _ => {}
    }
}

fn isolate<F: FnOnce()>(f: F) -> Result<(), Box<dyn Any + Send>> {
    catch_unwind(AssertUnwindSafe(f))
}

fn record(
    outcome: &mut RouteOutcome,
    result: Result<(), Box<dyn Any + Send>>,
    message: &ServerMessage,
) {
    match result {
        Ok(()) => outcome.delivered += 1,
        Err(payload) => {
            outcome.failed += 1;
            #[cfg(feature = "tracing")]
            tracing::error!(
                message_type = message.message_type(),
                panic = panic_message(payload.as_ref()),
                "Message callback panicked"
            );
            #[cfg(not(feature = "tracing"))]
            let _ = (&payload, message);
        }
    }
}

#[cfg(feature = "tracing")]
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use super::*;
    use crate::ws::registry::TaskCallback;

    fn collector() -> (TaskCallback, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: TaskCallback = Arc::new(move |data: &Value| {
            sink.lock().unwrap().push(data.clone());
        });
        (callback, seen)
    }

    #[test]
    fn task_update_reaches_only_its_task() {
        let mut registry = SubscriptionRegistry::new();
        let (a, seen_a) = collector();
        let (b, seen_b) = collector();
        registry.register("a", a);
        registry.register("b", b);

        let router = MessageRouter::new();
        let outcome = router.route_frame(
            r#"{"type":"task_update","task_id":"a","data":{"status":"running"}}"#,
            &registry,
            &mut HeartbeatMonitor::new(),
        );

        assert_eq!(outcome.delivered, 1);
        assert_eq!(*seen_a.lock().unwrap(), vec![json!({ "status": "running" })]);
        assert!(seen_b.lock().unwrap().is_empty());
    }

    #[test]
    fn global_handlers_see_every_message() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut router = MessageRouter::new();
        router.add_handler(
            HandlerId(0),
            Arc::new(move |message: &ServerMessage| {
                sink.lock().unwrap().push(message.message_type().to_owned());
            }),
        );

        let registry = SubscriptionRegistry::new();
        let mut heartbeat = HeartbeatMonitor::new();
        router.route_frame(r#"{"type":"task_update","task_id":"x","data":1}"#, &registry, &mut heartbeat);
        router.route_frame(r#"{"type":"custom_event","value":1}"#, &registry, &mut heartbeat);
        router.route_frame(r#"{"type":"pong","timestamp":1}"#, &registry, &mut heartbeat);

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["task_update", "custom_event", "pong"]
        );
    }

    #[test]
    fn task_callbacks_run_before_global_handlers() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();
        let mut router = MessageRouter::new();

        let sink = Arc::clone(&order);
        router.add_handler(
            HandlerId(0),
            Arc::new(move |_: &ServerMessage| sink.lock().unwrap().push("global")),
        );
        let sink = Arc::clone(&order);
        registry.register("t", Arc::new(move |_: &Value| sink.lock().unwrap().push("task")));

        router.route_frame(
            r#"{"type":"task_update","task_id":"t","data":null}"#,
            &registry,
            &mut HeartbeatMonitor::new(),
        );

        assert_eq!(*order.lock().unwrap(), vec!["task", "global"]);
    }

    #[test]
    fn panicking_callback_does_not_stop_the_others() {
        let mut registry = SubscriptionRegistry::new();
        registry.register("t", Arc::new(|_: &Value| panic!("boom")));
        let (healthy, seen) = collector();
        registry.register("t", healthy);

        let router = MessageRouter::new();
        let outcome = router.route_frame(
            r#"{"type":"task_update","task_id":"t","data":{"n":1}}"#,
            &registry,
            &mut HeartbeatMonitor::new(),
        );

        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(*seen.lock().unwrap(), vec![json!({ "n": 1 })]);
    }

    #[test]
    fn panicking_handler_does_not_stop_later_handlers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut router = MessageRouter::new();
        router.add_handler(HandlerId(0), Arc::new(|_: &ServerMessage| panic!("bad handler")));
        let sink = Arc::clone(&calls);
        router.add_handler(
            HandlerId(1),
            Arc::new(move |_: &ServerMessage| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let outcome = router.route_frame(
            r#"{"type":"heartbeat"}"#,
            &SubscriptionRegistry::new(),
            &mut HeartbeatMonitor::new(),
        );

        assert_eq!(outcome.failed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn updates_without_task_id_only_reach_global_handlers() {
        let mut registry = SubscriptionRegistry::new();
        let (callback, seen) = collector();
        registry.register("", Arc::clone(&callback));

        let router = MessageRouter::new();
        let outcome = router.route_frame(
            r#"{"type":"task_update","task_id":"","data":1}"#,
            &registry,
            &mut HeartbeatMonitor::new(),
        );

        assert_eq!(outcome.messages, 1);
        assert_eq!(outcome.delivered, 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn malformed_frame_is_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&calls);
        let mut router = MessageRouter::new();
        router.add_handler(
            HandlerId(0),
            Arc::new(move |_: &ServerMessage| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let outcome = router.route_frame(
            "{definitely not json",
            &SubscriptionRegistry::new(),
            &mut HeartbeatMonitor::new(),
        );

        assert!(outcome.malformed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn liveness_frames_refresh_heartbeat() {
        let mut heartbeat = HeartbeatMonitor::new();
        heartbeat.start(Instant::now());
        let router = MessageRouter::new();
        let registry = SubscriptionRegistry::new();

        router.route_frame(r#"{"type":"task_update","task_id":"t"}"#, &registry, &mut heartbeat);
        assert_eq!(heartbeat.last_pong(), None);

        router.route_frame(r#"{"type":"heartbeat","timestamp":"1.0"}"#, &registry, &mut heartbeat);
        assert!(heartbeat.last_pong().is_some());
    }

    #[test]
    fn removed_handler_is_not_called() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&calls);
        let mut router = MessageRouter::new();
        router.add_handler(
            HandlerId(7),
            Arc::new(move |_: &ServerMessage| {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(router.remove_handler(HandlerId(7)));
        assert!(!router.remove_handler(HandlerId(7)));
        router.route_frame(
            r#"{"type":"pong"}"#,
            &SubscriptionRegistry::new(),
            &mut HeartbeatMonitor::new(),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(router.handler_count(), 0);
    }
}
