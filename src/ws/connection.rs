#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant as StdInstant};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use futures::Stream;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use url::Url;

use super::config::Config;
use super::error::WsError;
use super::heartbeat::{HeartbeatMonitor, Liveness};
use super::queue::{OutboundQueue, SendOptions};
use super::registry::{
    Registration, Removal, SubscriptionRegistry, TaskCallback, TaskSubscription,
};
use super::router::{HandlerId, HandlerRegistration, MessageHandler, MessageRouter};
use super::timers::{TimerEvent, Timers};
use super::transport::{Inbound, Transport};
use crate::Result;
use crate::error::Error;
use crate::types::{ClientId, ClientMessage};

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to be
    Disconnected,
    /// Handshake in flight
    Connecting {
        /// Consecutive failed attempts before this one
        attempt: u32,
    },
    /// Transport is open
    Open {
        /// When the connection was established
        since: StdInstant,
    },
    /// A caller-initiated disconnect is tearing down the transport
    Closing,
    /// Waiting out the backoff delay before the next attempt
    Reconnecting {
        /// Reconnection attempt number, starting at 1
        attempt: u32,
        /// Delay before the attempt, including jitter
        delay: Duration,
    },
    /// Reconnection attempts are exhausted. Nothing reconnects until
    /// [`ConnectionManager::disconnect`] resets the manager.
    Unavailable,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Open { .. })
    }

    #[must_use]
    pub const fn is_unavailable(self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// Requests from handles to the driver task.
pub(crate) enum Command {
    Connect,
    Disconnect,
    Send {
        message: ClientMessage,
        options: SendOptions,
    },
    Subscribe {
        task_id: String,
        callback: TaskCallback,
    },
    Unsubscribe {
        task_id: String,
        callback: TaskCallback,
    },
    AddHandler {
        id: HandlerId,
        handler: MessageHandler,
    },
    RemoveHandler {
        id: HandlerId,
    },
}

/// Manages the WebSocket lifecycle, subscriptions, outbound buffering,
/// reconnection and heartbeat for one backend endpoint.
///
/// A background task owns the transport and every piece of mutable state;
/// this handle only forwards requests to it, so all methods return
/// immediately and the handle is cheap to clone. The task stops once every
/// handle (including [`TaskSubscription`]s and [`HandlerRegistration`]s) is
/// dropped.
///
/// - Subscriptions survive reconnects and are announced again exactly once per
///   new transport.
/// - Retryable messages sent while disconnected are queued and flushed in
///   bounded batches once the transport opens.
/// - Failed connections are retried with exponential backoff plus jitter.
///   After `reconnect.max_attempts` consecutive failures the manager becomes
///   [`ConnectionState::Unavailable`].
/// - While open, a `ping` is sent every `heartbeat.interval`; if nothing proves
///   the server alive within `heartbeat.timeout` the transport is dropped and
///   reconnection starts.
///
/// Must be created inside a Tokio runtime.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use serde_json::Value;
/// use task_channel_client::ws::ConnectionManager;
/// use task_channel_client::ws::config::Config;
///
/// # async fn run() -> task_channel_client::Result<()> {
/// let manager = ConnectionManager::new("ws://localhost:8000/ws", Config::default())?;
///
/// let subscription = manager.subscribe_to_task(
///     "task-42",
///     Arc::new(|data: &Value| {
///         let _status = data.get("status");
///     }),
/// );
///
/// // ... later
/// subscription.unsubscribe();
/// manager.disconnect();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    pong_rx: watch::Receiver<Option<StdInstant>>,
    client_id: ClientId,
    default_send: SendOptions,
    next_handler_id: Arc<AtomicU64>,
}

impl ConnectionManager {
    /// Create a manager for `endpoint` and start its background task.
    ///
    /// No connection is made until [`connect`](Self::connect) or
    /// [`subscribe_to_task`](Self::subscribe_to_task) is called. The
    /// configured client id is appended to the endpoint as the `client_id`
    /// query parameter.
    pub fn new(endpoint: &str, config: Config) -> Result<Self> {
        let url = connection_url(endpoint, &config.client_id)?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (pong_tx, pong_rx) = watch::channel(None);

        let client_id = config.client_id.clone();
        let default_send = SendOptions::retryable(config.queue.default_max_retries);

        let driver = Driver::new(url, config, commands_rx, state_tx, pong_tx);
        tokio::spawn(driver.run());

        Ok(Self {
            commands,
            state_rx,
            pong_rx,
            client_id,
            default_send,
            next_handler_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Open the transport. No-op while already connected or connecting, or
    /// while [`ConnectionState::Unavailable`].
    pub fn connect(&self) {
        self.dispatch(Command::Connect);
    }

    /// Close the transport and stop every timer. No reconnection follows.
    ///
    /// Subscriptions and queued messages are kept; the next
    /// [`connect`](Self::connect) replays and flushes them. Also clears
    /// [`ConnectionState::Unavailable`].
    pub fn disconnect(&self) {
        self.dispatch(Command::Disconnect);
    }

    /// Send a message with the default options: retryable, with the
    /// configured retry budget.
    pub fn send(&self, message: ClientMessage) {
        self.send_with(message, self.default_send);
    }

    /// Send a message now if connected.
    ///
    /// Otherwise a retryable message is queued for the next open transport
    /// and a non-retryable one is dropped.
    pub fn send_with(&self, message: ClientMessage, options: SendOptions) {
        self.dispatch(Command::Send { message, options });
    }

    /// Invoke `callback` with the `data` of every `task_update` for `task_id`.
    ///
    /// Registering the same callback twice for a task has no effect. Starts
    /// connecting if no connection attempt is in progress. An empty `task_id`
    /// is rejected with a warning and an inactive handle.
    pub fn subscribe_to_task(&self, task_id: &str, callback: TaskCallback) -> TaskSubscription {
        if task_id.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::warn!("Ignoring subscription with an empty task id");
            return TaskSubscription::inert(self.commands.clone());
        }

        self.dispatch(Command::Subscribe {
            task_id: task_id.to_owned(),
            callback: Arc::clone(&callback),
        });
        TaskSubscription::new(task_id.to_owned(), callback, self.commands.clone())
    }

    /// Remove `callback` from `task_id`, matched by `Arc` identity. Unknown
    /// pairs are ignored.
    pub fn unsubscribe_from_task(&self, task_id: &str, callback: &TaskCallback) {
        self.dispatch(Command::Unsubscribe {
            task_id: task_id.to_owned(),
            callback: Arc::clone(callback),
        });
    }

    /// Stream the `data` of every `task_update` for `task_id`.
    ///
    /// The subscription ends when the stream is dropped.
    pub fn task_updates(&self, task_id: &str) -> impl Stream<Item = Value> + use<> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: TaskCallback = Arc::new(move |data: &Value| {
            _ = tx.send(data.clone());
        });
        let guard = UnsubscribeOnDrop(Some(self.subscribe_to_task(task_id, callback)));

        async_stream::stream! {
            let _guard = guard;
            while let Some(data) = rx.recv().await {
                yield data;
            }
        }
    }

    /// Invoke `handler` with every parsed inbound message, after any task
    /// callbacks for that message.
    pub fn add_message_handler(&self, handler: MessageHandler) -> HandlerRegistration {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.dispatch(Command::AddHandler { id, handler });
        HandlerRegistration::new(id, self.commands.clone())
    }

    /// Whether the transport is open right now.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// When the last `pong` or `heartbeat` frame arrived.
    #[must_use]
    pub fn last_pong(&self) -> Option<StdInstant> {
        *self.pong_rx.borrow()
    }

    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    fn dispatch(&self, command: Command) {
        if self.commands.send(command).is_err() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Connection task has stopped; dropping request");
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct UnsubscribeOnDrop(Option<TaskSubscription>);

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        if let Some(subscription) = self.0.take() {
            subscription.unsubscribe();
        }
    }
}

fn connection_url(endpoint: &str, client_id: &ClientId) -> Result<Url> {
    let mut url = Url::parse(endpoint)?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(Error::validation(format!(
            "Endpoint must use ws:// or wss://, got {}://",
            url.scheme()
        )));
    }
    url.query_pairs_mut()
        .append_pair("client_id", client_id.as_str());
    Ok(url)
}

enum Event {
    Command(Option<Command>),
    Handshake(Result<Transport>),
    Inbound(Inbound),
    Timer(TimerEvent),
}

/// Owns the transport and all connection state. Runs as a single task so
/// that no two operations ever interleave.
struct Driver {
    url: Url,
    config: Config,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    pong_tx: watch::Sender<Option<StdInstant>>,
    registry: SubscriptionRegistry,
    router: MessageRouter,
    queue: OutboundQueue,
    heartbeat: HeartbeatMonitor,
    timers: Timers,
    transport: Option<Transport>,
    handshake: Option<Handshake>,
    backoff: ExponentialBackoff,
    /// Consecutive failed connection attempts
    attempt: u32,
    unavailable: bool,
}

impl Driver {
    fn new(
        url: Url,
        config: Config,
        commands: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        pong_tx: watch::Sender<Option<StdInstant>>,
    ) -> Self {
        Self {
            url,
            backoff: config.reconnect.clone().into(),
            queue: OutboundQueue::new(config.queue.batch_size),
            config,
            commands,
            state_tx,
            pong_tx,
            registry: SubscriptionRegistry::new(),
            router: MessageRouter::new(),
            heartbeat: HeartbeatMonitor::new(),
            timers: Timers::default(),
            transport: None,
            handshake: None,
            attempt: 0,
            unavailable: false,
        }
    }

    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                command = self.commands.recv() => Event::Command(command),
                result = next_handshake(&mut self.handshake) => Event::Handshake(result),
                inbound = next_inbound(&mut self.transport) => Event::Inbound(inbound),
                timer = self.timers.next() => Event::Timer(timer),
            };

            match event {
                Event::Command(Some(command)) => self.handle_command(command).await,
                Event::Command(None) => break,
                Event::Handshake(result) => {
                    self.handshake = None;
                    self.on_handshake(result).await;
                }
                Event::Inbound(inbound) => self.on_inbound(inbound),
                Event::Timer(timer) => self.on_timer(timer).await,
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("All connection handles dropped; shutting down");
        self.disconnect().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect().await,
            Command::Send { message, options } => self.send(message, options).await,
            Command::Subscribe { task_id, callback } => self.subscribe(task_id, callback).await,
            Command::Unsubscribe { task_id, callback } => {
                self.unsubscribe(&task_id, &callback).await;
            }
            Command::AddHandler { id, handler } => self.router.add_handler(id, handler),
            Command::RemoveHandler { id } => {
                self.router.remove_handler(id);
            }
        }
    }

    fn connect(&mut self) {
        if self.unavailable {
            #[cfg(feature = "tracing")]
            tracing::debug!("Backend is unavailable; disconnect() resets the manager");
            return;
        }
        if self.transport.is_some() || self.handshake.is_some() {
            return;
        }

        self.timers.cancel_reconnect();
        self.begin_handshake();
    }

    fn begin_handshake(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::debug!(url = %self.url, attempt = self.attempt, "Connecting");

        self.set_state(ConnectionState::Connecting {
            attempt: self.attempt,
        });
        self.handshake = Some(Box::pin(Transport::open(self.url.clone())));
        self.timers
            .arm_connect_deadline(self.config.connection_timeout);
    }

    async fn on_handshake(&mut self, result: Result<Transport>) {
        self.timers.cancel_connect_deadline();

        let transport = match result {
            Ok(transport) => transport,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, attempt = self.attempt, "Unable to connect");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                self.schedule_reconnect();
                return;
            }
        };

        let now = Instant::now();
        self.transport = Some(transport);
        self.attempt = 0;
        self.backoff.reset();
        self.set_state(ConnectionState::Open {
            since: now.into_std(),
        });

        #[cfg(feature = "tracing")]
        tracing::info!(
            client_id = %self.config.client_id,
            subscriptions = self.registry.len(),
            queued = self.queue.len(),
            "Connected"
        );

        self.heartbeat.start(now);
        self.timers.start_heartbeat(self.config.heartbeat.interval);

        for task_id in self.registry.take_pending() {
            if self.transport.is_none() {
                break;
            }
            self.announce(&task_id).await;
        }
        self.flush().await;
    }

    /// Drop a broken transport and start reconnecting. No-op when there is
    /// no transport, so a failure observed twice is handled once.
    fn handle_closed(&mut self, error: Error) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        drop(transport);

        #[cfg(feature = "tracing")]
        tracing::warn!(error = %error, "Connection lost");
        #[cfg(not(feature = "tracing"))]
        let _ = &error;

        self.heartbeat.stop();
        self.timers.stop_heartbeat();
        self.timers.stop_flush();
        self.registry.mark_all_pending();
        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let max_attempts = self.config.reconnect.max_attempts;
        if self.attempt >= max_attempts {
            #[cfg(feature = "tracing")]
            tracing::error!(
                attempts = self.attempt,
                "Backend unavailable; giving up on reconnection"
            );
            self.unavailable = true;
            self.set_state(ConnectionState::Unavailable);
            return;
        }

        self.attempt = self.attempt.saturating_add(1);
        let base = self
            .backoff
            .next_backoff()
            .unwrap_or(self.config.reconnect.max_backoff);
        let delay = base + self.config.reconnect.jitter();

        #[cfg(feature = "tracing")]
        tracing::info!(attempt = self.attempt, max_attempts, ?delay, "Scheduling reconnection");

        self.set_state(ConnectionState::Reconnecting {
            attempt: self.attempt,
            delay,
        });
        self.timers.arm_reconnect(delay);
    }

    async fn disconnect(&mut self) {
        self.set_state(ConnectionState::Closing);

        self.timers.clear();
        self.handshake = None;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.heartbeat.stop();
        self.registry.mark_all_pending();

        self.attempt = 0;
        self.backoff.reset();
        self.unavailable = false;
        self.set_state(ConnectionState::Disconnected);

        #[cfg(feature = "tracing")]
        tracing::info!("Disconnected");
    }

    async fn on_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::ConnectDeadline => {
                if self.handshake.take().is_some() {
                    let error = WsError::Timeout(self.config.connection_timeout);
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%error, "Abandoning connection attempt");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &error;
                    self.schedule_reconnect();
                }
            }
            TimerEvent::Reconnect => {
                if !self.unavailable && self.transport.is_none() && self.handshake.is_none() {
                    self.begin_handshake();
                }
            }
            TimerEvent::Heartbeat => self.heartbeat_tick().await,
            TimerEvent::Flush => self.flush().await,
        }
    }

    async fn heartbeat_tick(&mut self) {
        if self.transport.is_none() {
            return;
        }

        let liveness = self
            .heartbeat
            .check(self.config.heartbeat.timeout, Instant::now());
        if let Liveness::Expired { silent_for } = liveness {
            self.handle_closed(WsError::HeartbeatTimeout { silent_for }.into());
            return;
        }

        if let Err(e) = self.write(&ClientMessage::ping()).await {
            self.handle_closed(e);
        }
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Text(text) => {
                let outcome = self
                    .router
                    .route_frame(&text, &self.registry, &mut self.heartbeat);

                #[cfg(feature = "tracing")]
                tracing::trace!(?outcome, "Routed inbound frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &outcome;

                let last_pong = self.heartbeat.last_pong().map(Instant::into_std);
                self.pong_tx.send_if_modified(|current| {
                    let changed = *current != last_pong;
                    *current = last_pong;
                    changed
                });
            }
            Inbound::Closed(error) => self.handle_closed(error.into()),
        }
    }

    async fn send(&mut self, message: ClientMessage, options: SendOptions) {
        if self.transport.is_none() {
            if options.retryable {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    message_type = message.message_type(),
                    "Not connected; queueing message"
                );
                self.queue.push(message, options);
            } else {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    message_type = message.message_type(),
                    "Not connected; dropping non-retryable message"
                );
            }
            return;
        }

        // Earlier messages are still waiting; keep FIFO order.
        if options.retryable && !self.queue.is_empty() {
            self.queue.push(message, options);
            self.sync_flush_timer();
            return;
        }

        if let Err(e) = self.write(&message).await {
            if options.retryable {
                self.queue.push_failed(message, options);
            }
            self.handle_closed(e);
        }
    }

    async fn subscribe(&mut self, task_id: String, callback: TaskCallback) {
        match self.registry.register(&task_id, callback) {
            Registration::Duplicate => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%task_id, "Callback already subscribed");
            }
            Registration::Added { .. } => {
                if self.transport.is_some() {
                    self.announce(&task_id).await;
                } else {
                    #[cfg(feature = "tracing")]
                    tracing::info!(%task_id, "Not connected; subscription will be sent once open");
                    self.registry.mark_pending(&task_id);
                    if self.handshake.is_none() && !self.timers.reconnect_scheduled() {
                        self.connect();
                    }
                }
            }
        }
    }

    async fn unsubscribe(&mut self, task_id: &str, callback: &TaskCallback) {
        let removal = self.registry.unregister(task_id, callback);
        if removal != Removal::LastRemoved || self.transport.is_none() {
            return;
        }

        if let Err(e) = self.write(&ClientMessage::unsubscribe_task(task_id)).await {
            self.handle_closed(e);
        }
    }

    /// Tell the backend about `task_id`. On failure the task stays pending.
    async fn announce(&mut self, task_id: &str) {
        match self.write(&ClientMessage::subscribe_task(task_id)).await {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%task_id, "Subscribed to task");
            }
            Err(e) => {
                self.registry.mark_pending(task_id);
                self.handle_closed(e);
            }
        }
    }

    /// Transmit one batch from the queue.
    async fn flush(&mut self) {
        if self.transport.is_some() && !self.queue.is_empty() {
            let mut batch = self.queue.take_batch().into_iter();
            while let Some(queued) = batch.next() {
                if let Err(e) = self.write(&queued.message).await {
                    self.queue.retry(queued);
                    self.queue.restore(batch.collect());
                    self.handle_closed(e);
                    break;
                }
            }
        }
        self.sync_flush_timer();
    }

    /// The flush ticker runs only while there is something to flush and a
    /// transport to flush it to.
    fn sync_flush_timer(&mut self) {
        if self.transport.is_some() && !self.queue.is_empty() {
            self.timers.ensure_flush(self.config.queue.flush_interval);
        } else {
            self.timers.stop_flush();
        }
    }

    async fn write(&mut self, message: &ClientMessage) -> Result<()> {
        match self.transport.as_mut() {
            Some(transport) => transport.send(message).await,
            None => Err(WsError::ConnectionClosed.into()),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

type Handshake = BoxFuture<'static, Result<Transport>>;

async fn next_handshake(handshake: &mut Option<Handshake>) -> Result<Transport> {
    match handshake {
        Some(future) => future.await,
        None => pending().await,
    }
}

async fn next_inbound(transport: &mut Option<Transport>) -> Inbound {
    match transport {
        Some(transport) => transport.recv().await,
        None => pending().await,
    }
}
