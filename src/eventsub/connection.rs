use super::protocol::{
    self, EventSubMessage, Notification, Subscription, SubscriptionRequest, NOTIFICATION,
    REVOCATION, SESSION_KEEPALIVE, SESSION_RECONNECT, SESSION_WELCOME,
};
use super::reconnect::{Immediate, ReconnectPolicy};
use crate::config::EventSubConfig;
use crate::error::Error;
use crate::helix::SubscriptionApi;
use anyhow::{bail, Context, Result};
use futures::future::join_all;
use futures::StreamExt;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broadcast channel capacity for forwarded notifications.
const NOTIFICATION_CAPACITY: usize = 256;

/// Consecutive connect failures past the first are logged at `warn!` only
/// once per this many attempts.
const CONNECT_FAILURE_WARN_EVERY: u32 = 50;

/// Lifecycle of an [`EventSubConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No task running, no socket open
    Idle,
    /// Task running, opening a socket
    Connecting,
    /// Socket open, receiving
    Connected,
    /// Stop requested, task unwinding
    Stopping,
}

/// Lets a non-owning caller ask the receive loop to close its socket.
///
/// This is the only access other call sites get to the live connection.
#[derive(Clone, Default)]
struct CloseHandle(Arc<Notify>);

impl CloseHandle {
    fn close(&self) {
        self.0.notify_one();
    }

    async fn closed(&self) {
        self.0.notified().await;
    }
}

/// One `start()` of the background task. Stays in [`Inner::run`] until a
/// `stop()` has seen the task exit, so a new run never overlaps an old one.
struct Run {
    generation: u64,
    task: JoinHandle<()>,
    /// Becomes `true` once the task has finished touching shared state
    exited: watch::Receiver<bool>,
}

impl Run {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

/// State guarded by [`Shared::inner`]. Critical sections only read and
/// assign fields; no lock is held across an `.await`.
struct Inner {
    subscriptions: Vec<Subscription>,
    /// Set by the first `start()`, never cleared
    started: bool,
    run: Option<Run>,
    generation: u64,
    should_stop: bool,
    state: ConnectionState,
    /// Published and cleared only by the worker
    client: Option<CloseHandle>,
    session_id: Option<String>,
    /// Cuts a reconnect delay short on stop
    wakeup: Arc<Notify>,
}

struct Shared {
    inner: Mutex<Inner>,
    policy: Mutex<Box<dyn ReconnectPolicy>>,
    notifications: broadcast::Sender<Notification>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn policy(&self) -> MutexGuard<'_, Box<dyn ReconnectPolicy>> {
        self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A single EventSub websocket connection.
///
/// Owns one background task that connects, receives until the socket
/// closes, and reconnects, until [`stop`] is called. Every time the server
/// welcomes a new session, each registered subscription is created for it
/// through the [`SubscriptionApi`].
///
/// Subscriptions are fixed once the connection has been started.
///
/// # Example
///
/// ```no_run
/// use eventsub_bridge::config::EventSubConfig;
/// use eventsub_bridge::eventsub::EventSubConnection;
/// # use eventsub_bridge::helix::SubscriptionApi;
/// # use std::sync::Arc;
/// use serde_json::json;
///
/// # async fn run(api: Arc<dyn SubscriptionApi>) -> anyhow::Result<()> {
/// let connection = EventSubConnection::new(EventSubConfig::default(), api);
/// connection.add_subscription(
///     "channel.channel_points_custom_reward_redemption.add",
///     "1",
///     json!({ "broadcaster_user_id": "1234" }),
/// )?;
///
/// connection.start();
/// // ...
/// connection.stop().await;
/// # Ok(())
/// # }
/// ```
///
/// [`stop`]: EventSubConnection::stop
pub struct EventSubConnection {
    config: EventSubConfig,
    api: Arc<dyn SubscriptionApi>,
    shared: Arc<Shared>,
}

impl EventSubConnection {
    pub fn new(config: EventSubConfig, api: Arc<dyn SubscriptionApi>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let shared = Shared {
            inner: Mutex::new(Inner {
                subscriptions: Vec::new(),
                started: false,
                run: None,
                generation: 0,
                should_stop: false,
                state: ConnectionState::Idle,
                client: None,
                session_id: None,
                wakeup: Arc::new(Notify::new()),
            }),
            policy: Mutex::new(Box::new(Immediate)),
            notifications,
        };

        Self {
            config,
            api,
            shared: Arc::new(shared),
        }
    }

    /// Replace the default (immediate) reconnect policy.
    pub fn with_reconnect_policy(self, policy: Box<dyn ReconnectPolicy>) -> Self {
        *self.shared.policy() = policy;
        self
    }

    /// Register a subscription to create on every new session.
    ///
    /// Fails with [`Error::UnsupportedOperation`] once the connection has
    /// been started.
    pub fn add_subscription(
        &self,
        kind: impl Into<String>,
        version: impl Into<String>,
        condition: Value,
    ) -> Result<()> {
        let mut inner = self.shared.lock();
        if inner.started {
            return Err(Error::UnsupportedOperation("dynamic subscriptions are not supported").into());
        }
        inner
            .subscriptions
            .push(Subscription::new(kind, version, condition));
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.lock().subscriptions.clone()
    }

    /// Spawn the background task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Panics
    /// If no subscription has been registered, or the task is still running
    /// (including while a `stop()` is waiting for it).
    pub fn start(&self) {
        let mut inner = self.shared.lock();
        if inner.subscriptions.is_empty() {
            drop(inner);
            panic!("at least one subscription is required");
        }
        if inner.run.as_ref().is_some_and(Run::is_alive) {
            drop(inner);
            panic!("EventSub connection is already running");
        }

        inner.started = true;
        inner.should_stop = false;
        inner.state = ConnectionState::Connecting;
        inner.wakeup = Arc::new(Notify::new());
        inner.generation += 1;
        let generation = inner.generation;

        let (exited_tx, exited) = watch::channel(false);
        let worker = Worker {
            shared: Arc::clone(&self.shared),
            api: Arc::clone(&self.api),
            url: self.config.url.clone(),
            connect_timeout: Duration::from_secs(self.config.connect_timeout_secs),
            wakeup: Arc::clone(&inner.wakeup),
            exited: exited_tx,
        };
        inner.run = Some(Run {
            generation,
            task: tokio::spawn(worker.run()),
            exited,
        });

        info!(
            url = %self.config.url,
            subscriptions = inner.subscriptions.len(),
            "EventSub connection started"
        );
    }

    /// Stop the background task and wait for it to exit.
    ///
    /// Closes the live socket, if any, to unblock a pending receive.
    /// Concurrent callers all return once the same task has exited. Does
    /// nothing if the connection is not running.
    pub async fn stop(&self) {
        let (generation, mut exited) = {
            let mut inner = self.shared.lock();
            let Some((generation, exited)) = inner
                .run
                .as_ref()
                .map(|run| (run.generation, run.exited.clone()))
            else {
                return;
            };

            inner.should_stop = true;
            inner.state = ConnectionState::Stopping;
            if let Some(client) = &inner.client {
                client.close();
            }
            inner.wakeup.notify_one();
            (generation, exited)
        };

        info!("Stopping EventSub connection");
        // Err: the task dropped its sender without reporting, i.e. it panicked
        if exited.wait_for(|exited| *exited).await.is_err() {
            error!("EventSub task exited abnormally");
        }

        let mut inner = self.shared.lock();
        if inner
            .run
            .as_ref()
            .is_some_and(|run| run.generation == generation)
        {
            inner.run = None;
            inner.state = ConnectionState::Idle;
            info!("EventSub connection stopped");
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().run.as_ref().is_some_and(Run::is_alive)
    }

    /// Session id of the current connection, once welcomed.
    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().session_id.clone()
    }

    /// Receive `notification` messages for the registered subscriptions.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.shared.notifications.subscribe()
    }
}

impl Drop for EventSubConnection {
    fn drop(&mut self) {
        // Let a still-running task wind down on its own
        let mut inner = self.shared.lock();
        if inner.run.is_some() {
            inner.should_stop = true;
            if let Some(client) = &inner.client {
                client.close();
            }
            inner.wakeup.notify_one();
        }
    }
}

/// The background task's half of the connection.
struct Worker {
    shared: Arc<Shared>,
    api: Arc<dyn SubscriptionApi>,
    url: String,
    connect_timeout: Duration,
    wakeup: Arc<Notify>,
    exited: watch::Sender<bool>,
}

impl Worker {
    async fn run(self) {
        let mut first_attempt = true;
        let mut connect_failures: u32 = 0;

        loop {
            if !first_attempt {
                self.wait_before_reconnect().await;
            }
            first_attempt = false;

            let (ws, client) = match self.open_connection().await {
                Ok(Some(connection)) => {
                    connect_failures = 0;
                    connection
                }
                // Stop requested
                Ok(None) => break,
                Err(e) => {
                    connect_failures = connect_failures.saturating_add(1);
                    if warn_on_connect_failure(connect_failures) {
                        warn!(
                            url = %self.url,
                            failures = connect_failures,
                            error = %e,
                            "Unable to connect to EventSub"
                        );
                    } else {
                        debug!(failures = connect_failures, error = %e, "EventSub connect failed");
                    }
                    continue;
                }
            };

            self.receive_loop(ws, &client).await;

            {
                let mut inner = self.shared.lock();
                inner.client = None;
                inner.session_id = None;
                if !inner.should_stop {
                    inner.state = ConnectionState::Connecting;
                }
            }
        }

        self.shared.lock().state = ConnectionState::Idle;
        let _ = self.exited.send(true);
        debug!("EventSub task exited");
    }

    async fn wait_before_reconnect(&self) {
        let delay = self.shared.policy().next_delay();
        if delay.is_zero() {
            return;
        }

        info!(delay_ms = delay.as_millis() as u64, "Reconnecting to EventSub after delay");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = self.wakeup.notified() => {}
        }
    }

    /// Open a socket unless a stop is pending, and publish it.
    ///
    /// Returns `Ok(None)` when the task should exit.
    async fn open_connection(&self) -> Result<Option<(WsStream, CloseHandle)>> {
        {
            let mut inner = self.shared.lock();
            debug_assert!(inner.client.is_none());
            if inner.should_stop {
                return Ok(None);
            }
            inner.state = ConnectionState::Connecting;
        }

        debug!(url = %self.url, "Connecting to EventSub");
        let (mut ws, _response) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .context("Timed out connecting to EventSub")?
            .context("Failed to connect to EventSub")?;

        let client = CloseHandle::default();
        {
            let mut inner = self.shared.lock();
            if !inner.should_stop {
                inner.client = Some(client.clone());
                inner.state = ConnectionState::Connected;
                info!(url = %self.url, "Connected to EventSub");
                return Ok(Some((ws, client)));
            }
        }

        debug!("Stop requested while connecting, discarding socket");
        if let Err(e) = ws.close(None).await {
            debug!(error = %e, "Failed to close discarded socket");
        }
        Ok(None)
    }

    /// Receive until the socket closes, for whatever reason.
    async fn receive_loop(&self, mut ws: WsStream, client: &CloseHandle) {
        loop {
            let frame = tokio::select! {
                _ = client.closed() => {
                    info!("Closing EventSub socket");
                    if let Err(e) = ws.close(None).await {
                        debug!(error = %e, "EventSub close handshake failed");
                    }
                    return;
                }
                frame = ws.next() => frame,
            };

            match frame {
                None => {
                    info!("EventSub socket disconnected");
                    return;
                }
                Some(Ok(Message::Close(frame))) => {
                    // Keep reading so the close reply is flushed; the stream ends next
                    info!(frame = ?frame, "EventSub socket closed by server");
                }
                Some(Ok(message)) => {
                    if let Err(e) = self.handle_raw_message(message, client).await {
                        warn!(error = %e, "Failed to handle EventSub message");
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "EventSub socket closed with an error");
                    return;
                }
            }
        }
    }

    async fn handle_raw_message(&self, message: Message, client: &CloseHandle) -> Result<()> {
        let Some(message) = protocol::decode(message)? else {
            return Ok(());
        };
        self.handle_message(message, client).await
    }

    async fn handle_message(&self, message: EventSubMessage, client: &CloseHandle) -> Result<()> {
        debug!(
            message_id = %message.metadata.message_id,
            message_type = %message.message_type(),
            "Incoming EventSub message"
        );

        match message.message_type() {
            SESSION_WELCOME => {
                let session_id = message
                    .session_id()
                    .context("session_welcome without payload.session.id")?
                    .to_string();
                self.handle_welcome(session_id, client).await
            }
            SESSION_KEEPALIVE => Ok(()),
            NOTIFICATION => {
                if let Some(notification) = message.notification() {
                    // No receivers is fine
                    let _ = self.shared.notifications.send(notification);
                }
                Ok(())
            }
            SESSION_RECONNECT => {
                warn!("EventSub requested a reconnect; waiting for the server to close");
                Ok(())
            }
            REVOCATION => {
                warn!(
                    subscription_type = message.subscription_type().unwrap_or_default(),
                    "EventSub subscription revoked"
                );
                Ok(())
            }
            other => {
                debug!(message_type = %other, "Ignoring EventSub message");
                Ok(())
            }
        }
    }

    /// Create every registered subscription for the new session.
    ///
    /// Outstanding calls are abandoned if the socket is asked to close.
    async fn handle_welcome(&self, session_id: String, client: &CloseHandle) -> Result<()> {
        let subscriptions = {
            let mut inner = self.shared.lock();
            inner.session_id = Some(session_id.clone());
            inner.subscriptions.clone()
        };
        self.shared.policy().reset();

        info!(
            session_id = %session_id,
            subscriptions = subscriptions.len(),
            "EventSub session established"
        );

        let requests: Vec<SubscriptionRequest> = subscriptions
            .iter()
            .map(|subscription| SubscriptionRequest::new(subscription, &session_id))
            .collect();

        let calls = join_all(
            requests
                .iter()
                .map(|request| self.api.create_subscription(request)),
        );
        let results = tokio::select! {
            results = calls => results,
            _ = client.closed() => {
                // Re-arm so the receive loop sees the close as well
                client.close();
                info!(session_id = %session_id, "Close requested, abandoning subscription calls");
                return Ok(());
            }
        };

        let mut failed = 0;
        for (request, result) in requests.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                error!(
                    subscription_type = %request.kind,
                    session_id = %session_id,
                    error = %e,
                    "Failed to create EventSub subscription"
                );
            }
        }

        if failed > 0 {
            bail!("{} of {} subscriptions failed", failed, requests.len());
        }
        Ok(())
    }
}

fn warn_on_connect_failure(consecutive: u32) -> bool {
    consecutive == 1 || consecutive % CONNECT_FAILURE_WARN_EVERY == 0
}
