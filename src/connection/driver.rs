//! Connection Driver
//!
//! Tokio runtime for a [`ConnectionController`]. One actor task owns the
//! controller, the timer table and the current websocket; [`Client`] handles
//! talk to it over a channel. Socket I/O runs in a per-connection task that
//! reports back with the connection id it was opened under.

use std::collections::BTreeMap;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, HeartbeatConfigUpdate};
use crate::connection::controller::{
    Action, ClientEvent, CloseReason, ConnId, ConnectionController, ConnectionStatus,
    HeartbeatCallback, TimerKind,
};
use crate::connection::dispatcher::{FeedHandler, Listener};
use crate::connection::heartbeat::HeartbeatStats;
use crate::error::ClientError;
use crate::protocol::{payload, Command, LoginRequest, OperateTweet, ProviderProfile, VoteOnHistory};
use crate::store::{JsonFileStore, MemoryStore, SessionStore, StoredUser};

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

type Job = Box<dyn FnOnce(&mut ConnectionController, Instant) + Send>;

enum Request {
    Run(Job),
    Shutdown,
}

enum SocketEvent {
    Opened(ConnId),
    Frame(ConnId, String),
    Closed(ConnId, CloseReason),
}

struct SocketHandle {
    conn: ConnId,
    outgoing: mpsc::UnboundedSender<String>,
}

// =============================================================================
// CLIENT HANDLE
// =============================================================================

/// Handle to a running connection. Cheap to clone; the connection task stops
/// when [`shutdown`](Self::shutdown) is called or every handle is dropped.
#[derive(Clone)]
pub struct Client {
    requests: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<ClientEvent>,
}

impl Client {
    /// Start a connection with the store named by `config.store_path`
    /// (in-memory when unset). Must be called from within a tokio runtime.
    pub fn spawn(config: ClientConfig) -> Result<(Self, JoinHandle<()>), ClientError> {
        let store: Box<dyn SessionStore> = match config.store_path {
            Some(ref path) => Box::new(JsonFileStore::open(path)?),
            None => Box::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Start a connection backed by the given store and begin connecting.
    pub fn with_store(config: ClientConfig, store: Box<dyn SessionStore>) -> (Self, JoinHandle<()>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut controller = ConnectionController::new(config, store);
        controller.connect();

        let driver = Driver {
            controller,
            requests: request_rx,
            socket_events_tx: socket_tx,
            socket_events: socket_rx,
            socket: None,
            timers: BTreeMap::new(),
            events: events.clone(),
        };
        let handle = tokio::spawn(driver.run());

        (
            Self {
                requests: request_tx,
                events,
            },
            handle,
        )
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Run a closure against the controller on the connection task.
    pub fn run<F>(&self, f: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut ConnectionController, Instant) + Send + 'static,
    {
        self.requests
            .send(Request::Run(Box::new(f)))
            .map_err(|_| ClientError::Shutdown)
    }

    /// Run a closure against the controller and wait for its result.
    pub async fn query<T, F>(&self, f: F) -> Result<T, ClientError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ConnectionController, Instant) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.run(move |controller, now| {
            let _ = tx.send(f(controller, now));
        })?;
        rx.await.map_err(|_| ClientError::Shutdown)
    }

    /// Stop the connection task after a hard disconnect.
    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Connect if not connected or connecting.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.run(|c, _| c.connect())
    }

    /// Hard disconnect; no automatic reconnection follows.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.run(|c, _| c.disconnect())
    }

    /// Send a command through the authentication gate.
    pub fn send(&self, command: Command, data: Value, bypass: bool) -> Result<(), ClientError> {
        self.run(move |c, now| c.send(command, data, bypass, now))
    }

    /// Serialize a typed payload and [`send`](Self::send) it.
    pub fn send_payload<T: Serialize>(
        &self,
        command: Command,
        request: &T,
        bypass: bool,
    ) -> Result<(), ClientError> {
        let data = payload(request)?;
        self.send(command, data, bypass)
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    /// Register a listener for a command.
    pub fn on(&self, command: Command, listener: Listener) -> Result<(), ClientError> {
        self.run(move |c, _| c.on(command, listener))
    }

    /// Remove a listener; resolves to whether it was registered.
    pub async fn off(&self, command: Command, listener: Listener) -> Result<bool, ClientError> {
        self.query(move |c, _| c.off(command, &listener)).await
    }

    /// Receive scene feed payloads.
    pub fn subscribe(&self, handler: FeedHandler) -> Result<(), ClientError> {
        self.run(move |c, _| c.subscribe(handler))
    }

    /// Stop receiving scene feed payloads.
    pub async fn unsubscribe(&self, handler: FeedHandler) -> Result<bool, ClientError> {
        self.query(move |c, _| c.unsubscribe(&handler)).await
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Send a login request.
    pub fn login(&self, request: LoginRequest) -> Result<(), ClientError> {
        self.run(move |c, now| c.login(request, now))
    }

    /// Username/password login.
    pub fn manual_login(
        &self,
        username: &str,
        password: &str,
        nickname: Option<&str>,
    ) -> Result<(), ClientError> {
        self.login(LoginRequest::password(username, password, nickname))
    }

    /// Identity-provider login.
    pub fn provider_login(&self, profile: &ProviderProfile) -> Result<(), ClientError> {
        self.login(LoginRequest::provider(profile))
    }

    /// Fetch a scene feed page.
    pub fn get_scene_feed(
        &self,
        room_id: i64,
        page: u32,
        size: u32,
        episode: Option<u32>,
    ) -> Result<(), ClientError> {
        self.run(move |c, _| c.get_scene_feed(room_id, page, size, episode))
    }

    /// Operate on a tweet as the stored user.
    pub fn operate_tweet(&self, op: OperateTweet) -> Result<(), ClientError> {
        self.run(move |c, _| c.operate_tweet(op))
    }

    /// Up- or down-vote a thread.
    pub fn vote_thread(&self, thread_id: &str, upvote: bool) -> Result<(), ClientError> {
        let thread_id = thread_id.to_string();
        self.run(move |c, now| c.vote_thread(&thread_id, upvote, now))
    }

    /// Vote in a room's vote history.
    pub fn vote_on_history(&self, vote: VoteOnHistory) -> Result<(), ClientError> {
        self.run(move |c, now| c.vote_on_history(vote, now))
    }

    /// Fetch a room's vote history.
    pub fn get_vote_history(&self, room_id: i64) -> Result<(), ClientError> {
        self.run(move |c, now| c.get_vote_history(room_id, now))
    }

    /// Fetch character chat history.
    pub fn get_character_history(&self, page_size: u32, page_num: u32) -> Result<(), ClientError> {
        self.run(move |c, now| c.get_character_history(page_size, page_num, now))
    }

    /// Fetch the episode list.
    pub fn get_ep_list(&self) -> Result<(), ClientError> {
        self.run(|c, now| c.get_ep_list(now))
    }

    /// Fetch the player's point balance.
    pub fn get_user_points(&self) -> Result<(), ClientError> {
        self.run(|c, now| c.get_user_points(now))
    }

    /// Request vote and character history for a room.
    pub fn request_scene_data(&self, room_id: i64, request_id: Option<String>) -> Result<(), ClientError> {
        self.run(move |c, now| c.request_scene_data(room_id, request_id, now))
    }

    /// Persist a user record as signed in.
    pub fn remember_user(&self, user: StoredUser) -> Result<(), ClientError> {
        self.run(move |c, _| c.remember_user(&user))
    }

    /// Forget the persisted identity.
    pub fn forget_session(&self) -> Result<(), ClientError> {
        self.run(|c, _| c.forget_session())
    }

    // -------------------------------------------------------------------------
    // Heartbeat
    // -------------------------------------------------------------------------

    /// Start heartbeating if connected.
    pub fn enable_heartbeat(&self) -> Result<(), ClientError> {
        self.run(|c, now| c.enable_heartbeat(now))
    }

    /// Stop heartbeating.
    pub fn disable_heartbeat(&self) -> Result<(), ClientError> {
        self.run(|c, _| c.disable_heartbeat())
    }

    /// Send one probe now.
    pub fn send_manual_heartbeat(&self) -> Result<(), ClientError> {
        self.run(|c, now| c.send_manual_heartbeat(now))
    }

    /// Change heartbeat parameters.
    pub fn update_heartbeat_config(&self, update: HeartbeatConfigUpdate) -> Result<(), ClientError> {
        self.run(move |c, now| c.update_heartbeat_config(update, now))
    }

    /// Install the heartbeat observer.
    pub fn on_heartbeat_event(&self, callback: HeartbeatCallback) -> Result<(), ClientError> {
        self.run(move |c, _| c.on_heartbeat_event(callback))
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Whether the socket is open.
    pub async fn is_connection_open(&self) -> Result<bool, ClientError> {
        self.query(|c, _| c.is_connection_open()).await
    }

    /// Connection status snapshot.
    pub async fn connection_status(&self) -> Result<ConnectionStatus, ClientError> {
        self.query(|c, now| c.connection_status(now)).await
    }

    /// Heartbeat counters.
    pub async fn heartbeat_stats(&self) -> Result<HeartbeatStats, ClientError> {
        self.query(|c, now| c.heartbeat_stats(now)).await
    }
}

// =============================================================================
// ACTOR
// =============================================================================

struct Driver {
    controller: ConnectionController,
    requests: mpsc::UnboundedReceiver<Request>,
    socket_events_tx: mpsc::UnboundedSender<SocketEvent>,
    socket_events: mpsc::UnboundedReceiver<SocketEvent>,
    socket: Option<SocketHandle>,
    timers: BTreeMap<TimerKind, TokioInstant>,
    events: broadcast::Sender<ClientEvent>,
}

impl Driver {
    async fn run(mut self) {
        info!("Connection driver started");
        self.apply_actions();

        loop {
            let next_deadline = self.timers.values().min().copied();

            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Run(job)) => job(&mut self.controller, TokioInstant::now().into_std()),
                    Some(Request::Shutdown) | None => break,
                },
                Some(event) = self.socket_events.recv() => self.on_socket_event(event),
                _ = sleep_until_deadline(next_deadline) => self.fire_due_timers(),
            }

            self.apply_actions();
        }

        self.controller.disconnect();
        self.apply_actions();
        info!("Connection driver stopped");
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        let now = TokioInstant::now().into_std();
        match event {
            SocketEvent::Opened(conn) => self.controller.on_open(conn, now),
            SocketEvent::Frame(conn, text) => self.controller.on_frame(conn, &text, now),
            SocketEvent::Closed(conn, reason) => {
                if self.socket.as_ref().is_some_and(|s| s.conn == conn) {
                    self.socket = None;
                }
                self.controller.on_closed(conn, reason);
            }
        }
    }

    fn fire_due_timers(&mut self) {
        loop {
            let now = TokioInstant::now();
            let due = self
                .timers
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .min_by_key(|(_, deadline)| **deadline)
                .map(|(timer, _)| *timer);
            let Some(timer) = due else {
                break;
            };

            self.timers.remove(&timer);
            debug!(?timer, "Timer fired");
            self.controller.on_timer(timer, now.into_std());
            self.apply_actions();
        }
    }

    fn apply_actions(&mut self) {
        for action in self.controller.drain_actions() {
            match action {
                Action::Open { conn, endpoint } => self.open_socket(conn, endpoint),
                Action::Close { conn } => {
                    if self.socket.as_ref().is_some_and(|s| s.conn == conn) {
                        debug!(conn, "Closing socket");
                        // dropping the sender makes the socket task send a close frame
                        self.socket = None;
                    }
                }
                Action::Transmit { conn, text } => match self.socket {
                    Some(ref socket) if socket.conn == conn => {
                        if socket.outgoing.send(text).is_err() {
                            warn!(conn, "Socket writer gone, dropping message");
                        }
                    }
                    _ => warn!(conn, "No socket for outbound message"),
                },
                Action::ArmTimer { timer, after } => {
                    self.timers.insert(timer, TokioInstant::now() + after);
                }
                Action::CancelTimer(timer) => {
                    self.timers.remove(&timer);
                }
                Action::Emit(event) => {
                    // no subscribers is fine
                    let _ = self.events.send(event);
                }
            }
        }
    }

    fn open_socket(&mut self, conn: ConnId, endpoint: String) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        self.socket = Some(SocketHandle {
            conn,
            outgoing: outgoing_tx,
        });
        tokio::spawn(run_socket(
            conn,
            endpoint,
            outgoing_rx,
            self.socket_events_tx.clone(),
        ));
    }
}

async fn sleep_until_deadline(deadline: Option<TokioInstant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Socket task: connects, then pumps frames both ways until either side
/// closes. A local close (outgoing channel dropped) is not reported back.
async fn run_socket(
    conn: ConnId,
    endpoint: String,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    info!(conn, "Connecting to {}...", endpoint);

    let ws_stream = match connect_async(endpoint.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            error!(conn, "Failed to connect to server: {}", e);
            let _ = events.send(SocketEvent::Closed(
                conn,
                CloseReason::ConnectFailed(e.to_string()),
            ));
            return;
        }
    };

    info!(conn, "WebSocket connected");
    let _ = events.send(SocketEvent::Opened(conn));
    let (mut write, mut read) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(SocketEvent::Frame(conn, text));
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(conn, "Server closed connection");
                    break CloseReason::Peer;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(_)) => warn!(conn, "Ignoring non-text message"),
                Some(Err(e)) => {
                    error!(conn, "WebSocket read error: {}", e);
                    break CloseReason::Error(e.to_string());
                }
            },
            message = outgoing.recv() => match message {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        error!(conn, "Failed to send message: {}", e);
                        break CloseReason::Error(e.to_string());
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    debug!(conn, "Socket closed locally");
                    return;
                }
            },
        }
    };

    let _ = events.send(SocketEvent::Closed(conn, reason));
}
