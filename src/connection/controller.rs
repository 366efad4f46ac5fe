//! Connection Controller
//!
//! Synchronous state machine for the client side of the game websocket.
//! It owns every piece of connection state (lifecycle, heartbeat, listeners,
//! pending queue, session) and performs no I/O: each input is a method call
//! carrying the current time, and the resulting side effects are collected
//! as [`Action`]s for the driver to execute.
//!
//! ```text
//!   Disconnected ──connect──▶ Connecting ──opened──▶ Open
//!        ▲                        │                   │
//!        └────── closed / failed ─┴── closed / liveness lost
//!                 (reconnect after attempt × base delay, up to the cap)
//! ```
//!
//! Every socket the controller requests gets a fresh connection id. Socket
//! events carrying any other id, or arriving while disconnected, are stale
//! and ignored.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, HeartbeatConfig, HeartbeatConfigUpdate};
use crate::connection::dispatcher::{FeedHandler, Listener, ListenerRegistry};
use crate::connection::heartbeat::{HeartbeatMonitor, HeartbeatStats, Miss, ResponseOutcome};
use crate::connection::queue::{gate, ConnectWaiters, Gate, PendingRequest, RequestQueue};
use crate::connection::session::{self, LoginOutcome, Session};
use crate::protocol::{
    payload, Command, CommandEvent, HeartbeatProbe, HistoryPage, InboundEnvelope, LoginRequest,
    OperateTweet, OperateTweetRequest, OutboundEnvelope, ProviderProfile, SceneDataRequest,
    SceneFeedRequest, VoteOnHistory, VoteThreadRequest,
};
use crate::store::{SessionStore, StoredUser, KEY_PLAYER_ID};

/// Identifier of one socket incarnation.
pub type ConnId = u64;

/// Socket lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// Socket requested, not open yet.
    Connecting,
    /// Socket open.
    Open,
}

/// Why a socket went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Server closed the connection.
    Peer,
    /// Transport error on an open socket.
    Error(String),
    /// The socket never opened.
    ConnectFailed(String),
    /// Too many heartbeats went unanswered.
    LivenessLost,
}

/// Named timers. At most one of each kind is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Next heartbeat probe.
    HeartbeatInterval,
    /// Outstanding probe deadline.
    HeartbeatTimeout,
    /// Backoff before the next connection attempt.
    Reconnect,
    /// Poll for sends waiting on the socket to open.
    ConnectWait,
    /// Staggered sends.
    Deferred,
}

/// Lifecycle notifications for the rest of the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Socket opened.
    Connected,
    /// Socket lost.
    Disconnected(CloseReason),
    /// Login succeeded.
    LoggedIn {
        /// Player identifier from the response.
        player_id: Option<String>,
    },
    /// Login rejected.
    LoginFailed {
        /// Server error code.
        code: i64,
        /// Server error text.
        message: String,
    },
    /// A reconnection attempt has been scheduled.
    ReconnectScheduled {
        /// Attempt number, 1-based.
        attempt: u32,
        /// Backoff before the attempt.
        delay: Duration,
    },
    /// Retries exhausted; the connection stays down until `connect`.
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },
}

/// Heartbeat notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatEvent {
    /// Probe sent.
    Sent(HeartbeatProbe),
    /// Probe answered.
    Received {
        /// Round trip.
        rtt: Duration,
        /// Response payload.
        server_data: Value,
    },
    /// Probe missed.
    Timeout {
        /// Consecutive misses.
        missed: u32,
        /// Threshold.
        max_missed: u32,
    },
    /// Threshold reached; reconnecting.
    Missed {
        /// Consecutive misses.
        missed: u32,
    },
}

/// Heartbeat observer.
pub type HeartbeatCallback = Arc<dyn Fn(&HeartbeatEvent) + Send + Sync>;

/// Side effects requested by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open a socket.
    Open {
        /// Id to tag this socket's events with.
        conn: ConnId,
        /// URL.
        endpoint: String,
    },
    /// Close a socket without reporting it back.
    Close {
        /// Socket to close.
        conn: ConnId,
    },
    /// Write a text frame.
    Transmit {
        /// Target socket.
        conn: ConnId,
        /// Serialized envelope.
        text: String,
    },
    /// Arm (or re-arm) a timer.
    ArmTimer {
        /// Which timer.
        timer: TimerKind,
        /// Delay from now.
        after: Duration,
    },
    /// Disarm a timer.
    CancelTimer(TimerKind),
    /// Publish a lifecycle event.
    Emit(ClientEvent),
}

/// Snapshot returned by [`ConnectionController::connection_status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Socket open.
    pub is_connected: bool,
    /// Login confirmed on this connection.
    pub is_logged_in: bool,
    /// Heartbeat running.
    pub is_heartbeat_enabled: bool,
    /// Consecutive heartbeat misses.
    pub missed_heartbeats: u32,
    /// Time since the last probe was sent.
    pub last_heartbeat_ago: Option<Duration>,
    /// Reconnections since the last successful open.
    pub reconnect_attempts: u32,
    /// Requests held by the gate.
    pub pending_requests: usize,
    /// Requests evicted from the full pending queue.
    pub dropped_requests: u64,
    /// Heartbeat parameters.
    pub heartbeat_config: HeartbeatConfig,
    /// Heartbeat counters.
    pub heartbeat_stats: HeartbeatStats,
}

/// The connection state machine.
pub struct ConnectionController {
    config: ClientConfig,
    state: ConnectionState,
    conn: ConnId,
    reconnect_attempts: u32,
    heartbeat: HeartbeatMonitor,
    heartbeat_callback: Option<HeartbeatCallback>,
    listeners: ListenerRegistry,
    queue: RequestQueue,
    waiters: ConnectWaiters,
    deferred: VecDeque<(Instant, PendingRequest)>,
    session: Session,
    store: Box<dyn SessionStore>,
    actions: Vec<Action>,
}

impl ConnectionController {
    /// Create a disconnected controller.
    pub fn new(config: ClientConfig, store: Box<dyn SessionStore>) -> Self {
        Self {
            heartbeat: HeartbeatMonitor::new(config.heartbeat),
            queue: RequestQueue::new(config.pending_capacity),
            config,
            state: ConnectionState::Disconnected,
            conn: 0,
            reconnect_attempts: 0,
            heartbeat_callback: None,
            listeners: ListenerRegistry::new(),
            waiters: ConnectWaiters::default(),
            deferred: VecDeque::new(),
            session: Session::new(),
            store,
            actions: Vec::new(),
        }
    }

    /// Take the side effects produced so far.
    pub fn drain_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Open a socket unless one is open or being opened.
    pub fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!(state = ?self.state, "connect ignored, socket already present");
            return;
        }

        self.cancel(TimerKind::Reconnect);
        self.conn += 1;
        self.state = ConnectionState::Connecting;
        info!(endpoint = %self.config.endpoint, conn = self.conn, "Connecting");
        self.actions.push(Action::Open {
            conn: self.conn,
            endpoint: self.config.endpoint.clone(),
        });
    }

    /// Hard teardown: cancel timers, close the socket, drop queued requests
    /// and authentication. No automatic reconnection follows.
    pub fn disconnect(&mut self) {
        info!("Disconnecting");
        self.stop_heartbeat();
        for timer in [TimerKind::Reconnect, TimerKind::ConnectWait, TimerKind::Deferred] {
            self.cancel(timer);
        }
        self.session.invalidate();
        self.queue.clear();
        self.waiters.release();
        self.deferred.clear();
        self.reconnect_attempts = 0;

        if self.state != ConnectionState::Disconnected {
            self.actions.push(Action::Close { conn: self.conn });
            self.state = ConnectionState::Disconnected;
        }
    }

    /// The socket `conn` finished its handshake.
    pub fn on_open(&mut self, conn: ConnId, now: Instant) {
        if !self.is_current(conn) {
            debug!(conn, "ignoring open of stale socket");
            return;
        }

        info!(conn, "Connected");
        self.state = ConnectionState::Open;
        self.reconnect_attempts = 0;
        self.cancel(TimerKind::Reconnect);
        self.start_heartbeat(now);
        self.actions.push(Action::Emit(ClientEvent::Connected));

        let restored = session::restore_login(self.store.as_ref());
        self.retry_after_reconnect();
        match restored {
            Some(login) => {
                info!(name = %login.name, "Restoring session");
                self.login(login, now);
            }
            None => debug!("No stored identity, waiting for manual login"),
        }

        self.cancel(TimerKind::ConnectWait);
        for waiting in self.waiters.release() {
            self.route(waiting.request, waiting.bypass);
        }
    }

    /// The socket `conn` closed or failed to open.
    pub fn on_closed(&mut self, conn: ConnId, reason: CloseReason) {
        if !self.is_current(conn) {
            debug!(conn, ?reason, "ignoring close of stale socket");
            return;
        }
        self.handle_close(reason);
    }

    /// A text frame arrived on socket `conn`.
    pub fn on_frame(&mut self, conn: ConnId, text: &str, now: Instant) {
        if !self.is_current(conn) {
            debug!(conn, "ignoring frame from stale socket");
            return;
        }

        let envelope = match InboundEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed message: {} - {}", e, text);
                return;
            }
        };

        debug!(
            command = %envelope.command,
            code = envelope.code,
            message = envelope.message.as_deref().unwrap_or(""),
            "Received message"
        );

        if envelope.command == Command::HEARTBEAT {
            self.handle_heartbeat_response(envelope, now);
            return;
        }

        let event = envelope.into_event();
        if event.command == Command::LOGIN {
            self.handle_login_response(&event);
        }
        self.listeners.dispatch(&event);
    }

    /// A timer armed through [`Action::ArmTimer`] expired.
    pub fn on_timer(&mut self, timer: TimerKind, now: Instant) {
        match timer {
            TimerKind::HeartbeatInterval => {
                if self.heartbeat.is_active() {
                    self.arm(TimerKind::HeartbeatInterval, self.heartbeat.config().interval);
                    self.send_heartbeat(now);
                }
            }
            TimerKind::HeartbeatTimeout => {
                if self.heartbeat.is_active() && self.heartbeat.has_outstanding() {
                    let miss = self.heartbeat.on_timeout();
                    self.handle_miss(miss);
                }
            }
            TimerKind::Reconnect => self.connect(),
            TimerKind::ConnectWait => {
                for waiting in self.waiters.expire(now) {
                    warn!(command = %waiting.request.command, "Connection wait timed out, queueing request");
                    self.queue.push(waiting.request);
                }
                if !self.waiters.is_empty() {
                    self.arm(TimerKind::ConnectWait, self.config.connect_wait_poll);
                }
            }
            TimerKind::Deferred => {
                while self.deferred.front().is_some_and(|(due, _)| *due <= now) {
                    if let Some((_, request)) = self.deferred.pop_front() {
                        self.send(request.command, request.payload, true, now);
                    }
                }
                let next = self
                    .deferred
                    .front()
                    .map(|(due, _)| due.saturating_duration_since(now));
                if let Some(after) = next {
                    self.arm(TimerKind::Deferred, after);
                }
            }
        }
    }

    fn is_current(&self, conn: ConnId) -> bool {
        conn == self.conn && self.state != ConnectionState::Disconnected
    }

    fn handle_close(&mut self, reason: CloseReason) {
        info!(?reason, "Disconnected");
        self.state = ConnectionState::Disconnected;
        self.session.invalidate();
        self.stop_heartbeat();
        self.actions.push(Action::Emit(ClientEvent::Disconnected(reason)));

        if self.reconnect_attempts < self.config.max_reconnect_attempts {
            self.reconnect_attempts += 1;
            let delay = self.config.reconnect_delay(self.reconnect_attempts);
            info!(attempt = self.reconnect_attempts, ?delay, "Scheduling reconnect");
            self.arm(TimerKind::Reconnect, delay);
            self.actions.push(Action::Emit(ClientEvent::ReconnectScheduled {
                attempt: self.reconnect_attempts,
                delay,
            }));
        } else {
            error!(attempts = self.reconnect_attempts, "Reconnect attempts exhausted");
            self.actions.push(Action::Emit(ClientEvent::ReconnectExhausted {
                attempts: self.reconnect_attempts,
            }));
        }
    }

    fn arm(&mut self, timer: TimerKind, after: Duration) {
        self.actions.push(Action::ArmTimer { timer, after });
    }

    fn cancel(&mut self, timer: TimerKind) {
        self.actions.push(Action::CancelTimer(timer));
    }

    // =========================================================================
    // HEARTBEAT
    // =========================================================================

    fn start_heartbeat(&mut self, now: Instant) {
        if self.heartbeat.is_active() {
            debug!("Heartbeat already enabled");
            return;
        }
        info!(config = ?self.heartbeat.config(), "Starting heartbeat");
        self.heartbeat.start(now);
        self.arm(TimerKind::HeartbeatInterval, self.heartbeat.config().interval);
    }

    fn stop_heartbeat(&mut self) {
        if !self.heartbeat.is_active() {
            return;
        }
        info!("Stopping heartbeat");
        self.heartbeat.stop();
        self.cancel(TimerKind::HeartbeatInterval);
        self.cancel(TimerKind::HeartbeatTimeout);
    }

    fn send_heartbeat(&mut self, now: Instant) {
        if self.state != ConnectionState::Open {
            warn!("Connection not open, skipping heartbeat");
            return;
        }
        if !self.heartbeat.begin_probe(now) {
            debug!("Heartbeat probe still outstanding, skipping");
            return;
        }

        let probe = HeartbeatProbe {
            timestamp: chrono::Utc::now().timestamp_millis(),
            client_id: self
                .store
                .get(KEY_PLAYER_ID)
                .unwrap_or_else(|| "unknown".to_string()),
        };
        debug!(timestamp = probe.timestamp, "Sending heartbeat");

        if let Some(data) = encode(&probe) {
            self.transmit(OutboundEnvelope::new(Command::HEARTBEAT, data));
        }
        self.arm(TimerKind::HeartbeatTimeout, self.heartbeat.config().timeout);
        self.notify_heartbeat(HeartbeatEvent::Sent(probe));
    }

    fn handle_heartbeat_response(&mut self, envelope: InboundEnvelope, now: Instant) {
        match self.heartbeat.on_response(now, envelope.code) {
            ResponseOutcome::Received { rtt } => {
                self.cancel(TimerKind::HeartbeatTimeout);
                debug!(rtt_ms = rtt.as_millis() as u64, "Heartbeat response received");
                self.notify_heartbeat(HeartbeatEvent::Received {
                    rtt,
                    server_data: envelope.data,
                });
            }
            ResponseOutcome::Rejected(miss) => {
                self.cancel(TimerKind::HeartbeatTimeout);
                warn!(code = envelope.code, message = envelope.message.as_deref().unwrap_or(""), "Heartbeat response with error");
                self.handle_miss(miss);
            }
            ResponseOutcome::Unsolicited => {
                debug!("Heartbeat response with no probe outstanding");
            }
        }
    }

    fn handle_miss(&mut self, miss: Miss) {
        warn!(missed = miss.missed, max_missed = miss.max_missed, "Heartbeat timeout");
        self.notify_heartbeat(HeartbeatEvent::Timeout {
            missed: miss.missed,
            max_missed: miss.max_missed,
        });

        if miss.is_exhausted() {
            error!("Too many missed heartbeats, reconnecting");
            self.notify_heartbeat(HeartbeatEvent::Missed { missed: miss.missed });
            self.actions.push(Action::Close { conn: self.conn });
            self.handle_close(CloseReason::LivenessLost);
        }
    }

    fn notify_heartbeat(&self, event: HeartbeatEvent) {
        if let Some(ref callback) = self.heartbeat_callback {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!(?event, "heartbeat observer panicked");
            }
        }
    }

    /// Start heartbeating if the socket is open.
    pub fn enable_heartbeat(&mut self, now: Instant) {
        if self.state == ConnectionState::Open {
            self.start_heartbeat(now);
        } else {
            warn!("Cannot enable heartbeat: not connected");
        }
    }

    /// Stop heartbeating.
    pub fn disable_heartbeat(&mut self) {
        self.stop_heartbeat();
    }

    /// Send one probe now, outside the interval.
    pub fn send_manual_heartbeat(&mut self, now: Instant) {
        if self.state == ConnectionState::Open {
            self.send_heartbeat(now);
        } else {
            warn!("Cannot send heartbeat: not connected");
        }
    }

    /// Replace heartbeat parameters; a running monitor restarts with them.
    pub fn update_heartbeat_config(&mut self, update: HeartbeatConfigUpdate, now: Instant) {
        let config = self.heartbeat.config().merged(update);
        info!(?config, "Heartbeat config updated");
        self.heartbeat.set_config(config);
        self.config.heartbeat = config;

        if self.heartbeat.is_active() {
            self.stop_heartbeat();
            self.start_heartbeat(now);
        }
    }

    /// Install the heartbeat observer, replacing any previous one.
    pub fn on_heartbeat_event(&mut self, callback: HeartbeatCallback) {
        self.heartbeat_callback = Some(callback);
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// Send a command through the authentication gate.
    ///
    /// While the socket is not open the request waits up to
    /// `connect_wait_timeout` for it, then joins the pending queue. Never
    /// fails: undeliverable requests are queued.
    pub fn send(&mut self, command: Command, data: Value, bypass: bool, now: Instant) {
        let request = PendingRequest::new(command, data);
        if self.state == ConnectionState::Open {
            self.route(request, bypass);
            return;
        }

        debug!(command = %command, "Not connected, waiting for connection");
        if self.waiters.is_empty() {
            self.arm(TimerKind::ConnectWait, self.config.connect_wait_poll);
        }
        self.waiters
            .park(request, bypass, now + self.config.connect_wait_timeout);
    }

    fn route(&mut self, request: PendingRequest, bypass: bool) {
        match gate(request.command, bypass, self.session.is_authenticated()) {
            Gate::Pass => {
                self.transmit(OutboundEnvelope::new(request.command, request.payload));
            }
            Gate::Hold => {
                debug!(command = %request.command, queued = self.queue.len() + 1, "Not logged in, queueing request");
                self.queue.push(request);
            }
        }
    }

    /// Send straight to the socket, or queue when it is not open.
    fn transmit_or_queue(&mut self, envelope: OutboundEnvelope) {
        if self.state == ConnectionState::Open {
            self.transmit(envelope);
        } else {
            warn!(command = %envelope.command, "Connection not ready, queueing request");
            self.queue
                .push(PendingRequest::new(envelope.command, envelope.data));
        }
    }

    /// Serialize and write an envelope. Logs and drops it when closed.
    fn transmit(&mut self, envelope: OutboundEnvelope) {
        if self.state != ConnectionState::Open {
            error!(command = %envelope.command, "Connection not open, dropping message");
            return;
        }
        match envelope.to_json() {
            Ok(text) => {
                debug!(command = %envelope.command, "Sending message");
                self.actions.push(Action::Transmit {
                    conn: self.conn,
                    text,
                });
            }
            Err(e) => error!(command = %envelope.command, "Failed to serialize message: {}", e),
        }
    }

    fn retry_after_reconnect(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let drain = self.queue.drain_for_reconnect();
        info!(
            logins = drain.logins.len(),
            anonymous = drain.anonymous.len(),
            still_queued = self.queue.len(),
            "Retrying requests after reconnect"
        );
        for request in drain.logins.into_iter().chain(drain.anonymous) {
            self.route(request, true);
        }
    }

    fn handle_login_response(&mut self, event: &CommandEvent) {
        match self.session.apply_login_response(event, self.store.as_mut()) {
            LoginOutcome::Succeeded { player_id } => {
                self.actions
                    .push(Action::Emit(ClientEvent::LoggedIn { player_id }));

                let drain = self.queue.drain_for_login();
                if !drain.priority.is_empty() || !drain.rest.is_empty() {
                    info!(
                        priority = drain.priority.len(),
                        rest = drain.rest.len(),
                        "Replaying pending requests after login"
                    );
                }
                for request in drain.priority {
                    self.route(request, true);
                }
                for request in drain.rest {
                    self.route(request, false);
                }
            }
            LoginOutcome::Failed { code, message } => {
                self.actions
                    .push(Action::Emit(ClientEvent::LoginFailed { code, message }));
            }
        }
    }

    // =========================================================================
    // LISTENERS
    // =========================================================================

    /// Register a listener for a command.
    pub fn on(&mut self, command: Command, listener: Listener) {
        self.listeners.on(command, listener);
    }

    /// Remove a listener registration.
    pub fn off(&mut self, command: Command, listener: &Listener) -> bool {
        self.listeners.off(command, listener)
    }

    /// Receive scene feed payloads.
    pub fn subscribe(&mut self, handler: FeedHandler) {
        self.listeners.subscribe(handler);
    }

    /// Stop receiving scene feed payloads.
    pub fn unsubscribe(&mut self, handler: &FeedHandler) -> bool {
        self.listeners.unsubscribe(handler)
    }

    // =========================================================================
    // REQUEST HELPERS
    // =========================================================================

    /// Send a login request. Login always passes the gate.
    pub fn login(&mut self, request: LoginRequest, now: Instant) {
        self.session.note_login_sent(&request);
        if let Some(data) = encode(&request) {
            self.send(Command::LOGIN, data, false, now);
        }
    }

    /// Username/password login.
    pub fn manual_login(&mut self, username: &str, password: &str, nickname: Option<&str>, now: Instant) {
        self.login(LoginRequest::password(username, password, nickname), now);
    }

    /// Identity-provider login.
    pub fn provider_login(&mut self, profile: &ProviderProfile, now: Instant) {
        self.login(LoginRequest::provider(profile), now);
    }

    /// Fetch a scene feed page.
    pub fn get_scene_feed(&mut self, room_id: i64, page: u32, size: u32, episode: Option<u32>) {
        let request = SceneFeedRequest::new(room_id, page, size, episode);
        debug!(room_id, page, size, ?episode, "Requesting scene feed");
        if let Some(data) = encode(&request) {
            let envelope = OutboundEnvelope::new(Command::GET_SCENE_FEED, data)
                .with_request_id(chrono::Utc::now().timestamp_millis());
            self.transmit_or_queue(envelope);
        }
    }

    /// Like, comment on, or rate a tweet as the stored user.
    pub fn operate_tweet(&mut self, op: OperateTweet) {
        let user = StoredUser::load(self.store.as_ref());
        let (nick_name, user_no) = user
            .map(|u| (u.user_id, u.id))
            .unwrap_or_default();
        let request = OperateTweetRequest::new(op, nick_name, user_no);
        let player_id = self.store.get(KEY_PLAYER_ID).unwrap_or_default();

        if let Some(data) = encode(&request) {
            let envelope =
                OutboundEnvelope::new(Command::OPERATE_TWEET, data).with_player_id(player_id);
            self.transmit_or_queue(envelope);
        }
    }

    /// Up- or down-vote a thread.
    pub fn vote_thread(&mut self, thread_id: &str, upvote: bool, now: Instant) {
        let request = VoteThreadRequest {
            post_id: thread_id.to_string(),
            vote: if upvote { 1 } else { -1 },
        };
        self.send_payload(Command::VOTE_THREAD, &request, now);
    }

    /// Vote in a room's vote history.
    pub fn vote_on_history(&mut self, vote: VoteOnHistory, now: Instant) {
        self.send_payload(Command::VOTE_THREAD, &vote, now);
    }

    /// Fetch a room's vote history.
    pub fn get_vote_history(&mut self, room_id: i64, now: Instant) {
        let request = VoteOnHistory {
            room_id,
            ..Default::default()
        };
        self.send_payload(Command::VOTE_THREAD, &request, now);
    }

    /// Fetch character chat history.
    pub fn get_character_history(&mut self, page_size: u32, page_num: u32, now: Instant) {
        let request = HistoryPage { page_size, page_num };
        self.send_payload(Command::GET_CHARACTER_HISTORY, &request, now);
    }

    /// Fetch the episode list.
    pub fn get_ep_list(&mut self, now: Instant) {
        self.send(Command::GET_EP_LIST, Value::Object(Default::default()), false, now);
    }

    /// Fetch the player's point balance.
    pub fn get_user_points(&mut self, now: Instant) {
        self.send(Command::GET_USER_POINTS, Value::Object(Default::default()), false, now);
    }

    /// Request vote history and character history for a room. When logged
    /// in both go out, the second one staggered; otherwise both wait for
    /// login in the pending queue.
    pub fn request_scene_data(&mut self, room_id: i64, request_id: Option<String>, now: Instant) {
        let Some(data) = encode(&SceneDataRequest { room_id, request_id }) else {
            return;
        };
        let votes = PendingRequest::new(Command::VOTE_THREAD, data.clone());
        let history = PendingRequest::new(Command::GET_CHARACTER_HISTORY, data);

        if self.state == ConnectionState::Open && self.session.is_authenticated() {
            self.route(votes, true);
            if self.deferred.is_empty() {
                self.arm(TimerKind::Deferred, self.config.scene_data_stagger);
            }
            self.deferred
                .push_back((now + self.config.scene_data_stagger, history));
        } else {
            debug!(room_id, "Not ready, queueing scene data requests");
            self.queue.push(votes);
            self.queue.push(history);
        }
    }

    fn send_payload<T: Serialize>(&mut self, command: Command, request: &T, now: Instant) {
        if let Some(data) = encode(request) {
            self.send(command, data, false, now);
        }
    }

    // =========================================================================
    // SESSION
    // =========================================================================

    /// Persist a user record as signed in.
    pub fn remember_user(&mut self, user: &StoredUser) {
        if let Err(e) = session::remember_user(user, self.store.as_mut()) {
            error!("Failed to store user record: {}", e);
        }
    }

    /// Forget the persisted identity and drop authentication.
    pub fn forget_session(&mut self) {
        if let Err(e) = self.session.forget(self.store.as_mut()) {
            error!("Failed to clear stored session: {}", e);
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Id of the current (or last) socket.
    pub fn connection_id(&self) -> ConnId {
        self.conn
    }

    /// Whether the socket is open.
    pub fn is_connection_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Whether login has succeeded on this connection.
    pub fn is_logged_in(&self) -> bool {
        self.session.is_authenticated()
    }

    /// Authentication state.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Requests held by the gate, in queue order.
    pub fn pending_requests(&self) -> impl Iterator<Item = &PendingRequest> {
        self.queue.iter()
    }

    /// Sends waiting for the socket to open.
    pub fn waiting_sends(&self) -> usize {
        self.waiters.len()
    }

    /// Reconnections since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Heartbeat counters.
    pub fn heartbeat_stats(&self, now: Instant) -> HeartbeatStats {
        self.heartbeat.stats(now)
    }

    /// Full status snapshot.
    pub fn connection_status(&self, now: Instant) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            is_connected: self.is_connection_open(),
            is_logged_in: self.session.is_authenticated(),
            is_heartbeat_enabled: self.heartbeat.is_active(),
            missed_heartbeats: self.heartbeat.missed(),
            last_heartbeat_ago: self
                .heartbeat
                .last_sent_at()
                .map(|at| now.saturating_duration_since(at)),
            reconnect_attempts: self.reconnect_attempts,
            pending_requests: self.queue.len(),
            dropped_requests: self.queue.dropped(),
            heartbeat_config: self.heartbeat.config(),
            heartbeat_stats: self.heartbeat.stats(now),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Option<Value> {
    match payload(value) {
        Ok(data) => Some(data),
        Err(e) => {
            error!("Failed to encode payload: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, KEY_SIGNED_IN};
    use serde_json::json;
    use std::sync::Mutex;

    fn controller() -> ConnectionController {
        ConnectionController::new(ClientConfig::default(), Box::new(MemoryStore::new()))
    }

    fn open(ctl: &mut ConnectionController, now: Instant) {
        ctl.connect();
        let conn = ctl.connection_id();
        ctl.on_open(conn, now);
    }

    fn sent_commands(actions: &[Action]) -> Vec<i64> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Transmit { text, .. } => {
                    let value: Value = serde_json::from_str(text).unwrap();
                    value["command"].as_i64()
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mut ctl = controller();
        ctl.connect();
        ctl.connect();
        let opens = ctl
            .drain_actions()
            .into_iter()
            .filter(|a| matches!(a, Action::Open { .. }))
            .count();
        assert_eq!(opens, 1);
        assert_eq!(ctl.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_open_starts_heartbeat_and_emits() {
        let mut ctl = controller();
        open(&mut ctl, Instant::now());
        let actions = ctl.drain_actions();
        assert!(actions.contains(&Action::ArmTimer {
            timer: TimerKind::HeartbeatInterval,
            after: Duration::from_secs(30),
        }));
        assert!(actions.contains(&Action::Emit(ClientEvent::Connected)));
        assert!(ctl.connection_status(Instant::now()).is_heartbeat_enabled);
    }

    #[test]
    fn test_stale_socket_events_ignored() {
        let mut ctl = controller();
        let now = Instant::now();
        open(&mut ctl, now);
        let old = ctl.connection_id();
        ctl.on_closed(old, CloseReason::Peer);
        ctl.on_timer(TimerKind::Reconnect, now);
        ctl.drain_actions();

        ctl.on_open(old, now);
        assert_eq!(ctl.state(), ConnectionState::Connecting);
        ctl.on_frame(old, r#"{"command":10000,"code":0,"data":{}}"#, now);
        assert!(!ctl.is_logged_in());
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let mut ctl = controller();
        let now = Instant::now();
        open(&mut ctl, now);
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        ctl.on(Command::GET_EP_LIST, Arc::new(move |_: &CommandEvent| *counter.lock().unwrap() += 1));

        let conn = ctl.connection_id();
        ctl.on_frame(conn, "{{{", now);
        ctl.on_frame(conn, r#"{"code":0}"#, now);
        ctl.on_frame(conn, r#"{"command":10109,"code":0,"data":[]}"#, now);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_heartbeat_response_not_dispatched() {
        let mut ctl = controller();
        let now = Instant::now();
        open(&mut ctl, now);
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        ctl.on(Command::HEARTBEAT, Arc::new(move |_: &CommandEvent| *counter.lock().unwrap() += 1));

        ctl.send_manual_heartbeat(now);
        let conn = ctl.connection_id();
        ctl.on_frame(conn, r#"{"command":10001,"code":0,"data":{}}"#, now + Duration::from_millis(25));

        assert_eq!(*hits.lock().unwrap(), 0);
        let stats = ctl.heartbeat_stats(now);
        assert_eq!(stats.total_received, 1);
        assert_eq!(stats.last_rtt, 25);
    }

    #[test]
    fn test_heartbeat_events_reported() {
        let mut ctl = controller();
        let now = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ctl.on_heartbeat_event(Arc::new(move |ev: &HeartbeatEvent| {
            let tag = match ev {
                HeartbeatEvent::Sent(_) => "sent",
                HeartbeatEvent::Received { .. } => "received",
                HeartbeatEvent::Timeout { .. } => "timeout",
                HeartbeatEvent::Missed { .. } => "missed",
            };
            sink.lock().unwrap().push(tag);
        }));
        open(&mut ctl, now);

        ctl.on_timer(TimerKind::HeartbeatInterval, now);
        ctl.on_timer(TimerKind::HeartbeatTimeout, now);
        assert_eq!(*seen.lock().unwrap(), vec!["sent", "timeout"]);
    }

    #[test]
    fn test_update_heartbeat_config_restarts() {
        let mut ctl = controller();
        let now = Instant::now();
        open(&mut ctl, now);
        ctl.send_manual_heartbeat(now);
        ctl.drain_actions();

        ctl.update_heartbeat_config(
            HeartbeatConfigUpdate {
                interval: Some(Duration::from_secs(20)),
                ..Default::default()
            },
            now,
        );
        let actions = ctl.drain_actions();
        assert!(actions.contains(&Action::ArmTimer {
            timer: TimerKind::HeartbeatInterval,
            after: Duration::from_secs(20),
        }));
        assert_eq!(ctl.heartbeat_stats(now).total_sent, 0);
        assert_eq!(ctl.connection_status(now).heartbeat_config.interval, Duration::from_secs(20));
    }

    #[test]
    fn test_disable_heartbeat_keeps_stats() {
        let mut ctl = controller();
        let now = Instant::now();
        open(&mut ctl, now);
        ctl.send_manual_heartbeat(now);
        ctl.disable_heartbeat();
        assert!(!ctl.connection_status(now).is_heartbeat_enabled);
        assert_eq!(ctl.heartbeat_stats(now).total_sent, 1);

        ctl.enable_heartbeat(now);
        assert_eq!(ctl.heartbeat_stats(now).total_sent, 0);
    }

    #[test]
    fn test_disconnect_is_hard_teardown() {
        let mut ctl = controller();
        let now = Instant::now();
        open(&mut ctl, now);
        ctl.get_ep_list(now);
        assert_eq!(ctl.pending_requests().count(), 1);
        ctl.drain_actions();

        ctl.disconnect();
        let actions = ctl.drain_actions();
        assert!(actions.contains(&Action::Close { conn: ctl.connection_id() }));
        assert!(actions.contains(&Action::CancelTimer(TimerKind::HeartbeatInterval)));
        assert!(!actions.iter().any(|a| matches!(a, Action::ArmTimer { timer: TimerKind::Reconnect, .. })));
        assert_eq!(ctl.pending_requests().count(), 0);
        assert_eq!(ctl.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_waiting_send_released_on_open() {
        let mut ctl = controller();
        let now = Instant::now();
        ctl.connect();
        ctl.send(Command::GET_SCENE_FEED, json!({"roomId": 1}), false, now);
        assert_eq!(ctl.waiting_sends(), 1);
        ctl.drain_actions();

        let conn = ctl.connection_id();
        ctl.on_open(conn, now + Duration::from_secs(1));
        assert_eq!(ctl.waiting_sends(), 0);
        assert_eq!(sent_commands(&ctl.drain_actions()), vec![10112]);
    }

    #[test]
    fn test_waiting_send_queued_after_timeout() {
        let mut ctl = controller();
        let now = Instant::now();
        ctl.send(Command::GET_EP_LIST, json!({}), false, now);
        ctl.on_timer(TimerKind::ConnectWait, now + Duration::from_secs(1));
        assert_eq!(ctl.pending_requests().count(), 0);
        ctl.on_timer(TimerKind::ConnectWait, now + Duration::from_secs(5));
        assert_eq!(ctl.pending_requests().count(), 1);
        assert_eq!(ctl.waiting_sends(), 0);
    }

    #[test]
    fn test_session_restored_on_open() {
        let mut store = MemoryStore::new();
        StoredUser::new("ivy", "u-9").save(&mut store).unwrap();
        store.set(KEY_SIGNED_IN, "true").unwrap();
        let mut ctl = ConnectionController::new(ClientConfig::default(), Box::new(store));

        open(&mut ctl, Instant::now());
        let actions = ctl.drain_actions();
        assert_eq!(sent_commands(&actions), vec![Command::LOGIN.0]);
    }

    #[test]
    fn test_request_scene_data_staggers_when_logged_in() {
        let mut ctl = controller();
        let now = Instant::now();
        open(&mut ctl, now);
        let conn = ctl.connection_id();
        ctl.on_frame(conn, r#"{"command":10000,"code":0,"data":{"token":"t","player":{"playerId":"p"}}}"#, now);
        ctl.drain_actions();

        ctl.request_scene_data(7, Some("r1".into()), now);
        assert_eq!(sent_commands(&ctl.drain_actions()), vec![Command::VOTE_THREAD.0]);

        ctl.on_timer(TimerKind::Deferred, now + Duration::from_millis(200));
        assert_eq!(sent_commands(&ctl.drain_actions()), vec![Command::GET_CHARACTER_HISTORY.0]);
    }

    #[test]
    fn test_request_scene_data_queues_when_anonymous() {
        let mut ctl = controller();
        let now = Instant::now();
        ctl.request_scene_data(7, None, now);
        let queued: Vec<_> = ctl.pending_requests().map(|r| r.command).collect();
        assert_eq!(queued, vec![Command::VOTE_THREAD, Command::GET_CHARACTER_HISTORY]);
    }

    #[test]
    fn test_operate_tweet_carries_identity() {
        let mut store = MemoryStore::new();
        StoredUser::new("jo", "u-10").save(&mut store).unwrap();
        store.set(KEY_PLAYER_ID, "p-10").unwrap();
        let mut ctl = ConnectionController::new(ClientConfig::default(), Box::new(store));
        open(&mut ctl, Instant::now());
        ctl.drain_actions();

        ctl.operate_tweet(OperateTweet {
            tweet_id: 5,
            kind: 2,
            content: "nice".into(),
            ..Default::default()
        });
        let actions = ctl.drain_actions();
        let text = actions
            .iter()
            .find_map(|a| match a {
                Action::Transmit { text, .. } => Some(text.clone()),
                _ => None,
            })
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["playerId"], "p-10");
        assert_eq!(value["data"]["nickName"], "jo");
        assert_eq!(value["data"]["userNo"], "u-10");
        assert_eq!(value["data"]["type"], 2);
    }

    #[test]
    fn test_scene_feed_queued_when_closed() {
        let mut ctl = controller();
        ctl.get_scene_feed(1, 0, 30, None);
        let queued: Vec<_> = ctl.pending_requests().map(|r| r.command).collect();
        assert_eq!(queued, vec![Command::GET_SCENE_FEED]);
    }

    #[test]
    fn test_forget_session() {
        let mut ctl = controller();
        ctl.remember_user(&StoredUser::new("kim", "u-11"));
        ctl.forget_session();
        open(&mut ctl, Instant::now());
        assert!(sent_commands(&ctl.drain_actions()).is_empty());
    }

    #[test]
    fn test_panicking_heartbeat_observer_is_contained() {
        let mut ctl = controller();
        let now = Instant::now();
        ctl.on_heartbeat_event(Arc::new(|_: &HeartbeatEvent| panic!("observer bug")));
        open(&mut ctl, now);

        ctl.send_manual_heartbeat(now);
        let conn = ctl.connection_id();
        ctl.on_frame(conn, r#"{"command":10001,"code":0,"data":{}}"#, now + Duration::from_millis(5));

        assert!(ctl.is_connection_open());
        let stats = ctl.heartbeat_stats(now);
        assert_eq!(stats.total_sent, 1);
        assert_eq!(stats.total_received, 1);

        ctl.drain_actions();
        ctl.send(Command::GET_SCENE_FEED, json!({"roomId": 1}), false, now);
        assert_eq!(sent_commands(&ctl.drain_actions()), vec![Command::GET_SCENE_FEED.0]);
    }

    #[test]
    fn test_status_reports_dropped_requests() {
        let config = ClientConfig {
            pending_capacity: 2,
            ..Default::default()
        };
        let mut ctl = ConnectionController::new(config, Box::new(MemoryStore::new()));
        let now = Instant::now();
        open(&mut ctl, now);
        for _ in 0..5 {
            ctl.get_ep_list(now);
        }

        let status = ctl.connection_status(now);
        assert_eq!(status.pending_requests, 2);
        assert_eq!(status.dropped_requests, 3);
    }
}
