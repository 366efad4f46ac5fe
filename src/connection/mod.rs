//! Connection Layer
//!
//! Persistent websocket connection to the game backend: lifecycle and
//! reconnection, heartbeat, authentication gating and listener dispatch.
//! Everything except `driver` is synchronous and performs no I/O.

pub mod controller;
pub mod dispatcher;
pub mod driver;
pub mod heartbeat;
pub mod queue;
pub mod session;

pub use controller::{
    Action, ClientEvent, CloseReason, ConnId, ConnectionController, ConnectionState,
    ConnectionStatus, HeartbeatCallback, HeartbeatEvent, TimerKind,
};
pub use dispatcher::{FeedHandler, Listener, ListenerRegistry};
pub use driver::Client;
pub use heartbeat::{HeartbeatMonitor, HeartbeatStats};
pub use queue::{gate, Gate, PendingRequest, RequestQueue};
pub use session::{restore_login, LoginOutcome, Session};
