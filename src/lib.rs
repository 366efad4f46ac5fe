//! # Drama Link
//!
//! Client-side connection manager for the Dramai game backend websocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        DRAMA LINK                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  protocol.rs       - Command ids, envelopes, payloads        │
//! │  config.rs         - Client and heartbeat configuration      │
//! │  store.rs          - Persisted session key/value store       │
//! │                                                              │
//! │  connection/       - Sans-IO core + tokio driver             │
//! │  ├── controller.rs - Lifecycle state machine                 │
//! │  ├── heartbeat.rs  - Liveness probing and RTT stats          │
//! │  ├── dispatcher.rs - Command -> listener routing             │
//! │  ├── queue.rs      - Authentication gate, pending queue      │
//! │  ├── session.rs    - Login state and session restore         │
//! │  └── driver.rs     - Actor task owning socket and timers     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Execution Model
//!
//! The [`ConnectionController`] consumes inputs (caller operations, socket
//! events, timer expiries) stamped with the current time and returns
//! [`Action`]s. The [`Client`] handle runs it on a single tokio task, so all
//! state changes and listener callbacks are serialized. Lifecycle
//! notifications are published through [`Client::events`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use drama_link::{Client, ClientConfig, Command, CommandEvent};
//!
//! # async fn demo() -> Result<(), drama_link::ClientError> {
//! let (client, _task) = Client::spawn(ClientConfig::from_env())?;
//! client.on(Command::GET_EP_LIST, Arc::new(|event: &CommandEvent| {
//!     println!("episodes: {}", event.data);
//! }))?;
//! client.manual_login("alice", "secret", None)?;
//! client.get_ep_list()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod store;

// Re-export commonly used types
pub use config::{ClientConfig, HeartbeatConfig, HeartbeatConfigUpdate};
pub use connection::{
    Action, Client, ClientEvent, CloseReason, ConnectionController, ConnectionState,
    ConnectionStatus, HeartbeatEvent, HeartbeatStats, TimerKind,
};
pub use error::{ClientError, StoreError};
pub use protocol::{Command, CommandEvent, LoginRequest, OperateTweet, ProviderProfile};
pub use store::{JsonFileStore, MemoryStore, SessionStore, StoredUser};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
