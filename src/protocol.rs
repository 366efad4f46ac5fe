//! Protocol Messages
//!
//! Wire format for the game backend websocket. Every frame is a JSON
//! envelope carrying an integer command identifier and a payload whose shape
//! depends only on the command. The connection layer routes by command and
//! never looks inside payloads, except for login and heartbeat.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// COMMANDS
// =============================================================================

/// Command identifier shared with the server.
///
/// The set is open: any integer is a valid command, the constants below are
/// the ones this client knows how to build requests for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Command(pub i64);

impl Command {
    /// Login handshake.
    pub const LOGIN: Command = Command(10000);
    /// Liveness probe.
    pub const HEARTBEAT: Command = Command(10001);
    /// Episode list.
    pub const GET_EP_LIST: Command = Command(10109);
    /// Scene tweet feed.
    pub const GET_SCENE_FEED: Command = Command(10112);
    /// Like / comment / rate a tweet.
    pub const OPERATE_TWEET: Command = Command(10113);
    /// Character chat history.
    pub const GET_CHARACTER_HISTORY: Command = Command(10114);
    /// Vote on a thread, or fetch vote history.
    pub const VOTE_THREAD: Command = Command(10119);
    /// Player point balance.
    pub const GET_USER_POINTS: Command = Command(100081);

    /// Commands that may be sent before login succeeds.
    pub const ALLOW_LIST: [Command; 2] = [Command::HEARTBEAT, Command::GET_SCENE_FEED];

    /// Commands replayed ahead of everything else once login succeeds.
    pub const PRIORITY: [Command; 2] = [Command::VOTE_THREAD, Command::GET_CHARACTER_HISTORY];

    /// Whether this command bypasses the authentication gate.
    pub fn is_allow_listed(self) -> bool {
        Self::ALLOW_LIST.contains(&self)
    }

    /// Whether this command belongs to the login-replay priority class.
    pub fn is_priority(self) -> bool {
        Self::PRIORITY.contains(&self)
    }

    /// Human-readable name for known commands.
    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Command::LOGIN => "LOGIN",
            Command::HEARTBEAT => "HEARTBEAT",
            Command::GET_EP_LIST => "GET_EP_LIST",
            Command::GET_SCENE_FEED => "GET_SCENE_FEED",
            Command::OPERATE_TWEET => "OPERATE_TWEET",
            Command::GET_CHARACTER_HISTORY => "GET_CHARACTER_HISTORY",
            Command::VOTE_THREAD => "VOTE_THREAD",
            Command::GET_USER_POINTS => "GET_USER_POINTS",
            _ => return None,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

// =============================================================================
// ENVELOPES
// =============================================================================

/// `type` value of every client-originated envelope.
pub const CLIENT_MESSAGE_TYPE: i64 = 1;

/// Envelope sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    /// Not used for correlation; zero unless a helper stamps it.
    pub request_id: i64,
    /// Only some commands carry the player identifier at the top level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    /// Always [`CLIENT_MESSAGE_TYPE`].
    #[serde(rename = "type")]
    pub kind: i64,
    /// Command identifier.
    pub command: Command,
    /// Command-specific payload.
    pub data: Value,
}

impl OutboundEnvelope {
    /// Envelope with request id 0 and no player id.
    pub fn new(command: Command, data: Value) -> Self {
        Self {
            request_id: 0,
            player_id: None,
            kind: CLIENT_MESSAGE_TYPE,
            command,
            data,
        }
    }

    /// Set the request id.
    pub fn with_request_id(mut self, request_id: i64) -> Self {
        self.request_id = request_id;
        self
    }

    /// Set the top-level player id.
    pub fn with_player_id(mut self, player_id: impl Into<String>) -> Self {
        self.player_id = Some(player_id.into());
        self
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Envelope received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    /// Echoed request id, ignored for routing.
    #[serde(default)]
    pub request_id: i64,
    /// Player id; the server sends it as either string or number.
    #[serde(default)]
    pub player_id: Option<Value>,
    /// Message type.
    #[serde(rename = "type", default)]
    pub kind: i64,
    /// Command identifier, the only routing key.
    pub command: Command,
    /// Zero on success, a domain error code otherwise.
    #[serde(default)]
    pub code: i64,
    /// Error text for nonzero codes.
    #[serde(default)]
    pub message: Option<String>,
    /// Command-specific payload.
    #[serde(default)]
    pub data: Value,
}

impl InboundEnvelope {
    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Normalized event handed to listeners.
    pub fn into_event(self) -> CommandEvent {
        CommandEvent {
            command: self.command,
            data: self.data,
            code: self.code,
            message: self.message.unwrap_or_default(),
        }
    }
}

/// What a command listener receives.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEvent {
    /// Command the message was routed by.
    pub command: Command,
    /// Raw payload.
    pub data: Value,
    /// Zero on success.
    pub code: i64,
    /// Error text for nonzero codes.
    pub message: String,
}

impl CommandEvent {
    /// Whether the server reported success.
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

// =============================================================================
// REQUEST PAYLOADS
// =============================================================================

/// Login types understood by the server.
pub mod login_type {
    /// Username and password, also used for restored sessions.
    pub const PASSWORD: i64 = 1;
    /// Email-based identity provider.
    pub const PROVIDER: i64 = 2;
}

/// Password sent when replaying a persisted session.
pub const STORED_SESSION_PASSWORD: &str = "stored_session";

/// Login request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// See [`login_type`].
    pub login_type: i64,
    /// Account name or email.
    pub name: String,
    /// Password; empty for provider logins.
    pub password: String,
    /// Display name.
    pub nick_name: String,
    /// Avatar index.
    pub avatar: i64,
    /// Sex code.
    pub sex: i64,
    /// Time zone code.
    pub time_zone: i64,
    /// Client platform.
    pub client_os: String,
    /// Provider-side user id.
    pub user_id: String,
    /// Invite code used at registration.
    pub invite_code: String,
    /// Inviter.
    pub invite: String,
    /// Wallet / location address.
    pub address: String,
}

impl LoginRequest {
    fn base(login_type: i64) -> Self {
        Self {
            login_type,
            name: String::new(),
            password: String::new(),
            nick_name: String::new(),
            avatar: 0,
            sex: 1,
            time_zone: 2,
            client_os: "web".to_string(),
            user_id: String::new(),
            invite_code: String::new(),
            invite: String::new(),
            address: String::new(),
        }
    }

    /// Username/password login.
    pub fn password(username: &str, password: &str, nickname: Option<&str>) -> Self {
        Self {
            name: username.to_string(),
            password: password.to_string(),
            nick_name: nickname.unwrap_or(username).to_string(),
            ..Self::base(login_type::PASSWORD)
        }
    }

    /// Login from an identity provider profile.
    pub fn provider(profile: &ProviderProfile) -> Self {
        Self {
            name: profile.email.clone(),
            nick_name: profile.name.clone(),
            user_id: profile.id.clone(),
            ..Self::base(login_type::PROVIDER)
        }
    }

    /// Replay login for a persisted non-provider identity.
    pub fn restored(user_id: &str, id: &str) -> Self {
        Self {
            name: user_id.to_string(),
            password: STORED_SESSION_PASSWORD.to_string(),
            nick_name: user_id.to_string(),
            user_id: id.to_string(),
            ..Self::base(login_type::PASSWORD)
        }
    }
}

/// Identity produced by an external provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    /// Email address.
    pub email: String,
    /// Display name.
    pub name: String,
    /// Provider subject id.
    pub id: String,
}

impl ProviderProfile {
    /// Profile derived from an email, using the local part as display name.
    pub fn from_email(email: &str, id: &str) -> Self {
        let name = email.split('@').next().unwrap_or(email);
        Self {
            email: email.to_string(),
            name: name.to_string(),
            id: id.to_string(),
        }
    }
}

/// Scene feed page request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneFeedRequest {
    /// Room.
    pub room_id: i64,
    /// Zero-based page.
    pub page: u32,
    /// Page size.
    pub size: u32,
    /// Episode filter, `EP<n>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ep_id: Option<String>,
}

impl SceneFeedRequest {
    /// Build a page request, optionally filtered to one episode.
    pub fn new(room_id: i64, page: u32, size: u32, episode: Option<u32>) -> Self {
        Self {
            room_id,
            page,
            size,
            ep_id: episode.map(|ep| format!("EP{}", ep)),
        }
    }
}

/// Caller-facing tweet operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OperateTweet {
    /// Target tweet.
    pub tweet_id: i64,
    /// Operation: 1 like, 2 comment, 3 choose/rate.
    pub kind: i64,
    /// Comment text.
    pub content: String,
    /// Replied-to comment.
    pub reply_id: i64,
    /// Selected option.
    pub choose_index: i64,
    /// Ratings for rate operations.
    pub rate_list: Vec<i64>,
}

/// Tweet operation payload as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperateTweetRequest {
    /// Target tweet.
    pub tweet_id: i64,
    /// Operation code.
    #[serde(rename = "type")]
    pub kind: i64,
    /// Comment text.
    pub content: String,
    /// Replied-to comment.
    pub reply_id: i64,
    /// Selected option.
    pub choose_index: i64,
    /// Author display name.
    pub nick_name: String,
    /// Author number.
    pub user_no: String,
    /// Zero for new comments.
    pub comment_id: i64,
    /// Ratings.
    pub rate_list: Vec<i64>,
}

impl OperateTweetRequest {
    /// Attach the author identity to a caller operation.
    pub fn new(op: OperateTweet, nick_name: String, user_no: String) -> Self {
        Self {
            tweet_id: op.tweet_id,
            kind: op.kind,
            content: op.content,
            reply_id: op.reply_id,
            choose_index: op.choose_index,
            nick_name,
            user_no,
            comment_id: 0,
            rate_list: op.rate_list,
        }
    }
}

/// Up/down vote on a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteThreadRequest {
    /// Thread.
    pub post_id: String,
    /// `1` or `-1`.
    pub vote: i64,
}

/// Vote in a room's vote history, or fetch that history when only the
/// room is set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteOnHistory {
    /// Room.
    pub room_id: i64,
    /// Vote request being answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<i64>,
    /// Chosen option label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option: Option<String>,
    /// Vote weight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vote_value: Option<i64>,
    /// Free text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// History page request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    /// Page size.
    pub page_size: u32,
    /// One-based page number.
    pub page_num: u32,
}

/// Scene data request shared by vote and character history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneDataRequest {
    /// Room.
    pub room_id: i64,
    /// Caller-chosen tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Heartbeat probe payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatProbe {
    /// Epoch milliseconds at send time.
    pub timestamp: i64,
    /// Stored player id or `"unknown"`.
    pub client_id: String,
}

/// Serialize a payload struct into an opaque JSON value.
pub fn payload<T: Serialize>(value: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_envelope_shape() {
        let env = OutboundEnvelope::new(Command::GET_EP_LIST, json!({}));
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"requestId": 0, "type": 1, "command": 10109, "data": {}})
        );
    }

    #[test]
    fn test_player_id_only_when_set() {
        let env = OutboundEnvelope::new(Command::OPERATE_TWEET, json!({}))
            .with_player_id("p-9");
        let json = env.to_json().unwrap();
        assert!(json.contains("\"playerId\":\"p-9\""));

        let plain = OutboundEnvelope::new(Command::OPERATE_TWEET, json!({}));
        assert!(!plain.to_json().unwrap().contains("playerId"));
    }

    #[test]
    fn test_inbound_defaults() {
        let env = InboundEnvelope::from_json(r#"{"command":10112}"#).unwrap();
        assert_eq!(env.command, Command::GET_SCENE_FEED);
        assert_eq!(env.code, 0);
        assert_eq!(env.data, Value::Null);

        let event = env.into_event();
        assert!(event.is_success());
        assert_eq!(event.message, "");
    }

    #[test]
    fn test_inbound_numeric_player_id() {
        let env = InboundEnvelope::from_json(
            r#"{"requestId":3,"playerId":42,"type":2,"command":10000,"code":7,"message":"bad","data":null}"#,
        )
        .unwrap();
        assert_eq!(env.player_id, Some(json!(42)));
        assert_eq!(env.code, 7);
    }

    #[test]
    fn test_inbound_without_command_is_rejected() {
        assert!(InboundEnvelope::from_json(r#"{"code":0}"#).is_err());
        assert!(InboundEnvelope::from_json("not json").is_err());
    }

    #[test]
    fn test_unknown_command_display() {
        assert_eq!(Command(424242).to_string(), "424242");
        assert_eq!(Command::LOGIN.to_string(), "LOGIN(10000)");
    }

    #[test]
    fn test_command_classes() {
        assert!(Command::HEARTBEAT.is_allow_listed());
        assert!(Command::GET_SCENE_FEED.is_allow_listed());
        assert!(!Command::VOTE_THREAD.is_allow_listed());
        assert!(Command::VOTE_THREAD.is_priority());
        assert!(Command::GET_CHARACTER_HISTORY.is_priority());
        assert!(!Command::GET_EP_LIST.is_priority());
    }

    #[test]
    fn test_restored_login_payload() {
        let req = LoginRequest::restored("alice", "u-1");
        let value = payload(&req).unwrap();
        assert_eq!(value["loginType"], 1);
        assert_eq!(value["password"], STORED_SESSION_PASSWORD);
        assert_eq!(value["nickName"], "alice");
        assert_eq!(value["userId"], "u-1");
        assert_eq!(value["clientOs"], "web");
    }

    #[test]
    fn test_provider_login_payload() {
        let profile = ProviderProfile::from_email("bob@example.com", "sub-7");
        let req = LoginRequest::provider(&profile);
        assert_eq!(req.login_type, login_type::PROVIDER);
        assert_eq!(req.name, "bob@example.com");
        assert_eq!(req.nick_name, "bob");
        assert_eq!(req.password, "");
    }

    #[test]
    fn test_scene_feed_episode() {
        let value = payload(&SceneFeedRequest::new(3, 0, 30, Some(2))).unwrap();
        assert_eq!(value, json!({"roomId": 3, "page": 0, "size": 30, "epId": "EP2"}));

        let value = payload(&SceneFeedRequest::new(3, 1, 30, None)).unwrap();
        assert!(value.get("epId").is_none());
    }
}
