//! Session Bootstrap
//!
//! In-memory authentication state plus the two places it meets the
//! persisted store: deriving a replay login on (re)connect, and recording
//! the identity returned by a successful login.

use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::StoreError;
use crate::protocol::{CommandEvent, LoginRequest, ProviderProfile};
use crate::store::{
    SessionStore, StoredUser, KEY_PLAYER_ID, KEY_SIGNED_IN, KEY_TOKEN, KEY_USER_INFO,
};

/// Identity fields of a login response payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginReply {
    /// Opaque session token.
    pub token: Option<String>,
    /// Player identifier.
    pub player_id: Option<String>,
    /// Login location, when the server reports one.
    pub address: Option<String>,
}

impl LoginReply {
    /// Extract identity fields; absent or oddly-typed fields become `None`.
    pub fn from_data(data: &Value) -> Self {
        let player_id = match data.pointer("/player/playerId") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let string_field = |key: &str| {
            data.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            token: string_field("token"),
            player_id,
            address: string_field("address"),
        }
    }
}

/// What a login response did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Session is now authenticated.
    Succeeded {
        /// Player identifier, if the response carried one.
        player_id: Option<String>,
    },
    /// Login rejected; session untouched.
    Failed {
        /// Server error code.
        code: i64,
        /// Server error text.
        message: String,
    },
}

/// Authentication state of the current connection.
#[derive(Debug, Clone, Default)]
pub struct Session {
    authenticated: bool,
    token: Option<String>,
    player_id: Option<String>,
    last_login: Option<LoginRequest>,
}

impl Session {
    /// Unauthenticated session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether login has succeeded on this connection.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Token from the last successful login.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Player id from the last successful login.
    pub fn player_id(&self) -> Option<&str> {
        self.player_id.as_deref()
    }

    /// Drop authentication, e.g. on connection loss.
    pub fn invalidate(&mut self) {
        self.authenticated = false;
    }

    /// Remember the login request most recently sent.
    pub fn note_login_sent(&mut self, request: &LoginRequest) {
        self.last_login = Some(request.clone());
    }

    /// Apply a login response. Applying the same success twice leaves the
    /// session as applying it once.
    pub fn apply_login_response(
        &mut self,
        event: &CommandEvent,
        store: &mut dyn SessionStore,
    ) -> LoginOutcome {
        if !event.is_success() {
            error!(code = event.code, message = %event.message, "Login failed");
            return LoginOutcome::Failed {
                code: event.code,
                message: event.message.clone(),
            };
        }

        let reply = LoginReply::from_data(&event.data);
        if reply.token.is_none() || reply.player_id.is_none() {
            warn!("Login response is missing token or player id");
        }

        self.authenticated = true;
        if reply.token.is_some() {
            self.token = reply.token.clone();
        }
        if reply.player_id.is_some() {
            self.player_id = reply.player_id.clone();
        }

        if let Err(e) = self.persist(&reply, store) {
            error!("Failed to persist login state: {}", e);
        }

        info!(player_id = ?self.player_id, "Login successful");
        LoginOutcome::Succeeded {
            player_id: self.player_id.clone(),
        }
    }

    fn persist(&self, reply: &LoginReply, store: &mut dyn SessionStore) -> Result<(), StoreError> {
        if let Some(ref token) = reply.token {
            store.set(KEY_TOKEN, token)?;
        }
        if let Some(ref player_id) = reply.player_id {
            store.set(KEY_PLAYER_ID, player_id)?;
        }

        let user = StoredUser::load(store).or_else(|| {
            self.last_login
                .as_ref()
                .map(|login| StoredUser::new(login.name.clone(), login.user_id.clone()))
        });
        if let Some(mut user) = user {
            if let Some(ref address) = reply.address {
                info!(address = %address, "Updated login location");
                user.location = Some(address.clone());
            }
            user.save(store)?;
            store.set(KEY_SIGNED_IN, "true")?;
        }
        Ok(())
    }

    /// Forget the persisted identity and drop authentication.
    pub fn forget(&mut self, store: &mut dyn SessionStore) -> Result<(), StoreError> {
        self.authenticated = false;
        self.token = None;
        self.player_id = None;
        self.last_login = None;
        for key in [KEY_TOKEN, KEY_PLAYER_ID, KEY_USER_INFO, KEY_SIGNED_IN] {
            store.remove(key)?;
        }
        Ok(())
    }
}

/// Record a user as signed in, ahead of sending their login.
pub fn remember_user(user: &StoredUser, store: &mut dyn SessionStore) -> Result<(), StoreError> {
    user.save(store)?;
    store.set(KEY_SIGNED_IN, "true")
}

/// Derive the login to replay for a persisted identity, if there is one.
///
/// Email-shaped identities go through the provider flow, everything else
/// replays a stored-session password login.
pub fn restore_login(store: &dyn SessionStore) -> Option<LoginRequest> {
    store.get(KEY_SIGNED_IN)?;
    let user = StoredUser::load(store)?;

    let request = if user.is_provider_identity() {
        LoginRequest::provider(&ProviderProfile::from_email(&user.user_id, &user.id))
    } else {
        LoginRequest::restored(&user.user_id, &user.id)
    };
    Some(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{login_type, Command, STORED_SESSION_PASSWORD};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn login_event(code: i64, data: Value) -> CommandEvent {
        CommandEvent {
            command: Command::LOGIN,
            data,
            code,
            message: if code == 0 { String::new() } else { "denied".into() },
        }
    }

    #[test]
    fn test_restore_requires_signed_in_flag() {
        let mut store = MemoryStore::new();
        StoredUser::new("dave", "u-4").save(&mut store).unwrap();
        assert!(restore_login(&store).is_none());

        store.set(KEY_SIGNED_IN, "true").unwrap();
        let login = restore_login(&store).unwrap();
        assert_eq!(login.login_type, login_type::PASSWORD);
        assert_eq!(login.password, STORED_SESSION_PASSWORD);
        assert_eq!(login.user_id, "u-4");
    }

    #[test]
    fn test_restore_provider_identity() {
        let mut store = MemoryStore::new();
        remember_user(&StoredUser::new("erin@example.com", "g-5"), &mut store).unwrap();
        let login = restore_login(&store).unwrap();
        assert_eq!(login.login_type, login_type::PROVIDER);
        assert_eq!(login.nick_name, "erin");
        assert_eq!(login.user_id, "g-5");
    }

    #[test]
    fn test_login_success_persists_identity() {
        let mut store = MemoryStore::new();
        remember_user(&StoredUser::new("frank", "u-6"), &mut store).unwrap();

        let mut session = Session::new();
        let outcome = session.apply_login_response(
            &login_event(0, json!({"token": "t-1", "player": {"playerId": 99}, "address": "Lisbon"})),
            &mut store,
        );

        assert_eq!(outcome, LoginOutcome::Succeeded { player_id: Some("99".into()) });
        assert!(session.is_authenticated());
        assert_eq!(store.get(KEY_TOKEN).as_deref(), Some("t-1"));
        assert_eq!(store.get(KEY_PLAYER_ID).as_deref(), Some("99"));
        assert_eq!(StoredUser::load(&store).unwrap().location.as_deref(), Some("Lisbon"));
    }

    #[test]
    fn test_login_success_derives_user_record() {
        let mut store = MemoryStore::new();
        let mut session = Session::new();
        session.note_login_sent(&LoginRequest::password("gina", "pw", None));
        session.apply_login_response(
            &login_event(0, json!({"token": "t", "player": {"playerId": "p"}})),
            &mut store,
        );

        let user = StoredUser::load(&store).unwrap();
        assert_eq!(user.user_id, "gina");
        assert_eq!(store.get(KEY_SIGNED_IN).as_deref(), Some("true"));
        assert!(restore_login(&store).is_some());
    }

    #[test]
    fn test_login_failure_leaves_session() {
        let mut store = MemoryStore::new();
        let mut session = Session::new();
        let outcome = session.apply_login_response(&login_event(3, Value::Null), &mut store);
        assert_eq!(
            outcome,
            LoginOutcome::Failed { code: 3, message: "denied".into() }
        );
        assert!(!session.is_authenticated());
        assert!(store.get(KEY_TOKEN).is_none());
    }

    #[test]
    fn test_forget_clears_store() {
        let mut store = MemoryStore::new();
        remember_user(&StoredUser::new("hal", "u-8"), &mut store).unwrap();
        store.set(KEY_TOKEN, "t").unwrap();

        let mut session = Session::new();
        session.forget(&mut store).unwrap();
        assert!(restore_login(&store).is_none());
        assert!(store.get(KEY_TOKEN).is_none());
    }
}
