use crate::api::Api;
use crate::storage::LocalStorage;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Access and refresh tokens persisted under two independent storage keys.
/// A missing token reads as the empty string.
#[derive(Clone)]
pub struct TokenStore {
    storage: LocalStorage,
}

impl TokenStore {
    pub fn new(storage: LocalStorage) -> Self {
        Self { storage }
    }

    pub fn get_access_token(&self) -> String {
        self.storage.get(ACCESS_TOKEN_KEY).unwrap_or_default()
    }

    pub fn set_access_token(&self, token: &str) -> anyhow::Result<()> {
        self.storage.set(ACCESS_TOKEN_KEY, token)
    }

    pub fn remove_access_token(&self) -> anyhow::Result<()> {
        self.storage.remove(ACCESS_TOKEN_KEY)
    }

    pub fn get_refresh_token(&self) -> String {
        self.storage.get(REFRESH_TOKEN_KEY).unwrap_or_default()
    }

    pub fn set_refresh_token(&self, token: &str) -> anyhow::Result<()> {
        self.storage.set(REFRESH_TOKEN_KEY, token)
    }

    pub fn remove_refresh_token(&self) -> anyhow::Result<()> {
        self.storage.remove(REFRESH_TOKEN_KEY)
    }
}

/// Snapshot of the authentication state.
///
/// `is_auth` is a trust flag: it only becomes true after a token exchange or
/// a successful identity check, never merely because a token is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthState {
    pub is_auth: bool,
    pub access_token: String,
    pub refresh_token: String,
}

/// Tokens returned by the login and refresh endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// Owns the credential for the lifetime of the application. The in-memory
/// copy is authoritative during a session; storage is written through so the
/// tokens survive restarts.
#[derive(Clone)]
pub struct AuthSession {
    state: Arc<RwLock<AuthState>>,
    tokens: TokenStore,
}

impl AuthSession {
    /// Restore tokens from storage. The session starts unauthenticated until
    /// [`AuthSession::initialize_auth`] validates the stored token.
    pub fn load(storage: LocalStorage) -> Self {
        let tokens = TokenStore::new(storage);
        let state = AuthState {
            is_auth: false,
            access_token: tokens.get_access_token(),
            refresh_token: tokens.get_refresh_token(),
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            tokens,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state.read().clone()
    }

    pub fn is_auth(&self) -> bool {
        self.state.read().is_auth
    }

    pub fn access_token(&self) -> String {
        self.state.read().access_token.clone()
    }

    pub fn refresh_token(&self) -> String {
        self.state.read().refresh_token.clone()
    }

    pub fn set_access_token(&self, token: &str) {
        {
            let mut state = self.state.write();
            state.access_token = token.to_owned();
            state.is_auth = !token.is_empty();
        }
        if let Err(err) = self.tokens.set_access_token(token) {
            warn!(%err, "failed to persist access token");
        }
    }

    pub fn remove_access_token(&self) {
        {
            let mut state = self.state.write();
            state.access_token.clear();
            state.is_auth = false;
        }
        if let Err(err) = self.tokens.remove_access_token() {
            warn!(%err, "failed to remove persisted access token");
        }
    }

    pub fn set_refresh_token(&self, token: &str) {
        self.state.write().refresh_token = token.to_owned();
        if let Err(err) = self.tokens.set_refresh_token(token) {
            warn!(%err, "failed to persist refresh token");
        }
    }

    pub fn remove_refresh_token(&self) {
        self.state.write().refresh_token.clear();
        if let Err(err) = self.tokens.remove_refresh_token() {
            warn!(%err, "failed to remove persisted refresh token");
        }
    }

    /// Record the result of a successful login or refresh exchange.
    pub fn establish(&self, tokens: &TokenPair) {
        self.set_access_token(&tokens.access_token);
        if let Some(refresh) = tokens.refresh_token.as_deref().filter(|t| !t.is_empty()) {
            self.set_refresh_token(refresh);
        }
    }

    pub fn logout(&self) {
        self.remove_access_token();
        self.remove_refresh_token();
    }

    /// Validate the stored access token against the identity endpoint.
    ///
    /// Without a stored token this is a no-op. Any failure clears both tokens.
    pub async fn initialize_auth(&self, api: &Api) -> bool {
        if self.access_token().is_empty() {
            debug!("no stored access token, skipping identity check");
            return false;
        }

        match api.fetch_user_info().await {
            Ok(envelope) if envelope.is_ok() => {
                self.state.write().is_auth = true;
                info!("stored access token accepted");
                true
            }
            Ok(envelope) => {
                warn!(
                    code = %envelope.code_label(),
                    "identity check rejected stored token, clearing credentials"
                );
                self.logout();
                false
            }
            Err(err) => {
                warn!(%err, "identity check failed, clearing credentials");
                self.logout();
                false
            }
        }
    }
}
