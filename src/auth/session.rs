//! Authenticated session persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::StorageError;
use crate::remote::AccountMode;
use crate::storage::Storage;

/// Storage key for the persisted session.
pub const SESSION_STORAGE_KEY: &str = "authbridge.session";

/// Session created on reaching `Authenticated`.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub address: String,
    pub chain_id: String,
    pub account_mode: AccountMode,
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
    pub user: Value,
}

impl AuthSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Session view that is safe to hand to other contexts (no token).
    pub fn public_view(&self) -> Value {
        json!({
            "address": self.address,
            "chainId": self.chain_id,
            "accountMode": self.account_mode,
            "expiresAt": self.expires_at.to_rfc3339(),
            "user": self.user,
        })
    }
}

impl PartialEq for AuthSession {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.chain_id == other.chain_id
            && self.account_mode == other.account_mode
            && self.expires_at == other.expires_at
            && self.token.expose_secret() == other.token.expose_secret()
    }
}

/// On-disk shape. Kept separate so the token is only ever exposed here.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    address: String,
    chain_id: String,
    account_mode: AccountMode,
    token: String,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    user: Value,
}

impl From<&AuthSession> for StoredSession {
    fn from(session: &AuthSession) -> Self {
        Self {
            address: session.address.clone(),
            chain_id: session.chain_id.clone(),
            account_mode: session.account_mode,
            token: session.token.expose_secret().to_string(),
            expires_at: session.expires_at,
            user: session.user.clone(),
        }
    }
}

impl From<StoredSession> for AuthSession {
    fn from(stored: StoredSession) -> Self {
        Self {
            address: stored.address,
            chain_id: stored.chain_id,
            account_mode: stored.account_mode,
            token: SecretString::from(stored.token),
            expires_at: stored.expires_at,
            user: stored.user,
        }
    }
}

/// Reads and writes the single session record through a [`Storage`].
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn Storage>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Load the stored session. Expired or unreadable records are removed
    /// and reported as absent.
    pub async fn load_at(&self, now: DateTime<Utc>) -> Result<Option<AuthSession>, StorageError> {
        let Some(value) = self.storage.get(SESSION_STORAGE_KEY).await? else {
            return Ok(None);
        };
        let session: AuthSession = match serde_json::from_value::<StoredSession>(value) {
            Ok(stored) if !stored.token.trim().is_empty() => stored.into(),
            Ok(_) => {
                tracing::warn!("Discarding stored session with an empty token");
                self.clear().await?;
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!("Discarding malformed stored session: {}", e);
                self.clear().await?;
                return Ok(None);
            }
        };
        if session.is_expired_at(now) {
            tracing::info!(expired_at = %session.expires_at, "Stored session expired");
            self.clear().await?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    pub async fn load(&self) -> Result<Option<AuthSession>, StorageError> {
        self.load_at(Utc::now()).await
    }

    pub async fn save(&self, session: &AuthSession) -> Result<(), StorageError> {
        let value = serde_json::to_value(StoredSession::from(session)).map_err(|e| {
            StorageError::Corrupt {
                key: SESSION_STORAGE_KEY.to_string(),
                message: e.to_string(),
            }
        })?;
        self.storage.set(SESSION_STORAGE_KEY, value).await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.storage.remove(SESSION_STORAGE_KEY).await
    }
}
