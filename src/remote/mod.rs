//! Remote authentication API contract.
//!
//! The bridge never verifies signatures itself: it asks the remote API for
//! a challenge, hands it to the wallet, and forwards the signature back.

mod http;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

pub use self::http::HttpAuthApi;

/// Which account the session is bound to on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountMode {
    #[default]
    Live,
    Demo,
}

impl AccountMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Demo => "demo",
        }
    }
}

impl fmt::Display for AccountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "demo" => Ok(Self::Demo),
            other => Err(format!("unknown account mode '{other}' (expected live or demo)")),
        }
    }
}

/// Sign-in challenge issued for an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub message: String,
    pub nonce: String,
}

/// Outcome of a successful `verify`.
#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub token: SecretString,
    pub user: Value,
    /// Server-side expiry, when the API reports one.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of `validateSession`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionValidation {
    pub valid: bool,
    #[serde(default)]
    pub user: Value,
}

/// The four remote operations the sign-in flow depends on.
#[async_trait]
pub trait RemoteAuthApi: Send + Sync {
    async fn challenge(&self, address: &str) -> Result<Challenge, Error>;

    async fn verify(
        &self,
        message: &str,
        signature: &str,
        account_mode: AccountMode,
    ) -> Result<VerifyResult, Error>;

    async fn validate_session(&self, token: &SecretString) -> Result<SessionValidation, Error>;

    /// Returns the API's `success` flag.
    async fn disconnect(&self, token: &SecretString) -> Result<bool, Error>;
}
