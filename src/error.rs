//! Error types for authbridge.

use std::time::Duration;

use serde::Serialize;

/// Top-level error type for the bridge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Rate limit error: {0}")]
    RateLimited(#[from] RateLimitError),

    #[error("Timeout error: {0}")]
    Timeout(#[from] TimeoutError),

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Auth flow error: {0}")]
    Auth(#[from] AuthError),

    /// A handler panicked or failed outside its own error type.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// The message was dropped by a router on the way and no response will arrive.
    #[error("Message {message_type} was dropped before reaching a handler")]
    Dropped { message_type: String },

    /// Failure reported by another context, carried back unchanged.
    #[error("{message}")]
    Forwarded {
        kind: ErrorKind,
        code: Option<i64>,
        message: String,
    },
}

impl Error {
    /// Flat classification used on the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Validation(_) | Self::Dropped { .. } => ErrorKind::Validation,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Wallet(WalletError::UserRejected { .. }) => ErrorKind::UserRejected,
            Self::Wallet(WalletError::ProviderUnavailable) => ErrorKind::ProviderUnavailable,
            Self::Wallet(_) => ErrorKind::ProviderFailure,
            Self::Network(_) => ErrorKind::Network,
            Self::Session(_) => ErrorKind::Session,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Handler(_) => ErrorKind::Internal,
            Self::Auth(AuthError::InProgress) => ErrorKind::InProgress,
            Self::Forwarded { kind, .. } => *kind,
        }
    }

    /// Numeric code for the response envelope.
    pub fn code(&self) -> i64 {
        match self {
            Self::Forwarded {
                code: Some(code), ..
            } => *code,
            other => other.kind().code(),
        }
    }
}

/// Serializable failure classification carried in `_RESULT` responses.
#[derive(Debug, Clone, Copy, Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Validation,
    RateLimited,
    Timeout,
    UserRejected,
    ProviderUnavailable,
    ProviderFailure,
    Network,
    Session,
    Storage,
    InProgress,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Validation => "validation",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::UserRejected => "user_rejected",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::ProviderFailure => "provider_failure",
            Self::Network => "network",
            Self::Session => "session",
            Self::Storage => "storage",
            Self::InProgress => "in_progress",
            Self::Internal => "internal",
        }
    }

    /// Numeric code for the response envelope. Wallet codes follow EIP-1193.
    pub fn code(self) -> i64 {
        match self {
            Self::UserRejected => USER_REJECTED_CODE,
            Self::ProviderUnavailable => 4900,
            Self::ProviderFailure => -32603,
            Self::Validation => 400,
            Self::Session => 401,
            Self::Timeout => 408,
            Self::InProgress => 409,
            Self::RateLimited => 429,
            Self::Network => 502,
            Self::Config | Self::Storage | Self::Internal => 500,
        }
    }
}

/// Provider error code reported when the user dismisses a wallet prompt.
pub const USER_REJECTED_CODE: i64 = 4001;

/// Configuration-related errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Malformed messages or disallowed senders.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("message type {0:?} lacks the protocol prefix")]
    MissingPrefix(String),

    #[error("origin {0:?} is not allowed")]
    OriginNotAllowed(String),

    #[error("no handler registered for {0}")]
    NoHandler(String),

    #[error("malformed payload: {0}")]
    Payload(String),
}

/// Request denied by the shared token bucket.
#[derive(Debug, Clone, thiserror::Error)]
#[error("rate limit exceeded for {message_type}")]
pub struct RateLimitError {
    pub message_type: String,
}

/// A tracked unit of work outlived its allowed lifetime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TimeoutError {
    #[error("request {key} exceeded {timeout:?}")]
    Request { key: String, timeout: Duration },

    #[error("operation {id} exceeded {max_age:?}")]
    Operation { id: String, max_age: Duration },

    #[error("auth step {step} exceeded {timeout:?}")]
    Step { step: &'static str, timeout: Duration },

    #[error("no response within {0:?}")]
    Response(Duration),
}

/// Wallet-provider failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WalletError {
    #[error("user rejected the request: {message}")]
    UserRejected { message: String },

    #[error("no wallet provider available")]
    ProviderUnavailable,

    #[error("provider error {code}: {message}")]
    ProviderFailure { code: i64, message: String },
}

impl WalletError {
    /// Classify a raw provider error by its code.
    pub fn from_provider(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        if code == USER_REJECTED_CODE {
            Self::UserRejected { message }
        } else {
            Self::ProviderFailure { code, message }
        }
    }
}

/// Remote API failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
    #[error("remote API unreachable: {0}")]
    Unreachable(String),

    #[error("remote API rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("failed to decode remote API response: {0}")]
    Decode(String),
}

/// Session token failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("session token is invalid")]
    Invalid,

    #[error("session expired at {0}")]
    Expired(chrono::DateTime<chrono::Utc>),

    #[error("no active session")]
    Missing,
}

/// Storage collaborator failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("failed reading store: {0}")]
    Read(String),

    #[error("failed writing store: {0}")]
    Write(String),

    #[error("stored value for {key} is malformed: {message}")]
    Corrupt { key: String, message: String },
}

/// Terminal outcomes of the sign-in state machine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("a sign-in flow is already in progress")]
    InProgress,
}

/// Result type alias for the bridge.
pub type Result<T> = std::result::Result<T, Error>;
