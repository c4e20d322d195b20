//! Configuration for authbridge.
//!
//! Settings are resolved with priority: env var > TOML file > default.
//! The TOML file is `AUTHBRIDGE_CONFIG` or `~/.authbridge/config.toml`;
//! `.env` files are loaded first via dotenvy (see [`crate::bootstrap`]).

pub(crate) mod helpers;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{AuthFlowConfig, StepTimeouts};
use crate::background::{BackgroundConfig, keepalive::HOST_IDLE_THRESHOLD};
use crate::error::ConfigError;
use crate::protocol::DEFAULT_MESSAGE_PREFIX;
use crate::router::{DedupKey, RateLimiterConfig, RouterConfig};

use self::helpers::{normalize_variant, optional_env, parse_env, parse_list};

pub use self::helpers::authbridge_home;

pub const DEFAULT_ALLOWED_ORIGIN: &str = "https://app.authbridge.local";
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8787";

/// TOML file layout. Every field is optional; unset fields fall through to
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    pub router: RouterFileSettings,
    pub background: BackgroundFileSettings,
    pub remote: RemoteFileSettings,
    pub auth: AuthFileSettings,
    pub storage: StorageFileSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterFileSettings {
    pub message_prefix: Option<String>,
    pub allowed_origins: Option<Vec<String>>,
    pub max_tokens: Option<u32>,
    pub refill_rate: Option<f64>,
    pub dedup_timeout_ms: Option<u64>,
    pub dedup_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundFileSettings {
    pub keepalive_period_secs: Option<u64>,
    pub operation_max_age_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteFileSettings {
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthFileSettings {
    pub session_ttl_secs: Option<u64>,
    pub accounts_timeout_ms: Option<u64>,
    pub challenge_timeout_ms: Option<u64>,
    pub signature_timeout_ms: Option<u64>,
    pub verify_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageFileSettings {
    pub path: Option<PathBuf>,
}

impl FileSettings {
    /// Default TOML config file path (~/.authbridge/config.toml).
    pub fn default_toml_path() -> PathBuf {
        authbridge_home().join("config.toml")
    }

    /// Load settings from a TOML file. `None` if the file doesn't exist.
    pub fn load_toml(path: &Path) -> Result<Option<Self>, String> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
        };
        toml::from_str(&data)
            .map(Some)
            .map_err(|e| format!("invalid TOML in {}: {}", path.display(), e))
    }
}

/// Resolved router settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeRouterConfig {
    pub message_prefix: String,
    /// Page origins the relay accepts.
    pub allowed_origins: Vec<String>,
    pub rate_limit: RateLimiterConfig,
    pub dedup_timeout: Duration,
    pub dedup_key: DedupKey,
}

impl BridgeRouterConfig {
    fn resolve(file: &RouterFileSettings) -> Result<Self, ConfigError> {
        let message_prefix = optional_env("AUTHBRIDGE_MESSAGE_PREFIX")?
            .or_else(|| file.message_prefix.clone())
            .unwrap_or_else(|| DEFAULT_MESSAGE_PREFIX.to_string());
        if message_prefix.trim().is_empty() {
            return Err(invalid("AUTHBRIDGE_MESSAGE_PREFIX", "must not be empty"));
        }

        let allowed_origins = optional_env("AUTHBRIDGE_ALLOWED_ORIGINS")?
            .map(|raw| parse_list(&raw))
            .or_else(|| file.allowed_origins.clone())
            .unwrap_or_else(|| vec![DEFAULT_ALLOWED_ORIGIN.to_string()]);
        if allowed_origins.is_empty() {
            return Err(invalid(
                "AUTHBRIDGE_ALLOWED_ORIGINS",
                "at least one origin is required",
            ));
        }
        if let Some(bad) = allowed_origins
            .iter()
            .find(|o| crate::router::origin::normalize_origin(o).is_none())
        {
            return Err(invalid(
                "AUTHBRIDGE_ALLOWED_ORIGINS",
                format!("'{bad}' is not a valid origin"),
            ));
        }

        let defaults = RateLimiterConfig::default();
        let max_tokens = parse_env::<u32>("AUTHBRIDGE_RATE_LIMIT_MAX_TOKENS")?
            .or(file.max_tokens)
            .unwrap_or(defaults.max_tokens);
        if max_tokens == 0 {
            return Err(invalid("AUTHBRIDGE_RATE_LIMIT_MAX_TOKENS", "must be > 0"));
        }
        let refill_rate = parse_env::<f64>("AUTHBRIDGE_RATE_LIMIT_REFILL_PER_SEC")?
            .or(file.refill_rate)
            .unwrap_or(defaults.refill_rate);
        if !(refill_rate.is_finite() && refill_rate > 0.0) {
            return Err(invalid(
                "AUTHBRIDGE_RATE_LIMIT_REFILL_PER_SEC",
                "must be a positive number",
            ));
        }

        let dedup_timeout_ms = parse_env::<u64>("AUTHBRIDGE_DEDUP_TIMEOUT_MS")?
            .or(file.dedup_timeout_ms)
            .unwrap_or(60_000);
        if dedup_timeout_ms == 0 {
            return Err(invalid("AUTHBRIDGE_DEDUP_TIMEOUT_MS", "must be > 0"));
        }

        let dedup_key = match optional_env("AUTHBRIDGE_DEDUP_KEY")?.or_else(|| file.dedup_key.clone()) {
            Some(raw) => parse_dedup_key(&raw, "AUTHBRIDGE_DEDUP_KEY")?,
            None => DedupKey::default(),
        };

        Ok(Self {
            message_prefix,
            allowed_origins,
            rate_limit: RateLimiterConfig {
                max_tokens,
                refill_rate,
            },
            dedup_timeout: Duration::from_millis(dedup_timeout_ms),
            dedup_key,
        })
    }
}

fn parse_dedup_key(value: &str, key: &str) -> Result<DedupKey, ConfigError> {
    match normalize_variant(value).as_str() {
        "type" => Ok(DedupKey::Type),
        "type_and_payload" | "payload" => Ok(DedupKey::TypeAndPayload),
        _ => Err(invalid(
            key,
            format!("expected 'type' or 'type_and_payload', got '{value}'"),
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveConfig {
    pub period: Duration,
    pub operation_max_age: Duration,
}

impl KeepAliveConfig {
    fn resolve(file: &BackgroundFileSettings) -> Result<Self, ConfigError> {
        let period_secs = parse_env::<u64>("AUTHBRIDGE_KEEPALIVE_PERIOD_SECS")?
            .or(file.keepalive_period_secs)
            .unwrap_or(24);
        if period_secs == 0 || period_secs >= HOST_IDLE_THRESHOLD.as_secs() {
            return Err(invalid(
                "AUTHBRIDGE_KEEPALIVE_PERIOD_SECS",
                format!(
                    "must be between 1 and {} seconds",
                    HOST_IDLE_THRESHOLD.as_secs() - 1
                ),
            ));
        }
        let max_age_secs = parse_env::<u64>("AUTHBRIDGE_OPERATION_MAX_AGE_SECS")?
            .or(file.operation_max_age_secs)
            .unwrap_or(300);
        if max_age_secs == 0 {
            return Err(invalid("AUTHBRIDGE_OPERATION_MAX_AGE_SECS", "must be > 0"));
        }
        Ok(Self {
            period: Duration::from_secs(period_secs),
            operation_max_age: Duration::from_secs(max_age_secs),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteApiConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl RemoteApiConfig {
    fn resolve(file: &RemoteFileSettings) -> Result<Self, ConfigError> {
        let base_url = optional_env("AUTHBRIDGE_API_BASE_URL")?
            .or_else(|| file.base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        match url::Url::parse(&base_url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            _ => {
                return Err(invalid(
                    "AUTHBRIDGE_API_BASE_URL",
                    format!("'{base_url}' is not an http(s) URL"),
                ));
            }
        }
        let timeout_ms = parse_env::<u64>("AUTHBRIDGE_API_TIMEOUT_MS")?
            .or(file.timeout_ms)
            .unwrap_or(15_000);
        if timeout_ms == 0 {
            return Err(invalid("AUTHBRIDGE_API_TIMEOUT_MS", "must be > 0"));
        }
        Ok(Self {
            base_url,
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub session_ttl: Duration,
    pub timeouts: StepTimeouts,
}

impl AuthConfig {
    fn resolve(file: &AuthFileSettings) -> Result<Self, ConfigError> {
        let ttl_secs = parse_env::<u64>("AUTHBRIDGE_SESSION_TTL_SECS")?
            .or(file.session_ttl_secs)
            .unwrap_or(24 * 60 * 60);
        if ttl_secs == 0 {
            return Err(invalid("AUTHBRIDGE_SESSION_TTL_SECS", "must be > 0"));
        }
        let defaults = StepTimeouts::default();
        let step = |env: &str, from_file: Option<u64>, default: Duration| -> Result<Duration, ConfigError> {
            let ms = parse_env::<u64>(env)?
                .or(from_file)
                .unwrap_or(default.as_millis() as u64);
            if ms == 0 {
                return Err(invalid(env, "must be > 0"));
            }
            Ok(Duration::from_millis(ms))
        };
        Ok(Self {
            session_ttl: Duration::from_secs(ttl_secs),
            timeouts: StepTimeouts {
                accounts: step(
                    "AUTHBRIDGE_STEP_TIMEOUT_ACCOUNTS_MS",
                    file.accounts_timeout_ms,
                    defaults.accounts,
                )?,
                challenge: step(
                    "AUTHBRIDGE_STEP_TIMEOUT_CHALLENGE_MS",
                    file.challenge_timeout_ms,
                    defaults.challenge,
                )?,
                signature: step(
                    "AUTHBRIDGE_STEP_TIMEOUT_SIGNATURE_MS",
                    file.signature_timeout_ms,
                    defaults.signature,
                )?,
                verify: step(
                    "AUTHBRIDGE_STEP_TIMEOUT_VERIFY_MS",
                    file.verify_timeout_ms,
                    defaults.verify,
                )?,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl StorageConfig {
    fn resolve(file: &StorageFileSettings) -> Result<Self, ConfigError> {
        let path = optional_env("AUTHBRIDGE_STORAGE_PATH")?
            .map(PathBuf::from)
            .or_else(|| file.path.clone())
            .unwrap_or_else(|| authbridge_home().join("storage.json"));
        Ok(Self { path })
    }
}

/// Main configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub router: BridgeRouterConfig,
    pub keepalive: KeepAliveConfig,
    pub remote: RemoteApiConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
}

impl BridgeConfig {
    /// Load `.env` files, the TOML file and env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        let explicit = optional_env("AUTHBRIDGE_CONFIG")?.map(PathBuf::from);
        Self::from_env_with_toml(explicit.as_deref())
    }

    /// Load from env with an optional TOML config file overlay.
    ///
    /// An explicit path must exist and parse; the default path may be
    /// missing, and a broken default file only logs a warning.
    pub fn from_env_with_toml(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        crate::bootstrap::load_bridge_env();

        let path = explicit_path
            .map(PathBuf::from)
            .unwrap_or_else(FileSettings::default_toml_path);
        let file = match FileSettings::load_toml(&path) {
            Ok(Some(file)) => {
                tracing::debug!("Loaded TOML config from {}", path.display());
                file
            }
            Ok(None) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                FileSettings::default()
            }
            Err(e) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(e));
                }
                tracing::warn!("Failed to load default config file: {}", e);
                FileSettings::default()
            }
        };
        Self::resolve(&file)
    }

    /// Resolve against already-loaded file settings (env still wins).
    pub fn resolve(file: &FileSettings) -> Result<Self, ConfigError> {
        Ok(Self {
            router: BridgeRouterConfig::resolve(&file.router)?,
            keepalive: KeepAliveConfig::resolve(&file.background)?,
            remote: RemoteApiConfig::resolve(&file.remote)?,
            auth: AuthConfig::resolve(&file.auth)?,
            storage: StorageConfig::resolve(&file.storage)?,
        })
    }

    /// Router settings for one context, accepting `allowed_origins`.
    pub fn router_config(&self, context: &str, allowed_origins: Vec<String>) -> RouterConfig {
        RouterConfig {
            context: context.to_string(),
            message_prefix: self.router.message_prefix.clone(),
            allowed_origins,
            rate_limit: self.router.rate_limit,
            request_timeout: self.router.dedup_timeout,
            dedup_key: self.router.dedup_key,
        }
    }

    /// Background settings; its router only accepts the relay.
    pub fn background_config(&self, relay_origin: &str) -> BackgroundConfig {
        BackgroundConfig {
            router: self.router_config("background", vec![relay_origin.to_string()]),
            keepalive_period: self.keepalive.period,
            operation_max_age: self.keepalive.operation_max_age,
        }
    }

    pub fn auth_flow_config(&self) -> AuthFlowConfig {
        AuthFlowConfig {
            timeouts: self.auth.timeouts,
            session_ttl: self.auth.session_ttl,
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}
