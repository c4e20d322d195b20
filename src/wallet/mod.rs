//! Wallet-provider capability and provider selection.
//!
//! Only the EIP-1193 request/response contract matters here: the bridge asks
//! a provider for accounts and a `personal_sign` signature, and classifies
//! the provider's error codes.

mod local;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WalletError;

pub use self::local::LocalKeyWallet;

/// Raw provider error (`{ code, message }`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("provider error {code}: {message}")]
pub struct ProviderRpcError {
    pub code: i64,
    pub message: String,
}

impl ProviderRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ProviderRpcError> for WalletError {
    fn from(err: ProviderRpcError) -> Self {
        WalletError::from_provider(err.code, err.message)
    }
}

/// Wallet brand flags advertised by injected providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletKind {
    MetaMask,
    Coinbase,
    Rabby,
    Other(String),
}

impl fmt::Display for WalletKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MetaMask => f.write_str("metamask"),
            Self::Coinbase => f.write_str("coinbase"),
            Self::Rabby => f.write_str("rabby"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// Preferred wallets, most preferred first.
pub const KNOWN_WALLETS: [WalletKind; 3] =
    [WalletKind::MetaMask, WalletKind::Coinbase, WalletKind::Rabby];

/// EIP-1193 style provider.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Issue a JSON-RPC request to the wallet.
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, ProviderRpcError>;

    /// Chain the wallet currently reports, e.g. `0x1`.
    fn chain_id(&self) -> Option<String> {
        None
    }

    fn selected_address(&self) -> Option<String> {
        None
    }

    fn kind(&self) -> Option<WalletKind> {
        None
    }

    /// Sub-providers in multi-wallet environments.
    fn providers(&self) -> Vec<Arc<dyn WalletProvider>> {
        Vec::new()
    }
}

/// Pick the provider to talk to.
///
/// With sub-providers present, the first one whose kind appears earliest in
/// [`KNOWN_WALLETS`] wins, falling back to the first sub-provider. Without
/// sub-providers the root itself is used.
pub fn select_provider(
    root: Option<&Arc<dyn WalletProvider>>,
) -> Result<Arc<dyn WalletProvider>, WalletError> {
    let root = root.ok_or(WalletError::ProviderUnavailable)?;
    let candidates = root.providers();
    if candidates.is_empty() {
        return Ok(Arc::clone(root));
    }

    for known in &KNOWN_WALLETS {
        if let Some(found) = candidates
            .iter()
            .find(|candidate| candidate.kind().as_ref() == Some(known))
        {
            return Ok(Arc::clone(found));
        }
    }
    Ok(Arc::clone(&candidates[0]))
}

/// `eth_requestAccounts`, normalized. Empty account lists are an error.
pub async fn request_accounts(provider: &dyn WalletProvider) -> Result<Vec<String>, WalletError> {
    let value = provider.request("eth_requestAccounts", Vec::new()).await?;
    let accounts: Vec<String> = value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(normalize_wallet_address)
                .collect()
        })
        .unwrap_or_default();
    if accounts.is_empty() {
        return Err(WalletError::ProviderFailure {
            code: 0,
            message: "wallet returned no accounts".to_string(),
        });
    }
    Ok(accounts)
}

/// Current chain id: the provider's cached value, else `eth_chainId`.
pub async fn current_chain_id(provider: &dyn WalletProvider) -> Result<String, WalletError> {
    if let Some(chain_id) = provider.chain_id() {
        return Ok(chain_id);
    }
    let value = provider.request("eth_chainId", Vec::new()).await?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => match n.as_u64() {
            Some(id) => Ok(format!("0x{id:x}")),
            None => Err(WalletError::ProviderFailure {
                code: 0,
                message: format!("eth_chainId result is not a chain id: {n}"),
            }),
        },
        other => Err(WalletError::ProviderFailure {
            code: 0,
            message: format!("unexpected eth_chainId result: {other}"),
        }),
    }
}

/// `personal_sign(message, address)`, returning the hex signature.
pub async fn personal_sign(
    provider: &dyn WalletProvider,
    message: &str,
    address: &str,
) -> Result<String, WalletError> {
    let value = provider
        .request(
            "personal_sign",
            vec![Value::from(message), Value::from(address)],
        )
        .await?;
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| WalletError::ProviderFailure {
            code: 0,
            message: "personal_sign returned a non-string signature".to_string(),
        })
}

/// Lowercased `0x`-prefixed 40-hex address, or `None`.
pub fn normalize_wallet_address(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if !trimmed.starts_with("0x") || trimmed.len() != 42 {
        return None;
    }
    let hex = &trimmed[2..];
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}
