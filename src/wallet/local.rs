//! In-process secp256k1 wallet for development sign-ins and tests.

use async_trait::async_trait;
use k256::ecdsa::{SigningKey, VerifyingKey};
use serde_json::Value;
use sha3::{Digest, Keccak256};

use super::{ProviderRpcError, WalletKind, WalletProvider, normalize_wallet_address};

const UNAUTHORIZED: i64 = 4100;
const UNSUPPORTED_METHOD: i64 = 4200;
const INVALID_PARAMS: i64 = -32602;

/// Wallet answering account and `personal_sign` requests with a local key.
pub struct LocalKeyWallet {
    signing_key: SigningKey,
    address: String,
    chain_id: String,
}

impl LocalKeyWallet {
    /// Load from a `0x`-prefixed 32-byte hex private key.
    pub fn from_hex(private_key: &str, chain_id: impl Into<String>) -> Result<Self, String> {
        let bytes = decode_hex_prefixed(private_key)?;
        let signing_key =
            SigningKey::from_slice(&bytes).map_err(|e| format!("invalid private key: {e}"))?;
        Self::from_signing_key(signing_key, chain_id)
    }

    /// Fresh random key.
    pub fn random(chain_id: impl Into<String>) -> Result<Self, String> {
        Self::from_signing_key(SigningKey::random(&mut rand::thread_rng()), chain_id)
    }

    fn from_signing_key(signing_key: SigningKey, chain_id: impl Into<String>) -> Result<Self, String> {
        let address = ethereum_address_from_verifying_key(signing_key.verifying_key())?;
        Ok(Self {
            signing_key,
            address,
            chain_id: chain_id.into(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// EIP-191 `personal_sign` over raw message bytes; `v` is 27/28.
    pub fn sign_message(&self, message: &[u8]) -> Result<String, String> {
        let prehash = eip191_personal_sign_hash(message);
        let (sig, recid) = self
            .signing_key
            .sign_prehash_recoverable(&prehash)
            .map_err(|e| format!("signing failed: {e}"))?;
        let mut sig_bytes = sig.to_bytes().to_vec();
        sig_bytes.push(recid.to_byte() + 27);
        Ok(format!("0x{}", encode_hex_lower(&sig_bytes)))
    }

    fn personal_sign(&self, params: &[Value]) -> Result<Value, ProviderRpcError> {
        let (Some(message), Some(address)) = (
            params.first().and_then(Value::as_str),
            params.get(1).and_then(Value::as_str),
        ) else {
            return Err(ProviderRpcError::new(
                INVALID_PARAMS,
                "personal_sign expects [message, address]",
            ));
        };
        if normalize_wallet_address(address).as_deref() != Some(self.address.as_str()) {
            return Err(ProviderRpcError::new(
                UNAUTHORIZED,
                format!("account {address} is not managed by this wallet"),
            ));
        }
        // Hex-encoded payloads are signed as bytes, anything else as UTF-8.
        let bytes = match decode_hex_prefixed(message) {
            Ok(bytes) if message.starts_with("0x") => bytes,
            _ => message.as_bytes().to_vec(),
        };
        self.sign_message(&bytes)
            .map(Value::from)
            .map_err(|e| ProviderRpcError::new(-32603, e))
    }
}

#[async_trait]
impl WalletProvider for LocalKeyWallet {
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, ProviderRpcError> {
        match method {
            "eth_requestAccounts" | "eth_accounts" => Ok(Value::from(vec![self.address.clone()])),
            "eth_chainId" => Ok(Value::from(self.chain_id.clone())),
            "personal_sign" => self.personal_sign(&params),
            other => Err(ProviderRpcError::new(
                UNSUPPORTED_METHOD,
                format!("method {other} is not supported"),
            )),
        }
    }

    fn chain_id(&self) -> Option<String> {
        Some(self.chain_id.clone())
    }

    fn selected_address(&self) -> Option<String> {
        Some(self.address.clone())
    }

    fn kind(&self) -> Option<WalletKind> {
        Some(WalletKind::Other("local".to_string()))
    }
}

fn eip191_personal_sign_hash(message: &[u8]) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(message);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn ethereum_address_from_verifying_key(key: &VerifyingKey) -> Result<String, String> {
    let encoded = key.to_encoded_point(false);
    let pubkey = encoded.as_bytes();
    if pubkey.len() != 65 || pubkey[0] != 0x04 {
        return Err("unexpected public key format".to_string());
    }

    let mut hasher = Keccak256::new();
    hasher.update(&pubkey[1..]);
    let digest = hasher.finalize();
    Ok(format!("0x{}", encode_hex_lower(&digest[12..])))
}

fn decode_hex_prefixed(value: &str) -> Result<Vec<u8>, String> {
    let hex = value
        .trim()
        .strip_prefix("0x")
        .ok_or_else(|| "hex string must be 0x-prefixed".to_string())?;
    if hex.is_empty() || hex.len() % 2 != 0 {
        return Err("hex string must have an even, non-zero number of digits".to_string());
    }
    hex.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let hi = decode_hex_nibble(pair[0]);
            let lo = decode_hex_nibble(pair[1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
                _ => Err("invalid hex character".to_string()),
            }
        })
        .collect()
}

fn decode_hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn encode_hex_lower(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}
