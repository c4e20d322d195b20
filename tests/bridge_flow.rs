//! End-to-end sign-in across the page, relay and background contexts.
//!
//! The remote API is an in-memory stand-in; wallets are local keys (or a
//! scripted provider for rejection). Verifies:
//! - concurrent connects from the page collapse into one sign-in
//! - wallet rejection surfaces as a typed error with the provider code
//! - SESSION_CHANGED pushes reach the page
//! - foreign page origins never reach the background

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use authbridge::auth::AccountMode;
use authbridge::background::TokioAlarmHost;
use authbridge::cli::{BridgeStack, RELAY_ORIGIN};
use authbridge::config::{BridgeConfig, FileSettings};
use authbridge::contexts::{self, ContextEndpoint, PageClient};
use authbridge::error::{Error, ErrorKind, USER_REJECTED_CODE};
use authbridge::protocol::BridgeMessage;
use authbridge::remote::{Challenge, RemoteAuthApi, SessionValidation, VerifyResult};
use authbridge::router::handler_fn;
use authbridge::storage::MemoryStorage;
use authbridge::wallet::{LocalKeyWallet, ProviderRpcError, WalletProvider};

const PAGE: &str = "https://app.example.com";
const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct CountingApi {
    challenges: AtomicUsize,
    verifies: AtomicUsize,
    disconnects: AtomicUsize,
}

#[async_trait]
impl RemoteAuthApi for CountingApi {
    async fn challenge(&self, address: &str) -> Result<Challenge, Error> {
        self.challenges.fetch_add(1, Ordering::SeqCst);
        // Long enough for a concurrent duplicate to arrive mid-flow.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Challenge {
            message: format!("Sign in with {address}"),
            nonce: "n-1".to_string(),
        })
    }

    async fn verify(
        &self,
        _message: &str,
        signature: &str,
        _account_mode: AccountMode,
    ) -> Result<VerifyResult, Error> {
        assert!(signature.starts_with("0x"));
        self.verifies.fetch_add(1, Ordering::SeqCst);
        Ok(VerifyResult {
            token: SecretString::from("tok-1".to_string()),
            user: json!({ "id": "u1" }),
            expires_at: None,
        })
    }

    async fn validate_session(&self, _token: &SecretString) -> Result<SessionValidation, Error> {
        Ok(SessionValidation {
            valid: true,
            user: json!({ "id": "u1" }),
        })
    }

    async fn disconnect(&self, _token: &SecretString) -> Result<bool, Error> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Hands out an account but refuses to sign.
struct RefusingWallet;

#[async_trait]
impl WalletProvider for RefusingWallet {
    async fn request(&self, method: &str, _params: Vec<Value>) -> Result<Value, ProviderRpcError> {
        match method {
            "eth_requestAccounts" | "eth_accounts" => {
                Ok(json!(["0x70997970c51812dc3a010c7d01b50e0d17dc79c8"]))
            }
            "eth_chainId" => Ok(json!("0x1")),
            _ => Err(ProviderRpcError::new(USER_REJECTED_CODE, "User denied message signature")),
        }
    }
}

fn config() -> BridgeConfig {
    let mut file = FileSettings::default();
    file.router.allowed_origins = Some(vec![PAGE.to_string()]);
    BridgeConfig::resolve(&file).unwrap()
}

async fn start(wallet: Arc<dyn WalletProvider>, api: Arc<CountingApi>) -> BridgeStack {
    BridgeStack::start(
        &config(),
        Some(wallet),
        api,
        Arc::new(MemoryStorage::new()),
        Arc::new(TokioAlarmHost::new()),
    )
    .await
    .unwrap()
}

fn local_wallet() -> Arc<dyn WalletProvider> {
    Arc::new(LocalKeyWallet::random("0x1").unwrap())
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_concurrent_connects_share_one_sign_in() {
    let api = Arc::new(CountingApi::default());
    let stack = start(local_wallet(), Arc::clone(&api)).await;

    let (first, second) = tokio::join!(
        stack.page.connect(AccountMode::Live),
        stack.page.connect(AccountMode::Live)
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first["authenticated"], json!(true));
    assert_eq!(first["session"], second["session"]);
    assert_eq!(api.challenges.load(Ordering::SeqCst), 1);
    assert_eq!(api.verifies.load(Ordering::SeqCst), 1);

    // Once settled, a new connect runs a new flow.
    stack.page.connect(AccountMode::Live).await.unwrap();
    assert_eq!(api.verifies.load(Ordering::SeqCst), 2);
    stack.shutdown();
}

#[tokio::test]
async fn test_wallet_rejection_is_typed_at_the_page() {
    let api = Arc::new(CountingApi::default());
    let stack = start(Arc::new(RefusingWallet), Arc::clone(&api)).await;

    let err = stack.page.connect(AccountMode::Live).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UserRejected);
    assert_eq!(err.code(), USER_REJECTED_CODE);
    assert_eq!(api.verifies.load(Ordering::SeqCst), 0);

    let session = stack.page.get_session().await.unwrap();
    assert_eq!(session["authenticated"], json!(false));

    // A failed flow does not block the next attempt.
    let ping = stack.page.ping().await.unwrap();
    assert_eq!(ping["pong"], json!(true));
    assert_eq!(ping["pendingOperations"], json!(0));
    stack.shutdown();
}

#[tokio::test]
async fn test_session_changes_are_pushed_to_the_page() {
    let api = Arc::new(CountingApi::default());
    let stack = start(local_wallet(), Arc::clone(&api)).await;

    let (tx, mut pushed) = mpsc::channel::<BridgeMessage>(8);
    stack.page.on_session_changed(handler_fn(move |message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message).await;
            Ok::<_, Error>(Value::Null)
        }
    }));

    stack.page.connect(AccountMode::Demo).await.unwrap();
    let signed_in = timeout(TIMEOUT, pushed.recv()).await.unwrap().unwrap();
    assert_eq!(signed_in.message_type, "SIWE_BRIDGE_SESSION_CHANGED");
    assert_eq!(signed_in.payload["authenticated"], json!(true));
    assert_eq!(signed_in.payload["session"]["accountMode"], json!("demo"));

    let out = stack.page.disconnect().await.unwrap();
    assert_eq!(out["disconnected"], json!(true));
    let signed_out = timeout(TIMEOUT, pushed.recv()).await.unwrap().unwrap();
    assert_eq!(signed_out.payload["authenticated"], json!(false));
    assert_eq!(api.disconnects.load(Ordering::SeqCst), 1);
    stack.shutdown();
}

#[tokio::test]
async fn test_foreign_page_is_dropped_at_the_relay() {
    let api = Arc::new(CountingApi::default());
    let stack = start(local_wallet(), Arc::clone(&api)).await;

    let (to_relay, relay_rx) = contexts::link(8, TIMEOUT);
    let relay: Arc<dyn ContextEndpoint> = Arc::clone(&stack.relay) as Arc<dyn ContextEndpoint>;
    tokio::spawn(contexts::serve(relay, relay_rx));
    let config = config();
    let foreign = PageClient::new(
        "https://evil.example",
        to_relay,
        config.router_config("page", vec![RELAY_ORIGIN.to_string()]),
    );

    match foreign.connect(AccountMode::Live).await {
        Err(Error::Dropped { .. }) => {}
        other => panic!("expected drop, got {other:?}"),
    }
    assert_eq!(api.challenges.load(Ordering::SeqCst), 0);
    assert_eq!(stack.background.operations().pending_count(), 0);
    stack.shutdown();
}
