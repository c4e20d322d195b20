//! Integration tests for the HTTP remote auth API client.
//!
//! These tests start a mock auth API on a random port with Axum and drive:
//! - challenge / verify / session / disconnect against `HttpAuthApi`
//! - status mapping (401 on session calls, rejected verify, unreachable host)
//! - a full `login` through the in-process page, relay and background stack

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::{Value, json};

use authbridge::auth::AccountMode;
use authbridge::background::TokioAlarmHost;
use authbridge::cli::BridgeStack;
use authbridge::config::{BridgeConfig, FileSettings};
use authbridge::error::{Error, ErrorKind, NetworkError, SessionError};
use authbridge::remote::{HttpAuthApi, RemoteAuthApi};
use authbridge::storage::{JsonFileStorage, Storage};
use authbridge::wallet::{LocalKeyWallet, WalletProvider};

const TOKEN: &str = "tok-1";
const TIMEOUT: Duration = Duration::from_secs(5);
const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

#[derive(Default)]
struct MockState {
    verified: Mutex<Vec<Value>>,
    disconnects: Mutex<u32>,
}

fn is_bind_permission_error<E: std::fmt::Display>(err: &E) -> bool {
    err.to_string().contains("Operation not permitted")
        || err.to_string().contains("Permission denied")
        || err.to_string().contains("failed to bind")
}

async fn challenge(Json(body): Json<Value>) -> Json<Value> {
    let address = body["address"].as_str().unwrap_or_default();
    Json(json!({
        "message": format!("authbridge wants you to sign in with {address}\nNonce: n-1"),
        "nonce": "n-1",
    }))
}

async fn verify(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if body["signature"] == json!("0xbad") {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "signature mismatch" })),
        )
            .into_response();
    }
    state.verified.lock().unwrap().push(body);
    Json(json!({
        "token": TOKEN,
        "user": { "id": "u1" },
        "expiresAt": "2099-01-01T00:00:00Z",
    }))
    .into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

async fn session(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({ "valid": true, "user": { "id": "u1" } })).into_response()
}

async fn disconnect(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    *state.disconnects.lock().unwrap() += 1;
    Json(json!({ "success": true })).into_response()
}

/// Start the mock API on a random port. `None` when the sandbox forbids
/// binding.
async fn start_mock() -> Option<(SocketAddr, Arc<MockState>)> {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if is_bind_permission_error(&e) => return None,
        Err(e) => panic!("Failed to bind mock API: {e:?}"),
    };
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/auth/challenge", post(challenge))
        .route("/auth/verify", post(verify))
        .route("/auth/session", get(session))
        .route("/auth/disconnect", post(disconnect))
        .with_state(Arc::clone(&state));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Some((addr, state))
}

fn api(addr: SocketAddr) -> HttpAuthApi {
    HttpAuthApi::new(format!("http://{addr}/"), TIMEOUT).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_full_contract_round() {
    let Some((addr, state)) = start_mock().await else {
        return;
    };
    let api = api(addr);
    assert_eq!(api.base_url(), format!("http://{addr}"));

    let challenge = api.challenge("0xabc").await.unwrap();
    assert_eq!(challenge.nonce, "n-1");
    assert!(challenge.message.contains("0xabc"));

    let verified = api
        .verify(&challenge.message, "0xsig", AccountMode::Demo)
        .await
        .unwrap();
    assert_eq!(verified.user, json!({ "id": "u1" }));
    assert!(verified.expires_at.is_some());
    assert_eq!(
        state.verified.lock().unwrap()[0]["accountMode"],
        json!("demo")
    );

    let token = SecretString::from(TOKEN.to_string());
    let validation = api.validate_session(&token).await.unwrap();
    assert!(validation.valid);

    assert!(api.disconnect(&token).await.unwrap());
    assert_eq!(*state.disconnects.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_status_mapping() {
    let Some((addr, _state)) = start_mock().await else {
        return;
    };
    let api = api(addr);

    let stale = SecretString::from("stale".to_string());
    match api.validate_session(&stale).await {
        Err(Error::Session(SessionError::Invalid)) => {}
        other => panic!("expected invalid session, got {other:?}"),
    }

    match api.verify("m", "0xbad", AccountMode::Live).await {
        Err(Error::Network(NetworkError::Rejected { status, message })) => {
            assert_eq!(status, 401);
            assert_eq!(message, "signature mismatch");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unreachable_host_is_a_network_error() {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if is_bind_permission_error(&e) => return,
        Err(e) => panic!("Failed to bind: {e:?}"),
    };
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = api(addr).challenge("0xabc").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert!(matches!(err, Error::Network(NetworkError::Unreachable(_))));
}

#[tokio::test]
async fn test_login_through_the_bridge_persists_the_session() {
    let Some((addr, state)) = start_mock().await else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let storage_path = dir.path().join("storage.json");

    let mut file = FileSettings::default();
    file.router.allowed_origins = Some(vec!["https://app.example.com".to_string()]);
    file.remote.base_url = Some(format!("http://{addr}"));
    file.storage.path = Some(storage_path.clone());
    let config = BridgeConfig::resolve(&file).unwrap();

    let wallet: Arc<dyn WalletProvider> = Arc::new(LocalKeyWallet::from_hex(DEV_KEY, "0x1").unwrap());
    let stack = BridgeStack::start(
        &config,
        Some(wallet),
        Arc::new(api(addr)),
        Arc::new(JsonFileStorage::new(&storage_path)),
        Arc::new(TokioAlarmHost::new()),
    )
    .await
    .unwrap();

    let data = stack.page.connect(AccountMode::Live).await.unwrap();
    assert_eq!(data["authenticated"], json!(true));
    assert_eq!(
        data["session"]["address"],
        json!("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266")
    );
    assert!(data["session"].get("token").is_none());

    let signature = state.verified.lock().unwrap()[0]["signature"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(signature.starts_with("0x"));
    assert_eq!(signature.len(), 2 + 130);
    stack.shutdown();

    // A fresh process sees the stored session and can end it.
    let reopened = JsonFileStorage::new(&storage_path);
    assert!(reopened.get("authbridge.session").await.unwrap().is_some());

    let stack = BridgeStack::start(
        &config,
        None,
        Arc::new(api(addr)),
        Arc::new(reopened),
        Arc::new(TokioAlarmHost::new()),
    )
    .await
    .unwrap();
    let session = stack.page.get_session().await.unwrap();
    assert_eq!(session["authenticated"], json!(true));
    let out = stack.page.disconnect().await.unwrap();
    assert_eq!(out["disconnected"], json!(true));
    assert_eq!(*state.disconnects.lock().unwrap(), 1);
    stack.shutdown();
}
