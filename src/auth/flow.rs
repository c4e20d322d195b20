//! Wallet sign-in state machine.
//!
//! `connect` walks Connecting, AwaitingChallenge, AwaitingSignature and
//! Verifying, each bounded by its own timeout, and ends in Authenticated
//! (session persisted and announced) or Failed carrying the error kind. Only
//! one flow runs at a time per controller.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use super::session::{AuthSession, SessionStore};
use crate::error::{AuthError, Error, ErrorKind, SessionError, TimeoutError};
use crate::remote::{AccountMode, RemoteAuthApi};
use crate::wallet::{self, WalletProvider};

/// Controller phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Idle,
    Connecting,
    AwaitingChallenge,
    AwaitingSignature,
    Verifying,
    Authenticated,
    Failed(ErrorKind),
}

impl AuthPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Authenticated | Self::Failed(_))
    }

    /// A flow is running.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != Self::Idle
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingChallenge => "awaiting_challenge",
            Self::AwaitingSignature => "awaiting_signature",
            Self::Verifying => "verifying",
            Self::Authenticated => "authenticated",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for AuthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(kind) => write!(f, "failed({})", kind.as_str()),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Per-step time limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTimeouts {
    pub accounts: Duration,
    pub challenge: Duration,
    pub signature: Duration,
    pub verify: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            accounts: Duration::from_secs(60),
            challenge: Duration::from_secs(15),
            signature: Duration::from_secs(120),
            verify: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthFlowConfig {
    pub timeouts: StepTimeouts,
    /// Session lifetime when the API does not report an expiry.
    pub session_ttl: Duration,
}

impl Default for AuthFlowConfig {
    fn default() -> Self {
        Self {
            timeouts: StepTimeouts::default(),
            session_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Session-changed notification fanned out to every connected context.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SignedIn(Value),
    SignedOut,
}

impl SessionEvent {
    /// Payload carried by the outbound `SESSION_CHANGED` message.
    pub fn payload(&self) -> Value {
        match self {
            Self::SignedIn(session) => json!({ "authenticated": true, "session": session }),
            Self::SignedOut => json!({ "authenticated": false, "session": Value::Null }),
        }
    }
}

const EVENT_CAPACITY: usize = 16;

/// Drives one sign-in at a time against the injected collaborators.
pub struct AuthFlowController {
    wallet: Option<Arc<dyn WalletProvider>>,
    api: Arc<dyn RemoteAuthApi>,
    sessions: SessionStore,
    config: AuthFlowConfig,
    phase: Mutex<AuthPhase>,
    events: broadcast::Sender<SessionEvent>,
}

/// Returns the controller to Idle if a flow is abandoned mid-way.
struct FlowGuard<'a> {
    controller: &'a AuthFlowController,
    settled: bool,
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let mut phase = self.controller.lock_phase();
            if phase.is_active() {
                tracing::warn!(phase = %*phase, "Sign-in flow abandoned, resetting to idle");
                *phase = AuthPhase::Idle;
            }
        }
    }
}

impl AuthFlowController {
    pub fn new(
        wallet: Option<Arc<dyn WalletProvider>>,
        api: Arc<dyn RemoteAuthApi>,
        sessions: SessionStore,
        config: AuthFlowConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            wallet,
            api,
            sessions,
            config,
            phase: Mutex::new(AuthPhase::Idle),
            events,
        }
    }

    pub fn phase(&self) -> AuthPhase {
        *self.lock_phase()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    fn lock_phase(&self) -> std::sync::MutexGuard<'_, AuthPhase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, next: AuthPhase) {
        let mut phase = self.lock_phase();
        tracing::debug!(from = %*phase, to = %next, "Auth phase transition");
        *phase = next;
    }

    fn announce(&self, event: SessionEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(event);
    }

    /// Claim the controller for a new flow. Terminal phases reset to Idle
    /// first; a running flow is refused.
    fn begin(&self) -> Result<FlowGuard<'_>, Error> {
        let mut phase = self.lock_phase();
        if phase.is_active() {
            return Err(AuthError::InProgress.into());
        }
        if phase.is_terminal() {
            tracing::debug!(from = %*phase, "Resetting auth flow to idle");
        }
        *phase = AuthPhase::Connecting;
        Ok(FlowGuard {
            controller: self,
            settled: false,
        })
    }

    /// Run the full sign-in. On failure the controller ends in
    /// `Failed(kind)` and the originating error is returned.
    pub async fn connect(&self, account_mode: AccountMode) -> Result<AuthSession, Error> {
        let mut guard = self.begin()?;
        tracing::info!(account_mode = %account_mode, "Starting wallet sign-in");

        let outcome = self.run_flow(account_mode).await;
        guard.settled = true;
        match outcome {
            Ok(session) => {
                self.transition(AuthPhase::Authenticated);
                tracing::info!(address = %session.address, "Wallet sign-in complete");
                self.announce(SessionEvent::SignedIn(session.public_view()));
                Ok(session)
            }
            Err(err) => {
                let kind = err.kind();
                self.transition(AuthPhase::Failed(kind));
                tracing::warn!(kind = kind.as_str(), "Wallet sign-in failed: {}", err);
                Err(err)
            }
        }
    }

    async fn run_flow(&self, account_mode: AccountMode) -> Result<AuthSession, Error> {
        let timeouts = self.config.timeouts;
        let provider = wallet::select_provider(self.wallet.as_ref())?;

        let (address, chain_id) = step("accounts", timeouts.accounts, async {
            let accounts = wallet::request_accounts(provider.as_ref()).await?;
            let chain_id = wallet::current_chain_id(provider.as_ref()).await?;
            Ok::<_, Error>((accounts[0].clone(), chain_id))
        })
        .await?;

        self.transition(AuthPhase::AwaitingChallenge);
        let challenge = step("challenge", timeouts.challenge, self.api.challenge(&address)).await?;

        self.transition(AuthPhase::AwaitingSignature);
        let signature = step(
            "signature",
            timeouts.signature,
            wallet::personal_sign(provider.as_ref(), &challenge.message, &address),
        )
        .await?;

        self.transition(AuthPhase::Verifying);
        let verified = step(
            "verify",
            timeouts.verify,
            self.api
                .verify(&challenge.message, &signature, account_mode),
        )
        .await?;

        let expires_at = verified.expires_at.unwrap_or_else(|| {
            Utc::now()
                + chrono::Duration::from_std(self.config.session_ttl)
                    .unwrap_or_else(|_| chrono::Duration::hours(24))
        });
        let session = AuthSession {
            address,
            chain_id,
            account_mode,
            token: verified.token,
            expires_at,
            user: verified.user,
        };
        if let Err(e) = self.sessions.save(&session).await {
            tracing::error!("Failed to persist session: {}", e);
            return Err(e.into());
        }
        Ok(session)
    }

    /// Sign out: remote disconnect (best effort), drop the stored session,
    /// announce, and return to Idle. Returns whether a session existed.
    pub async fn disconnect(&self) -> Result<bool, Error> {
        if self.phase().is_active() {
            return Err(AuthError::InProgress.into());
        }
        let existing = self.sessions.load().await?;
        if let Some(session) = &existing {
            match self.api.disconnect(&session.token).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!("Remote disconnect reported failure"),
                Err(e) => tracing::warn!("Remote disconnect failed: {}", e),
            }
        }
        self.sessions.clear().await?;
        self.transition(AuthPhase::Idle);
        if existing.is_some() {
            tracing::info!("Signed out");
            self.announce(SessionEvent::SignedOut);
        }
        Ok(existing.is_some())
    }

    /// Stored, unexpired session, if any.
    pub async fn current_session(&self) -> Result<Option<AuthSession>, Error> {
        Ok(self.sessions.load().await?)
    }

    /// Ask the remote API whether the stored session is still accepted.
    /// A rejected session is removed and announced as signed out.
    pub async fn validate_session(&self) -> Result<AuthSession, Error> {
        let session = self
            .sessions
            .load()
            .await?
            .ok_or(SessionError::Missing)?;
        match self.api.validate_session(&session.token).await {
            Ok(validation) if validation.valid => Ok(session),
            Ok(_) | Err(Error::Session(SessionError::Invalid)) => {
                self.drop_rejected_session().await?;
                Err(SessionError::Invalid.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Cold-start restore. Invalid sessions are dropped; when the API cannot
    /// be reached the stored session is kept.
    pub async fn restore_session(&self) -> Result<Option<AuthSession>, Error> {
        match self.validate_session().await {
            Ok(session) => {
                self.transition(AuthPhase::Authenticated);
                tracing::info!(address = %session.address, "Restored stored session");
                Ok(Some(session))
            }
            Err(Error::Session(SessionError::Missing | SessionError::Invalid)) => Ok(None),
            Err(Error::Network(e)) => {
                tracing::warn!("Could not validate stored session, keeping it: {}", e);
                let session = self.sessions.load().await?;
                if session.is_some() {
                    self.transition(AuthPhase::Authenticated);
                }
                Ok(session)
            }
            Err(e) => Err(e),
        }
    }

    async fn drop_rejected_session(&self) -> Result<(), Error> {
        tracing::info!("Stored session rejected by the remote API");
        self.sessions.clear().await?;
        self.transition(AuthPhase::Idle);
        self.announce(SessionEvent::SignedOut);
        Ok(())
    }
}

async fn step<T, E, F>(name: &'static str, limit: Duration, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, E>>,
    E: Into<Error>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(TimeoutError::Step {
            step: name,
            timeout: limit,
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use secrecy::{ExposeSecret, SecretString};
    use tokio::sync::Notify;

    use super::*;
    use crate::auth::session::SESSION_STORAGE_KEY;
    use crate::error::NetworkError;
    use crate::remote::{Challenge, SessionValidation, VerifyResult};
    use crate::storage::{MemoryStorage, Storage};
    use crate::wallet::ProviderRpcError;

    const ADDRESS: &str = "0x9431cf5da0ce60664661341db650763b08286b18";

    #[derive(Clone, Copy)]
    enum SignBehavior {
        Sign,
        Reject,
        Hang,
        Gate,
    }

    struct FakeWallet {
        sign: SignBehavior,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl WalletProvider for FakeWallet {
        async fn request(&self, method: &str, _params: Vec<Value>) -> Result<Value, ProviderRpcError> {
            match method {
                "eth_requestAccounts" => Ok(json!([ADDRESS])),
                "eth_chainId" => Ok(json!("0x1")),
                "personal_sign" => match self.sign {
                    SignBehavior::Sign => Ok(json!("0xsig")),
                    SignBehavior::Reject => {
                        Err(ProviderRpcError::new(4001, "User denied message signature"))
                    }
                    SignBehavior::Hang => futures::future::pending().await,
                    SignBehavior::Gate => {
                        self.gate.notified().await;
                        Ok(json!("0xsig"))
                    }
                },
                _ => Err(ProviderRpcError::new(4200, "unsupported")),
            }
        }
    }

    #[derive(Default)]
    struct FakeApi {
        verifies: AtomicUsize,
        disconnects: AtomicUsize,
        validation: Mutex<Option<Result<bool, Error>>>,
    }

    #[async_trait]
    impl RemoteAuthApi for FakeApi {
        async fn challenge(&self, address: &str) -> Result<Challenge, Error> {
            Ok(Challenge {
                message: format!("Sign in as {address}"),
                nonce: "n-1".to_string(),
            })
        }

        async fn verify(
            &self,
            _message: &str,
            signature: &str,
            _account_mode: AccountMode,
        ) -> Result<VerifyResult, Error> {
            self.verifies.fetch_add(1, Ordering::SeqCst);
            assert_eq!(signature, "0xsig");
            Ok(VerifyResult {
                token: SecretString::from("tok".to_string()),
                user: json!({"id": "u1"}),
                expires_at: None,
            })
        }

        async fn validate_session(&self, _token: &SecretString) -> Result<SessionValidation, Error> {
            let scripted = self
                .validation
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .unwrap_or(Ok(true));
            scripted.map(|valid| SessionValidation {
                valid,
                user: Value::Null,
            })
        }

        async fn disconnect(&self, _token: &SecretString) -> Result<bool, Error> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn controller(
        sign: SignBehavior,
    ) -> (Arc<AuthFlowController>, Arc<FakeApi>, Arc<MemoryStorage>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let wallet: Arc<dyn WalletProvider> = Arc::new(FakeWallet {
            sign,
            gate: Arc::clone(&gate),
        });
        let api = Arc::new(FakeApi::default());
        let storage = Arc::new(MemoryStorage::new());
        let controller = AuthFlowController::new(
            Some(wallet),
            api.clone(),
            SessionStore::new(storage.clone()),
            AuthFlowConfig::default(),
        );
        (Arc::new(controller), api, storage, gate)
    }

    #[tokio::test]
    async fn successful_flow_persists_one_session_and_announces_it() {
        let (controller, api, storage, _) = controller(SignBehavior::Sign);
        let mut events = controller.subscribe();

        let session = controller.connect(AccountMode::Live).await.expect("session");
        assert_eq!(session.address, ADDRESS);
        assert_eq!(session.token.expose_secret(), "tok");
        assert_eq!(controller.phase(), AuthPhase::Authenticated);
        assert_eq!(api.verifies.load(Ordering::SeqCst), 1);
        assert_eq!(storage.len().await, 1);

        match events.recv().await.expect("event") {
            SessionEvent::SignedIn(view) => assert_eq!(view["address"], json!(ADDRESS)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(controller.current_session().await.expect("load").is_some());
    }

    #[tokio::test]
    async fn rejection_at_signing_fails_without_session() {
        let (controller, api, storage, _) = controller(SignBehavior::Reject);
        let err = controller.connect(AccountMode::Live).await.expect_err("rejected");
        assert_eq!(err.kind(), ErrorKind::UserRejected);
        assert_eq!(controller.phase(), AuthPhase::Failed(ErrorKind::UserRejected));
        assert_eq!(api.verifies.load(Ordering::SeqCst), 0);
        assert_eq!(storage.len().await, 0);
    }

    #[tokio::test]
    async fn missing_wallet_fails_as_provider_unavailable() {
        let controller = AuthFlowController::new(
            None,
            Arc::new(FakeApi::default()),
            SessionStore::new(Arc::new(MemoryStorage::new())),
            AuthFlowConfig::default(),
        );
        let err = controller.connect(AccountMode::Demo).await.expect_err("no wallet");
        assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_signature_times_out() {
        let (controller, _, storage, _) = controller(SignBehavior::Hang);
        let err = controller.connect(AccountMode::Live).await.expect_err("timeout");
        assert!(matches!(
            err,
            Error::Timeout(TimeoutError::Step { step: "signature", .. })
        ));
        assert_eq!(controller.phase(), AuthPhase::Failed(ErrorKind::Timeout));
        assert_eq!(storage.len().await, 0);
    }

    #[tokio::test]
    async fn second_connect_while_running_is_refused_then_reentry_works() {
        let (controller, _, _, gate) = controller(SignBehavior::Gate);
        let running = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.connect(AccountMode::Live).await })
        };
        while controller.phase() != AuthPhase::AwaitingSignature {
            tokio::task::yield_now().await;
        }

        let err = controller.connect(AccountMode::Live).await.expect_err("busy");
        assert!(matches!(err, Error::Auth(AuthError::InProgress)));

        gate.notify_one();
        tokio_test::assert_ok!(running.await.expect("join"));

        // Terminal state resets on the next connect.
        gate.notify_one();
        tokio_test::assert_ok!(controller.connect(AccountMode::Demo).await);
    }

    #[tokio::test]
    async fn disconnect_clears_and_announces() {
        let (controller, api, storage, _) = controller(SignBehavior::Sign);
        controller.connect(AccountMode::Live).await.expect("session");
        let mut events = controller.subscribe();

        assert!(controller.disconnect().await.expect("disconnect"));
        assert_eq!(api.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(storage.len().await, 0);
        assert_eq!(controller.phase(), AuthPhase::Idle);
        assert_eq!(events.recv().await.expect("event"), SessionEvent::SignedOut);

        assert!(!controller.disconnect().await.expect("second disconnect"));
    }

    #[tokio::test]
    async fn restore_keeps_session_on_network_failure_and_drops_invalid() {
        let (controller, api, storage, _) = controller(SignBehavior::Sign);
        controller.connect(AccountMode::Live).await.expect("session");

        *api.validation.lock().expect("lock") = Some(Err(
            NetworkError::Unreachable("connection refused".to_string()).into(),
        ));
        assert!(controller.restore_session().await.expect("restore").is_some());
        assert_eq!(storage.len().await, 1);

        *api.validation.lock().expect("lock") = Some(Ok(false));
        assert!(controller.restore_session().await.expect("restore").is_none());
        assert!(storage.get(SESSION_STORAGE_KEY).await.expect("get").is_none());
        assert_eq!(controller.phase(), AuthPhase::Idle);
    }
}
