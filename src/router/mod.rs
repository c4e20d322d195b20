//! Inbound message routing for one execution context.
//!
//! Every cross-context message enters through [`MessageRouter`], which gates
//! it on the protocol prefix, the sender's origin, a registered handler and
//! the shared token bucket (in that order) before dispatching. Rejected
//! messages are dropped without a response. Handler failures, including
//! panics, are converted into failure responses so nothing propagates across
//! the message boundary. A handler that forwards elsewhere and reports
//! [`Error::Dropped`] propagates the drop instead.

pub mod dedup;
pub mod origin;
pub mod rate_limit;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{Error, RateLimitError, ValidationError};
use crate::protocol::{BridgeMessage, BridgeResponse};

pub use self::dedup::{DEFAULT_REQUEST_TIMEOUT, RequestDeduplicator};
pub use self::origin::OriginValidator;
pub use self::rate_limit::{RateLimiter, RateLimiterConfig};

use self::dedup::Joined;

/// What a handler returns: response data, or an error converted to a failure response.
pub type HandlerResult = Result<Value, Error>;

/// Handler for one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: BridgeMessage) -> HandlerResult;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(BridgeMessage) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: BridgeMessage) -> HandlerResult {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(BridgeMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// How deduplicated routes derive their in-flight key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupKey {
    /// Message type alone: every concurrent request of a type shares one result.
    Type,
    /// Message type plus the canonical payload (request id excluded).
    #[default]
    TypeAndPayload,
}

impl DedupKey {
    pub fn key_for(self, message: &BridgeMessage) -> String {
        match self {
            Self::Type => message.message_type.clone(),
            Self::TypeAndPayload => {
                format!("{}:{}", message.message_type, message.canonical_payload())
            }
        }
    }
}

/// Router construction parameters.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Label used in logs (`page`, `relay`, `background`).
    pub context: String,
    pub message_prefix: String,
    pub allowed_origins: Vec<String>,
    pub rate_limit: RateLimiterConfig,
    pub request_timeout: Duration,
    pub dedup_key: DedupKey,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            context: "background".to_string(),
            message_prefix: crate::protocol::DEFAULT_MESSAGE_PREFIX.to_string(),
            allowed_origins: Vec::new(),
            rate_limit: RateLimiterConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            dedup_key: DedupKey::default(),
        }
    }
}

/// Why a message was not dispatched.
#[derive(Debug, Clone)]
pub enum Rejection {
    Validation(ValidationError),
    RateLimited(RateLimitError),
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Validation(err) => Error::Validation(err),
            Rejection::RateLimited(err) => Error::RateLimited(err),
        }
    }
}

/// Single entry point for inbound messages in a context.
pub struct MessageRouter {
    context: String,
    prefix: String,
    origins: OriginValidator,
    limiter: RateLimiter,
    dedup: RequestDeduplicator<Option<BridgeResponse>>,
    dedup_key: DedupKey,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl MessageRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            origins: OriginValidator::new(&config.allowed_origins),
            limiter: RateLimiter::new(config.rate_limit),
            dedup: RequestDeduplicator::new(config.request_timeout),
            dedup_key: config.dedup_key,
            context: config.context,
            prefix: config.message_prefix,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn origins(&self) -> &OriginValidator {
        &self.origins
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    pub fn register(&self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let message_type = message_type.into();
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message_type.clone(), handler)
            .is_some();
        tracing::debug!(
            context = %self.context,
            message_type = %message_type,
            replaced,
            "Registered message handler"
        );
    }

    /// Remove the handler for `message_type`. Returns true iff one existed.
    pub fn unregister(&self, message_type: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(message_type)
            .is_some()
    }

    pub fn has_handler(&self, message_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(message_type)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Gate a message. The token bucket is only charged for messages that
    /// pass every other check.
    pub fn admit(
        &self,
        message: &BridgeMessage,
        origin: &str,
    ) -> Result<Arc<dyn MessageHandler>, Rejection> {
        if !message.message_type.starts_with(&self.prefix) {
            return Err(Rejection::Validation(ValidationError::MissingPrefix(
                message.message_type.clone(),
            )));
        }
        if !self.origins.is_allowed(origin) {
            return Err(Rejection::Validation(ValidationError::OriginNotAllowed(
                origin.to_string(),
            )));
        }
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message.message_type)
            .cloned()
            .ok_or_else(|| {
                Rejection::Validation(ValidationError::NoHandler(message.message_type.clone()))
            })?;
        self.charge(message)?;
        Ok(handler)
    }

    fn charge(&self, message: &BridgeMessage) -> Result<(), Rejection> {
        if self.limiter.check() {
            Ok(())
        } else {
            Err(Rejection::RateLimited(RateLimitError {
                message_type: message.message_type.clone(),
            }))
        }
    }

    /// Charge one token for traffic admitted elsewhere (port messages).
    /// Returns false, logging the drop, when the bucket is empty.
    pub fn throttle(&self, message: &BridgeMessage) -> bool {
        self.charge(message)
            .map_err(|rejection| self.log_rejection(rejection))
            .is_ok()
    }

    fn admit_logged(
        &self,
        message: &BridgeMessage,
        origin: &str,
    ) -> Option<Arc<dyn MessageHandler>> {
        self.admit(message, origin)
            .map_err(|rejection| self.log_rejection(rejection))
            .ok()
    }

    fn log_rejection(&self, rejection: Rejection) {
        match rejection {
            Rejection::RateLimited(err) => {
                tracing::warn!(context = %self.context, "Dropping message: {}", err);
            }
            Rejection::Validation(err) => {
                tracing::debug!(context = %self.context, "Dropping message: {}", err);
            }
        }
    }

    /// Gate and dispatch. `None` means the message was dropped.
    pub async fn dispatch(&self, message: BridgeMessage, origin: &str) -> Option<BridgeResponse> {
        let handler = self.admit_logged(&message, origin)?;
        invoke(self.context.clone(), handler, message).await
    }

    /// Gate and dispatch, collapsing concurrent requests with the same
    /// dedup key onto one handler invocation.
    pub async fn dispatch_deduplicated(
        &self,
        message: BridgeMessage,
        origin: &str,
    ) -> Option<BridgeResponse> {
        let handler = self.admit_logged(&message, origin)?;
        self.run_deduplicated(handler, message).await
    }

    /// Run an already admitted message through the dedup table, so it shares
    /// the outcome of any in-flight request with the same key.
    pub async fn run_deduplicated(
        &self,
        handler: Arc<dyn MessageHandler>,
        message: BridgeMessage,
    ) -> Option<BridgeResponse> {
        let key = self.dedup_key.key_for(&message);
        let joined = self.dedup.join_or_start(&key, Instant::now(), || {
            dedup::pending(invoke(self.context.clone(), handler, message.clone()))
        });
        match joined {
            Joined::Started(handle) => handle.await,
            Joined::Existing(handle) => {
                tracing::debug!(
                    context = %self.context,
                    message_type = %message.message_type,
                    "Joining in-flight request"
                );
                handle.await.map(|response| response.for_request(&message))
            }
        }
    }

    /// True iff the message was recognised and dispatched, regardless of
    /// the handler's outcome.
    pub async fn route(&self, message: BridgeMessage, origin: &str) -> bool {
        self.dispatch(message, origin).await.is_some()
    }

    pub async fn route_with_deduplication(&self, message: BridgeMessage, origin: &str) -> bool {
        self.dispatch_deduplicated(message, origin).await.is_some()
    }

    /// Whether deduplicated work is pending for this message.
    pub fn is_in_flight(&self, message: &BridgeMessage) -> bool {
        self.dedup
            .is_in_flight(&self.dedup_key.key_for(message), Instant::now())
    }

    pub fn cleanup_stale_requests(&self, now: Instant) -> HashSet<String> {
        self.dedup.cleanup_stale_requests(now)
    }

    pub fn in_flight_count(&self) -> usize {
        self.dedup.len()
    }

    /// Drop all transient state: handlers, in-flight entries, throttle.
    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.dedup.clear();
        self.limiter.reset();
    }
}

/// Run `handler`, converting errors and panics into failure responses.
/// `None` when the handler reports that a downstream context dropped the message.
pub(crate) async fn invoke(
    context: String,
    handler: Arc<dyn MessageHandler>,
    message: BridgeMessage,
) -> Option<BridgeResponse> {
    tracing::debug!(
        context = %context,
        message_type = %message.message_type,
        request_id = message.request_id.as_deref().unwrap_or("-"),
        "Dispatching message"
    );
    match AssertUnwindSafe(handler.handle(message.clone()))
        .catch_unwind()
        .await
    {
        Ok(Ok(data)) => Some(BridgeResponse::ok(&message, data)),
        Ok(Err(err @ Error::Dropped { .. })) => {
            tracing::debug!(context = %context, "Dropping message: {}", err);
            None
        }
        Ok(Err(err)) => {
            tracing::warn!(
                context = %context,
                message_type = %message.message_type,
                kind = err.kind().as_str(),
                "Handler failed: {}",
                err
            );
            Some(BridgeResponse::failure(&message, &err))
        }
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            tracing::warn!(
                context = %context,
                message_type = %message.message_type,
                "Handler panicked: {}",
                detail
            );
            Some(BridgeResponse::failure(&message, &Error::Handler(detail)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::{ErrorKind, WalletError};

    const ORIGIN: &str = "https://app.example.com";

    fn explode() -> HandlerResult {
        panic!("boom")
    }

    fn router(max_tokens: u32) -> MessageRouter {
        MessageRouter::new(RouterConfig {
            context: "test".to_string(),
            message_prefix: "SIWE_BRIDGE_".to_string(),
            allowed_origins: vec![ORIGIN.to_string()],
            rate_limit: RateLimiterConfig {
                max_tokens,
                refill_rate: 0.001,
            },
            request_timeout: Duration::from_secs(60),
            dedup_key: DedupKey::Type,
        })
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        handler_fn(move |_msg| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(json!({"ok": true}))
            }
        })
    }

    #[tokio::test]
    async fn rejects_without_invoking_handler() {
        let router = router(10);
        let calls = Arc::new(AtomicUsize::new(0));
        router.register("SIWE_BRIDGE_PING", counting_handler(Arc::clone(&calls)));
        router.register("OTHER_PING", counting_handler(Arc::clone(&calls)));

        assert!(!router.route(BridgeMessage::new("SIWE_BRIDGE_UNKNOWN"), ORIGIN).await);
        assert!(!router.route(BridgeMessage::new("OTHER_PING"), ORIGIN).await);
        assert!(
            !router
                .route(BridgeMessage::new("SIWE_BRIDGE_PING"), "https://evil.example")
                .await
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(router.route(BridgeMessage::new("SIWE_BRIDGE_PING"), ORIGIN).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limiter_drops_excess_messages() {
        let router = router(2);
        let calls = Arc::new(AtomicUsize::new(0));
        router.register("SIWE_BRIDGE_PING", counting_handler(Arc::clone(&calls)));

        assert!(router.route(BridgeMessage::new("SIWE_BRIDGE_PING"), ORIGIN).await);
        assert!(router.route(BridgeMessage::new("SIWE_BRIDGE_PING"), ORIGIN).await);
        assert!(!router.route(BridgeMessage::new("SIWE_BRIDGE_PING"), ORIGIN).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejected_messages_do_not_consume_tokens() {
        let router = router(1);
        let calls = Arc::new(AtomicUsize::new(0));
        router.register("SIWE_BRIDGE_PING", counting_handler(Arc::clone(&calls)));

        for _ in 0..5 {
            router
                .route(BridgeMessage::new("SIWE_BRIDGE_PING"), "https://evil.example")
                .await;
        }
        assert!(router.route(BridgeMessage::new("SIWE_BRIDGE_PING"), ORIGIN).await);
    }

    #[tokio::test]
    async fn handler_errors_and_panics_become_failure_responses() {
        let router = router(10);
        router.register(
            "SIWE_BRIDGE_FAIL",
            handler_fn(|_msg| async {
                Err::<Value, _>(Error::from(WalletError::UserRejected {
                    message: "nope".to_string(),
                }))
            }),
        );
        router.register(
            "SIWE_BRIDGE_PANIC",
            handler_fn(|_msg| async { explode() }),
        );

        let resp = router
            .dispatch(BridgeMessage::new("SIWE_BRIDGE_FAIL").with_request_id("1"), ORIGIN)
            .await
            .expect("dispatched");
        assert!(!resp.success);
        assert_eq!(resp.code, Some(4001));

        assert!(router.route(BridgeMessage::new("SIWE_BRIDGE_PANIC"), ORIGIN).await);
        let resp = router
            .dispatch(BridgeMessage::new("SIWE_BRIDGE_PANIC"), ORIGIN)
            .await
            .expect("dispatched");
        assert_eq!(resp.error_kind, Some(ErrorKind::Internal));
        assert!(resp.error.unwrap_or_default().contains("boom"));
    }

    #[tokio::test]
    async fn register_replaces_and_unregister_reports() {
        let router = router(10);
        router.register("SIWE_BRIDGE_X", handler_fn(|_m| async { Ok::<_, Error>(json!(1)) }));
        router.register("SIWE_BRIDGE_X", handler_fn(|_m| async { Ok::<_, Error>(json!(2)) }));
        let resp = router
            .dispatch(BridgeMessage::new("SIWE_BRIDGE_X"), ORIGIN)
            .await
            .expect("dispatched");
        assert_eq!(resp.data.get("result"), Some(&json!(2)));

        assert!(router.unregister("SIWE_BRIDGE_X"));
        assert!(!router.unregister("SIWE_BRIDGE_X"));
        assert!(!router.route(BridgeMessage::new("SIWE_BRIDGE_X"), ORIGIN).await);
    }

    #[tokio::test]
    async fn concurrent_duplicates_invoke_handler_once() {
        let router = router(10);
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            router.register(
                "SIWE_BRIDGE_CONNECT",
                handler_fn(move |_msg| {
                    let calls = Arc::clone(&calls);
                    let gate = Arc::clone(&gate);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok::<_, Error>(json!({"address": "0xabc"}))
                    }
                }),
            );
        }

        let release = {
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                while calls.load(Ordering::SeqCst) == 0 {
                    tokio::task::yield_now().await;
                }
                gate.notify_one();
            })
        };

        let (a, b) = tokio::join!(
            router.dispatch_deduplicated(
                BridgeMessage::new("SIWE_BRIDGE_CONNECT").with_request_id("a"),
                ORIGIN,
            ),
            router.dispatch_deduplicated(
                BridgeMessage::new("SIWE_BRIDGE_CONNECT").with_request_id("b"),
                ORIGIN,
            )
        );
        release.await.expect("release task");

        let (a, b) = (a.expect("handled"), b.expect("handled"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(a.success && b.success);
        assert_eq!(a.data, b.data);
        assert_eq!(a.request_id.as_deref(), Some("a"));
        assert_eq!(b.request_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn payload_keys_keep_distinct_requests_apart() {
        let router = MessageRouter::new(RouterConfig {
            allowed_origins: vec![ORIGIN.to_string()],
            ..RouterConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        router.register("SIWE_BRIDGE_CONNECT", counting_handler(Arc::clone(&calls)));

        let live = BridgeMessage::new("SIWE_BRIDGE_CONNECT").with_field("accountMode", "live");
        let demo = BridgeMessage::new("SIWE_BRIDGE_CONNECT").with_field("accountMode", "demo");
        let (a, b) = tokio::join!(
            router.dispatch_deduplicated(live, ORIGIN),
            router.dispatch_deduplicated(demo, ORIGIN)
        );
        assert!(a.is_some() && b.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn throttle_draws_from_the_routing_bucket() {
        let router = router(2);
        let calls = Arc::new(AtomicUsize::new(0));
        router.register("SIWE_BRIDGE_PING", counting_handler(Arc::clone(&calls)));

        let ping = BridgeMessage::new("SIWE_BRIDGE_PING");
        assert!(router.throttle(&ping));
        assert!(router.route(ping.clone(), ORIGIN).await);
        assert!(!router.throttle(&ping));
        assert!(!router.route(ping, ORIGIN).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn downstream_drops_are_not_answered() {
        let router = router(10);
        router.register(
            "SIWE_BRIDGE_PING",
            handler_fn(|msg: BridgeMessage| async move {
                Err::<Value, _>(Error::Dropped {
                    message_type: msg.message_type,
                })
            }),
        );
        assert!(
            router
                .dispatch(BridgeMessage::new("SIWE_BRIDGE_PING"), ORIGIN)
                .await
                .is_none()
        );
        assert!(
            router
                .dispatch_deduplicated(BridgeMessage::new("SIWE_BRIDGE_PING"), ORIGIN)
                .await
                .is_none()
        );
    }
}
