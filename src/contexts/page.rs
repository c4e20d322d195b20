//! Page-side client.

use std::sync::Arc;

use serde_json::{Map, Value};

use super::ContextLink;
use crate::error::Error;
use crate::protocol::{BridgeMessage, MessageTypes};
use crate::remote::AccountMode;
use crate::router::{MessageHandler, MessageRouter, RouterConfig};

/// Issues bridge requests towards the relay and owns the page's inbound
/// router, which accepts pushes (`SESSION_CHANGED`) from the relay only.
pub struct PageClient {
    types: MessageTypes,
    origin: String,
    upstream: ContextLink,
    router: Arc<MessageRouter>,
}

impl PageClient {
    /// `router` gates inbound pushes; its allow-list should hold the relay
    /// origin. `origin` is the page's own origin, stamped on every request.
    pub fn new(origin: impl Into<String>, upstream: ContextLink, router: RouterConfig) -> Self {
        Self {
            types: MessageTypes::new(router.message_prefix.clone()),
            origin: origin.into(),
            upstream,
            router: Arc::new(MessageRouter::new(router)),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn types(&self) -> &MessageTypes {
        &self.types
    }

    /// Inbound router, to be served on the page's own context channel.
    pub fn router(&self) -> Arc<MessageRouter> {
        Arc::clone(&self.router)
    }

    pub fn on_session_changed(&self, handler: Arc<dyn MessageHandler>) {
        self.router.register(self.types.session_changed(), handler);
    }

    /// Send `op` with `payload` and a fresh request id. Failure responses
    /// come back as typed errors.
    pub async fn request(&self, op: &str, payload: Map<String, Value>) -> Result<Map<String, Value>, Error> {
        let mut message = BridgeMessage::new(self.types.name(op))
            .with_request_id(uuid::Uuid::new_v4().to_string());
        message.payload = payload;
        let request_id = message.request_id.clone();

        let response = self.upstream.send(message, &self.origin).await?;
        if response.request_id != request_id {
            tracing::debug!(
                expected = request_id.as_deref().unwrap_or("-"),
                got = response.request_id.as_deref().unwrap_or("-"),
                "Response request id mismatch"
            );
        }
        response.into_result()
    }

    pub async fn connect(&self, account_mode: AccountMode) -> Result<Map<String, Value>, Error> {
        let mut payload = Map::new();
        payload.insert("accountMode".to_string(), Value::from(account_mode.as_str()));
        self.request(crate::protocol::CONNECT, payload).await
    }

    pub async fn disconnect(&self) -> Result<Map<String, Value>, Error> {
        self.request(crate::protocol::DISCONNECT, Map::new()).await
    }

    pub async fn get_session(&self) -> Result<Map<String, Value>, Error> {
        self.request(crate::protocol::GET_SESSION, Map::new()).await
    }

    pub async fn validate_session(&self) -> Result<Map<String, Value>, Error> {
        self.request(crate::protocol::VALIDATE_SESSION, Map::new()).await
    }

    pub async fn ping(&self) -> Result<Map<String, Value>, Error> {
        self.request(crate::protocol::PING, Map::new()).await
    }
}
