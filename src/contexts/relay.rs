//! Relay between the page and the background coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ContextEndpoint, ContextLink};
use crate::error::Error;
use crate::protocol::{self, BridgeMessage, BridgeResponse, MessageTypes};
use crate::router::{HandlerResult, MessageHandler, MessageRouter, RouterConfig};

/// Gates page traffic with its own router and forwards admitted requests
/// upstream under the relay's origin. A request the background drops is
/// dropped here too, so the page never learns why.
pub struct Relay {
    types: MessageTypes,
    origin: String,
    router: Arc<MessageRouter>,
}

struct Forward {
    origin: String,
    upstream: ContextLink,
}

#[async_trait]
impl MessageHandler for Forward {
    async fn handle(&self, message: BridgeMessage) -> HandlerResult {
        let response = self.upstream.send(message, &self.origin).await?;
        response.into_result().map(Value::Object)
    }
}

impl Relay {
    /// `router.allowed_origins` is the set of page origins the relay serves.
    pub fn new(origin: impl Into<String>, router: RouterConfig, upstream: ContextLink) -> Self {
        let origin = origin.into();
        let types = MessageTypes::new(router.message_prefix.clone());
        let router = Arc::new(MessageRouter::new(router));
        let forward: Arc<dyn MessageHandler> = Arc::new(Forward {
            origin: origin.clone(),
            upstream,
        });
        for op in [
            protocol::CONNECT,
            protocol::DISCONNECT,
            protocol::GET_SESSION,
            protocol::VALIDATE_SESSION,
            protocol::PING,
        ] {
            router.register(types.name(op), Arc::clone(&forward));
        }
        Self {
            types,
            origin,
            router,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Push `SESSION_CHANGED` broadcasts from a background port down to the
    /// page. Other port traffic is ignored.
    pub fn forward_notifications(
        self: &Arc<Self>,
        mut port: mpsc::Receiver<Value>,
        downstream: ContextLink,
    ) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let session_changed = relay.types.session_changed();
            while let Some(value) = port.recv().await {
                let Ok(message) = serde_json::from_value::<BridgeMessage>(value) else {
                    continue;
                };
                if message.message_type != session_changed {
                    continue;
                }
                if let Err(e) = downstream.send(message, &relay.origin).await {
                    tracing::debug!("Session change not delivered to page: {}", e);
                }
            }
            tracing::debug!("Background port closed, notification forwarding stopped");
        })
    }
}

#[async_trait]
impl ContextEndpoint for Relay {
    async fn receive(&self, message: BridgeMessage, origin: &str) -> Option<BridgeResponse> {
        if message.message_type == self.types.connect() {
            self.router.dispatch_deduplicated(message, origin).await
        } else {
            self.router.dispatch(message, origin).await
        }
    }
}
