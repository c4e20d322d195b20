//! Isolated execution contexts and the channels between them.
//!
//! Page, relay and background share no memory. Each one owns a
//! [`ContextEndpoint`] and receives [`ContextEnvelope`]s over a bounded
//! channel; the sender awaits the reply on a oneshot. A `None` reply means
//! the receiving router dropped the message.

pub mod page;
pub mod relay;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, TimeoutError};
use crate::protocol::{BridgeMessage, BridgeResponse};
use crate::router::MessageRouter;

pub use self::page::PageClient;
pub use self::relay::Relay;

/// How long a sender waits for a reply. Covers a full sign-in.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default queue depth between two contexts.
pub const DEFAULT_LINK_CAPACITY: usize = 64;

/// One message in transit plus the sender's origin and reply slot.
#[derive(Debug)]
pub struct ContextEnvelope {
    pub message: BridgeMessage,
    pub origin: String,
    pub reply: oneshot::Sender<Option<BridgeResponse>>,
}

/// Sending half of a context channel.
#[derive(Debug, Clone)]
pub struct ContextLink {
    tx: mpsc::Sender<ContextEnvelope>,
    response_timeout: Duration,
}

/// Create a link and the receiver its target context serves.
pub fn link(capacity: usize, response_timeout: Duration) -> (ContextLink, mpsc::Receiver<ContextEnvelope>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ContextLink {
            tx,
            response_timeout,
        },
        rx,
    )
}

impl ContextLink {
    /// Deliver `message` as coming from `origin` and wait for the reply.
    pub async fn send(&self, message: BridgeMessage, origin: &str) -> Result<BridgeResponse, Error> {
        let message_type = message.message_type.clone();
        let (reply, response) = oneshot::channel();
        let envelope = ContextEnvelope {
            message,
            origin: origin.to_string(),
            reply,
        };
        if self.tx.send(envelope).await.is_err() {
            tracing::debug!(message_type = %message_type, "Target context is gone");
            return Err(Error::Dropped { message_type });
        }
        match tokio::time::timeout(self.response_timeout, response).await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) | Ok(Err(_)) => Err(Error::Dropped { message_type }),
            Err(_) => Err(TimeoutError::Response(self.response_timeout).into()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving side of a context.
#[async_trait]
pub trait ContextEndpoint: Send + Sync {
    /// Handle one inbound message. `None` drops it without a reply.
    async fn receive(&self, message: BridgeMessage, origin: &str) -> Option<BridgeResponse>;
}

#[async_trait]
impl ContextEndpoint for MessageRouter {
    async fn receive(&self, message: BridgeMessage, origin: &str) -> Option<BridgeResponse> {
        self.dispatch(message, origin).await
    }
}

/// Serve envelopes until every sender is gone. Each envelope runs on its own
/// task so a slow handler never blocks the queue.
pub async fn serve(endpoint: Arc<dyn ContextEndpoint>, mut rx: mpsc::Receiver<ContextEnvelope>) {
    while let Some(envelope) = rx.recv().await {
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move {
            let ContextEnvelope {
                message,
                origin,
                reply,
            } = envelope;
            let response = endpoint.receive(message, &origin).await;
            // The sender may have timed out and gone away.
            let _ = reply.send(response);
        });
    }
}
