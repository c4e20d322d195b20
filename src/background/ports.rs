//! Named persistent connections into the background context.
//!
//! Port traffic skips the origin check (the host authenticated the port when
//! it opened) but still draws from the context's token bucket, and types
//! marked with [`PortRegistry::deduplicate`] share in-flight work with the
//! router.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::operations::OperationTracker;
use crate::error::Error;
use crate::protocol::{BridgeMessage, BridgeResponse};
use crate::router::{MessageHandler, MessageRouter};

/// Outbound side of a port: serialized messages and responses.
pub type PortConnection = mpsc::Sender<Value>;

/// An open port.
#[derive(Debug, Clone)]
pub struct ActivePort {
    pub id: String,
    pub name: String,
    pub connection: PortConnection,
    pub opened_at: Instant,
}

/// Open ports plus the per-name handlers serving them.
pub struct PortRegistry {
    ports: RwLock<HashMap<String, ActivePort>>,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    deduplicated: RwLock<HashSet<String>>,
    operations: Arc<OperationTracker>,
    router: Arc<MessageRouter>,
    sequence: AtomicU64,
}

impl PortRegistry {
    /// `router` is the context's router; port messages are charged against
    /// its rate limiter and deduplicated through its in-flight table.
    pub fn new(operations: Arc<OperationTracker>, router: Arc<MessageRouter>) -> Self {
        Self {
            ports: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            deduplicated: RwLock::new(HashSet::new()),
            operations,
            router,
            sequence: AtomicU64::new(0),
        }
    }

    /// Collapse concurrent port messages of `message_type` onto the router's
    /// in-flight work for the same key.
    pub fn deduplicate(&self, message_type: impl Into<String>) {
        self.deduplicated
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message_type.into());
    }

    /// Serve ports named `name` with `handler`, replacing any previous one.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), handler);
    }

    /// Register a connection. The id combines the name with the open time
    /// so reconnects under the same name never collide.
    pub fn open(&self, name: impl Into<String>, connection: PortConnection) -> String {
        let name = name.into();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{}-{}", name, chrono::Utc::now().timestamp_millis(), seq);
        let port = ActivePort {
            id: id.clone(),
            name,
            connection,
            opened_at: Instant::now(),
        };
        tracing::info!(port_id = %id, port_name = %port.name, "Port connected");
        self.ports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), port);
        id
    }

    pub fn get(&self, port_id: &str) -> Option<ActivePort> {
        self.ports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(port_id)
            .cloned()
    }

    /// Route a message that arrived on a port to the handler registered for
    /// the port's name. The response goes back over the same port. Returns
    /// false when the port is unknown, no handler is registered, the rate
    /// limit is exhausted or the handler dropped the message.
    pub async fn dispatch(&self, port_id: &str, message: BridgeMessage) -> bool {
        let Some(port) = self.get(port_id) else {
            tracing::debug!(port_id = %port_id, "Message for unknown port");
            return false;
        };
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&port.name)
            .cloned();
        let Some(handler) = handler else {
            tracing::warn!(port_name = %port.name, "No handler for port");
            return false;
        };

        if !self.router.throttle(&message) {
            return false;
        }

        let deduplicated = self
            .deduplicated
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&message.message_type);
        let op_type = message.message_type.clone();
        let context = format!("port:{}", port.name);
        let work = async {
            if deduplicated {
                self.router.run_deduplicated(handler, message).await
            } else {
                crate::router::invoke(context, handler, message).await
            }
        };
        match self.operations.track(&op_type, Some(port.id.clone()), work).await {
            Some(response) => {
                send_to(&port, &response);
                true
            }
            None => false,
        }
    }

    /// Remove a port and fail every operation it started.
    pub fn close(&self, port_id: &str) -> Option<ActivePort> {
        let removed = self
            .ports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(port_id)?;
        let failed = self.operations.fail_for_port(
            port_id,
            &Error::Handler(format!("port {port_id} disconnected")),
        );
        tracing::info!(
            port_id = %port_id,
            failed_operations = failed.len(),
            "Port disconnected"
        );
        Some(removed)
    }

    /// Push `message` to every open port. Ports whose receiving side is gone
    /// are closed. Returns how many ports accepted the message.
    pub fn broadcast(&self, message: &BridgeMessage) -> usize {
        let value = match serde_json::to_value(message) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to serialize broadcast: {}", e);
                return 0;
            }
        };
        let ports: Vec<ActivePort> = self
            .ports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut delivered = 0;
        for port in ports {
            match port.connection.try_send(value.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(port_id = %port.id, "Port backlog full, dropping broadcast");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.close(&port.id);
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.ports.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every port (teardown). Operations are cleared by their owner.
    pub fn clear(&self) {
        self.ports.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

fn send_to(port: &ActivePort, response: &BridgeResponse) {
    let value = match serde_json::to_value(response) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(port_id = %port.id, "Failed to serialize port response: {}", e);
            return;
        }
    };
    if port.connection.try_send(value).is_err() {
        tracing::debug!(port_id = %port.id, "Port response not delivered");
    }
}
