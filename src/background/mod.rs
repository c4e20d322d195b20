//! Background coordinator.
//!
//! All in-memory state here (router throttle and dedup map, ports,
//! operations) is transient: the host may tear the coordinator down at any
//! moment and [`BackgroundCoordinator::cold_start`] rebuilds it from empty.
//! Only the session in storage survives.

pub mod keepalive;
pub mod operations;
pub mod ports;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::auth::{AccountMode, AuthFlowController, SessionEvent};
use crate::contexts::{self, ContextEndpoint, ContextEnvelope};
use crate::error::{Error, SessionError, ValidationError};
use crate::protocol::{self, BridgeMessage, BridgeResponse, MessageTypes};
use crate::router::{HandlerResult, MessageHandler, MessageRouter, RouterConfig};

pub use self::keepalive::{
    AlarmEvent, AlarmHost, DEFAULT_KEEPALIVE_PERIOD, KEEPALIVE_ALARM, KeepAliveScheduler,
    KeepAliveTick, TokioAlarmHost,
};
pub use self::operations::{ActiveOperation, DEFAULT_OPERATION_MAX_AGE, OperationTracker};
pub use self::ports::{ActivePort, PortConnection, PortRegistry};

/// Port name served by the coordinator's own handlers.
pub const BRIDGE_PORT: &str = "authbridge";

const PORT_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct BackgroundConfig {
    pub router: RouterConfig,
    pub keepalive_period: Duration,
    pub operation_max_age: Duration,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            keepalive_period: DEFAULT_KEEPALIVE_PERIOD,
            operation_max_age: DEFAULT_OPERATION_MAX_AGE,
        }
    }
}

/// Handlers for every bridge message type. Registered on the router per
/// type and on [`BRIDGE_PORT`].
struct BridgeHandlers {
    types: MessageTypes,
    auth: Arc<AuthFlowController>,
    operations: Arc<OperationTracker>,
    ports: std::sync::Weak<PortRegistry>,
}

impl BridgeHandlers {
    async fn connect(&self, message: &BridgeMessage) -> HandlerResult {
        let account_mode = match message.str_field("accountMode") {
            Some(raw) => raw
                .parse::<AccountMode>()
                .map_err(|e| Error::from(ValidationError::Payload(e)))?,
            None => AccountMode::default(),
        };

        let session = self.auth.connect(account_mode).await?;
        Ok(json!({ "authenticated": true, "session": session.public_view() }))
    }

    async fn get_session(&self) -> HandlerResult {
        Ok(match self.auth.current_session().await? {
            Some(session) => json!({ "authenticated": true, "session": session.public_view() }),
            None => json!({ "authenticated": false, "session": Value::Null }),
        })
    }

    async fn validate_session(&self) -> HandlerResult {
        match self.auth.validate_session().await {
            Ok(session) => Ok(json!({ "valid": true, "session": session.public_view() })),
            Err(Error::Session(SessionError::Missing | SessionError::Invalid)) => {
                Ok(json!({ "valid": false, "session": Value::Null }))
            }
            Err(e) => Err(e),
        }
    }

    fn ping(&self) -> HandlerResult {
        let open_ports = self.ports.upgrade().map(|p| p.len()).unwrap_or(0);
        Ok(json!({
            "pong": true,
            "phase": self.auth.phase().as_str(),
            "openPorts": open_ports,
            "pendingOperations": self.operations.pending_count(),
        }))
    }
}

#[async_trait]
impl MessageHandler for BridgeHandlers {
    async fn handle(&self, message: BridgeMessage) -> HandlerResult {
        let op = message
            .message_type
            .strip_prefix(self.types.prefix())
            .unwrap_or_default();
        match op {
            protocol::CONNECT => self.connect(&message).await,
            protocol::DISCONNECT => {
                let had_session = self.auth.disconnect().await?;
                Ok(json!({ "disconnected": had_session }))
            }
            protocol::GET_SESSION => self.get_session().await,
            protocol::VALIDATE_SESSION => self.validate_session().await,
            protocol::PING => self.ping(),
            _ => Err(ValidationError::NoHandler(message.message_type.clone()).into()),
        }
    }
}

/// Owns the background context's registries and wires them together.
pub struct BackgroundCoordinator {
    types: MessageTypes,
    router: Arc<MessageRouter>,
    operations: Arc<OperationTracker>,
    ports: Arc<PortRegistry>,
    keepalive: Arc<KeepAliveScheduler>,
    auth: Arc<AuthFlowController>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundCoordinator {
    /// Build fresh state, re-arm the keep-alive alarm, register handlers and
    /// restore the stored session.
    pub async fn cold_start(
        config: BackgroundConfig,
        auth: Arc<AuthFlowController>,
        alarms: Arc<dyn AlarmHost>,
    ) -> Result<Arc<Self>, Error> {
        let types = MessageTypes::new(config.router.message_prefix.clone());
        let router = Arc::new(MessageRouter::new(config.router));
        let operations = Arc::new(OperationTracker::new(config.operation_max_age));
        let ports = Arc::new(PortRegistry::new(
            Arc::clone(&operations),
            Arc::clone(&router),
        ));
        let keepalive = Arc::new(KeepAliveScheduler::new(
            alarms,
            config.keepalive_period,
            Arc::clone(&ports),
            Arc::clone(&operations),
            Arc::clone(&router),
        )?);
        keepalive.arm();

        let handlers: Arc<dyn MessageHandler> = Arc::new(BridgeHandlers {
            types: types.clone(),
            auth: Arc::clone(&auth),
            operations: Arc::clone(&operations),
            ports: Arc::downgrade(&ports),
        });
        for op in [
            protocol::CONNECT,
            protocol::DISCONNECT,
            protocol::GET_SESSION,
            protocol::VALIDATE_SESSION,
            protocol::PING,
        ] {
            router.register(types.name(op), Arc::clone(&handlers));
        }
        ports.register_handler(BRIDGE_PORT, handlers);
        ports.deduplicate(types.connect());

        let coordinator = Arc::new(Self {
            types,
            router,
            operations,
            ports,
            keepalive: Arc::clone(&keepalive),
            auth: Arc::clone(&auth),
            tasks: Mutex::new(Vec::new()),
        });

        let heartbeat = tokio::spawn(keepalive.run());
        let fan_out = tokio::spawn(forward_session_events(
            auth.subscribe(),
            coordinator.types.session_changed(),
            Arc::downgrade(&coordinator.ports),
        ));
        coordinator
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([heartbeat, fan_out]);

        match auth.restore_session().await {
            Ok(Some(session)) => {
                tracing::info!(address = %session.address, "Session restored on cold start")
            }
            Ok(None) => tracing::debug!("No session to restore"),
            Err(e) => tracing::warn!("Session restore failed: {}", e),
        }
        tracing::info!(
            handlers = coordinator.router.handler_count(),
            "Background coordinator ready"
        );
        Ok(coordinator)
    }

    pub fn types(&self) -> &MessageTypes {
        &self.types
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn operations(&self) -> &OperationTracker {
        &self.operations
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn auth(&self) -> &Arc<AuthFlowController> {
        &self.auth
    }

    pub fn keepalive(&self) -> &KeepAliveScheduler {
        &self.keepalive
    }

    /// Open a port; broadcasts and port replies arrive on the receiver.
    pub fn open_port(&self, name: &str) -> (String, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(PORT_CAPACITY);
        (self.ports.open(name, tx), rx)
    }

    pub fn close_port(&self, port_id: &str) -> bool {
        self.ports.close(port_id).is_some()
    }

    pub async fn port_message(&self, port_id: &str, message: BridgeMessage) -> bool {
        self.ports.dispatch(port_id, message).await
    }

    /// Serve envelopes from the relay until it goes away.
    pub async fn serve(self: Arc<Self>, rx: mpsc::Receiver<ContextEnvelope>) {
        contexts::serve(self, rx).await;
    }

    /// Drop all transient state. The keep-alive alarm stays with the host;
    /// the next cold start re-arms it.
    pub fn teardown(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        self.router.clear();
        self.ports.clear();
        self.operations.clear();
        tracing::info!("Background coordinator torn down");
    }
}

#[async_trait]
impl ContextEndpoint for BackgroundCoordinator {
    async fn receive(&self, message: BridgeMessage, origin: &str) -> Option<BridgeResponse> {
        // One connect runs at a time; concurrent duplicates share its result.
        if message.message_type == self.types.connect() {
            let op_type = message.message_type.clone();
            let work = self.router.dispatch_deduplicated(message, origin);
            self.operations.track(&op_type, None, work).await
        } else {
            self.router.dispatch(message, origin).await
        }
    }
}

async fn forward_session_events(
    mut events: broadcast::Receiver<SessionEvent>,
    message_type: String,
    ports: std::sync::Weak<PortRegistry>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Session event listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(ports) = ports.upgrade() else {
            break;
        };
        let mut message = BridgeMessage::new(message_type.clone());
        if let Value::Object(payload) = event.payload() {
            message.payload = payload;
        }
        let delivered = ports.broadcast(&message);
        tracing::debug!(delivered, "Broadcast session change");
    }
}
