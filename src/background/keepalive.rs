//! Keep-alive heartbeat driven by a host-owned recurring alarm.
//!
//! In-process timers die with a suspended coordinator, so the heartbeat is
//! registered with an [`AlarmHost`] and re-armed (clear, then create) on every
//! cold start. A tick that finds open ports or pending operations is what
//! keeps the host from treating the coordinator as idle.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use super::operations::OperationTracker;
use super::ports::PortRegistry;
use crate::error::ConfigError;
use crate::router::MessageRouter;

/// Alarm name used for the heartbeat.
pub const KEEPALIVE_ALARM: &str = "authbridge-keepalive";

/// Heartbeat period; must stay under the host's idle threshold.
pub const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(24);

/// Host idle threshold the heartbeat period must undercut.
pub const HOST_IDLE_THRESHOLD: Duration = Duration::from_secs(30);

/// An alarm fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmEvent {
    pub name: String,
}

/// Host-provided recurring alarm primitive.
pub trait AlarmHost: Send + Sync {
    /// Create (or replace) a recurring alarm.
    fn create_alarm(&self, name: &str, period: Duration);

    /// Remove an alarm. Returns whether it existed.
    fn clear_alarm(&self, name: &str) -> bool;

    /// Stream of fired alarms.
    fn subscribe(&self) -> broadcast::Receiver<AlarmEvent>;
}

/// Alarm host backed by tokio tasks. Alarms live in the host, so they outlive
/// any coordinator that registered them.
///
/// `create_alarm` must be called from within a tokio runtime.
pub struct TokioAlarmHost {
    alarms: Mutex<HashMap<String, JoinHandle<()>>>,
    events: broadcast::Sender<AlarmEvent>,
}

impl Default for TokioAlarmHost {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioAlarmHost {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            alarms: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn has_alarm(&self, name: &str) -> bool {
        self.alarms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn alarm_count(&self) -> usize {
        self.alarms.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl AlarmHost for TokioAlarmHost {
    fn create_alarm(&self, name: &str, period: Duration) {
        let events = self.events.clone();
        let alarm = name.to_string();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let _ = events.send(AlarmEvent {
                    name: alarm.clone(),
                });
            }
        });
        if let Some(previous) = self
            .alarms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), task)
        {
            previous.abort();
        }
    }

    fn clear_alarm(&self, name: &str) -> bool {
        match self
            .alarms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
        {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AlarmEvent> {
        self.events.subscribe()
    }
}

impl Drop for TokioAlarmHost {
    fn drop(&mut self) {
        let alarms = self.alarms.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, task) in alarms.drain() {
            task.abort();
        }
    }
}

/// What one heartbeat observed and cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepAliveTick {
    pub open_ports: usize,
    pub pending_operations: usize,
    pub swept_operations: Vec<String>,
    pub expired_requests: HashSet<String>,
}

impl KeepAliveTick {
    /// Whether the coordinator had live work at this tick.
    pub fn keeps_alive(&self) -> bool {
        self.open_ports > 0 || self.pending_operations > 0
    }
}

pub struct KeepAliveScheduler {
    host: Arc<dyn AlarmHost>,
    period: Duration,
    ports: Arc<PortRegistry>,
    operations: Arc<OperationTracker>,
    router: Arc<MessageRouter>,
}

impl KeepAliveScheduler {
    pub fn new(
        host: Arc<dyn AlarmHost>,
        period: Duration,
        ports: Arc<PortRegistry>,
        operations: Arc<OperationTracker>,
        router: Arc<MessageRouter>,
    ) -> Result<Self, ConfigError> {
        if period.is_zero() || period >= HOST_IDLE_THRESHOLD {
            return Err(ConfigError::InvalidValue {
                key: "background.keepalive_period_secs".to_string(),
                message: format!(
                    "must be between 1s and {}s (exclusive)",
                    HOST_IDLE_THRESHOLD.as_secs()
                ),
            });
        }
        Ok(Self {
            host,
            period,
            ports,
            operations,
            router,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Idempotent re-arm: an earlier registration may or may not have
    /// survived, so clear it before creating.
    pub fn arm(&self) {
        let replaced = self.host.clear_alarm(KEEPALIVE_ALARM);
        self.host.create_alarm(KEEPALIVE_ALARM, self.period);
        tracing::info!(
            period_secs = self.period.as_secs(),
            replaced,
            "Keep-alive alarm armed"
        );
    }

    pub fn disarm(&self) -> bool {
        self.host.clear_alarm(KEEPALIVE_ALARM)
    }

    /// One heartbeat: run the staleness sweeps, then report live work.
    pub fn tick(&self, now: Instant) -> KeepAliveTick {
        let swept_operations = self.operations.sweep_stale(now);
        let expired_requests = self.router.cleanup_stale_requests(now);
        let tick = KeepAliveTick {
            open_ports: self.ports.len(),
            pending_operations: self.operations.pending_count(),
            swept_operations,
            expired_requests,
        };
        tracing::debug!(
            open_ports = tick.open_ports,
            pending_operations = tick.pending_operations,
            swept = tick.swept_operations.len(),
            expired = tick.expired_requests.len(),
            keeps_alive = tick.keeps_alive(),
            "Keep-alive tick"
        );
        tick
    }

    /// Tick on every heartbeat alarm. Runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut alarms = BroadcastStream::new(self.host.subscribe());
        while let Some(event) = alarms.next().await {
            match event {
                Ok(event) if event.name == KEEPALIVE_ALARM => {
                    self.tick(Instant::now());
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Keep-alive listener lagged: {}", e),
            }
        }
    }
}
