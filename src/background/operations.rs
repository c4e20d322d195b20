//! Long-running operation tracking.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::Error;
use crate::protocol::BridgeResponse;

/// Operations older than this are swept.
pub const DEFAULT_OPERATION_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// A tracked asynchronous operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveOperation {
    pub id: String,
    pub op_type: String,
    pub start_time: Instant,
    /// Port that started the operation. Non-owning: the port may close first.
    pub port_id: Option<String>,
}

/// Registry of in-progress operations keyed by id.
///
/// The pending count is the map size, so it can never drift from the set of
/// tracked operations.
#[derive(Debug)]
pub struct OperationTracker {
    operations: Mutex<HashMap<String, ActiveOperation>>,
    max_age: Duration,
    sequence: AtomicU64,
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new(DEFAULT_OPERATION_MAX_AGE)
    }
}

impl OperationTracker {
    pub fn new(max_age: Duration) -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            max_age,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveOperation>> {
        self.operations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Unique id for a new operation of `op_type`.
    pub fn next_id(&self, op_type: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{}",
            op_type,
            chrono::Utc::now().timestamp_millis(),
            seq
        )
    }

    /// Track a new operation. A duplicate id is refused and the existing
    /// entry kept; returns whether the operation was inserted.
    pub fn start(&self, id: impl Into<String>, op_type: impl Into<String>, port_id: Option<String>) -> bool {
        self.start_at(id, op_type, port_id, Instant::now())
    }

    pub fn start_at(
        &self,
        id: impl Into<String>,
        op_type: impl Into<String>,
        port_id: Option<String>,
        now: Instant,
    ) -> bool {
        let id = id.into();
        let mut operations = self.lock();
        if operations.contains_key(&id) {
            tracing::warn!(operation_id = %id, "Refusing duplicate operation id");
            return false;
        }
        let operation = ActiveOperation {
            id: id.clone(),
            op_type: op_type.into(),
            start_time: now,
            port_id,
        };
        tracing::debug!(
            operation_id = %id,
            op_type = %operation.op_type,
            "Operation started"
        );
        operations.insert(id, operation);
        true
    }

    /// Remove a finished operation. Unknown ids are ignored.
    pub fn complete(&self, id: &str) -> Option<ActiveOperation> {
        let removed = self.lock().remove(id);
        if removed.is_some() {
            tracing::debug!(operation_id = %id, "Operation completed");
        }
        removed
    }

    /// Remove a failed operation. Unknown ids are ignored.
    pub fn fail(&self, id: &str, error: &Error) -> Option<ActiveOperation> {
        let removed = self.lock().remove(id);
        if removed.is_some() {
            tracing::warn!(operation_id = %id, "Operation failed: {}", error);
        }
        removed
    }

    /// Run `work` as one tracked operation, settled by the response it
    /// yields. A dropped message completes without a failure.
    pub async fn track<F>(
        &self,
        op_type: &str,
        port_id: Option<String>,
        work: F,
    ) -> Option<BridgeResponse>
    where
        F: Future<Output = Option<BridgeResponse>>,
    {
        let id = self.next_id(op_type);
        self.start(id.clone(), op_type, port_id);
        let response = work.await;
        match response.as_ref().and_then(BridgeResponse::to_error) {
            Some(err) => self.fail(&id, &err),
            None => self.complete(&id),
        };
        response
    }

    /// Remove every operation with age >= the configured max age.
    pub fn sweep_stale(&self, now: Instant) -> Vec<String> {
        self.sweep_stale_with(now, self.max_age)
    }

    pub fn sweep_stale_with(&self, now: Instant, max_age: Duration) -> Vec<String> {
        let mut removed = Vec::new();
        self.lock().retain(|id, op| {
            let stale = now.saturating_duration_since(op.start_time) >= max_age;
            if stale {
                removed.push(id.clone());
            }
            !stale
        });
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Swept stale operations");
        }
        removed
    }

    /// Fail every operation started from `port_id`.
    pub fn fail_for_port(&self, port_id: &str, error: &Error) -> Vec<String> {
        let mut removed = Vec::new();
        self.lock().retain(|id, op| {
            let owned = op.port_id.as_deref() == Some(port_id);
            if owned {
                removed.push(id.clone());
            }
            !owned
        });
        for id in &removed {
            tracing::warn!(operation_id = %id, port_id = %port_id, "Operation failed: {}", error);
        }
        removed
    }

    pub fn ids_for_port(&self, port_id: &str) -> Vec<String> {
        self.lock()
            .values()
            .filter(|op| op.port_id.as_deref() == Some(port_id))
            .map(|op| op.id.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<ActiveOperation> {
        self.lock().get(id).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
