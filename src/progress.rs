//! Progress tracking for long-running operations
//!
//! `start` mints an operation id; producers push updates; every change is
//! persisted in the operation map and broadcast on a per-operation channel.
//! Progress is clamped non-decreasing, terminal states freeze the record, and
//! the terminal event closes the channel so subscribers drain buffered events
//! and finish.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("Operation not found: {0}")]
    NotFound(Uuid),

    #[error("Operation {0} already finished")]
    Finished(Uuid),
}

pub type Result<T> = std::result::Result<T, ProgressError>;

/// Operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Running)
    }
}

/// One tracked operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressOperation {
    pub id: Uuid,
    pub task_type: String,
    pub progress: f64,
    pub message: String,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Event broadcast to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress(ProgressOperation),
    Done { status: OperationStatus },
    Error { message: String },
}

/// Operation registry plus per-operation broadcast channels
#[derive(Default)]
pub struct ProgressService {
    operations: DashMap<Uuid, ProgressOperation>,
    channels: DashMap<Uuid, broadcast::Sender<ProgressEvent>>,
}

impl ProgressService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a long-running task.
    pub fn start(&self, task_type: &str, estimated_duration: Option<f64>) -> ProgressOperation {
        let now = Utc::now();
        let operation = ProgressOperation {
            id: Uuid::new_v4(),
            task_type: task_type.to_string(),
            progress: 0.0,
            message: "started".to_string(),
            status: OperationStatus::Running,
            started_at: now,
            updated_at: now,
            elapsed_seconds: 0.0,
            estimated_remaining: estimated_duration,
            output: None,
            error: None,
        };

        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        self.channels.insert(operation.id, tx);
        self.operations.insert(operation.id, operation.clone());

        debug!(operation = %operation.id, task_type, "operation started");
        operation
    }

    /// Record and broadcast a progress update. Progress never decreases.
    pub fn update(&self, id: Uuid, progress: f64, message: &str) -> Result<ProgressOperation> {
        let updated = {
            let mut entry = self
                .operations
                .get_mut(&id)
                .ok_or(ProgressError::NotFound(id))?;
            if entry.status.is_terminal() {
                return Err(ProgressError::Finished(id));
            }

            let now = Utc::now();
            entry.progress = progress.clamp(entry.progress, 100.0);
            entry.message = message.to_string();
            entry.updated_at = now;
            entry.elapsed_seconds = (now - entry.started_at).num_milliseconds() as f64 / 1000.0;
            if let Some(estimate) = entry.estimated_remaining {
                entry.estimated_remaining =
                    Some((estimate - entry.elapsed_seconds).max(0.0));
            }
            entry.clone()
        };

        self.broadcast(id, ProgressEvent::Progress(updated.clone()));
        Ok(updated)
    }

    pub fn complete(&self, id: Uuid, output: Option<JsonValue>) -> Result<ProgressOperation> {
        self.finish(id, OperationStatus::Completed, output, None)
    }

    pub fn fail(&self, id: Uuid, error: &str) -> Result<ProgressOperation> {
        self.finish(id, OperationStatus::Failed, None, Some(error.to_string()))
    }

    pub fn cancel(&self, id: Uuid) -> Result<ProgressOperation> {
        self.finish(id, OperationStatus::Cancelled, None, None)
    }

    fn finish(
        &self,
        id: Uuid,
        status: OperationStatus,
        output: Option<JsonValue>,
        error: Option<String>,
    ) -> Result<ProgressOperation> {
        let finished = {
            let mut entry = self
                .operations
                .get_mut(&id)
                .ok_or(ProgressError::NotFound(id))?;
            if entry.status.is_terminal() {
                return Err(ProgressError::Finished(id));
            }

            let now = Utc::now();
            entry.status = status;
            entry.updated_at = now;
            entry.elapsed_seconds = (now - entry.started_at).num_milliseconds() as f64 / 1000.0;
            entry.estimated_remaining = None;
            if status == OperationStatus::Completed {
                entry.progress = 100.0;
            }
            entry.output = output;
            entry.error = error.clone();
            entry.clone()
        };

        self.broadcast(id, ProgressEvent::Progress(finished.clone()));
        if let Some(message) = error {
            self.broadcast(id, ProgressEvent::Error { message });
        }
        self.broadcast(id, ProgressEvent::Done { status });

        // Dropping the sender closes the channel; subscribers drain whatever
        // is buffered, then finish.
        self.channels.remove(&id);

        debug!(operation = %id, status = ?status, "operation finished");
        Ok(finished)
    }

    fn broadcast(&self, id: Uuid, event: ProgressEvent) {
        if let Some(tx) = self.channels.get(&id) {
            let _ = tx.send(event);
        }
    }

    pub fn get(&self, id: Uuid) -> Option<ProgressOperation> {
        self.operations.get(&id).map(|op| op.clone())
    }

    /// Snapshot plus live event stream. Finished operations return the
    /// snapshot with no receiver.
    pub fn subscribe(
        &self,
        id: Uuid,
    ) -> Option<(ProgressOperation, Option<broadcast::Receiver<ProgressEvent>>)> {
        let operation = self.get(id)?;
        let receiver = self.channels.get(&id).map(|tx| tx.subscribe());
        Some((operation, receiver))
    }
}
