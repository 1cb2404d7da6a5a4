//! Operations service: runs backup and restore requests as tracked,
//! cancellable background operations.
//!
//! Every submitted request becomes an [`Operation`] record that moves from
//! `PENDING` through `RUNNING` to exactly one terminal state. Callers poll the
//! record until it is terminal; WebSocket subscribers get the same lifecycle
//! as events.
//!
//! Timeouts and cancels raise the operation's [`StopSignal`]. The terminal
//! state is recorded only after the operation has cleaned up, so a node is
//! free for the next request as soon as the previous one reads terminal.

pub mod coordinator;

use crate::cluster::ClusterControl;
use crate::executor::{
    BackupOperation, CommitLogRestoreOperation, RestoreOperation, StopReason, StopSignal,
};
use crate::request::{OperationKind, OperationRequest};
use crate::storage::StorageRegistry;
use crate::transfer::progress::format_speed;
use crate::transfer::{ProgressReport, ProgressSink};
use crate::utils::errors::{BackupError, Result};
use crate::ws::{OperationProgressPayload, WsEvent, WsState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Default interval between polls of a peer agent
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How long a cancel waits for the operation to clean up before the task is
/// aborted outright
pub const CANCEL_GRACE: Duration = Duration::from_secs(60);

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Completed | OperationState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            OperationState::Pending => 0,
            OperationState::Running => 1,
            OperationState::Completed | OperationState::Failed => 2,
        }
    }

    /// States only move forward and a terminal state is final.
    pub fn can_become(self, next: OperationState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Result of one member of a coordinated request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub node: String,
    pub operation_id: Option<Uuid>,
    pub state: OperationState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub state: OperationState,
    /// Completion in `[0, 1]`
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub node_outcomes: Vec<NodeOutcome>,
    /// Summary of a completed operation
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl Operation {
    fn new(kind: OperationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: OperationState::Pending,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            node_outcomes: Vec::new(),
            result: None,
        }
    }
}

/// What an engine run produced
pub struct Execution {
    pub result: Result<serde_json::Value>,
    pub node_outcomes: Vec<NodeOutcome>,
}

/// Runs one request to completion: locally, or fanned out to peer agents
/// for coordinated requests.
#[derive(Clone)]
pub struct Engine {
    cluster: Arc<dyn ClusterControl>,
    storage: StorageRegistry,
    http: reqwest::Client,
    poll_interval: Duration,
}

impl Engine {
    pub fn new(cluster: Arc<dyn ClusterControl>, storage: StorageRegistry) -> Self {
        Self {
            cluster,
            storage,
            http: reqwest::Client::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run `request` until it finishes or `stop` is raised and it has
    /// cleaned up.
    pub async fn execute(
        &self,
        request: &OperationRequest,
        progress: Arc<dyn ProgressSink>,
        stop: &StopSignal,
    ) -> Execution {
        if request.is_global() {
            let coordinate =
                coordinator::coordinate(&self.http, request, self.poll_interval, progress);
            let (node_outcomes, result) = tokio::select! {
                biased;
                err = stop.stopped() => {
                    return Execution {
                        result: Err(err),
                        node_outcomes: Vec::new(),
                    };
                }
                coordinated = coordinate => coordinated,
            };

            return Execution {
                result: result.map(|()| serde_json::json!({ "nodes": node_outcomes.len() })),
                node_outcomes,
            };
        }

        Execution {
            result: self.execute_local(request, progress, stop.clone()).await,
            node_outcomes: Vec::new(),
        }
    }

    async fn execute_local(
        &self,
        request: &OperationRequest,
        progress: Arc<dyn ProgressSink>,
        stop: StopSignal,
    ) -> Result<serde_json::Value> {
        match request {
            OperationRequest::Backup(r) => {
                let storage = self.storage.resolve(&r.storage_location.provider)?;
                let operation = BackupOperation::new(r.clone(), Arc::clone(&self.cluster), storage)
                    .with_stop_signal(stop);
                Ok(serde_json::to_value(operation.run(progress).await?)?)
            }
            OperationRequest::Restore(r) => {
                let storage = self.storage.resolve(&r.storage_location.provider)?;
                let operation = RestoreOperation::new(r.clone(), storage).with_stop_signal(stop);
                Ok(serde_json::to_value(operation.run(progress).await?)?)
            }
            OperationRequest::CommitlogRestore(r) => {
                let storage = self.storage.resolve(&r.storage_location.provider)?;
                let operation =
                    CommitLogRestoreOperation::new(r.clone(), storage).with_stop_signal(stop);
                Ok(serde_json::to_value(operation.run(progress).await?)?)
            }
        }
    }
}

/// Handles on a running operation
struct Task {
    stop: StopSignal,
    abort: AbortHandle,
}

struct Inner {
    engine: Engine,
    operations: RwLock<HashMap<Uuid, Operation>>,
    tasks: RwLock<HashMap<Uuid, Task>>,
    events: WsState,
}

/// Submit, observe and cancel operations. Cheap to clone.
#[derive(Clone)]
pub struct OperationsService {
    inner: Arc<Inner>,
}

impl OperationsService {
    pub fn new(engine: Engine, events: WsState) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                operations: RwLock::new(HashMap::new()),
                tasks: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn events(&self) -> &WsState {
        &self.inner.events
    }

    /// Validate `request` and start it in the background.
    pub async fn submit(&self, request: OperationRequest) -> Result<Operation> {
        request.validate()?;

        let operation = Operation::new(request.kind());
        let id = operation.id;
        self.inner
            .operations
            .write()
            .await
            .insert(id, operation.clone());

        info!(operation_id = %id, kind = %request.kind(), "Operation submitted");

        // Hold the task map while spawning so a fast task cannot finish and
        // deregister before it was registered.
        let mut tasks = self.inner.tasks.write().await;
        let service = self.clone();
        let stop = StopSignal::new();
        let task_stop = stop.clone();
        let handle = tokio::spawn(async move {
            service.run(id, request, task_stop).await;
        });
        tasks.insert(
            id,
            Task {
                stop,
                abort: handle.abort_handle(),
            },
        );

        Ok(operation)
    }

    pub async fn get(&self, id: Uuid) -> Option<Operation> {
        self.inner.operations.read().await.get(&id).cloned()
    }

    /// All operations, oldest first
    pub async fn list(&self) -> Vec<Operation> {
        let mut operations: Vec<Operation> =
            self.inner.operations.read().await.values().cloned().collect();
        operations.sort_by_key(|op| op.created_at);
        operations
    }

    pub async fn running_count(&self) -> usize {
        self.inner.tasks.read().await.len()
    }

    /// Stop a running operation and wait until it has cleaned up and is
    /// recorded as failed. An operation that does not stop within
    /// [`CANCEL_GRACE`] is aborted. Returns `None` for an unknown id.
    pub async fn cancel(&self, id: Uuid) -> Option<Operation> {
        self.cancel_within(id, CANCEL_GRACE).await
    }

    async fn cancel_within(&self, id: Uuid, grace: Duration) -> Option<Operation> {
        let current = self.get(id).await?;
        if current.state.is_terminal() {
            return Some(current);
        }

        let stop = self
            .inner
            .tasks
            .read()
            .await
            .get(&id)
            .map(|task| task.stop.clone());
        if let Some(stop) = stop {
            info!(operation_id = %id, "Cancelling operation");
            stop.stop(StopReason::Cancelled);
        }

        let settled = tokio::time::timeout(grace, self.wait_for_terminal(id, CANCEL_POLL_INTERVAL));
        if let Ok(Ok(operation)) = settled.await {
            return Some(operation);
        }

        warn!(
            operation_id = %id,
            "Operation did not stop within {}s, aborting it",
            grace.as_secs()
        );
        if let Some(task) = self.inner.tasks.write().await.remove(&id) {
            task.abort.abort();
        }
        self.finish(id, Err(BackupError::Cancelled), Vec::new()).await;
        self.get(id).await
    }

    /// Cancel everything that is still running.
    pub async fn cancel_all(&self) {
        let ids: Vec<Uuid> = self.inner.tasks.read().await.keys().copied().collect();
        futures_util::future::join_all(ids.into_iter().map(|id| self.cancel(id))).await;
    }

    /// Poll until operation `id` reaches a terminal state.
    pub async fn wait_for_terminal(&self, id: Uuid, poll_interval: Duration) -> Result<Operation> {
        loop {
            let operation = self
                .get(id)
                .await
                .ok_or_else(|| BackupError::InvalidRequest(format!("unknown operation {}", id)))?;

            if operation.state.is_terminal() {
                return Ok(operation);
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn run(&self, id: Uuid, request: OperationRequest, stop: StopSignal) {
        let kind = request.kind();
        if !self.start(id).await {
            self.inner.tasks.write().await.remove(&id);
            return;
        }
        self.inner.events.broadcast(WsEvent::OperationStarted { operation_id: id, kind });

        let progress: Arc<dyn ProgressSink> = Arc::new(OperationProgress {
            service: self.clone(),
            id,
        });

        let execute = self.inner.engine.execute(&request, progress, &stop);
        tokio::pin!(execute);

        let execution = if request.is_global() {
            // Members enforce the deadline themselves and report per node.
            execute.await
        } else {
            let timeout = request.timeout();
            tokio::select! {
                execution = &mut execute => execution,
                _ = tokio::time::sleep(timeout) => {
                    warn!(operation_id = %id, "Operation timed out after {}s, stopping", timeout.as_secs());
                    stop.stop(StopReason::Timeout(timeout));
                    execute.await
                }
            }
        };

        self.inner.tasks.write().await.remove(&id);
        self.finish(id, execution.result, execution.node_outcomes).await;
    }

    async fn start(&self, id: Uuid) -> bool {
        let mut operations = self.inner.operations.write().await;
        match operations.get_mut(&id) {
            Some(op) if op.state.can_become(OperationState::Running) => {
                op.state = OperationState::Running;
                op.started_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    async fn finish(
        &self,
        id: Uuid,
        result: Result<serde_json::Value>,
        node_outcomes: Vec<NodeOutcome>,
    ) {
        let event = {
            let mut operations = self.inner.operations.write().await;
            let Some(op) = operations.get_mut(&id) else {
                return;
            };

            let next = if result.is_ok() {
                OperationState::Completed
            } else {
                OperationState::Failed
            };
            if !op.state.can_become(next) {
                return;
            }

            op.state = next;
            op.completed_at = Some(Utc::now());
            op.node_outcomes = node_outcomes;

            match result {
                Ok(summary) => {
                    op.progress = 1.0;
                    op.result = Some(summary);
                    info!(operation_id = %id, kind = %op.kind, "Operation completed");
                    WsEvent::OperationCompleted { operation_id: id }
                }
                Err(e) => {
                    let cause = e.to_string();
                    if matches!(e, BackupError::Cancelled) {
                        warn!(operation_id = %id, kind = %op.kind, "Operation cancelled");
                    } else {
                        error!(operation_id = %id, kind = %op.kind, "Operation failed: {}", cause);
                    }
                    op.error = Some(cause.clone());
                    WsEvent::OperationFailed {
                        operation_id: id,
                        error: cause,
                    }
                }
            }
        };

        self.inner.events.broadcast(event);
    }

    async fn record_progress(&self, id: Uuid, report: &ProgressReport) {
        let mut operations = self.inner.operations.write().await;
        if let Some(op) = operations.get_mut(&id) {
            if op.state == OperationState::Running {
                op.progress = report.fraction();
            }
        }
    }
}

/// Feeds transfer progress into an operation record and the event stream
struct OperationProgress {
    service: OperationsService,
    id: Uuid,
}

#[async_trait]
impl ProgressSink for OperationProgress {
    async fn report(&self, report: ProgressReport) {
        self.service.record_progress(self.id, &report).await;

        self.service
            .events()
            .broadcast(WsEvent::OperationProgress(OperationProgressPayload {
                operation_id: self.id,
                percent: report.fraction() * 100.0,
                completed_entries: report.completed_entries,
                total_entries: report.total_entries,
                transferred_bytes: report.transferred_bytes,
                total_bytes: report.total_bytes,
                bytes_per_second: report.bytes_per_second,
                speed: format_speed(report.bytes_per_second),
                eta_seconds: report.eta_seconds,
            }));
    }
}
