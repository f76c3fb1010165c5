//! Job Lifecycle Tracker
//! 作业生命周期跟踪器
//!
//! `advance` polls the backend for one record and applies at most one status
//! transition. It is idempotent: terminal records are returned unchanged.
//! Advances on the same record are serialized by a per-record async mutex,
//! and every write carries an optimistic version check, so a concurrent
//! writer elsewhere surfaces as a conflict instead of a lost update.
//! 同一记录的推进由每条记录的异步互斥锁串行化，写入均带乐观版本检查。

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{BackendRegistry, BackendStatus, DispatchError, ExecutionBackend, JobFailure};
use super::manifest::OutputCollector;
use super::{ExecutedOperation, ExecutionStatus};
use crate::operations::{ExecutionMode, Operation};
use crate::storage::{Repository, StorageError};

/// Tracker error / 跟踪器错误
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Executed operation not found: {0}")]
    NotFound(Uuid),

    #[error("Operation {0} of an executed operation no longer exists")]
    OperationMissing(Uuid),

    #[error("No execution backend configured for mode {0}")]
    NoBackend(ExecutionMode),

    #[error("Executed operation {0} was modified concurrently")]
    Conflict(Uuid),

    #[error("Executed operation {id} is already {status}")]
    AlreadyTerminal { id: Uuid, status: ExecutionStatus },

    #[error("Backend did not confirm cancellation of {0}")]
    CancelNotConfirmed(Uuid),

    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Backend error: {0}")]
    Backend(#[from] DispatchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// Advances executed operations through their lifecycle
/// 推进执行记录的生命周期
#[derive(Debug)]
pub struct JobTracker {
    executions: Arc<Repository<ExecutedOperation>>,
    operations: Arc<Repository<Operation>>,
    backends: Arc<BackendRegistry>,
    collector: OutputCollector,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    advance_permits: Semaphore,
}

fn transition(record: &mut ExecutedOperation, next: ExecutionStatus) -> TrackerResult<()> {
    if !record.status.can_transition_to(next) {
        return Err(TrackerError::IllegalTransition {
            from: record.status,
            to: next,
        });
    }
    let now = Utc::now();
    if next == ExecutionStatus::Running && record.started_at.is_none() {
        record.started_at = Some(now);
    }
    if next.is_terminal() {
        record.completed_at = Some(now);
    }
    record.status = next;
    Ok(())
}

fn fail(record: &mut ExecutedOperation, failure: &JobFailure) -> TrackerResult<()> {
    record.errors.push(failure.to_string());
    transition(record, ExecutionStatus::Failed)
}

impl JobTracker {
    pub fn new(
        executions: Arc<Repository<ExecutedOperation>>,
        operations: Arc<Repository<Operation>>,
        backends: Arc<BackendRegistry>,
        collector: OutputCollector,
        max_concurrent: usize,
    ) -> Self {
        Self {
            executions,
            operations,
            backends,
            collector,
            locks: DashMap::new(),
            advance_permits: Semaphore::new(max_concurrent.max(1)),
        }
    }

    fn lock_for(&self, id: &Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(*id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn backend_for(&self, mode: ExecutionMode) -> TrackerResult<Arc<dyn ExecutionBackend>> {
        self.backends.get(mode).ok_or(TrackerError::NoBackend(mode))
    }

    /// Load a record under its lock. Locks of unknown and terminal records
    /// are dropped from the map since nothing will write them again.
    /// 在锁内加载记录；不存在或已终态记录的锁会从映射中移除。
    async fn load(&self, id: &Uuid) -> TrackerResult<ExecutedOperation> {
        match self.executions.get(id).await? {
            Some(record) => {
                if record.is_terminal() {
                    self.locks.remove(id);
                }
                Ok(record)
            }
            None => {
                self.locks.remove(id);
                Err(TrackerError::NotFound(*id))
            }
        }
    }

    async fn save(&self, record: ExecutedOperation, expected_version: u64) -> TrackerResult<ExecutedOperation> {
        let id = record.id;
        let status = record.status;
        match self.executions.update(record, expected_version).await {
            Ok(saved) => {
                if status.is_terminal() {
                    self.locks.remove(&id);
                }
                Ok(saved)
            }
            Err(StorageError::VersionConflict { .. }) => Err(TrackerError::Conflict(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll the backend once and apply the resulting transition
    /// 轮询后端一次并应用相应的状态转换
    pub async fn advance(&self, id: &Uuid) -> TrackerResult<ExecutedOperation> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let record = self.load(id).await?;
        if record.is_terminal() {
            debug!(execution_id = %id, status = %record.status, "already terminal");
            return Ok(record);
        }
        let expected_version = record.version;
        let backend = self.backend_for(record.mode)?;

        let status = match backend.poll(&record).await {
            Ok(status) => status,
            Err(e) => {
                if record.status == ExecutionStatus::Running {
                    warn!(execution_id = %id, error = %e, "backend unreachable, status unknown");
                    let mut updated = record;
                    updated.warnings.push(format!("status check failed: {}", e));
                    transition(&mut updated, ExecutionStatus::Unknown)?;
                    return self.save(updated, expected_version).await;
                }
                warn!(execution_id = %id, status = %record.status, error = %e, "status check failed");
                return Ok(record);
            }
        };

        let mut updated = record.clone();
        let mut registered = Vec::new();
        match status {
            BackendStatus::Pending => return Ok(record),
            BackendStatus::Running => {
                if record.status == ExecutionStatus::Running {
                    return Ok(record);
                }
                transition(&mut updated, ExecutionStatus::Running)?;
            }
            BackendStatus::Failed(message) => {
                fail(&mut updated, &JobFailure::Backend(message))?;
            }
            BackendStatus::Succeeded => {
                match self.finish(backend.as_ref(), &record).await {
                    Ok(collected) => {
                        updated.outputs = Some(collected.outputs);
                        updated.warnings.extend(collected.warnings);
                        registered = collected.registered;
                        transition(&mut updated, ExecutionStatus::Finished)?;
                    }
                    Err(JobFailure::Unreachable(message)) => {
                        warn!(execution_id = %id, error = %message, "outputs not available yet");
                        return Ok(record);
                    }
                    Err(failure) => fail(&mut updated, &failure)?,
                }
            }
        }

        let saved = match self.save(updated, expected_version).await {
            Ok(saved) => saved,
            Err(e) => {
                if !registered.is_empty() {
                    warn!(
                        execution_id = %id,
                        resources = registered.len(),
                        error = %e,
                        "record not saved, deactivating output resources"
                    );
                    self.collector.retire(&registered).await;
                }
                return Err(e);
            }
        };
        info!(
            execution_id = %id,
            from = %record.status,
            to = %saved.status,
            "execution status changed"
        );
        Ok(saved)
    }

    async fn finish(
        &self,
        backend: &dyn ExecutionBackend,
        record: &ExecutedOperation,
    ) -> Result<super::manifest::CollectedOutputs, JobFailure> {
        let operation = self
            .operations
            .get(&record.operation_id)
            .await
            .map_err(|e| JobFailure::Backend(e.to_string()))?
            .ok_or_else(|| {
                JobFailure::Backend(format!("operation {} no longer exists", record.operation_id))
            })?;
        let manifest = backend.collect_outputs(record).await?;
        self.collector
            .collect(&operation, record, &manifest, |key, raw| {
                backend.output_path(record, key, raw)
            })
            .await
    }

    /// Advance every non-terminal record, at most `max_concurrent` at a time
    /// 推进所有非终态记录，最多同时推进`max_concurrent`条
    pub async fn advance_all(&self) -> TrackerResult<Vec<(Uuid, TrackerResult<ExecutionStatus>)>> {
        let pending: Vec<Uuid> = self
            .executions
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .map(|r| r.id)
            .collect();
        debug!(count = pending.len(), "advancing executions");

        let results = futures::future::join_all(pending.into_iter().map(|id| async move {
            // Acquire advance permit / 获取推进许可
            let result = match self.advance_permits.acquire().await {
                Ok(_permit) => self.advance(&id).await.map(|r| r.status),
                Err(_) => Err(TrackerError::Conflict(id)),
            };
            if let Err(e) = &result {
                warn!(execution_id = %id, error = %e, "advance failed");
            }
            (id, result)
        }))
        .await;
        Ok(results)
    }

    /// Ask the backend to stop a job; the record is marked failed only once
    /// the backend confirms.
    /// 请求后端停止作业；仅在后端确认后才将记录标记为失败。
    pub async fn cancel(&self, id: &Uuid) -> TrackerResult<ExecutedOperation> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let record = self.load(id).await?;
        if record.is_terminal() {
            return Err(TrackerError::AlreadyTerminal {
                id: *id,
                status: record.status,
            });
        }
        let backend = self.backend_for(record.mode)?;
        if !backend.cancel(&record).await? {
            return Err(TrackerError::CancelNotConfirmed(*id));
        }
        let expected_version = record.version;
        let mut updated = record;
        fail(&mut updated, &JobFailure::Cancelled)?;
        let saved = self.save(updated, expected_version).await?;
        info!(execution_id = %id, "execution cancelled");
        Ok(saved)
    }
}
