//! Execution dispatch and job lifecycle
//! 执行分发与作业生命周期
//!
//! An [`ExecutedOperation`] records one run of an operation: the arguments it
//! was given, the backend job handle, and its progress through the status
//! lifecycle. Records are created only after a successful dispatch and are
//! advanced by the [`JobTracker`].
//! 执行记录仅在分发成功后创建，并由作业跟踪器推进。

pub mod backend;
pub mod cromwell;
pub mod docker;
pub mod manifest;
pub mod tracker;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::conversion::ConvertedArguments;
use crate::operations::{ExecutionMode, Operation};
use crate::storage::{Record, EXECUTED_OPERATION_PREFIX};

pub use backend::{
    BackendRegistry, BackendStatus, DispatchError, DispatchRequest, ExecutionBackend, JobFailure,
};
pub use cromwell::CromwellBackend;
pub use docker::LocalDockerBackend;
pub use manifest::OutputCollector;
pub use tracker::{JobTracker, TrackerError};

/// Execution status / 执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Submitted,
    Running,
    Finished,
    Failed,
    /// Backend could not be reached while the job was running
    /// 作业运行期间无法联系后端
    Unknown,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Finished | ExecutionStatus::Failed)
    }

    /// Allowed lifecycle edges / 允许的生命周期转换
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Submitted, Running | Finished | Failed)
                | (Running, Finished | Failed | Unknown)
                | (Unknown, Running | Finished | Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Submitted => "submitted",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Finished => "finished",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run of an operation / 操作的一次执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedOperation {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub owner: Option<String>,
    pub workspace: Option<Uuid>,
    /// Container id or workflow id / 容器ID或工作流ID
    pub job_handle: String,
    pub mode: ExecutionMode,
    /// Arguments as validated and converted at submission / 提交时的参数快照
    pub inputs: ConvertedArguments,
    pub status: ExecutionStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Typed outputs, present only once finished / 类型化输出，仅在完成后存在
    pub outputs: Option<IndexMap<String, Value>>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Scratch directory of the run / 本次执行的工作目录
    pub execution_dir: PathBuf,
    #[serde(default)]
    pub version: u64,
}

impl ExecutedOperation {
    /// Record for a job the backend has just accepted / 后端刚接受的作业记录
    pub fn submitted(
        id: Uuid,
        operation: &Operation,
        owner: Option<String>,
        workspace: Option<Uuid>,
        inputs: ConvertedArguments,
        job_handle: String,
        execution_dir: PathBuf,
    ) -> Self {
        Self {
            id,
            operation_id: operation.id,
            owner,
            workspace,
            job_handle,
            mode: operation.mode,
            inputs,
            status: ExecutionStatus::Submitted,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            outputs: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            execution_dir,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Record for ExecutedOperation {
    const PREFIX: &'static str = EXECUTED_OPERATION_PREFIX;

    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionStatus::*;

    #[test]
    fn test_lifecycle_edges() {
        let all = [Submitted, Running, Finished, Failed, Unknown];
        for next in all {
            assert!(!Finished.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
            assert!(!next.can_transition_to(Submitted));
        }
        assert!(Submitted.can_transition_to(Finished));
        assert!(!Submitted.can_transition_to(Unknown));
        assert!(Running.can_transition_to(Unknown));
        assert!(Unknown.can_transition_to(Running));
        assert!(!Unknown.can_transition_to(Unknown));
    }

    #[test]
    fn test_terminal_states() {
        assert!(Finished.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Unknown.is_terminal());
        assert_eq!(serde_json::to_value(Unknown).unwrap(), serde_json::json!("unknown"));
    }
}
