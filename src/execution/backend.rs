//! Execution backend abstraction
//! 执行后端抽象

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use super::ExecutedOperation;
use crate::conversion::ConvertedArguments;
use crate::operations::{ExecutionMode, Operation};

/// Dispatch error / 分发错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Backend could not be contacted; not retried
    /// 无法联系后端，不重试
    #[error("execution backend unreachable: {0}")]
    Unreachable(String),

    /// Backend refused the job; the caller may retry
    /// 后端拒绝了作业，调用方可以重试
    #[error("execution backend rejected the job: {0}")]
    Rejected(String),
}

/// Reason a job ended in `failed` / 作业以失败结束的原因
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobFailure {
    #[error("job failed: {0}")]
    Backend(String),

    #[error("output manifest not found at {path}")]
    MissingManifest { path: String },

    #[error("malformed output manifest: {0}")]
    MalformedManifest(String),

    #[error("output '{key}' is missing from the manifest")]
    MissingOutput { key: String },

    #[error("output '{key}' is invalid: {reason}")]
    InvalidOutput { key: String, reason: String },

    /// Outputs could not be fetched right now; the record is left as is
    /// 暂时无法获取输出，记录保持不变
    #[error("outputs could not be fetched: {0}")]
    Unreachable(String),

    #[error("job was cancelled")]
    Cancelled,
}

/// Job state as reported by a backend / 后端报告的作业状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    /// Accepted but not started / 已接受但未开始
    Pending,
    Running,
    Succeeded,
    Failed(String),
}

/// Everything a backend needs to start a job / 启动作业所需的全部信息
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    pub execution_id: Uuid,
    pub operation: &'a Operation,
    pub inputs: &'a ConvertedArguments,
    pub execution_dir: &'a Path,
}

/// Runs jobs for one execution mode. Dispatch starts a job and returns its
/// handle without waiting for it.
/// 为一种执行模式运行作业；分发只启动作业并返回句柄，不等待完成。
#[async_trait]
pub trait ExecutionBackend: Send + Sync + Debug {
    fn mode(&self) -> ExecutionMode;

    async fn dispatch(&self, request: DispatchRequest<'_>) -> Result<String, DispatchError>;

    async fn poll(&self, job: &ExecutedOperation) -> Result<BackendStatus, DispatchError>;

    /// Flat output manifest of a finished job / 已完成作业的扁平输出清单
    async fn collect_outputs(&self, job: &ExecutedOperation) -> Result<Value, JobFailure>;

    /// Returns true once the backend confirms the job was stopped
    /// 后端确认作业已停止时返回true
    async fn cancel(&self, job: &ExecutedOperation) -> Result<bool, DispatchError>;

    /// Host path of a file named for output `key` in the manifest. Files
    /// must stay inside the execution directory.
    /// 清单中输出`key`所指文件的主机路径；文件必须位于执行目录内。
    fn output_path(
        &self,
        job: &ExecutedOperation,
        key: &str,
        raw: &str,
    ) -> Result<PathBuf, JobFailure> {
        confined_path(&job.execution_dir, Path::new(raw)).map_err(|reason| {
            JobFailure::InvalidOutput {
                key: key.to_string(),
                reason,
            }
        })
    }
}

/// Remove `.` and `..` components without touching the filesystem
/// 在不访问文件系统的情况下去除`.`与`..`组件
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Resolve `raw` against `base` and require the result to stay under `base`,
/// both lexically and after following symlinks of existing files.
/// 将`raw`相对`base`解析，并要求结果（词法上及解析符号链接后）位于`base`之内。
pub fn confined_path(base: &Path, raw: &Path) -> Result<PathBuf, String> {
    let base = normalize_lexically(base);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        base.join(raw)
    };
    let path = normalize_lexically(&joined);
    if path == base || !path.starts_with(&base) {
        return Err(format!(
            "path {} is outside {}",
            raw.display(),
            base.display()
        ));
    }
    if let (Ok(real), Ok(real_base)) = (std::fs::canonicalize(&path), std::fs::canonicalize(&base))
    {
        if !real.starts_with(&real_base) {
            return Err(format!(
                "path {} resolves outside {}",
                raw.display(),
                base.display()
            ));
        }
    }
    Ok(path)
}

/// Backends keyed by execution mode / 按执行模式索引的后端
#[derive(Debug, Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<ExecutionMode, Arc<dyn ExecutionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn ExecutionBackend>) {
        self.backends.insert(backend.mode(), backend);
    }

    pub fn with(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, mode: ExecutionMode) -> Option<Arc<dyn ExecutionBackend>> {
        self.backends.get(&mode).cloned()
    }

    pub fn modes(&self) -> Vec<ExecutionMode> {
        self.backends.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(normalize_lexically(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize_lexically(Path::new("a/../../b")), PathBuf::from("../b"));
    }

    #[test]
    fn test_confined_path_rejects_escapes() {
        let base = Path::new("/data/exec/7");
        assert_eq!(
            confined_path(base, Path::new("plots/./a.json")).unwrap(),
            PathBuf::from("/data/exec/7/plots/a.json")
        );
        assert_eq!(
            confined_path(base, Path::new("/data/exec/7/x.tsv")).unwrap(),
            PathBuf::from("/data/exec/7/x.tsv")
        );
        assert!(confined_path(base, Path::new("/etc/passwd")).is_err());
        assert!(confined_path(base, Path::new("../../../etc/shadow")).is_err());
        assert!(confined_path(base, Path::new("sub/../../8/x.tsv")).is_err());
        assert!(confined_path(base, Path::new("/data/exec/70/x.tsv")).is_err());
        assert!(confined_path(base, Path::new(".")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_confined_path_rejects_symlink_escape() {
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.tsv");
        std::fs::write(&secret, "gene\ts1\ng1\t1\n").unwrap();
        let exec = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(&secret, exec.path().join("link.tsv")).unwrap();
        std::fs::write(exec.path().join("real.tsv"), "x").unwrap();

        assert!(confined_path(exec.path(), Path::new("link.tsv")).is_err());
        assert!(confined_path(exec.path(), Path::new("real.tsv")).is_ok());
    }
}
