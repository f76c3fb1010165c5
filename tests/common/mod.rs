//! Shared helpers for engine integration tests / 引擎集成测试的共享辅助工具
#![allow(dead_code)]

use async_trait::async_trait;
use mev_engine::config::MevConfig;
use mev_engine::execution::backend::confined_path;
use mev_engine::execution::{
    BackendRegistry, BackendStatus, DispatchError, DispatchRequest, ExecutedOperation,
    ExecutionBackend, JobFailure,
};
use mev_engine::operations::{ExecutionMode, UnverifiedImageResolver};
use mev_engine::storage::MemoryKvStore;
use mev_engine::MevService;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Local backend that renders the entrypoint but runs nothing; the test
/// decides what the "container" reports.
/// 渲染入口命令但不运行任何内容的本地后端；由测试决定“容器”的状态。
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    pub commands: Mutex<Vec<Vec<String>>>,
    pub status: Mutex<Option<BackendStatus>>,
    pub reject_dispatch: Mutex<Option<DispatchError>>,
}

impl ScriptedBackend {
    pub fn set_status(&self, status: BackendStatus) {
        *self.status.lock() = Some(status);
    }

    pub fn last_command(&self) -> Option<Vec<String>> {
        self.commands.lock().last().cloned()
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::LocalDocker
    }

    async fn dispatch(&self, request: DispatchRequest<'_>) -> Result<String, DispatchError> {
        if let Some(e) = self.reject_dispatch.lock().clone() {
            return Err(e);
        }
        let template = request
            .operation
            .entrypoint()
            .ok_or_else(|| DispatchError::Rejected("no entrypoint".to_string()))?
            .map_err(|e| DispatchError::Rejected(e.to_string()))?;
        let exec_dir = request.execution_dir.display().to_string();
        let job_id = request.execution_id.to_string();
        let argv = template
            .render_args(|key| match key {
                "execution_dir" => Some(Value::String(exec_dir.clone())),
                "job_id" => Some(Value::String(job_id.clone())),
                other => request.inputs.get(other).cloned(),
            })
            .map_err(|e| DispatchError::Rejected(e.to_string()))?;
        self.commands.lock().push(argv);
        Ok(format!("container-{}", request.execution_id))
    }

    async fn poll(&self, _job: &ExecutedOperation) -> Result<BackendStatus, DispatchError> {
        Ok(self.status.lock().clone().unwrap_or(BackendStatus::Pending))
    }

    async fn collect_outputs(&self, job: &ExecutedOperation) -> Result<Value, JobFailure> {
        let path = job.execution_dir.join("outputs.json");
        let raw = std::fs::read_to_string(&path).map_err(|_| JobFailure::MissingManifest {
            path: path.display().to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| JobFailure::MalformedManifest(e.to_string()))
    }

    async fn cancel(&self, _job: &ExecutedOperation) -> Result<bool, DispatchError> {
        Ok(true)
    }

    fn output_path(
        &self,
        job: &ExecutedOperation,
        key: &str,
        raw: &str,
    ) -> Result<PathBuf, JobFailure> {
        confined_path(&job.execution_dir, Path::new(raw)).map_err(|reason| JobFailure::InvalidOutput {
            key: key.to_string(),
            reason,
        })
    }
}

/// Config rooted in a scratch directory / 以临时目录为根的配置
pub fn test_config(root: &Path) -> MevConfig {
    let mut config = MevConfig::default();
    config.storage.backend = "memory".to_string();
    config.execution.executed_operations_dir = root.join("executed");
    config.execution.resource_root = root.join("resources");
    config.registry.verify_images = false;
    config
}

/// Service with a memory store and the given backends / 使用内存存储与指定后端的服务
pub fn service_with(root: &Path, backends: BackendRegistry) -> MevService {
    MevService::new(
        test_config(root),
        Arc::new(MemoryKvStore::new()),
        backends,
        Arc::new(UnverifiedImageResolver),
    )
}

/// Service whose local backend is scripted / 本地后端可脚本化的服务
pub fn scripted_service(root: &Path) -> (MevService, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::default());
    let service = service_with(root, BackendRegistry::new().with(backend.clone()));
    (service, backend)
}

/// Write a file under `root`, creating parents / 在`root`下写文件并创建父目录
pub fn write_file(root: &Path, rel: &str, content: &str) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}
