//! Engine service facade
//! 引擎服务门面
//!
//! `MevService` owns the registries, repositories, backends and tracker and
//! exposes the operations a front end needs: ingest operations, submit runs,
//! advance and cancel them, and look things up.
//! `MevService`持有注册表、仓库、后端与跟踪器，并提供前端所需的操作。

use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MevConfig;
use crate::conversion::{self, ArgumentValidationError, ConverterRegistry};
use crate::execution::{
    BackendRegistry, CromwellBackend, DispatchError, DispatchRequest, ExecutedOperation,
    ExecutionStatus, JobTracker, LocalDockerBackend, OutputCollector, TrackerError,
};
use crate::operations::{
    ImageResolver, Ingestor, Operation, OperationFiles, RegistryImageResolver, SourceRef,
    SpecParseError, UnverifiedImageResolver,
};
use crate::resource_types::ResourceTypeRegistry;
use crate::resources::{Resource, ResourceError, ResourceService, ResourceStore};
use crate::storage::kv::{create_kv_store_from_config, KvStore, KvStoreConfig};
use crate::storage::{Repository, StorageError};

/// Service-level error / 服务级错误
#[derive(Debug, thiserror::Error)]
pub enum MevError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Spec(#[from] SpecParseError),

    #[error(transparent)]
    Validation(#[from] ArgumentValidationError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Resource(ResourceError),

    #[error(transparent)]
    Tracker(TrackerError),
}

pub type MevResult<T> = Result<T, MevError>;

impl From<ResourceError> for MevError {
    fn from(e: ResourceError) -> Self {
        match e {
            ResourceError::NotFound(id) => MevError::NotFound { kind: "Resource", id },
            ResourceError::Conflict { .. } => MevError::Conflict(e.to_string()),
            other => MevError::Resource(other),
        }
    }
}

impl From<TrackerError> for MevError {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::NotFound(id) => MevError::NotFound {
                kind: "Executed operation",
                id,
            },
            TrackerError::Conflict(_) | TrackerError::AlreadyTerminal { .. } => {
                MevError::Conflict(e.to_string())
            }
            other => MevError::Tracker(other),
        }
    }
}

/// A request to run an operation / 运行操作的请求
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub operation_id: Uuid,
    /// JSON object keyed by input name / 以输入名为键的JSON对象
    pub arguments: Value,
    pub owner: Option<String>,
    pub workspace: Option<Uuid>,
}

impl SubmitRequest {
    pub fn new(operation_id: Uuid, arguments: Value) -> Self {
        Self {
            operation_id,
            arguments,
            owner: None,
            workspace: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_workspace(mut self, workspace: Uuid) -> Self {
        self.workspace = Some(workspace);
        self
    }
}

/// Engine service / 引擎服务
#[derive(Debug, Clone)]
pub struct MevService {
    config: Arc<MevConfig>,
    operations: Arc<Repository<Operation>>,
    executions: Arc<Repository<ExecutedOperation>>,
    resource_repo: Arc<Repository<Resource>>,
    resources: ResourceService,
    converters: Arc<ConverterRegistry>,
    backends: Arc<BackendRegistry>,
    ingestor: Ingestor,
    tracker: Arc<JobTracker>,
}

impl MevService {
    /// Build the service and its backends from configuration
    /// 根据配置构建服务及其后端
    pub async fn from_config(config: MevConfig) -> MevResult<Self> {
        let store = create_kv_store_from_config(&KvStoreConfig::from_storage_config(&config.storage))
            .await?;

        let mut backends = BackendRegistry::new();
        if config.docker.enabled {
            backends.register(Arc::new(LocalDockerBackend::new(
                config.docker.clone(),
                config.execution.resource_root.clone(),
            )));
        }
        if config.cromwell.enabled {
            let mut cromwell =
                CromwellBackend::new(&config.cromwell.base_url, config.cromwell.timeout())?;
            if let Some(root) = &config.cromwell.outputs_root {
                cromwell = cromwell.with_outputs_root(root.clone());
            }
            backends.register(Arc::new(cromwell));
        }

        let images: Arc<dyn ImageResolver> = if config.registry.verify_images {
            Arc::new(
                RegistryImageResolver::new(&config.registry.base_url, config.registry.timeout())
                    .map_err(|e| MevError::Config(e.to_string()))?,
            )
        } else {
            Arc::new(UnverifiedImageResolver)
        };

        info!(
            storage = %config.storage.backend,
            modes = ?backends.modes(),
            verify_images = config.registry.verify_images,
            "engine service configured"
        );
        Ok(Self::new(config, store, backends, images))
    }

    /// Assemble the service from explicit components / 由显式组件组装服务
    pub fn new(
        config: MevConfig,
        store: Arc<dyn KvStore>,
        backends: BackendRegistry,
        images: Arc<dyn ImageResolver>,
    ) -> Self {
        let resource_types = Arc::new(ResourceTypeRegistry::with_defaults());
        let converters = Arc::new(ConverterRegistry::with_defaults());
        Self::with_registries(config, store, backends, images, resource_types, converters)
    }

    /// Like [`MevService::new`] with caller-built registries
    /// 与`new`相同，但使用调用方构建的注册表
    pub fn with_registries(
        config: MevConfig,
        store: Arc<dyn KvStore>,
        backends: BackendRegistry,
        images: Arc<dyn ImageResolver>,
        resource_types: Arc<ResourceTypeRegistry>,
        converters: Arc<ConverterRegistry>,
    ) -> Self {
        let operations = Arc::new(Repository::new(store.clone()));
        let executions = Arc::new(Repository::new(store.clone()));
        let resource_repo = Arc::new(Repository::new(store));
        let resources = ResourceService::new(resource_repo.clone(), resource_types.clone());
        let backends = Arc::new(backends);
        let ingestor = Ingestor::new(
            resource_types,
            converters.clone(),
            images,
            config.docker.image_repository.clone(),
            config.registry.timeout(),
        );
        let tracker = Arc::new(JobTracker::new(
            executions.clone(),
            operations.clone(),
            backends.clone(),
            OutputCollector::new(resources.clone()),
            config.execution.max_concurrent_advances,
        ));
        Self {
            config: Arc::new(config),
            operations,
            executions,
            resource_repo,
            resources,
            converters,
            backends,
            ingestor,
            tracker,
        }
    }

    pub fn config(&self) -> &MevConfig {
        &self.config
    }

    pub fn resources(&self) -> &ResourceService {
        &self.resources
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    // ---- Operations / 操作 ----

    /// Ingest and store an operation / 摄取并保存操作
    pub async fn ingest(
        &self,
        document: &Value,
        source: SourceRef,
        files: OperationFiles,
    ) -> MevResult<Operation> {
        let operation = self.ingestor.ingest(document, source, files).await?;
        self.operations.insert(&operation).await?;
        Ok(operation)
    }

    /// Ingest and store an operation directory / 摄取并保存操作目录
    pub async fn ingest_dir(&self, dir: &Path, source: SourceRef) -> MevResult<Operation> {
        let operation = self.ingestor.ingest_dir(dir, source).await?;
        self.operations.insert(&operation).await?;
        Ok(operation)
    }

    /// Ingest every operation directory listed in the configuration; one
    /// failing directory does not stop the others.
    /// 摄取配置中列出的所有操作目录；单个目录失败不影响其他目录。
    pub async fn ingest_configured(&self) -> Vec<(PathBuf, MevResult<Operation>)> {
        let mut results = Vec::with_capacity(self.config.operations.len());
        for entry in &self.config.operations {
            let source = SourceRef::new(&entry.repository_url, &entry.commit_hash);
            let result = self.ingest_dir(&entry.dir, source).await;
            match &result {
                Ok(op) => info!(dir = %entry.dir.display(), operation_id = %op.id, "configured operation ingested"),
                Err(e) => error!(dir = %entry.dir.display(), error = %e, "configured operation rejected"),
            }
            results.push((entry.dir.clone(), result));
        }
        results
    }

    pub async fn get_operation(&self, id: &Uuid) -> MevResult<Operation> {
        self.operations
            .get(id)
            .await?
            .ok_or(MevError::NotFound {
                kind: "Operation",
                id: *id,
            })
    }

    pub async fn list_operations(&self) -> MevResult<Vec<Operation>> {
        let mut ops = self.operations.list().await?;
        ops.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(ops)
    }

    /// Every argument problem of a prospective submission / 预提交的全部参数问题
    pub async fn check_arguments(
        &self,
        operation_id: &Uuid,
        arguments: &Value,
    ) -> MevResult<Vec<ArgumentValidationError>> {
        let operation = self.get_operation(operation_id).await?;
        let result = conversion::validate_all(
            &operation,
            arguments,
            self.resource_repo.as_ref(),
            &self.converters,
        )
        .await;
        Ok(result.err().unwrap_or_default())
    }

    // ---- Executions / 执行 ----

    /// Validate, convert and dispatch. A record is stored only when the
    /// backend accepted the job.
    /// 验证、转换并分发；仅当后端接受作业时才保存记录。
    pub async fn submit(&self, request: SubmitRequest) -> MevResult<ExecutedOperation> {
        let operation = self.get_operation(&request.operation_id).await?;
        if operation.workspace_operation && request.workspace.is_none() {
            return Err(ArgumentValidationError::new(
                "workspace",
                "this operation must be run inside a workspace",
            )
            .into());
        }
        let backend = self.backends.get(operation.mode).ok_or_else(|| {
            MevError::Config(format!("no backend enabled for mode {}", operation.mode))
        })?;

        let inputs = conversion::validate_and_convert(
            &operation,
            &request.arguments,
            self.resource_repo.as_ref(),
            &self.converters,
        )
        .await?;

        let execution_id = Uuid::new_v4();
        let execution_dir = self.prepare_execution_dir(&execution_id).await?;
        let dispatched = backend
            .dispatch(DispatchRequest {
                execution_id,
                operation: &operation,
                inputs: &inputs,
                execution_dir: &execution_dir,
            })
            .await;
        let job_handle = match dispatched {
            Ok(handle) => handle,
            Err(e) => {
                warn!(operation_id = %operation.id, error = %e, "dispatch failed");
                if let Err(cleanup) = tokio::fs::remove_dir_all(&execution_dir).await {
                    debug!(dir = %execution_dir.display(), error = %cleanup, "execution dir cleanup failed");
                }
                return Err(e.into());
            }
        };

        let record = ExecutedOperation::submitted(
            execution_id,
            &operation,
            request.owner,
            request.workspace,
            inputs,
            job_handle,
            execution_dir,
        );
        self.executions.insert(&record).await?;
        info!(
            execution_id = %record.id,
            operation_id = %operation.id,
            mode = %operation.mode,
            job = %record.job_handle,
            "execution submitted"
        );
        Ok(record)
    }

    async fn prepare_execution_dir(&self, execution_id: &Uuid) -> MevResult<PathBuf> {
        let dir = self
            .config
            .execution
            .executed_operations_dir
            .join(execution_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| MevError::Io(format!("{}: {}", dir.display(), e)))?;
        tokio::fs::canonicalize(&dir)
            .await
            .map_err(|e| MevError::Io(format!("{}: {}", dir.display(), e)))
    }

    pub async fn advance(&self, id: &Uuid) -> MevResult<ExecutedOperation> {
        Ok(self.tracker.advance(id).await?)
    }

    pub async fn advance_all(&self) -> MevResult<Vec<(Uuid, Result<ExecutionStatus, TrackerError>)>> {
        Ok(self.tracker.advance_all().await?)
    }

    pub async fn cancel(&self, id: &Uuid) -> MevResult<ExecutedOperation> {
        Ok(self.tracker.cancel(id).await?)
    }

    pub async fn get_execution(&self, id: &Uuid) -> MevResult<ExecutedOperation> {
        self.executions
            .get(id)
            .await?
            .ok_or(MevError::NotFound {
                kind: "Executed operation",
                id: *id,
            })
    }

    /// Executions, optionally of one operation, oldest first
    /// 执行记录（可按操作过滤），按提交时间排序
    pub async fn list_executions(
        &self,
        operation_id: Option<&Uuid>,
    ) -> MevResult<Vec<ExecutedOperation>> {
        let mut records: Vec<ExecutedOperation> = self
            .executions
            .list()
            .await?
            .into_iter()
            .filter(|r| operation_id.map_or(true, |id| &r.operation_id == id))
            .collect();
        records.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(records)
    }

    /// Run `advance_all` every poll interval until `shutdown` resolves
    /// 每个轮询间隔运行一次`advance_all`，直到`shutdown`完成
    pub async fn poll_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.execution.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("poller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.advance_all().await {
                        Ok(results) => {
                            let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                            debug!(advanced = results.len(), failed, "poll pass complete");
                        }
                        Err(e) => error!(error = %e, "poll pass failed"),
                    }
                }
            }
        }
    }

    // ---- Resources / 资源 ----

    /// Register an unvalidated resource file / 登记未验证的资源文件
    pub async fn add_resource(
        &self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        owner: Option<String>,
    ) -> MevResult<Resource> {
        let resource = Resource::new(name, path, owner);
        Ok(ResourceStore::create(self.resource_repo.as_ref(), resource).await?)
    }

    /// Set a resource's type, keeping the previous type on failure
    /// 设置资源类型；失败时保留之前的类型
    pub async fn validate_resource(&self, id: &Uuid, tag: &str) -> MevResult<Resource> {
        Ok(self.resources.validate_resource(id, tag).await?)
    }

    pub async fn get_resource(&self, id: &Uuid) -> MevResult<Resource> {
        Ok(self.resources.get(id).await?)
    }
}
