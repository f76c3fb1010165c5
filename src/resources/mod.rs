//! Data resources as seen by the engine
//! 引擎视角下的数据资源
//!
//! The engine does not own user files. It only needs to look up a resource's
//! current path and type when converting arguments, to register new resources
//! produced by finished jobs, and to (re-)validate a resource against a type.
//! 引擎不拥有用户文件，只需在转换参数时查询资源路径与类型、登记作业产出的新资源，
//! 以及针对类型（重新）验证资源。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::resource_types::{ResourceMetadata, ResourceTypeRegistry, ResourceValidationError};
use crate::storage::{Record, Repository, StorageError, RESOURCE_PREFIX};

/// Data resource record / 数据资源记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Uuid,
    pub name: String,
    /// Location of the stored file / 存储文件的位置
    pub path: PathBuf,
    /// Last successfully validated type, `None` before any validation
    /// 最近一次验证成功的类型，验证前为`None`
    pub resource_type: Option<String>,
    #[serde(default)]
    pub metadata: Option<ResourceMetadata>,
    pub owner: Option<String>,
    pub workspace: Option<Uuid>,
    pub is_active: bool,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Resource {
    /// Create an unvalidated, active resource / 创建未验证的活动资源
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, owner: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            path: path.into(),
            resource_type: None,
            metadata: None,
            owner,
            workspace: None,
            is_active: true,
            version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_workspace(mut self, workspace: Option<Uuid>) -> Self {
        self.workspace = workspace;
        self
    }
}

impl Record for Resource {
    const PREFIX: &'static str = RESOURCE_PREFIX;

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

/// Resource lookup and persistence / 资源查询与持久化
#[async_trait]
pub trait ResourceStore: Send + Sync + Debug {
    async fn get(&self, id: &Uuid) -> Result<Option<Resource>, StorageError>;

    async fn create(&self, resource: Resource) -> Result<Resource, StorageError>;

    /// Replace the record if the stored version equals `expected_version`
    /// 若存储版本等于期望版本则替换记录
    async fn update(
        &self,
        resource: Resource,
        expected_version: u64,
    ) -> Result<Resource, StorageError>;
}

#[async_trait]
impl ResourceStore for Repository<Resource> {
    async fn get(&self, id: &Uuid) -> Result<Option<Resource>, StorageError> {
        Repository::get(self, id).await
    }

    async fn create(&self, resource: Resource) -> Result<Resource, StorageError> {
        self.insert(&resource).await?;
        Ok(resource)
    }

    async fn update(
        &self,
        resource: Resource,
        expected_version: u64,
    ) -> Result<Resource, StorageError> {
        Repository::update(self, resource, expected_version).await
    }
}

/// Resource service error / 资源服务错误
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Resource not found: {0}")]
    NotFound(Uuid),

    #[error("Resource {id} failed validation as {tag}: {source}")]
    Validation {
        id: Uuid,
        tag: String,
        #[source]
        source: ResourceValidationError,
    },

    #[error("Output file {path} failed validation as {tag}: {source}")]
    OutputValidation {
        path: String,
        tag: String,
        #[source]
        source: ResourceValidationError,
    },

    #[error("Resource {id} was modified concurrently")]
    Conflict { id: Uuid },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Validation and registration of data resources / 数据资源的验证与登记
#[derive(Debug, Clone)]
pub struct ResourceService {
    store: Arc<dyn ResourceStore>,
    registry: Arc<ResourceTypeRegistry>,
}

impl ResourceService {
    pub fn new(store: Arc<dyn ResourceStore>, registry: Arc<ResourceTypeRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ResourceTypeRegistry> {
        &self.registry
    }

    pub async fn get(&self, id: &Uuid) -> Result<Resource, ResourceError> {
        self.store
            .get(id)
            .await?
            .ok_or(ResourceError::NotFound(*id))
    }

    async fn run_validator(
        &self,
        path: PathBuf,
        tag: &str,
    ) -> Result<crate::resource_types::ValidatedResource, ResourceValidationError> {
        let registry = self.registry.clone();
        let tag = tag.to_string();
        match tokio::task::spawn_blocking(move || registry.validate(&path, &tag)).await {
            Ok(result) => result,
            Err(e) => Err(ResourceValidationError::Format {
                message: format!("validator task failed: {}", e),
            }),
        }
    }

    /// Validate a resource as `tag`. On success the new type, metadata and
    /// normalized path are stored; on failure the record is left untouched,
    /// so its type stays at the last successfully validated value.
    /// 将资源验证为`tag`。成功则保存新类型、元数据与规范路径；失败则不修改记录。
    pub async fn validate_resource(&self, id: &Uuid, tag: &str) -> Result<Resource, ResourceError> {
        let snapshot = self.get(id).await?;
        self.validate_snapshot(snapshot, tag).await
    }

    pub(crate) async fn validate_snapshot(
        &self,
        snapshot: Resource,
        tag: &str,
    ) -> Result<Resource, ResourceError> {
        let id = snapshot.id;
        let expected_version = snapshot.version;
        let validated = match self.run_validator(snapshot.path.clone(), tag).await {
            Ok(v) => v,
            Err(source) => {
                warn!(
                    resource_id = %id,
                    tag = %tag,
                    kept_type = ?snapshot.resource_type,
                    error = %source,
                    "resource validation failed, keeping previous type"
                );
                return Err(ResourceError::Validation {
                    id,
                    tag: tag.to_string(),
                    source,
                });
            }
        };

        let mut updated = snapshot;
        updated.resource_type = Some(validated.resource_type);
        updated.metadata = Some(validated.metadata);
        updated.path = validated.path;
        match self.store.update(updated, expected_version).await {
            Ok(stored) => {
                info!(resource_id = %id, tag = %tag, "resource type set");
                Ok(stored)
            }
            Err(StorageError::VersionConflict { .. }) => Err(ResourceError::Conflict { id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Validate a file produced by a job and register it as a new resource.
    /// Nothing is stored when validation fails.
    /// 验证作业产出的文件并登记为新资源；验证失败时不保存任何内容。
    pub async fn register_output(
        &self,
        path: PathBuf,
        tag: &str,
        name: impl Into<String>,
        owner: Option<String>,
        workspace: Option<Uuid>,
    ) -> Result<Resource, ResourceError> {
        let validated = self.run_validator(path.clone(), tag).await.map_err(|source| {
            ResourceError::OutputValidation {
                path: path.display().to_string(),
                tag: tag.to_string(),
                source,
            }
        })?;
        let mut resource = Resource::new(name, validated.path, owner).with_workspace(workspace);
        resource.resource_type = Some(validated.resource_type);
        resource.metadata = Some(validated.metadata);
        let created = self.store.create(resource).await?;
        info!(resource_id = %created.id, tag = %tag, "output resource registered");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;

    fn service() -> ResourceService {
        let store: Arc<dyn ResourceStore> =
            Arc::new(Repository::<Resource>::new(Arc::new(MemoryKvStore::new())));
        ResourceService::new(store, Arc::new(ResourceTypeRegistry::with_defaults()))
    }

    #[tokio::test]
    async fn test_failed_revalidation_keeps_previous_type() {
        let svc = service();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.tsv");
        std::fs::write(&path, "gene\ts1\ts2\ng1\t1.5\t2\ng2\t3\t4\n").unwrap();

        let resource = svc
            .store()
            .create(Resource::new("counts.tsv", &path, Some("alice".into())))
            .await
            .unwrap();
        assert!(resource.resource_type.is_none());

        let validated = svc.validate_resource(&resource.id, "MTX").await.unwrap();
        assert_eq!(validated.resource_type.as_deref(), Some("MTX"));
        let obs = validated.metadata.unwrap().observation_set.unwrap();
        assert_eq!(obs.ids(), vec!["s1", "s2"]);

        // Fractional values are not raw counts / 小数值不是原始计数
        let err = svc
            .validate_resource(&resource.id, "RNASEQ_COUNT_MTX")
            .await
            .unwrap_err();
        assert!(matches!(err, ResourceError::Validation { .. }));

        let after = svc.get(&resource.id).await.unwrap();
        assert_eq!(after.resource_type.as_deref(), Some("MTX"));
        assert_eq!(after.version, 1);
    }

    #[tokio::test]
    async fn test_first_validation_failure_leaves_type_unset() {
        let svc = service();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.json");
        std::fs::write(&path, "{broken").unwrap();
        let resource = svc
            .store()
            .create(Resource::new("notes.json", &path, None))
            .await
            .unwrap();

        assert!(svc.validate_resource(&resource.id, "JSON").await.is_err());
        assert!(svc.get(&resource.id).await.unwrap().resource_type.is_none());
    }

    #[tokio::test]
    async fn test_stale_snapshot_conflicts() {
        let svc = service();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, "{}").unwrap();
        let resource = svc
            .store()
            .create(Resource::new("doc.json", &path, None))
            .await
            .unwrap();
        let stale = resource.clone();

        svc.validate_resource(&resource.id, "JSON").await.unwrap();
        let err = svc.validate_snapshot(stale, "*").await.unwrap_err();
        assert!(matches!(err, ResourceError::Conflict { .. }));
        assert_eq!(
            svc.get(&resource.id).await.unwrap().resource_type.as_deref(),
            Some("JSON")
        );
    }

    #[tokio::test]
    async fn test_register_output() {
        let svc = service();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pca.csv");
        std::fs::write(&path, "sample,pc1,pc2\ns1,0.1,0.2\ns2,0.3,0.4\n").unwrap();

        let created = svc
            .register_output(path, "ANN", "pca_coordinates", Some("alice".into()), None)
            .await
            .unwrap();
        assert_eq!(created.resource_type.as_deref(), Some("ANN"));
        assert_eq!(created.path.extension().unwrap(), "tsv");
        assert!(svc.get(&created.id).await.is_ok());

        let missing = dir.path().join("absent.tsv");
        assert!(matches!(
            svc.register_output(missing, "ANN", "x", None, None).await,
            Err(ResourceError::OutputValidation { .. })
        ));
    }
}
