//! Storage layer for the MEV engine
//! MEV引擎的存储层
//!
//! Records (operations, executed operations, resources) are serialized as
//! JSON and kept in a [`KvStore`] under a per-type key prefix. Updates go
//! through an optimistic version check so concurrent writers cannot silently
//! overwrite each other.
//! 记录以JSON形式序列化并按类型前缀存放于KV存储中；更新经过乐观版本检查。

pub mod kv;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub use kv::{
    create_kv_store_from_config, KvKey, KvPair, KvStore, KvStoreConfig, KvValue, MemoryKvStore,
};
#[cfg(feature = "sled")]
pub use kv::SledKvStore;

use kv::serialization;

/// Key prefix for operations / 操作键前缀
pub const OPERATION_PREFIX: &str = "operation:";
/// Key prefix for executed operations / 已执行操作键前缀
pub const EXECUTED_OPERATION_PREFIX: &str = "executed_operation:";
/// Key prefix for data resources / 数据资源键前缀
pub const RESOURCE_PREFIX: &str = "resource:";

/// Storage error / 存储错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Unsupported KV backend: {0}")]
    UnsupportedBackend(String),

    #[error("Record not found: {key}")]
    NotFound { key: String },

    #[error("Record already exists: {key}")]
    AlreadyExists { key: String },

    #[error("Version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },
}

/// A record that can be persisted in a [`Repository`]
/// 可持久化到仓库中的记录
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Key prefix for this record type / 此记录类型的键前缀
    const PREFIX: &'static str;

    fn id(&self) -> Uuid;

    /// Immutable records keep the default version of 0 / 不可变记录保持默认版本0
    fn version(&self) -> u64 {
        0
    }

    fn set_version(&mut self, _version: u64) {}
}

/// Typed, versioned record repository over a KV store
/// 基于KV存储的类型化、带版本的记录仓库
#[derive(Debug)]
pub struct Repository<T> {
    store: Arc<dyn KvStore>,
    // Serializes read-compare-write sequences within this process.
    // 在进程内串行化读-比较-写序列
    write_lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> Repository<T> {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    fn key(id: &Uuid) -> KvKey {
        serialization::record_key(T::PREFIX, id)
    }

    /// Fetch a record by id / 按ID获取记录
    pub async fn get(&self, id: &Uuid) -> Result<Option<T>, StorageError> {
        match self.store.get(&Self::key(id)).await? {
            Some(bytes) => Ok(Some(serialization::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert a new record; fails if the id is taken
    /// 插入新记录；若ID已存在则失败
    pub async fn insert(&self, record: &T) -> Result<(), StorageError> {
        let key = Self::key(&record.id());
        let _guard = self.write_lock.lock().await;
        if self.store.exists(&key).await? {
            return Err(StorageError::AlreadyExists { key });
        }
        self.store.put(&key, &serialization::serialize(record)?).await
    }

    /// Replace a record if its stored version matches `expected_version`.
    /// The stored copy gets `expected_version + 1`, which is returned.
    /// 若存储版本与期望版本一致则替换记录，并返回版本加一后的记录
    pub async fn update(&self, mut record: T, expected_version: u64) -> Result<T, StorageError> {
        let key = Self::key(&record.id());
        let _guard = self.write_lock.lock().await;
        let current: T = match self.store.get(&key).await? {
            Some(bytes) => serialization::deserialize(&bytes)?,
            None => return Err(StorageError::NotFound { key }),
        };
        if current.version() != expected_version {
            return Err(StorageError::VersionConflict {
                key,
                expected: expected_version,
                found: current.version(),
            });
        }
        record.set_version(expected_version + 1);
        self.store
            .put(&key, &serialization::serialize(&record)?)
            .await?;
        Ok(record)
    }

    /// List every record of this type / 列出此类型的所有记录
    pub async fn list(&self) -> Result<Vec<T>, StorageError> {
        let pairs = self.store.scan_prefix(T::PREFIX).await?;
        pairs
            .iter()
            .map(|pair| serialization::deserialize(&pair.value))
            .collect()
    }

    pub async fn delete(&self, id: &Uuid) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        self.store.delete(&Self::key(id)).await
    }
}
