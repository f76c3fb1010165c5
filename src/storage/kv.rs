//! Key-Value storage abstraction layer for the MEV engine
//! MEV引擎的键值存储抽象层
//!
//! This module provides a generic interface for different KV storage backends,
//! supporting basic CRUD operations and prefix scans.
//! 该模块为不同的KV存储后端提供通用接口，支持基本的CRUD操作和前缀扫描。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::StorageError;
use crate::config::base::StorageConfig;

#[cfg(feature = "sled")]
use crate::{handle_sled_error, spawn_blocking_task};

/// Key type for KV operations / KV操作的键类型
pub type KvKey = String;

/// Value type for KV operations / KV操作的值类型
pub type KvValue = Vec<u8>;

/// Key/value pair returned by scans / 扫描返回的键值对
#[derive(Debug, Clone, PartialEq)]
pub struct KvPair {
    pub key: KvKey,
    pub value: KvValue,
}

/// KV storage configuration / KV存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvStoreConfig {
    /// Storage backend type / 存储后端类型
    pub backend: String,
    /// Configuration parameters / 配置参数
    pub params: HashMap<String, String>,
}

impl KvStoreConfig {
    /// Create a new memory store config / 创建新的内存存储配置
    pub fn memory() -> Self {
        Self {
            backend: "memory".to_string(),
            params: HashMap::new(),
        }
    }

    /// Create a new Sled store config / 创建新的Sled存储配置
    #[cfg(feature = "sled")]
    pub fn sled<P: AsRef<str>>(path: P) -> Self {
        let mut params = HashMap::new();
        params.insert("path".to_string(), path.as_ref().to_string());
        Self {
            backend: "sled".to_string(),
            params,
        }
    }

    /// Get a configuration parameter / 获取配置参数
    pub fn get_param(&self, key: &str) -> Option<&String> {
        self.params.get(key)
    }

    /// Convert from StorageConfig to KvStoreConfig / 从StorageConfig转换为KvStoreConfig
    pub fn from_storage_config(storage_config: &StorageConfig) -> Self {
        let mut params = HashMap::new();
        params.insert("path".to_string(), storage_config.data_dir.clone());
        Self {
            backend: storage_config.backend.clone(),
            params,
        }
    }
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        Self::memory()
    }
}

/// KV storage trait for different backends / 不同后端的KV存储trait
#[async_trait]
pub trait KvStore: Send + Sync + Debug {
    /// Get value by key / 根据键获取值
    async fn get(&self, key: &KvKey) -> Result<Option<KvValue>, StorageError>;

    /// Put key-value pair / 存储键值对
    async fn put(&self, key: &KvKey, value: &KvValue) -> Result<(), StorageError>;

    /// Delete key / 删除键
    async fn delete(&self, key: &KvKey) -> Result<bool, StorageError>;

    /// Check if key exists / 检查键是否存在
    async fn exists(&self, key: &KvKey) -> Result<bool, StorageError>;

    /// List keys with the given prefix / 列出给定前缀的键
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<KvKey>, StorageError> {
        let pairs = self.scan_prefix(prefix).await?;
        Ok(pairs.into_iter().map(|p| p.key).collect())
    }

    /// Scan all pairs with the given prefix / 扫描给定前缀的所有键值对
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<KvPair>, StorageError>;

    /// Count all keys / 统计所有键
    async fn count(&self) -> Result<usize, StorageError>;

    /// Remove every key / 清除所有键
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Create a KV store from configuration / 根据配置创建KV存储
pub async fn create_kv_store_from_config(
    config: &KvStoreConfig,
) -> Result<Arc<dyn KvStore>, StorageError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryKvStore::new())),
        #[cfg(feature = "sled")]
        "sled" => {
            let path = config
                .get_param("path")
                .cloned()
                .unwrap_or_else(|| "./data/mev".to_string());
            Ok(Arc::new(SledKvStore::new(path)?))
        }
        other => Err(StorageError::UnsupportedBackend(other.to_string())),
    }
}

/// In-memory KV store implementation / 内存KV存储实现
#[derive(Debug)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<KvKey, KvValue>>>,
}

impl MemoryKvStore {
    /// Create a new memory KV store / 创建新的内存KV存储
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<KvValue>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &KvKey, value: &KvValue) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.insert(key.clone(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, StorageError> {
        let mut data = self.data.write().await;
        Ok(data.remove(key).is_some())
    }

    async fn exists(&self, key: &KvKey) -> Result<bool, StorageError> {
        let data = self.data.read().await;
        Ok(data.contains_key(key))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<KvPair>, StorageError> {
        let data = self.data.read().await;
        let pairs: Vec<KvPair> = data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KvPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        Ok(pairs)
    }

    async fn count(&self) -> Result<usize, StorageError> {
        let data = self.data.read().await;
        Ok(data.len())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.clear();
        Ok(())
    }
}

/// Serialization helpers for stored records / 存储记录的序列化辅助函数
pub mod serialization {
    use super::*;
    use uuid::Uuid;

    /// Serialize a value to bytes / 将值序列化为字节
    pub fn serialize<T: Serialize>(value: &T) -> Result<KvValue, StorageError> {
        crate::handle_json_error!(serde_json::to_vec(value), "Failed to serialize value")
    }

    /// Deserialize bytes to a value / 将字节反序列化为值
    pub fn deserialize<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StorageError> {
        crate::handle_json_error!(serde_json::from_slice(bytes), "Failed to deserialize value")
    }

    /// Build a record key from a prefix and UUID / 由前缀和UUID生成记录键
    pub fn record_key(prefix: &str, id: &Uuid) -> KvKey {
        format!("{}{}", prefix, id)
    }

    /// Extract UUID from a record key / 从记录键中提取UUID
    pub fn extract_uuid(prefix: &str, key: &str) -> Result<Uuid, StorageError> {
        let raw = key.strip_prefix(prefix).ok_or_else(|| {
            StorageError::Serialization(format!("Key '{}' lacks prefix '{}'", key, prefix))
        })?;
        Uuid::parse_str(raw)
            .map_err(|e| StorageError::Serialization(format!("Invalid UUID in key: {}", e)))
    }
}

/// Sled KV store implementation / Sled KV存储实现
#[cfg(feature = "sled")]
#[derive(Debug)]
pub struct SledKvStore {
    db: Arc<sled::Db>,
}

#[cfg(feature = "sled")]
impl SledKvStore {
    /// Create a new Sled KV store / 创建新的Sled KV存储
    pub fn new(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)
            .map_err(|e| StorageError::Backend(format!("Failed to open Sled: {}", e)))?;
        Ok(Self { db: Arc::new(db) })
    }
}

#[cfg(feature = "sled")]
#[async_trait]
impl KvStore for SledKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<KvValue>, StorageError> {
        let db = self.db.clone();
        let key = key.clone();
        spawn_blocking_task!(move || {
            handle_sled_error!(db.get(&key).map(|opt| opt.map(|ivec| ivec.to_vec())), "get")
        })
    }

    async fn put(&self, key: &KvKey, value: &KvValue) -> Result<(), StorageError> {
        let db = self.db.clone();
        let key = key.clone();
        let value = value.clone();
        spawn_blocking_task!(move || {
            handle_sled_error!(
                db.insert(&key, value).and_then(|_| db.flush()).map(|_| ()),
                "put"
            )
        })
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, StorageError> {
        let db = self.db.clone();
        let key = key.clone();
        spawn_blocking_task!(move || {
            handle_sled_error!(db.remove(&key).map(|opt| opt.is_some()), "delete")
        })
    }

    async fn exists(&self, key: &KvKey) -> Result<bool, StorageError> {
        let db = self.db.clone();
        let key = key.clone();
        spawn_blocking_task!(move || handle_sled_error!(db.contains_key(&key), "exists"))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<KvPair>, StorageError> {
        let db = self.db.clone();
        let prefix = prefix.to_string();
        spawn_blocking_task!(move || {
            let mut pairs = Vec::new();
            for item in db.scan_prefix(&prefix) {
                let (key, value) = handle_sled_error!(item, "scan")?;
                if let Ok(key_str) = String::from_utf8(key.to_vec()) {
                    pairs.push(KvPair {
                        key: key_str,
                        value: value.to_vec(),
                    });
                }
            }
            Ok(pairs)
        })
    }

    async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.db.len())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let db = self.db.clone();
        spawn_blocking_task!(move || handle_sled_error!(db.clear(), "clear"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryKvStore::new();
        let key = "operation:1".to_string();
        assert!(store.get(&key).await.unwrap().is_none());
        store.put(&key, &b"v1".to_vec()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(b"v1".to_vec()));
        assert!(store.exists(&key).await.unwrap());
        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_prefix_scan() {
        let store = MemoryKvStore::new();
        for k in ["resource:a", "resource:b", "operation:a", "resources_other"] {
            store.put(&k.to_string(), &k.as_bytes().to_vec()).await.unwrap();
        }
        let pairs = store.scan_prefix("resource:").await.unwrap();
        let keys: Vec<&str> = pairs.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["resource:a", "resource:b"]);
        assert_eq!(store.keys_with_prefix("operation:").await.unwrap(), vec!["operation:a"]);

        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_backend() {
        let cfg = KvStoreConfig {
            backend: "rocksdb".to_string(),
            params: HashMap::new(),
        };
        assert!(matches!(
            create_kv_store_from_config(&cfg).await,
            Err(StorageError::UnsupportedBackend(_))
        ));
    }

    #[cfg(feature = "sled")]
    #[tokio::test]
    async fn test_sled_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = SledKvStore::new(&path).unwrap();
            store
                .put(&"operation:x".to_string(), &b"1".to_vec())
                .await
                .unwrap();
        }
        let store = SledKvStore::new(&path).unwrap();
        assert_eq!(
            store.get(&"operation:x".to_string()).await.unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(store.scan_prefix("operation:").await.unwrap().len(), 1);
    }

    #[test]
    fn test_record_key_round_trip() {
        let id = uuid::Uuid::new_v4();
        let key = serialization::record_key("resource:", &id);
        assert_eq!(serialization::extract_uuid("resource:", &key).unwrap(), id);
        assert!(serialization::extract_uuid("operation:", &key).is_err());
    }
}
