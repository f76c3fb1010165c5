//! Resource Type Registry
//! 资源类型注册表
//!
//! Maps a resource-type tag (e.g. `MTX`, `ANN`, `FQ`) to a validator able to
//! check a candidate file and extract its observation/feature metadata.
//! 将资源类型标签映射到能够检查候选文件并提取观测/特征元数据的验证器。
//!
//! Registries are explicit objects: build one with
//! [`ResourceTypeRegistry::with_defaults`] (or empty with `new`) before any
//! operation is ingested and share it behind an `Arc`.
//! 注册表是显式对象：在摄取任何操作之前构建，并通过`Arc`共享。

pub mod sequence;
pub mod table;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::attributes::ElementSet;
pub use sequence::{GenericValidator, JsonValidator, SequenceValidator};
pub use table::{CellRequirement, ColumnType, TableKind, TableValidator};

/// Tag for the generic "any file" type / 通用“任意文件”类型标签
pub const WILDCARD_TYPE: &str = "*";

/// Resource validation error / 资源验证错误
#[derive(Debug, thiserror::Error)]
pub enum ResourceValidationError {
    #[error("Unknown resource type: {tag}")]
    UnknownType { tag: String },

    #[error("Resource file not found: {path}")]
    NotFound { path: String },

    #[error("File '{path}' does not have an expected extension ({expected})")]
    Extension { path: String, expected: String },

    #[error("Missing header: first row of '{path}' looks numeric ({row})")]
    MissingHeader { path: String, row: String },

    #[error("Row {line} has {found} fields, expected {expected}")]
    RaggedRow {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("Value '{value}' at row {line}, column '{column}' is not {expected}")]
    CellType {
        line: usize,
        column: String,
        value: String,
        expected: String,
    },

    #[error("Duplicate row identifier '{id}'")]
    DuplicateIdentifier { id: String },

    #[error("Format error: {message}")]
    Format { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Column definition inferred from a table / 从表格推断的列定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ColumnType,
}

/// Metadata extracted by a validator / 验证器提取的元数据
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceMetadata {
    /// Observations (samples) described by the file / 文件描述的观测（样本）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_set: Option<ElementSet>,
    /// Features (genes) described by the file / 文件描述的特征（基因）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_set: Option<ElementSet>,
    /// Inferred column types for tables / 表格推断的列类型
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<ColumnDefinition>,
}

/// Outcome of a successful validation / 验证成功的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedResource {
    /// Validated resource type tag / 验证通过的资源类型标签
    pub resource_type: String,
    /// Extracted metadata / 提取的元数据
    pub metadata: ResourceMetadata,
    /// Path of the (possibly normalized) stored representation
    /// （可能已规范化的）存储表示的路径
    pub path: PathBuf,
}

/// Validator bound to a resource type tag / 绑定到资源类型标签的验证器
pub trait ResourceValidator: Send + Sync + Debug {
    /// Human-readable description / 可读描述
    fn description(&self) -> &str;

    /// Validate the file, returning metadata and the canonical path
    /// 验证文件，返回元数据和规范路径
    fn validate(&self, path: &Path) -> Result<(ResourceMetadata, PathBuf), ResourceValidationError>;
}

/// Registry of resource type validators / 资源类型验证器注册表
#[derive(Debug, Default)]
pub struct ResourceTypeRegistry {
    validators: RwLock<HashMap<String, Arc<dyn ResourceValidator>>>,
}

impl ResourceTypeRegistry {
    /// Create an empty registry / 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry populated with the built-in types
    /// 创建包含内置类型的注册表
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(
            "MTX",
            TableValidator::new(TableKind::Matrix(CellRequirement::Numeric), "Numeric matrix"),
        );
        registry.register(
            "I_MTX",
            TableValidator::new(TableKind::Matrix(CellRequirement::Integer), "Integer matrix"),
        );
        registry.register(
            "EXP_MTX",
            TableValidator::new(
                TableKind::Matrix(CellRequirement::Numeric),
                "Expression matrix",
            ),
        );
        registry.register(
            "RNASEQ_COUNT_MTX",
            TableValidator::new(
                TableKind::Matrix(CellRequirement::NonnegativeInteger),
                "RNA-seq count matrix",
            ),
        );
        registry.register(
            "ANN",
            TableValidator::new(TableKind::Annotation, "Annotation table"),
        );
        registry.register(
            "FT",
            TableValidator::new(TableKind::FeatureTable, "Feature table"),
        );
        registry.register("JSON", JsonValidator);
        registry.register(
            "FQ",
            SequenceValidator::new("FASTQ", &[".fastq", ".fq", ".fastq.gz", ".fq.gz"]),
        );
        registry.register(
            "FA",
            SequenceValidator::new("FASTA", &[".fasta", ".fa", ".fasta.gz", ".fa.gz"]),
        );
        registry.register("BAM", SequenceValidator::new("Aligned reads", &[".bam"]));
        registry.register(WILDCARD_TYPE, GenericValidator);
        registry
    }

    /// Register (or replace) a validator for a tag / 为标签注册（或替换）验证器
    pub fn register<V>(&self, tag: impl Into<String>, validator: V)
    where
        V: ResourceValidator + 'static,
    {
        let tag = tag.into();
        debug!(tag = %tag, "registering resource type");
        self.validators.write().insert(tag, Arc::new(validator));
    }

    /// Check whether a tag is registered / 检查标签是否已注册
    pub fn contains(&self, tag: &str) -> bool {
        self.validators.read().contains_key(tag)
    }

    /// List registered tags, sorted / 列出已注册标签（已排序）
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.validators.read().keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn description(&self, tag: &str) -> Option<String> {
        self.validators
            .read()
            .get(tag)
            .map(|v| v.description().to_string())
    }

    /// Validate a file against a resource type / 针对资源类型验证文件
    pub fn validate(
        &self,
        path: &Path,
        tag: &str,
    ) -> Result<ValidatedResource, ResourceValidationError> {
        let validator = self
            .validators
            .read()
            .get(tag)
            .cloned()
            .ok_or_else(|| ResourceValidationError::UnknownType {
                tag: tag.to_string(),
            })?;
        if !path.is_file() {
            return Err(ResourceValidationError::NotFound {
                path: path.display().to_string(),
            });
        }
        let (metadata, normalized) = validator.validate(path)?;
        debug!(tag = %tag, path = %path.display(), normalized = %normalized.display(), "resource validated");
        Ok(ValidatedResource {
            resource_type: tag.to_string(),
            metadata,
            path: normalized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_registered() {
        let registry = ResourceTypeRegistry::with_defaults();
        for tag in ["MTX", "I_MTX", "EXP_MTX", "RNASEQ_COUNT_MTX", "ANN", "FT", "JSON", "FQ", "FA", "BAM", "*"] {
            assert!(registry.contains(tag), "missing {}", tag);
        }
        assert!(!registry.contains("VCF"));
    }

    #[test]
    fn test_unknown_tag() {
        let registry = ResourceTypeRegistry::with_defaults();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        std::fs::write(&path, "a").unwrap();
        assert!(matches!(
            registry.validate(&path, "VCF"),
            Err(ResourceValidationError::UnknownType { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let registry = ResourceTypeRegistry::with_defaults();
        assert!(matches!(
            registry.validate(Path::new("/nonexistent/file.tsv"), "MTX"),
            Err(ResourceValidationError::NotFound { .. })
        ));
    }

    #[derive(Debug)]
    struct VcfValidator;

    impl ResourceValidator for VcfValidator {
        fn description(&self) -> &str {
            "Variant calls"
        }

        fn validate(
            &self,
            path: &Path,
        ) -> Result<(ResourceMetadata, PathBuf), ResourceValidationError> {
            let content = std::fs::read_to_string(path)?;
            if !content.starts_with("##fileformat=VCF") {
                return Err(ResourceValidationError::Format {
                    message: "missing VCF preamble".to_string(),
                });
            }
            Ok((ResourceMetadata::default(), path.to_path_buf()))
        }
    }

    #[test]
    fn test_register_extension_type() {
        let registry = ResourceTypeRegistry::with_defaults();
        registry.register("VCF", VcfValidator);
        assert!(registry.contains("VCF"));
        assert_eq!(registry.description("VCF").as_deref(), Some("Variant calls"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.vcf");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "##fileformat=VCFv4.2").unwrap();
        let validated = registry.validate(&path, "VCF").unwrap();
        assert_eq!(validated.resource_type, "VCF");
        assert_eq!(validated.path, path);
    }
}
