//! Operation Specification Model
//! 操作规范模型
//!
//! An [`Operation`] is the declarative description of one analysis step:
//! ordered typed inputs, typed outputs, execution mode, source reference and
//! the payload the execution backend needs (image + entrypoint template, or
//! workflow sources + input mapping). Operations are created once at
//! ingestion and never mutated; a new version is a new Operation.
//! 操作在摄取时创建且不可变；新版本即新的操作。

pub mod image;
pub mod spec;
pub mod template;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::attributes::AttributeSpec;
use crate::storage::{Record, OPERATION_PREFIX};

pub use image::{
    tag_wdl_images, ImageReference, ImageResolutionError, ImageResolver, RegistryImageResolver,
    UnverifiedImageResolver,
};
pub use spec::{Ingestor, OperationFiles, SpecDocument, SpecParseError};
pub use template::{Template, TemplateError};

/// Template variables supplied by the engine rather than by inputs
/// 由引擎而非输入提供的模板变量
pub const RESERVED_TEMPLATE_KEYS: [&str; 2] = ["execution_dir", "job_id"];

/// Execution mode / 执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Local containerized process / 本地容器进程
    LocalDocker,
    /// Remote Cromwell workflow / 远程Cromwell工作流
    Cromwell,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::LocalDocker => "local_docker",
            ExecutionMode::Cromwell => "cromwell",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_docker" => Ok(ExecutionMode::LocalDocker),
            "cromwell" => Ok(ExecutionMode::Cromwell),
            other => Err(SpecParseError::UnknownMode(other.to_string())),
        }
    }
}

/// Where an operation's code came from / 操作代码的来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub repository_url: String,
    pub commit_hash: String,
}

impl SourceRef {
    pub fn new(repository_url: impl Into<String>, commit_hash: impl Into<String>) -> Self {
        Self {
            repository_url: repository_url.into(),
            commit_hash: commit_hash.into(),
        }
    }

    /// Last path segment of the repository URL, lowercased
    /// 仓库URL的最后一段（小写）
    pub fn repository_name(&self) -> String {
        self.repository_url
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase()
    }
}

/// Declared operation input / 声明的操作输入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInput {
    pub description: String,
    /// Display name / 显示名称
    pub name: String,
    pub required: bool,
    pub spec: AttributeSpec,
    /// Converter tag, validated at ingestion / 转换器标签（摄取时已验证）
    pub converter: String,
}

/// Declared operation output / 声明的操作输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationOutput {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub name: String,
    pub spec: AttributeSpec,
}

/// Backend-specific material captured at ingestion / 摄取时捕获的后端特定材料
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionPayload {
    Local {
        /// Fully tagged image / 带完整标签的镜像
        image: String,
        /// Entrypoint template source / 入口模板源码
        entrypoint: String,
    },
    Workflow {
        /// Name of the top-level `workflow` block / 顶层workflow块名称
        workflow_name: String,
        /// Rewritten `main.wdl` with tagged images / 镜像已加标签的main.wdl
        main_wdl: String,
        /// Additional WDL files by file name / 其他WDL文件
        imports: BTreeMap<String, String>,
        /// `<Workflow>.<input>` → operation input key / WDL输入到操作输入键的映射
        input_mapping: IndexMap<String, String>,
        /// Images referenced by the workflow / 工作流引用的镜像
        images: Vec<String>,
    },
}

/// Ingested operation / 已摄取的操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Inputs in declaration order / 按声明顺序的输入
    pub inputs: IndexMap<String, OperationInput>,
    pub outputs: IndexMap<String, OperationOutput>,
    pub mode: ExecutionMode,
    pub source: SourceRef,
    pub payload: ExecutionPayload,
    #[serde(default)]
    pub workspace_operation: bool,
    pub created_at: DateTime<Utc>,
}

impl Operation {
    /// Parsed entrypoint template for local operations / 本地操作的入口模板
    pub fn entrypoint(&self) -> Option<Result<Template, TemplateError>> {
        match &self.payload {
            ExecutionPayload::Local { entrypoint, .. } => Some(Template::parse(entrypoint)),
            ExecutionPayload::Workflow { .. } => None,
        }
    }

    pub fn image(&self) -> Option<&str> {
        match &self.payload {
            ExecutionPayload::Local { image, .. } => Some(image),
            ExecutionPayload::Workflow { .. } => None,
        }
    }
}

impl Record for Operation {
    const PREFIX: &'static str = OPERATION_PREFIX;

    fn id(&self) -> Uuid {
        self.id
    }
}
