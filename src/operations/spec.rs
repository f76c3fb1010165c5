//! Operation specification ingestion
//! 操作规范摄取
//!
//! Turns an `operation_spec.json` document (plus the entrypoint template or
//! workflow sources next to it) into an [`Operation`]. Every check happens
//! here, before anything is stored: unknown modes, unregistered resource
//! types, unknown or mismatched converters, template keys without inputs and
//! unresolvable images all abort ingestion.
//! 所有检查都在存储之前完成；任何不一致都会中止摄取。

use chrono::Utc;
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::image::{ImageReference, ImageResolutionError, ImageResolver};
use super::template::{Template, TemplateError};
use super::{
    tag_wdl_images, ExecutionMode, ExecutionPayload, Operation, OperationInput, OperationOutput,
    SourceRef, RESERVED_TEMPLATE_KEYS,
};
use crate::attributes::AttributeSpec;
use crate::conversion::{ConverterLookupError, ConverterRegistry};
use crate::resource_types::ResourceTypeRegistry;

/// Operation specification file name / 操作规范文件名
pub const SPEC_FILE: &str = "operation_spec.json";
/// Local entrypoint template file name / 本地入口模板文件名
pub const ENTRYPOINT_FILE: &str = "entrypoint.txt";
/// Primary workflow file name / 主工作流文件名
pub const MAIN_WORKFLOW_FILE: &str = "main.wdl";
/// Workflow input mapping file name / 工作流输入映射文件名
pub const WORKFLOW_INPUTS_FILE: &str = "inputs.json";

/// Specification parse error / 规范解析错误
#[derive(Debug, thiserror::Error)]
pub enum SpecParseError {
    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },

    #[error("malformed specification document: {0}")]
    Document(String),

    #[error("missing or empty field '{0}'")]
    MissingField(&'static str),

    #[error("unrecognized execution mode '{0}'")]
    UnknownMode(String),

    #[error("input '{key}': {message}")]
    InvalidInput { key: String, message: String },

    #[error("'{key}' declares an empty resource_types list")]
    EmptyResourceTypes { key: String },

    #[error("'{key}' references unregistered resource type '{tag}'")]
    UnknownResourceType { key: String, tag: String },

    #[error("input '{key}': {source}")]
    Converter {
        key: String,
        #[source]
        source: ConverterLookupError,
    },

    #[error("output '{key}': {message}")]
    InvalidOutput { key: String, message: String },

    #[error("local operations require an entrypoint template")]
    MissingEntrypoint,

    #[error("workflow operations require {MAIN_WORKFLOW_FILE}")]
    MissingWorkflow,

    #[error("invalid entrypoint template: {0}")]
    Template(#[from] TemplateError),

    #[error("template references '{key}' which is not a declared input")]
    UnknownTemplateKey { key: String },

    #[error("invalid workflow input mapping: {0}")]
    InputMapping(String),

    #[error("image {image} cannot be used: {source}")]
    Image {
        image: String,
        #[source]
        source: ImageResolutionError,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct InputDocument {
    #[serde(default)]
    description: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    required: bool,
    spec: Value,
    converter: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OutputDocument {
    #[serde(default)]
    description: String,
    #[serde(default)]
    name: String,
    spec: Value,
}

/// Raw `operation_spec.json` document / 原始规范文档
#[derive(Debug, Clone, Deserialize)]
pub struct SpecDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    inputs: IndexMap<String, InputDocument>,
    #[serde(default)]
    outputs: IndexMap<String, OutputDocument>,
    pub mode: String,
    #[serde(default)]
    pub workspace_operation: bool,
    /// Explicit image for local operations / 本地操作的显式镜像
    #[serde(default)]
    pub image: Option<String>,
    /// Inline entrypoint template / 内联入口模板
    #[serde(default)]
    pub entrypoint: Option<String>,
}

impl SpecDocument {
    pub fn from_value(value: &Value) -> Result<Self, SpecParseError> {
        Self::deserialize(value).map_err(|e| SpecParseError::Document(e.to_string()))
    }

    pub fn input_keys(&self) -> impl Iterator<Item = &String> {
        self.inputs.keys()
    }

    pub fn output_keys(&self) -> impl Iterator<Item = &String> {
        self.outputs.keys()
    }
}

/// Files found next to the specification / 规范文件旁的其他文件
#[derive(Debug, Clone, Default)]
pub struct OperationFiles {
    pub entrypoint: Option<String>,
    pub main_wdl: Option<String>,
    pub workflow_inputs: Option<String>,
    /// Other `.wdl` files by name / 其他`.wdl`文件
    pub imports: BTreeMap<String, String>,
}

async fn read_optional(path: &Path) -> Result<Option<String>, SpecParseError> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SpecParseError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        }),
    }
}

impl OperationFiles {
    /// Read the spec document and companion files from a directory
    /// 从目录读取规范文档及配套文件
    pub async fn load_dir(dir: &Path) -> Result<(Value, Self), SpecParseError> {
        let spec_path = dir.join(SPEC_FILE);
        let raw = read_optional(&spec_path)
            .await?
            .ok_or_else(|| SpecParseError::Io {
                path: spec_path.display().to_string(),
                message: "file not found".to_string(),
            })?;
        let document: Value =
            serde_json::from_str(&raw).map_err(|e| SpecParseError::Document(e.to_string()))?;

        let mut files = OperationFiles {
            entrypoint: read_optional(&dir.join(ENTRYPOINT_FILE)).await?,
            main_wdl: read_optional(&dir.join(MAIN_WORKFLOW_FILE)).await?,
            workflow_inputs: read_optional(&dir.join(WORKFLOW_INPUTS_FILE)).await?,
            imports: BTreeMap::new(),
        };

        let io_err = |e: std::io::Error| SpecParseError::Io {
            path: dir.display().to_string(),
            message: e.to_string(),
        };
        let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path: PathBuf = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if name != MAIN_WORKFLOW_FILE && name.ends_with(".wdl") {
                if let Some(content) = read_optional(&path).await? {
                    files.imports.insert(name, content);
                }
            }
        }
        Ok((document, files))
    }
}

fn workflow_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^\s*workflow\s+([A-Za-z_][A-Za-z0-9_]*)\s*\{").expect("static regex")
    })
}

fn check_resource_types(
    key: &str,
    spec: &AttributeSpec,
    registry: &ResourceTypeRegistry,
) -> Result<(), SpecParseError> {
    if let AttributeSpec::DataResource { resource_types, .. } = spec {
        if resource_types.is_empty() {
            return Err(SpecParseError::EmptyResourceTypes {
                key: key.to_string(),
            });
        }
        if let Some(tag) = resource_types.iter().find(|t| !registry.contains(t)) {
            return Err(SpecParseError::UnknownResourceType {
                key: key.to_string(),
                tag: tag.clone(),
            });
        }
    }
    Ok(())
}

/// Builds operations from specification documents / 从规范文档构建操作
#[derive(Debug, Clone)]
pub struct Ingestor {
    resource_types: Arc<ResourceTypeRegistry>,
    converters: Arc<ConverterRegistry>,
    images: Arc<dyn ImageResolver>,
    image_repository: String,
    image_timeout: Duration,
}

impl Ingestor {
    pub fn new(
        resource_types: Arc<ResourceTypeRegistry>,
        converters: Arc<ConverterRegistry>,
        images: Arc<dyn ImageResolver>,
        image_repository: impl Into<String>,
        image_timeout: Duration,
    ) -> Self {
        Self {
            resource_types,
            converters,
            images,
            image_repository: image_repository.into(),
            image_timeout,
        }
    }

    /// Ingest an operation directory / 摄取操作目录
    pub async fn ingest_dir(
        &self,
        dir: &Path,
        source: SourceRef,
    ) -> Result<Operation, SpecParseError> {
        let (document, files) = OperationFiles::load_dir(dir).await?;
        self.ingest(&document, source, files).await
    }

    /// Ingest a parsed specification document / 摄取已解析的规范文档
    pub async fn ingest(
        &self,
        document: &Value,
        source: SourceRef,
        files: OperationFiles,
    ) -> Result<Operation, SpecParseError> {
        let doc = SpecDocument::from_value(document)?;
        if doc.name.trim().is_empty() {
            return Err(SpecParseError::MissingField("name"));
        }
        if source.commit_hash.trim().is_empty() {
            return Err(SpecParseError::MissingField("commit_hash"));
        }
        let mode: ExecutionMode = doc.mode.parse()?;

        let inputs = self.parse_inputs(&doc, mode)?;
        let outputs = self.parse_outputs(&doc)?;

        let payload = match mode {
            ExecutionMode::LocalDocker => self.local_payload(&doc, &inputs, &source, &files)?,
            ExecutionMode::Cromwell => self.workflow_payload(&inputs, &source, &files)?,
        };
        self.verify_images(&payload).await?;

        let operation = Operation {
            id: Uuid::new_v4(),
            name: doc.name,
            description: doc.description,
            inputs,
            outputs,
            mode,
            source,
            payload,
            workspace_operation: doc.workspace_operation,
            created_at: Utc::now(),
        };
        info!(
            operation_id = %operation.id,
            name = %operation.name,
            mode = %operation.mode,
            commit = %operation.source.commit_hash,
            "operation ingested"
        );
        Ok(operation)
    }

    fn parse_inputs(
        &self,
        doc: &SpecDocument,
        mode: ExecutionMode,
    ) -> Result<IndexMap<String, OperationInput>, SpecParseError> {
        let mut inputs = IndexMap::with_capacity(doc.inputs.len());
        for (key, raw) in &doc.inputs {
            let invalid = |message: String| SpecParseError::InvalidInput {
                key: key.clone(),
                message,
            };
            let spec: AttributeSpec =
                serde_json::from_value(raw.spec.clone()).map_err(|e| invalid(e.to_string()))?;
            spec.check().map_err(|e| invalid(e.to_string()))?;
            check_resource_types(key, &spec, &self.resource_types)?;
            self.converters
                .resolve(&raw.converter, &spec, mode)
                .map_err(|source| SpecParseError::Converter {
                    key: key.clone(),
                    source,
                })?;
            debug!(input = %key, kind = spec.kind_name(), converter = %raw.converter, "input parsed");
            inputs.insert(
                key.clone(),
                OperationInput {
                    description: raw.description.clone(),
                    name: raw.name.clone(),
                    required: raw.required,
                    spec,
                    converter: raw.converter.clone(),
                },
            );
        }
        Ok(inputs)
    }

    fn parse_outputs(
        &self,
        doc: &SpecDocument,
    ) -> Result<IndexMap<String, OperationOutput>, SpecParseError> {
        let mut outputs = IndexMap::with_capacity(doc.outputs.len());
        for (key, raw) in &doc.outputs {
            let invalid = |message: String| SpecParseError::InvalidOutput {
                key: key.clone(),
                message,
            };
            let spec: AttributeSpec =
                serde_json::from_value(raw.spec.clone()).map_err(|e| invalid(e.to_string()))?;
            spec.check().map_err(|e| invalid(e.to_string()))?;
            check_resource_types(key, &spec, &self.resource_types)?;
            if let AttributeSpec::DataResource { resource_types, .. } = &spec {
                if resource_types.len() != 1 {
                    return Err(invalid(
                        "output data resources must declare exactly one resource type".to_string(),
                    ));
                }
            }
            outputs.insert(
                key.clone(),
                OperationOutput {
                    description: raw.description.clone(),
                    name: raw.name.clone(),
                    spec,
                },
            );
        }
        Ok(outputs)
    }

    fn local_payload(
        &self,
        doc: &SpecDocument,
        inputs: &IndexMap<String, OperationInput>,
        source: &SourceRef,
        files: &OperationFiles,
    ) -> Result<ExecutionPayload, SpecParseError> {
        let entrypoint = files
            .entrypoint
            .clone()
            .or_else(|| doc.entrypoint.clone())
            .filter(|e| !e.trim().is_empty())
            .ok_or(SpecParseError::MissingEntrypoint)?;
        let template = Template::parse(entrypoint.trim())?;
        for key in template.referenced_keys() {
            if !inputs.contains_key(&key) && !RESERVED_TEMPLATE_KEYS.contains(&key.as_str()) {
                return Err(SpecParseError::UnknownTemplateKey { key });
            }
        }

        let image = match &doc.image {
            Some(explicit) => {
                let mut reference =
                    ImageReference::parse(explicit).map_err(|source| SpecParseError::Image {
                        image: explicit.clone(),
                        source,
                    })?;
                if !reference.is_pinned() {
                    reference.tag = Some(source.commit_hash.clone());
                }
                reference.to_string()
            }
            None => format!(
                "{}/{}:{}",
                self.image_repository.trim_end_matches('/'),
                source.repository_name(),
                source.commit_hash
            ),
        };
        Ok(ExecutionPayload::Local {
            image,
            entrypoint: template.source().to_string(),
        })
    }

    fn workflow_payload(
        &self,
        inputs: &IndexMap<String, OperationInput>,
        source: &SourceRef,
        files: &OperationFiles,
    ) -> Result<ExecutionPayload, SpecParseError> {
        let main = files
            .main_wdl
            .as_deref()
            .ok_or(SpecParseError::MissingWorkflow)?;
        let workflow_name = workflow_name_pattern()
            .captures(main)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                SpecParseError::InputMapping(format!("{} has no workflow block", MAIN_WORKFLOW_FILE))
            })?;

        let raw_mapping = files.workflow_inputs.as_deref().ok_or_else(|| {
            SpecParseError::InputMapping(format!("{} is missing", WORKFLOW_INPUTS_FILE))
        })?;
        let input_mapping: IndexMap<String, String> = serde_json::from_str(raw_mapping)
            .map_err(|e| SpecParseError::InputMapping(e.to_string()))?;
        let prefix = format!("{}.", workflow_name);
        for (wdl_input, op_key) in &input_mapping {
            if !wdl_input.starts_with(&prefix) {
                return Err(SpecParseError::InputMapping(format!(
                    "'{}' is not an input of workflow {}",
                    wdl_input, workflow_name
                )));
            }
            if !inputs.contains_key(op_key) {
                return Err(SpecParseError::UnknownTemplateKey {
                    key: op_key.clone(),
                });
            }
        }
        for (key, input) in inputs {
            if input.required && !input_mapping.values().any(|v| v == key) {
                return Err(SpecParseError::InputMapping(format!(
                    "required input '{}' is not passed to the workflow",
                    key
                )));
            }
        }

        let image_err = |source: ImageResolutionError| SpecParseError::Image {
            image: MAIN_WORKFLOW_FILE.to_string(),
            source,
        };
        let (main_wdl, mut images) =
            tag_wdl_images(main, &source.commit_hash).map_err(image_err)?;
        let mut imports = BTreeMap::new();
        for (name, content) in &files.imports {
            let (rewritten, more) =
                tag_wdl_images(content, &source.commit_hash).map_err(|source| {
                    SpecParseError::Image {
                        image: name.clone(),
                        source,
                    }
                })?;
            images.extend(more);
            imports.insert(name.clone(), rewritten);
        }
        images.sort();
        images.dedup();

        Ok(ExecutionPayload::Workflow {
            workflow_name,
            main_wdl,
            imports,
            input_mapping,
            images,
        })
    }

    async fn verify_images(&self, payload: &ExecutionPayload) -> Result<(), SpecParseError> {
        let images: Vec<&String> = match payload {
            ExecutionPayload::Local { image, .. } => vec![image],
            ExecutionPayload::Workflow { images, .. } => images.iter().collect(),
        };
        for image in images {
            match tokio::time::timeout(self.image_timeout, self.images.resolve(image)).await {
                Ok(Ok(())) => debug!(image = %image, "image resolved"),
                Ok(Err(source)) => {
                    return Err(SpecParseError::Image {
                        image: image.clone(),
                        source,
                    })
                }
                Err(_) => {
                    return Err(SpecParseError::Image {
                        image: image.clone(),
                        source: ImageResolutionError::Timeout(image.clone()),
                    })
                }
            }
        }
        Ok(())
    }
}
