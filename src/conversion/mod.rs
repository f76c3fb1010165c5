//! Validation & Conversion Layer
//! 验证与转换层
//!
//! Submitted arguments are checked against an operation's declared inputs in
//! declaration order, data resource references are resolved and type-checked,
//! and each value is passed through the converter chosen at ingestion to get
//! its backend-native form.
//! 按声明顺序根据操作输入检查提交的参数，解析并检查数据资源引用，
//! 再通过摄取时选定的转换器得到后端原生表示。

pub mod converters;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

use crate::attributes::{create_attribute, Attribute, AttributeSpec, AttributeValue};
use crate::operations::{ExecutionMode, Operation, OperationInput};
use crate::resource_types::WILDCARD_TYPE;
use crate::resources::{Resource, ResourceStore};

pub use converters::{
    BasicConverter, ElementSetConverter, ResourcePathConverter, StringListConverter,
};

/// Argument validation failure, keyed by input / 按输入键报告的参数验证失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid argument '{key}': {reason}")]
pub struct ArgumentValidationError {
    pub key: String,
    pub reason: String,
}

impl ArgumentValidationError {
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Converter resolution failure / 转换器解析失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConverterLookupError {
    #[error("unknown converter '{0}'")]
    Unknown(String),

    #[error("converter '{tag}' does not support mode {mode}")]
    UnsupportedMode { tag: String, mode: ExecutionMode },

    #[error("converter '{tag}' cannot convert {kind} inputs")]
    IncompatibleInput { tag: String, kind: String },
}

/// Value after validation, ready for conversion / 验证后、待转换的值
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedArgument {
    Attribute(Attribute),
    /// Resolved data resources / 已解析的数据资源
    Resources { resources: Vec<Resource>, many: bool },
}

/// Maps a validated argument to a backend-native value
/// 将已验证参数映射为后端原生值
pub trait Converter: Send + Sync + Debug {
    fn tag(&self) -> &'static str;

    fn supports_mode(&self, mode: ExecutionMode) -> bool;

    /// Whether inputs declared with `spec` can be converted
    /// 是否可以转换以`spec`声明的输入
    fn accepts(&self, spec: &AttributeSpec) -> bool;

    fn convert(&self, arg: &ValidatedArgument) -> Result<Value, String>;
}

/// Registry of converters by tag / 按标签索引的转换器注册表
#[derive(Debug, Default)]
pub struct ConverterRegistry {
    converters: RwLock<HashMap<String, Arc<dyn Converter>>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in converter / 包含全部内置转换器的注册表
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(BasicConverter);
        registry.register(StringListConverter);
        registry.register(ResourcePathConverter::local_single());
        registry.register(ResourcePathConverter::local_multiple());
        registry.register(ResourcePathConverter::cromwell_single());
        registry.register(ResourcePathConverter::cromwell_multiple());
        registry.register(ElementSetConverter::csv());
        registry.register(ElementSetConverter::list());
        registry
    }

    pub fn register<C>(&self, converter: C)
    where
        C: Converter + 'static,
    {
        self.converters
            .write()
            .insert(converter.tag().to_string(), Arc::new(converter));
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Converter>> {
        self.converters.read().get(tag).cloned()
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.converters.read().keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Look up a converter and check it fits the input and mode
    /// 查找转换器并检查其与输入和模式是否匹配
    pub fn resolve(
        &self,
        tag: &str,
        spec: &AttributeSpec,
        mode: ExecutionMode,
    ) -> Result<Arc<dyn Converter>, ConverterLookupError> {
        let converter = self
            .get(tag)
            .ok_or_else(|| ConverterLookupError::Unknown(tag.to_string()))?;
        if !converter.supports_mode(mode) {
            return Err(ConverterLookupError::UnsupportedMode {
                tag: tag.to_string(),
                mode,
            });
        }
        if !converter.accepts(spec) {
            return Err(ConverterLookupError::IncompatibleInput {
                tag: tag.to_string(),
                kind: spec.kind_name().to_string(),
            });
        }
        Ok(converter)
    }
}

/// Validated and converted arguments, in input declaration order
/// 按输入声明顺序排列的已验证、已转换参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvertedArguments {
    /// Canonical JSON of each validated value / 每个已验证值的规范JSON
    pub validated: IndexMap<String, Value>,
    /// Backend-native value per input key / 每个输入键的后端原生值
    pub converted: IndexMap<String, Value>,
}

impl ConvertedArguments {
    /// Converted value for `key` / `key`的转换值
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.converted.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.converted.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.converted.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.converted.iter()
    }

    pub fn len(&self) -> usize {
        self.converted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converted.is_empty()
    }
}

fn resource_type_allowed(resource: &Resource, allowed: &[String]) -> Result<(), String> {
    let Some(tag) = resource.resource_type.as_deref() else {
        return Err(format!("resource {} has not been validated", resource.id));
    };
    if allowed.iter().any(|t| t == WILDCARD_TYPE || t == tag) {
        Ok(())
    } else {
        Err(format!(
            "resource {} has type {} but one of {:?} is required",
            resource.id, tag, allowed
        ))
    }
}

async fn validate_input(
    key: &str,
    input: &OperationInput,
    raw: &Value,
    mode: ExecutionMode,
    resources: &dyn ResourceStore,
    converters: &ConverterRegistry,
) -> Result<(Value, Value), ArgumentValidationError> {
    let err = |reason: String| ArgumentValidationError::new(key, reason);

    let attribute = create_attribute(&input.spec, raw).map_err(|e| err(e.to_string()))?;
    let validated_json = attribute.to_json();

    let argument = match (&input.spec, attribute.value()) {
        (
            AttributeSpec::DataResource { resource_types, many },
            AttributeValue::DataResource(reference),
        ) => {
            let mut resolved = Vec::with_capacity(reference.ids.len());
            for id in &reference.ids {
                let resource = resources
                    .get(id)
                    .await
                    .map_err(|e| err(format!("resource lookup failed: {}", e)))?
                    .ok_or_else(|| err(format!("resource {} does not exist", id)))?;
                if !resource.is_active {
                    return Err(err(format!("resource {} is not active", id)));
                }
                resource_type_allowed(&resource, resource_types).map_err(err)?;
                resolved.push(resource);
            }
            ValidatedArgument::Resources {
                resources: resolved,
                many: *many,
            }
        }
        _ => ValidatedArgument::Attribute(attribute),
    };

    let converter = converters
        .resolve(&input.converter, &input.spec, mode)
        .map_err(|e| err(e.to_string()))?;
    let converted = converter.convert(&argument).map_err(err)?;
    debug!(input = %key, converter = %input.converter, "argument converted");
    Ok((validated_json, converted))
}

fn argument_object(raw: &Value) -> Result<&serde_json::Map<String, Value>, ArgumentValidationError> {
    raw.as_object().ok_or_else(|| {
        ArgumentValidationError::new("", "arguments must be a JSON object keyed by input name")
    })
}

/// Walk declared inputs, calling `on_error` for each failure; stops early
/// when `on_error` returns false.
async fn walk_inputs<F>(
    operation: &Operation,
    raw_arguments: &Value,
    resources: &dyn ResourceStore,
    converters: &ConverterRegistry,
    mut on_error: F,
) -> Result<ConvertedArguments, ArgumentValidationError>
where
    F: FnMut(ArgumentValidationError) -> bool,
{
    let args = argument_object(raw_arguments)?;
    let mut out = ConvertedArguments::default();

    for (key, input) in &operation.inputs {
        let raw = match args.get(key) {
            None | Some(Value::Null) => {
                if input.required
                    && !on_error(ArgumentValidationError::new(key, "required input is missing"))
                {
                    return Ok(out);
                }
                continue;
            }
            Some(raw) => raw,
        };
        match validate_input(key, input, raw, operation.mode, resources, converters).await {
            Ok((validated, converted)) => {
                out.validated.insert(key.clone(), validated);
                out.converted.insert(key.clone(), converted);
            }
            Err(e) => {
                if !on_error(e) {
                    return Ok(out);
                }
            }
        }
    }

    for key in args.keys() {
        if !operation.inputs.contains_key(key)
            && !on_error(ArgumentValidationError::new(
                key,
                "not an input of this operation",
            ))
        {
            break;
        }
    }
    Ok(out)
}

/// Validate and convert, reporting the first failing input
/// 验证并转换参数，报告第一个失败的输入
pub async fn validate_and_convert(
    operation: &Operation,
    raw_arguments: &Value,
    resources: &dyn ResourceStore,
    converters: &ConverterRegistry,
) -> Result<ConvertedArguments, ArgumentValidationError> {
    let mut first = None;
    let out = walk_inputs(operation, raw_arguments, resources, converters, |e| {
        first = Some(e);
        false
    })
    .await?;
    match first {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

/// Validate and convert, reporting every failing input
/// 验证并转换参数，报告所有失败的输入
pub async fn validate_all(
    operation: &Operation,
    raw_arguments: &Value,
    resources: &dyn ResourceStore,
    converters: &ConverterRegistry,
) -> Result<ConvertedArguments, Vec<ArgumentValidationError>> {
    let mut errors = Vec::new();
    let out = walk_inputs(operation, raw_arguments, resources, converters, |e| {
        errors.push(e);
        true
    })
    .await
    .map_err(|e| vec![e])?;
    if errors.is_empty() {
        Ok(out)
    } else {
        Err(errors)
    }
}
