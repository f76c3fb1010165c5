//! Output manifest validation / 输出清单验证
//!
//! A finished job reports a flat JSON object keyed by output name. Attribute
//! outputs are checked against their declared kind; file outputs are
//! validated against their resource type and registered as new resources,
//! whose UUIDs replace the paths in the stored outputs.
//! 属性输出按声明类型检查；文件输出按资源类型验证并登记为新资源，
//! 存储的输出中以资源UUID替换路径。

use indexmap::IndexMap;
use serde_json::Value;
use std::path::PathBuf;
use tracing::{debug, warn};

use super::backend::JobFailure;
use super::ExecutedOperation;
use crate::attributes::{create_attribute, AttributeSpec};
use crate::operations::Operation;
use crate::resources::{Resource, ResourceService};

/// Validated outputs plus non-fatal remarks / 已验证的输出及非致命提示
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedOutputs {
    pub outputs: IndexMap<String, Value>,
    pub warnings: Vec<String>,
    /// Resources created for file outputs / 为文件输出创建的资源
    pub registered: Vec<Resource>,
}

/// Turns output manifests into typed outputs / 将输出清单转换为类型化输出
#[derive(Debug, Clone)]
pub struct OutputCollector {
    resources: ResourceService,
}

fn output_paths(key: &str, raw: &Value, many: bool) -> Result<Vec<String>, JobFailure> {
    let invalid = |reason: &str| JobFailure::InvalidOutput {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    match (raw, many) {
        (Value::String(p), false) if !p.trim().is_empty() => Ok(vec![p.clone()]),
        (Value::Array(items), true) => items
            .iter()
            .map(|item| match item.as_str() {
                Some(p) if !p.trim().is_empty() => Ok(p.to_string()),
                _ => Err(invalid("expected a list of file paths")),
            })
            .collect(),
        (Value::String(p), true) if !p.trim().is_empty() => Ok(vec![p.clone()]),
        (_, false) => Err(invalid("expected a file path")),
        (_, true) => Err(invalid("expected a list of file paths")),
    }
}

impl OutputCollector {
    pub fn new(resources: ResourceService) -> Self {
        Self { resources }
    }

    /// Validate every declared output of `operation` from `manifest`.
    /// `locate` maps an output key and manifest path to the host path of the
    /// file, or refuses it.
    /// 根据清单验证操作声明的每个输出；`locate`把输出键与清单路径映射为主机路径，或拒绝该路径。
    pub async fn collect<F>(
        &self,
        operation: &Operation,
        job: &ExecutedOperation,
        manifest: &Value,
        locate: F,
    ) -> Result<CollectedOutputs, JobFailure>
    where
        F: Fn(&str, &str) -> Result<PathBuf, JobFailure>,
    {
        let entries = manifest.as_object().ok_or_else(|| {
            JobFailure::MalformedManifest("manifest must be a JSON object".to_string())
        })?;

        let mut collected = CollectedOutputs::default();
        let mut registered: Vec<Resource> = Vec::new();
        let result = self
            .collect_declared(operation, job, entries, &locate, &mut collected, &mut registered)
            .await;
        if let Err(failure) = result {
            self.retire(&registered).await;
            return Err(failure);
        }
        collected.registered = registered;

        for key in entries.keys() {
            if !operation.outputs.contains_key(key) {
                collected
                    .warnings
                    .push(format!("manifest entry '{}' is not a declared output", key));
            }
        }
        Ok(collected)
    }

    async fn collect_declared<F>(
        &self,
        operation: &Operation,
        job: &ExecutedOperation,
        entries: &serde_json::Map<String, Value>,
        locate: &F,
        collected: &mut CollectedOutputs,
        registered: &mut Vec<Resource>,
    ) -> Result<(), JobFailure>
    where
        F: Fn(&str, &str) -> Result<PathBuf, JobFailure>,
    {
        for (key, output) in &operation.outputs {
            let raw = match entries.get(key) {
                None | Some(Value::Null) => {
                    return Err(JobFailure::MissingOutput { key: key.clone() })
                }
                Some(raw) => raw,
            };

            let value = match &output.spec {
                AttributeSpec::DataResource {
                    resource_types,
                    many,
                } => {
                    let tag = resource_types.first().ok_or_else(|| JobFailure::InvalidOutput {
                        key: key.clone(),
                        reason: "no resource type declared".to_string(),
                    })?;
                    let mut ids = Vec::new();
                    for raw_path in output_paths(key, raw, *many)? {
                        let path = locate(key, &raw_path)?;
                        let name = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| key.clone());
                        let resource = self
                            .resources
                            .register_output(path, tag, name, job.owner.clone(), job.workspace)
                            .await
                            .map_err(|e| JobFailure::InvalidOutput {
                                key: key.clone(),
                                reason: e.to_string(),
                            })?;
                        ids.push(Value::String(resource.id.to_string()));
                        registered.push(resource);
                    }
                    if *many {
                        Value::Array(ids)
                    } else {
                        ids.into_iter().next().unwrap_or(Value::Null)
                    }
                }
                spec => create_attribute(spec, raw)
                    .map_err(|e| JobFailure::InvalidOutput {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?
                    .to_json(),
            };
            debug!(execution_id = %job.id, output = %key, "output accepted");
            collected.outputs.insert(key.clone(), value);
        }
        Ok(())
    }

    /// Deactivate output resources whose job could not be completed
    /// 停用所属作业未能完成的输出资源
    pub async fn retire(&self, registered: &[Resource]) {
        for resource in registered {
            let mut inactive = resource.clone();
            inactive.is_active = false;
            if let Err(e) = self
                .resources
                .store()
                .update(inactive, resource.version)
                .await
            {
                warn!(resource_id = %resource.id, error = %e, "failed to deactivate output resource");
            }
        }
    }
}
