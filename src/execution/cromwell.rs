//! Remote workflow execution via the Cromwell REST API
//! 通过Cromwell REST API执行远程工作流

use async_trait::async_trait;
use reqwest::{multipart, Url};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::backend::{
    confined_path, BackendStatus, DispatchError, DispatchRequest, ExecutionBackend, JobFailure,
};
use super::ExecutedOperation;
use crate::conversion::ConvertedArguments;
use crate::operations::{ExecutionMode, ExecutionPayload};

const API_PREFIX: &str = "api/workflows/v1";
const DEPENDENCIES_ARCHIVE: &str = "dependencies.zip";

#[derive(Debug, Deserialize)]
struct WorkflowIdResponse {
    id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct OutputsResponse {
    #[serde(default)]
    outputs: Map<String, Value>,
}

/// Cromwell backend / Cromwell后端
#[derive(Debug, Clone)]
pub struct CromwellBackend {
    client: reqwest::Client,
    base_url: Url,
    outputs_root: Option<PathBuf>,
}

/// Build the `<Workflow>.<input>` map from converted arguments; optional
/// inputs that were not supplied are left out.
/// 由转换后的参数构建`<Workflow>.<input>`映射；未提供的可选输入被省略。
pub fn workflow_inputs(
    input_mapping: &indexmap::IndexMap<String, String>,
    inputs: &ConvertedArguments,
) -> Map<String, Value> {
    input_mapping
        .iter()
        .filter_map(|(wdl_key, op_key)| inputs.get(op_key).map(|v| (wdl_key.clone(), v.clone())))
        .collect()
}

/// Pack bundled WDL files into the archive sent as `workflowDependencies`.
/// Entries keep their import names so relative imports in the main source
/// resolve inside the engine.
/// 将随附WDL文件打包为`workflowDependencies`归档；条目保留导入名，
/// 使主文件中的相对导入在引擎内解析。
pub fn dependencies_zip(imports: &BTreeMap<String, String>) -> Result<Vec<u8>, DispatchError> {
    let archive_err = |e: &dyn std::fmt::Display| {
        DispatchError::Rejected(format!("cannot build workflow dependencies: {}", e))
    };
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, content) in imports {
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| archive_err(&e))?;
        writer
            .write_all(content.as_bytes())
            .map_err(|e| archive_err(&e))?;
    }
    let cursor = writer.finish().map_err(|e| archive_err(&e))?;
    Ok(cursor.into_inner())
}

/// Strip the `<Workflow>.` prefix from output keys / 去掉输出键的`<Workflow>.`前缀
fn strip_workflow_prefix(outputs: Map<String, Value>) -> Map<String, Value> {
    outputs
        .into_iter()
        .map(|(k, v)| match k.split_once('.') {
            Some((_, rest)) => (rest.to_string(), v),
            None => (k, v),
        })
        .collect()
}

fn map_status(status: &str) -> Result<BackendStatus, DispatchError> {
    match status {
        "Submitted" | "On Hold" => Ok(BackendStatus::Pending),
        "Running" | "Aborting" => Ok(BackendStatus::Running),
        "Succeeded" => Ok(BackendStatus::Succeeded),
        "Failed" => Ok(BackendStatus::Failed("workflow failed".to_string())),
        "Aborted" => Ok(BackendStatus::Failed("workflow aborted".to_string())),
        other => Err(DispatchError::Rejected(format!(
            "unrecognized workflow status '{}'",
            other
        ))),
    }
}

fn unreachable_err(e: reqwest::Error) -> DispatchError {
    DispatchError::Unreachable(e.to_string())
}

impl CromwellBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DispatchError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| DispatchError::Unreachable(format!("{}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(unreachable_err)?;
        Ok(Self {
            client,
            base_url,
            outputs_root: None,
        })
    }

    /// Accept workflow outputs only under `root`, where the engine writes them
    /// 仅接受位于引擎输出目录`root`下的工作流输出
    pub fn with_outputs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.outputs_root = Some(root.into());
        self
    }

    fn endpoint(&self, suffix: &str) -> Result<Url, DispatchError> {
        let path = match suffix.trim_start_matches('/') {
            "" => API_PREFIX.to_string(),
            rest => format!("{}/{}", API_PREFIX, rest),
        };
        self.base_url
            .join(&path)
            .map_err(|e| DispatchError::Rejected(e.to_string()))
    }

    async fn error_body(resp: reqwest::Response) -> String {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        format!("status {}: {}", status, body)
    }
}

#[async_trait]
impl ExecutionBackend for CromwellBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Cromwell
    }

    async fn dispatch(&self, request: DispatchRequest<'_>) -> Result<String, DispatchError> {
        let ExecutionPayload::Workflow {
            workflow_name,
            main_wdl,
            imports,
            input_mapping,
            ..
        } = &request.operation.payload
        else {
            return Err(DispatchError::Rejected(
                "operation has no workflow source".to_string(),
            ));
        };

        let inputs = Value::Object(workflow_inputs(input_mapping, request.inputs));
        debug!(workflow = %workflow_name, inputs = %inputs, imports = imports.len(), "submitting workflow");
        let mut form = multipart::Form::new()
            .text("workflowSource", main_wdl.clone())
            .text("workflowInputs", inputs.to_string());
        if !imports.is_empty() {
            let archive = multipart::Part::bytes(dependencies_zip(imports)?)
                .file_name(DEPENDENCIES_ARCHIVE)
                .mime_str("application/zip")
                .map_err(|e| DispatchError::Rejected(e.to_string()))?;
            form = form.part("workflowDependencies", archive);
        }

        let resp = self
            .client
            .post(self.endpoint("")?)
            .multipart(form)
            .send()
            .await
            .map_err(unreachable_err)?;
        if !resp.status().is_success() {
            return Err(DispatchError::Rejected(Self::error_body(resp).await));
        }
        let body: WorkflowIdResponse = resp
            .json()
            .await
            .map_err(|e| DispatchError::Rejected(format!("unexpected submit response: {}", e)))?;
        info!(
            execution_id = %request.execution_id,
            workflow = %workflow_name,
            workflow_id = %body.id,
            status = %body.status,
            "workflow submitted"
        );
        Ok(body.id)
    }

    async fn poll(&self, job: &ExecutedOperation) -> Result<BackendStatus, DispatchError> {
        #[derive(Deserialize)]
        struct StatusResponse {
            status: String,
        }

        let resp = self
            .client
            .get(self.endpoint(&format!("{}/status", job.job_handle))?)
            .send()
            .await
            .map_err(unreachable_err)?;
        if !resp.status().is_success() {
            return Err(DispatchError::Rejected(Self::error_body(resp).await));
        }
        let body: StatusResponse = resp
            .json()
            .await
            .map_err(|e| DispatchError::Rejected(e.to_string()))?;
        map_status(&body.status)
    }

    async fn collect_outputs(&self, job: &ExecutedOperation) -> Result<Value, JobFailure> {
        let url = self
            .endpoint(&format!("{}/outputs", job.job_handle))
            .map_err(|e| JobFailure::Backend(e.to_string()))?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| JobFailure::Unreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(JobFailure::Backend(Self::error_body(resp).await));
        }
        let body: OutputsResponse = resp
            .json()
            .await
            .map_err(|e| JobFailure::MalformedManifest(e.to_string()))?;
        Ok(Value::Object(strip_workflow_prefix(body.outputs)))
    }

    fn output_path(&self, job: &ExecutedOperation, key: &str, raw: &str) -> Result<PathBuf, JobFailure> {
        let base = self.outputs_root.as_deref().unwrap_or(&job.execution_dir);
        confined_path(base, Path::new(raw)).map_err(|reason| JobFailure::InvalidOutput {
            key: key.to_string(),
            reason,
        })
    }

    async fn cancel(&self, job: &ExecutedOperation) -> Result<bool, DispatchError> {
        let resp = self
            .client
            .post(self.endpoint(&format!("{}/abort", job.job_handle))?)
            .send()
            .await
            .map_err(unreachable_err)?;
        if resp.status().is_success() {
            return Ok(true);
        }
        let error = Self::error_body(resp).await;
        warn!(
            workflow_id = %job.job_handle,
            error = %error,
            "abort not accepted"
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionStatus;
    use crate::operations::{Operation, SourceRef};
    use axum::{extract::Path as AxumPath, routing::{get, post}, Json, Router};
    use chrono::Utc;
    use indexmap::IndexMap;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    fn operation(imports: BTreeMap<String, String>) -> Operation {
        let mut mapping = IndexMap::new();
        mapping.insert("StarAlign.r1_files".to_string(), "r1_files".to_string());
        mapping.insert("StarAlign.genome".to_string(), "genome".to_string());
        mapping.insert("StarAlign.min_quality".to_string(), "min_quality".to_string());
        Operation {
            id: Uuid::new_v4(),
            name: "Alignment".to_string(),
            description: String::new(),
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            mode: ExecutionMode::Cromwell,
            source: SourceRef::new("https://github.com/web-mev/star", "abc1234"),
            payload: ExecutionPayload::Workflow {
                workflow_name: "StarAlign".to_string(),
                main_wdl: "import \"align.wdl\" as a\nworkflow StarAlign {}".to_string(),
                imports,
                input_mapping: mapping,
                images: vec![],
            },
            workspace_operation: false,
            created_at: Utc::now(),
        }
    }

    fn converted() -> ConvertedArguments {
        let mut args = ConvertedArguments::default();
        args.converted
            .insert("r1_files".to_string(), json!(["/data/a.fq", "/data/b.fq"]));
        args.converted.insert("genome".to_string(), json!("GRCh38"));
        args
    }

    #[test]
    fn test_workflow_inputs_skip_missing_optional() {
        let op = operation(BTreeMap::new());
        let ExecutionPayload::Workflow { input_mapping, .. } = &op.payload else {
            unreachable!()
        };
        let inputs = workflow_inputs(input_mapping, &converted());
        assert_eq!(
            Value::Object(inputs),
            json!({"StarAlign.r1_files": ["/data/a.fq", "/data/b.fq"], "StarAlign.genome": "GRCh38"})
        );
    }

    #[test]
    fn test_status_mapping_and_prefix_strip() {
        assert_eq!(map_status("On Hold").unwrap(), BackendStatus::Pending);
        assert_eq!(map_status("Aborting").unwrap(), BackendStatus::Running);
        assert!(matches!(map_status("Aborted").unwrap(), BackendStatus::Failed(_)));
        assert!(map_status("Exploded").is_err());

        let stripped = strip_workflow_prefix(
            json!({"StarAlign.aligned_bams": ["/x.bam"], "plain": 1})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(Value::Object(stripped), json!({"aligned_bams": ["/x.bam"], "plain": 1}));
    }

    #[test]
    fn test_dependencies_zip_keeps_import_names() {
        let mut imports = BTreeMap::new();
        imports.insert("align.wdl".to_string(), "task align {}".to_string());
        imports.insert("qc.wdl".to_string(), "task qc {}".to_string());
        let bytes = dependencies_zip(&imports).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut content = String::new();
        std::io::Read::read_to_string(&mut archive.by_name("align.wdl").unwrap(), &mut content)
            .unwrap();
        assert_eq!(content, "task align {}");
        assert!(archive.by_name("qc.wdl").is_ok());
    }

    #[test]
    fn test_output_paths_confined_to_outputs_root() {
        let root = tempfile::tempdir().unwrap();
        let engine_root = root.path().join("cromwell-executions");
        std::fs::create_dir_all(&engine_root).unwrap();
        let backend = CromwellBackend::new("http://localhost:8000", Duration::from_secs(1))
            .unwrap()
            .with_outputs_root(&engine_root);
        let job = ExecutedOperation::submitted(
            Uuid::new_v4(),
            &operation(BTreeMap::new()),
            None,
            None,
            ConvertedArguments::default(),
            "wf-1".to_string(),
            root.path().join("exec"),
        );

        let inside = engine_root.join("StarAlign/wf-1/call-align/a.bam");
        assert_eq!(
            backend
                .output_path(&job, "aligned_bams", &inside.display().to_string())
                .unwrap(),
            inside
        );
        for raw in [
            "/etc/passwd".to_string(),
            engine_root.join("../secrets.txt").display().to_string(),
            root.path().join("exec/a.bam").display().to_string(),
        ] {
            assert!(matches!(
                backend.output_path(&job, "aligned_bams", &raw),
                Err(JobFailure::InvalidOutput { .. })
            ));
        }

        // Without an outputs root the execution dir is the boundary
        let plain = CromwellBackend::new("http://localhost:8000", Duration::from_secs(1)).unwrap();
        assert!(plain.output_path(&job, "aligned_bams", "/bams/a.bam").is_err());
        assert_eq!(
            plain.output_path(&job, "aligned_bams", "a.bam").unwrap(),
            root.path().join("exec/a.bam")
        );
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_submit_poll_collect_abort_against_mock() {
        let bodies = Arc::new(Mutex::new(Vec::<String>::new()));
        let captured = bodies.clone();
        let app = Router::new()
            .route(
                "/api/workflows/v1",
                post(move |body: axum::body::Bytes| {
                    let captured = captured.clone();
                    async move {
                        captured.lock().await.push(String::from_utf8_lossy(&body).into_owned());
                        Json(json!({"id": "wf-1", "status": "Submitted"}))
                    }
                }),
            )
            .route(
                "/api/workflows/v1/{id}/status",
                get(|AxumPath(id): AxumPath<String>| async move {
                    Json(json!({"id": id, "status": "Running"}))
                }),
            )
            .route(
                "/api/workflows/v1/{id}/outputs",
                get(|| async {
                    Json(json!({"id": "wf-1", "outputs": {"StarAlign.aligned_bams": ["/bams/a.bam"]}}))
                }),
            )
            .route("/api/workflows/v1/{id}/abort", post(|| async { Json(json!({"status": "Aborting"})) }));
        let base = spawn(app).await;

        let backend = CromwellBackend::new(&base, Duration::from_secs(5)).unwrap();
        let exec = tempfile::tempdir().unwrap();
        let mut imports = BTreeMap::new();
        imports.insert("align.wdl".to_string(), "task align {}".to_string());
        let op = operation(imports);
        let inputs = converted();
        let handle = backend
            .dispatch(DispatchRequest {
                execution_id: Uuid::new_v4(),
                operation: &op,
                inputs: &inputs,
                execution_dir: exec.path(),
            })
            .await
            .unwrap();
        assert_eq!(handle, "wf-1");
        assert_eq!(std::fs::read_dir(exec.path()).unwrap().count(), 0);
        {
            let bodies = bodies.lock().await;
            assert!(bodies[0].contains("workflowSource"));
            assert!(bodies[0].contains("workflowInputs"));
            assert!(bodies[0].contains("StarAlign.genome"));
            assert!(bodies[0].contains("name=\"workflowDependencies\""));
            assert!(bodies[0].contains("import \"align.wdl\" as a"));
            assert!(bodies[0].contains("task align {}"));
        }

        let mut job = ExecutedOperation::submitted(
            Uuid::new_v4(),
            &op,
            None,
            None,
            inputs,
            handle,
            exec.path().to_path_buf(),
        );
        assert_eq!(backend.poll(&job).await.unwrap(), BackendStatus::Running);
        job.status = ExecutionStatus::Running;
        assert_eq!(
            backend.collect_outputs(&job).await.unwrap(),
            json!({"aligned_bams": ["/bams/a.bam"]})
        );
        assert!(backend.cancel(&job).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejection_and_unreachable() {
        let app = Router::new().route(
            "/api/workflows/v1",
            post(|| async { (axum::http::StatusCode::BAD_REQUEST, "bad inputs") }),
        );
        let base = spawn(app).await;
        let backend = CromwellBackend::new(&base, Duration::from_secs(5)).unwrap();
        let exec = tempfile::tempdir().unwrap();
        let op = operation(BTreeMap::new());
        let inputs = converted();
        let request = DispatchRequest {
            execution_id: Uuid::new_v4(),
            operation: &op,
            inputs: &inputs,
            execution_dir: exec.path(),
        };
        assert!(matches!(
            backend.dispatch(request).await,
            Err(DispatchError::Rejected(m)) if m.contains("bad inputs")
        ));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let backend = CromwellBackend::new(&closed, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            backend.dispatch(request).await,
            Err(DispatchError::Unreachable(_))
        ));
    }
}
