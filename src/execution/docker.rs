//! Local containerized execution / 本地容器执行
//!
//! Jobs run as detached `docker run` containers. The execution directory is
//! mounted at the configured container workdir and the resource root is
//! mounted read-only at its host path, so converted resource paths stay valid
//! inside the container. The job writes `outputs.json` into its workdir.
//! 作业以分离模式的容器运行；执行目录挂载到容器工作目录，资源根目录以只读方式
//! 挂载到相同路径。作业在工作目录中写出`outputs.json`。

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::backend::{
    confined_path, BackendStatus, DispatchError, DispatchRequest, ExecutionBackend, JobFailure,
};
use super::ExecutedOperation;
use crate::config::base::DockerConfig;
use crate::operations::{ExecutionMode, ExecutionPayload};

/// Manifest file written by local jobs / 本地作业写出的清单文件
pub const OUTPUT_MANIFEST: &str = "outputs.json";

const INSPECT_FORMAT: &str = "{{.State.Status}} {{.State.ExitCode}}";

/// Local docker backend / 本地docker后端
#[derive(Debug, Clone)]
pub struct LocalDockerBackend {
    config: DockerConfig,
    resource_root: PathBuf,
}

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl LocalDockerBackend {
    pub fn new(config: DockerConfig, resource_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            resource_root: resource_root.into(),
        }
    }

    /// Container name for an execution / 执行对应的容器名
    pub fn container_name(execution_id: &uuid::Uuid) -> String {
        format!("mev-{}", execution_id)
    }

    /// Arguments passed to the docker binary for `run`
    /// 传给docker的`run`参数
    pub fn build_run_args(
        &self,
        container_name: &str,
        execution_dir: &Path,
        resource_root: &Path,
        image: &str,
        command: &[String],
    ) -> Vec<String> {
        let workdir = &self.config.container_workdir;
        let root = resource_root.display().to_string();
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "-v".to_string(),
            format!("{}:{}", execution_dir.display(), workdir),
            "-v".to_string(),
            format!("{}:{}:ro", root, root),
            "-w".to_string(),
            workdir.clone(),
        ];
        args.extend(self.config.extra_run_args.iter().cloned());
        args.push(image.to_string());
        args.extend(command.iter().cloned());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<CommandOutput, DispatchError> {
        debug!(binary = %self.config.binary, args = ?args, "invoking docker");
        let mut command = Command::new(&self.config.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.output();
        let output = tokio::time::timeout(self.config.command_timeout(), child)
            .await
            .map_err(|_| {
                DispatchError::Unreachable(format!(
                    "{} did not respond within {}s",
                    self.config.binary, self.config.command_timeout_secs
                ))
            })?
            .map_err(|e| DispatchError::Unreachable(format!("{}: {}", self.config.binary, e)))?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn manifest_path(job: &ExecutedOperation) -> PathBuf {
        job.execution_dir.join(OUTPUT_MANIFEST)
    }
}

/// Daemon connection problems and images that cannot be pulled will not go
/// away on retry; anything else is treated as a rejection.
/// 守护进程连接问题和无法拉取的镜像重试也无效；其余情况视为拒绝。
fn classify_failure(stderr: &str) -> DispatchError {
    const UNREACHABLE: [&str; 7] = [
        "Cannot connect to the Docker daemon",
        "Is the docker daemon running",
        "error during connect",
        "connection refused",
        "Unable to find image",
        "pull access denied",
        "manifest unknown",
    ];
    let lower = stderr.to_ascii_lowercase();
    if UNREACHABLE
        .iter()
        .any(|needle| lower.contains(&needle.to_ascii_lowercase()))
    {
        DispatchError::Unreachable(stderr.to_string())
    } else {
        DispatchError::Rejected(stderr.to_string())
    }
}

fn parse_inspect(line: &str) -> Result<BackendStatus, DispatchError> {
    let mut parts = line.split_whitespace();
    let state = parts.next().unwrap_or_default();
    let exit_code = parts.next().and_then(|c| c.parse::<i64>().ok());
    match state {
        "created" => Ok(BackendStatus::Pending),
        "running" | "restarting" | "paused" | "removing" => Ok(BackendStatus::Running),
        "exited" | "dead" => match exit_code {
            Some(0) => Ok(BackendStatus::Succeeded),
            Some(code) => Ok(BackendStatus::Failed(format!(
                "container exited with code {}",
                code
            ))),
            None => Ok(BackendStatus::Failed(format!("container is {}", state))),
        },
        other => Err(DispatchError::Rejected(format!(
            "unrecognized container state '{}'",
            other
        ))),
    }
}

#[async_trait]
impl ExecutionBackend for LocalDockerBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::LocalDocker
    }

    async fn dispatch(&self, request: DispatchRequest<'_>) -> Result<String, DispatchError> {
        let image = match &request.operation.payload {
            ExecutionPayload::Local { image, .. } => image.clone(),
            ExecutionPayload::Workflow { .. } => {
                return Err(DispatchError::Rejected(
                    "operation has no local entrypoint".to_string(),
                ))
            }
        };
        let template = match request.operation.entrypoint() {
            Some(Ok(t)) => t,
            Some(Err(e)) => return Err(DispatchError::Rejected(e.to_string())),
            None => {
                return Err(DispatchError::Rejected(
                    "operation has no local entrypoint".to_string(),
                ))
            }
        };

        let workdir = self.config.container_workdir.clone();
        let job_id = request.execution_id.to_string();
        let command = template
            .render_args(|key| match key {
                "execution_dir" => Some(Value::String(workdir.clone())),
                "job_id" => Some(Value::String(job_id.clone())),
                other => request.inputs.get(other).cloned(),
            })
            .map_err(|e| DispatchError::Rejected(e.to_string()))?;

        let resource_root = tokio::fs::canonicalize(&self.resource_root)
            .await
            .unwrap_or_else(|_| self.resource_root.clone());
        let name = Self::container_name(&request.execution_id);
        let args =
            self.build_run_args(&name, request.execution_dir, &resource_root, &image, &command);

        let output = self.docker(&args).await?;
        if !output.success {
            return Err(classify_failure(&output.stderr));
        }
        let container_id = output.stdout.lines().last().unwrap_or_default().to_string();
        if container_id.is_empty() {
            return Err(DispatchError::Rejected(
                "docker run returned no container id".to_string(),
            ));
        }
        info!(
            execution_id = %request.execution_id,
            container = %container_id,
            image = %image,
            "container started"
        );
        Ok(container_id)
    }

    async fn poll(&self, job: &ExecutedOperation) -> Result<BackendStatus, DispatchError> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            INSPECT_FORMAT.to_string(),
            job.job_handle.clone(),
        ];
        let output = self.docker(&args).await?;
        if !output.success {
            if output.stderr.contains("No such") {
                return Ok(BackendStatus::Failed(format!(
                    "container {} no longer exists",
                    job.job_handle
                )));
            }
            return Err(classify_failure(&output.stderr));
        }
        parse_inspect(&output.stdout)
    }

    async fn collect_outputs(&self, job: &ExecutedOperation) -> Result<Value, JobFailure> {
        let path = Self::manifest_path(job);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JobFailure::MissingManifest {
                    path: path.display().to_string(),
                })
            }
            Err(e) => return Err(JobFailure::MalformedManifest(e.to_string())),
        };
        serde_json::from_str(&raw).map_err(|e| JobFailure::MalformedManifest(e.to_string()))
    }

    async fn cancel(&self, job: &ExecutedOperation) -> Result<bool, DispatchError> {
        let args = vec!["stop".to_string(), job.job_handle.clone()];
        let output = self.docker(&args).await?;
        if !output.success {
            warn!(container = %job.job_handle, stderr = %output.stderr, "docker stop failed");
        }
        Ok(output.success)
    }

    fn output_path(
        &self,
        job: &ExecutedOperation,
        key: &str,
        raw: &str,
    ) -> Result<PathBuf, JobFailure> {
        // Container workdir paths map onto the execution dir
        let workdir = self.config.container_workdir.trim_end_matches('/');
        let host = match raw.strip_prefix(workdir) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                job.execution_dir.join(rest.trim_start_matches('/'))
            }
            _ => PathBuf::from(raw),
        };
        confined_path(&job.execution_dir, &host).map_err(|reason| JobFailure::InvalidOutput {
            key: key.to_string(),
            reason,
        })
    }
}
