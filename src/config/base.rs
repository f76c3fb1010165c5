//! Base configuration structures and utilities
//! 基础配置结构和工具

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Base logging configuration / 基础日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level / 日志级别
    pub level: String,
    /// Log format / 日志格式
    pub format: String,
    /// Log output file / 日志输出文件
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

impl LogConfig {
    /// Convert to the common LoggingConfig used by init_tracing
    /// 转换为init_tracing使用的通用LoggingConfig
    pub fn to_logging_config(&self) -> crate::config::LoggingConfig {
        crate::config::LoggingConfig {
            level: self.level.clone(),
            format: self.format.clone(),
            file_enabled: self.file.is_some(),
            file_path: self.file.as_ref().map(PathBuf::from),
        }
    }
}

/// Storage configuration / 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend type (memory, sled) / 存储后端类型
    pub backend: String,
    /// Storage data directory / 存储数据目录
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sled".to_string(),
            data_dir: "./data/mev".to_string(),
        }
    }
}

/// Execution layout and polling / 执行目录布局与轮询
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Parent of per-job execution directories / 每个作业执行目录的父目录
    pub executed_operations_dir: PathBuf,
    /// Root directory holding resource files / 存放资源文件的根目录
    pub resource_root: PathBuf,
    /// Seconds between advance passes / 两次推进之间的秒数
    pub poll_interval_secs: u64,
    /// Maximum records advanced concurrently / 并发推进的最大记录数
    pub max_concurrent_advances: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            executed_operations_dir: PathBuf::from("./data/executed_operations"),
            resource_root: PathBuf::from("./data/resources"),
            poll_interval_secs: 15,
            max_concurrent_advances: 8,
        }
    }
}

impl ExecutionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Local docker backend configuration / 本地docker后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Enable the local backend / 启用本地后端
    pub enabled: bool,
    /// docker binary / docker可执行文件
    pub binary: String,
    /// Image repository (organization) prefix / 镜像仓库（组织）前缀
    pub image_repository: String,
    /// Mount point of the execution directory inside the container
    /// 执行目录在容器内的挂载点
    pub container_workdir: String,
    /// Timeout for each docker CLI call / 每次docker命令调用的超时
    pub command_timeout_secs: u64,
    /// Extra arguments inserted into `docker run` / 插入到`docker run`的额外参数
    pub extra_run_args: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "docker".to_string(),
            image_repository: "ghcr.io/web-mev".to_string(),
            container_workdir: "/out".to_string(),
            command_timeout_secs: 60,
            extra_run_args: Vec::new(),
        }
    }
}

impl DockerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Remote workflow engine configuration / 远程工作流引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CromwellConfig {
    /// Enable the remote backend / 启用远程后端
    pub enabled: bool,
    /// Engine base URL / 引擎基础URL
    pub base_url: String,
    /// Request timeout in seconds / 请求超时（秒）
    pub timeout_secs: u64,
    /// Directory the engine writes workflow outputs under; outputs elsewhere
    /// are refused. Unset means the execution dir.
    /// 引擎写入工作流输出的目录；其他位置的输出会被拒绝。未设置时为执行目录。
    pub outputs_root: Option<PathBuf>,
}

impl Default for CromwellConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:8000".to_string(),
            timeout_secs: 30,
            outputs_root: None,
        }
    }
}

impl CromwellConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Container image registry configuration / 容器镜像仓库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Verify images exist before accepting an operation / 接受操作前验证镜像存在
    pub verify_images: bool,
    /// Registry v2 base URL used for unqualified images / 用于未限定镜像的v2仓库地址
    pub base_url: String,
    /// Lookup timeout in seconds / 查询超时（秒）
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            verify_images: true,
            base_url: "https://ghcr.io".to_string(),
            timeout_secs: 10,
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// An operation directory to ingest at startup / 启动时摄取的操作目录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSourceConfig {
    /// Directory containing `operation_spec.json` / 包含`operation_spec.json`的目录
    pub dir: PathBuf,
    /// Source repository URL / 源代码仓库URL
    pub repository_url: String,
    /// Commit hash the directory was checked out at / 目录检出的提交哈希
    pub commit_hash: String,
}
