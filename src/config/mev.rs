//! MEV engine configuration and command line
//! MEV引擎配置与命令行

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use figment::{
    value::{Map, Value},
    Metadata, Profile, Provider,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::base::{
    CromwellConfig, DockerConfig, ExecutionConfig, LogConfig, OperationSourceConfig,
    RegistryConfig, StorageConfig,
};
use super::AppConfig;

/// MEV engine command line arguments / MEV引擎命令行参数
#[derive(Parser, Debug, Clone)]
#[command(
    name = "mev-engine",
    version,
    about = "MEV engine - operation ingestion and job execution\nMEV引擎 - 操作摄取与作业执行",
    long_about = "Ingests analysis operations, validates submitted arguments and tracks jobs on local docker or a remote Cromwell engine.\n摄取分析操作，验证提交的参数，并在本地docker或远程Cromwell引擎上跟踪作业。"
)]
pub struct CliArgs {
    /// Configuration file path / 配置文件路径
    #[arg(short, long, value_name = "FILE", help = "Configuration file path / 配置文件路径")]
    pub config: Option<PathBuf>,

    /// Log level / 日志级别
    #[arg(long, value_name = "LEVEL", help = "Log level (trace, debug, info, warn, error) / 日志级别")]
    pub log_level: Option<String>,

    /// Storage backend type / 存储后端类型
    #[arg(long, value_name = "BACKEND", help = "Storage backend type (memory, sled) / 存储后端类型")]
    pub storage_backend: Option<String>,

    /// Storage path for file-based backends / 基于文件的后端存储路径
    #[arg(long, value_name = "PATH", help = "Storage path for file-based backends / 基于文件的后端存储路径")]
    pub storage_path: Option<String>,

    /// Poll interval in seconds / 轮询间隔（秒）
    #[arg(long, value_name = "SECONDS", help = "Seconds between job advance passes / 作业推进间隔（秒）")]
    pub poll_interval: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands / 子命令
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Ingest configured operations, then advance jobs until ctrl-c
    /// 摄取配置的操作，然后推进作业直到ctrl-c
    Serve,
    /// Ingest a single operation directory and print its id
    /// 摄取单个操作目录并打印其ID
    Ingest {
        /// Operation directory / 操作目录
        dir: PathBuf,
        /// Source repository URL / 源代码仓库URL
        #[arg(long)]
        repo: String,
        /// Commit hash / 提交哈希
        #[arg(long)]
        commit: String,
    },
}

/// Custom Figment provider for command line arguments
/// 命令行参数的自定义Figment提供者
impl Provider for CliArgs {
    fn metadata(&self) -> Metadata {
        Metadata::named("CLI Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Map<String, Value>>, figment::Error> {
        let mut map: Map<String, Value> = Map::new();

        // Only add values that were explicitly provided / 只添加明确提供的值
        if let Some(ref level) = self.log_level {
            let mut log_map: Map<String, Value> = Map::new();
            log_map.insert("level".to_string(), Value::from(level.clone()));
            map.insert("log".to_string(), Value::from(log_map));
        }

        if self.storage_backend.is_some() || self.storage_path.is_some() {
            let mut storage_map: Map<String, Value> = Map::new();
            if let Some(ref backend) = self.storage_backend {
                storage_map.insert("backend".to_string(), Value::from(backend.clone()));
            }
            if let Some(ref path) = self.storage_path {
                storage_map.insert("data_dir".to_string(), Value::from(path.clone()));
            }
            map.insert("storage".to_string(), Value::from(storage_map));
        }

        if let Some(interval) = self.poll_interval {
            let mut execution_map: Map<String, Value> = Map::new();
            execution_map.insert("poll_interval_secs".to_string(), Value::from(interval));
            map.insert("execution".to_string(), Value::from(execution_map));
        }

        Ok(Map::from([(Profile::Default, map)]))
    }
}

/// MEV engine configuration / MEV引擎配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MevConfig {
    /// Logging configuration / 日志配置
    pub log: LogConfig,
    /// Record storage / 记录存储
    pub storage: StorageConfig,
    /// Execution layout and polling / 执行布局与轮询
    pub execution: ExecutionConfig,
    /// Local docker backend / 本地docker后端
    pub docker: DockerConfig,
    /// Remote Cromwell backend / 远程Cromwell后端
    pub cromwell: CromwellConfig,
    /// Image registry checks / 镜像仓库检查
    pub registry: RegistryConfig,
    /// Operations ingested at startup / 启动时摄取的操作
    pub operations: Vec<OperationSourceConfig>,
}

impl MevConfig {
    /// Load configuration with CLI arguments override / 使用CLI参数覆盖加载配置
    pub fn load_with_cli(args: &CliArgs) -> Result<Self> {
        Self::load_with_overrides(args.config.as_deref(), args.clone())
    }
}

impl AppConfig for MevConfig {
    const ENV_PREFIX: &'static str = "MEV_";

    fn default_config() -> Self {
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        match self.storage.backend.as_str() {
            "memory" | "sled" => {}
            other => bail!("unsupported storage backend '{}'", other),
        }
        if self.execution.poll_interval_secs == 0 {
            bail!("execution.poll_interval_secs must be positive");
        }
        if self.execution.max_concurrent_advances == 0 {
            bail!("execution.max_concurrent_advances must be positive");
        }
        if self.docker.enabled && self.docker.command_timeout_secs == 0 {
            bail!("docker.command_timeout_secs must be positive");
        }
        if self.cromwell.enabled {
            if self.cromwell.timeout_secs == 0 {
                bail!("cromwell.timeout_secs must be positive");
            }
            url::Url::parse(&self.cromwell.base_url).map_err(|e| {
                anyhow::anyhow!("invalid cromwell.base_url '{}': {}", self.cromwell.base_url, e)
            })?;
        }
        if self.registry.verify_images && self.registry.timeout_secs == 0 {
            bail!("registry.timeout_secs must be positive");
        }
        for op in &self.operations {
            if op.commit_hash.trim().is_empty() {
                bail!("operation at {} has an empty commit_hash", op.dir.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn no_args() -> CliArgs {
        CliArgs::parse_from(["mev-engine"])
    }

    #[test]
    #[serial]
    fn test_defaults_are_valid() {
        let cfg = MevConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.storage.backend, "sled");
        assert!(!cfg.cromwell.enabled);
    }

    #[test]
    #[serial]
    fn test_file_then_env_then_cli() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[log]
level = "debug"

[execution]
poll_interval_secs = 30

[docker]
image_repository = "docker.io/example"

[[operations]]
dir = "/ops/pca"
repository_url = "https://github.com/example/pca"
commit_hash = "abc1234"
"#
        )
        .unwrap();

        std::env::set_var("MEV_DOCKER__BINARY", "podman");
        let args = CliArgs::parse_from([
            "mev-engine",
            "--config",
            file.path().to_str().unwrap(),
            "--poll-interval",
            "5",
            "--storage-backend",
            "memory",
        ]);
        let cfg = MevConfig::load_with_cli(&args);
        std::env::remove_var("MEV_DOCKER__BINARY");
        let cfg = cfg.unwrap();

        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.execution.poll_interval_secs, 5);
        assert_eq!(cfg.docker.image_repository, "docker.io/example");
        assert_eq!(cfg.docker.binary, "podman");
        assert_eq!(cfg.storage.backend, "memory");
        assert_eq!(cfg.operations.len(), 1);
        assert_eq!(cfg.operations[0].commit_hash, "abc1234");
    }

    #[test]
    #[serial]
    fn test_invalid_backend_rejected() {
        let args = CliArgs::parse_from(["mev-engine", "--storage-backend", "rocksdb"]);
        assert!(MevConfig::load_with_cli(&args).is_err());
    }

    #[test]
    fn test_ingest_subcommand() {
        let args = CliArgs::parse_from([
            "mev-engine",
            "ingest",
            "/ops/pca",
            "--repo",
            "https://github.com/example/pca",
            "--commit",
            "abc1234",
        ]);
        assert_eq!(
            args.command,
            Some(Command::Ingest {
                dir: PathBuf::from("/ops/pca"),
                repo: "https://github.com/example/pca".to_string(),
                commit: "abc1234".to_string(),
            })
        );
        assert!(no_args().command.is_none());
    }
}
