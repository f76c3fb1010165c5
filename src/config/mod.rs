//! Configuration management for the MEV engine
//! MEV引擎的配置管理
//!
//! This module provides a layered configuration framework that supports:
//! - Command line arguments / 命令行参数
//! - Environment variables (`MEV_` prefix) / 环境变量（`MEV_`前缀）
//! - Configuration files (TOML) / 配置文件（TOML）
//! - Built-in defaults / 内置默认值
//!
//! Nested keys are addressed in the environment with a double underscore,
//! e.g. `MEV_DOCKER__IMAGE_REPOSITORY`.
//! 环境变量中的嵌套键使用双下划线表示，例如`MEV_DOCKER__IMAGE_REPOSITORY`。

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Base configuration sections / 基础配置段
pub mod base;
/// Engine configuration and CLI / 引擎配置与命令行
pub mod mev;

pub use crate::storage::kv::KvStoreConfig;
pub use base::*;
pub use mev::{CliArgs, Command, MevConfig};

/// Base configuration trait / 基础配置特征
/// All application configurations should implement this trait
/// 所有应用程序配置都应该实现此特征
pub trait AppConfig: for<'de> Deserialize<'de> + Serialize + Clone + std::fmt::Debug {
    /// Environment variable prefix / 环境变量前缀
    const ENV_PREFIX: &'static str;

    /// Get default configuration values
    /// 获取默认配置值
    fn default_config() -> Self;

    /// Build the layered figment without CLI overrides
    /// 构建不含CLI覆盖的分层figment
    ///
    /// Precedence order (highest to lowest):
    /// 优先级顺序（从高到低）：
    /// 1. Environment variables / 环境变量
    /// 2. Configuration file / 配置文件
    /// 3. Default values / 默认值
    fn figment(config_path: Option<&Path>) -> Figment {
        let file = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("config.toml"));
        Figment::new()
            .merge(Serialized::defaults(Self::default_config()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"))
    }

    /// Load configuration from a specific file
    /// 从特定文件加载配置
    fn load_from_file(path: &Path) -> Result<Self> {
        let config: Self = Self::figment(Some(path))
            .extract()
            .context("Failed to load configuration from file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with a CLI provider on top (highest priority)
    /// 加载配置并以CLI提供者覆盖（最高优先级）
    fn load_with_overrides<P: Provider>(config_path: Option<&Path>, overrides: P) -> Result<Self> {
        let config: Self = Self::figment(config_path)
            .merge(overrides)
            .extract()
            .context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    /// 验证配置
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Common logging configuration / 通用日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) / 日志级别
    pub level: String,
    /// Log format (json, compact, pretty) / 日志格式
    pub format: String,
    /// Enable file logging / 启用文件日志
    pub file_enabled: bool,
    /// Log file path / 日志文件路径
    pub file_path: Option<PathBuf>,
}

static FILE_LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_enabled: false,
            file_path: None,
        }
    }
}

type BoxedLayer = Box<dyn tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync>;

fn fmt_layer<W>(format: &str, writer: W) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    use tracing_subscriber::Layer;

    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_level(true)
        .with_writer(writer);
    match format {
        "json" => layer.json().boxed(),
        "compact" => layer.compact().boxed(),
        _ => layer.pretty().boxed(),
    }
}

/// Initialize tracing based on logging configuration
/// 基于日志配置初始化跟踪
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.level.trim().is_empty() {
            EnvFilter::new("info")
        } else {
            EnvFilter::new(config.level.clone())
        }
    });

    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(&config.format, std::io::stdout)];

    if config.file_enabled {
        if let Some(path) = config.file_path.as_ref() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir: {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file: {}", path.display()))?;
            let (file_writer, guard) = tracing_appender::non_blocking(file);
            let _ = FILE_LOG_GUARD.set(guard);
            // Files never get the multi-line pretty format / 文件不使用多行pretty格式
            let file_format = if config.format == "json" { "json" } else { "compact" };
            layers.push(fmt_layer(file_format, file_writer));
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
