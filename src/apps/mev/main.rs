//! MEV engine main entry point
//! MEV引擎主入口点

use anyhow::Context;
use clap::Parser;
use mev_engine::config::{init_tracing, CliArgs, Command, MevConfig};
use mev_engine::operations::SourceRef;
use mev_engine::MevService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments / 解析命令行参数
    let args = CliArgs::parse();
    let log_args = format!("{:?}", args);

    // Layered configuration with CLI overrides on top / 分层配置，CLI覆盖优先
    let config = MevConfig::load_with_cli(&args)?;

    // Initialize logging with configuration / 使用配置初始化日志
    init_tracing(&config.log.to_logging_config())?;
    tracing::info!("Starting MEV engine with args: {}", log_args);

    let service = MevService::from_config(config)
        .await
        .context("Failed to initialize engine service")?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Ingest { dir, repo, commit } => {
            let operation = service
                .ingest_dir(&dir, SourceRef::new(repo, commit))
                .await
                .with_context(|| format!("Failed to ingest {}", dir.display()))?;
            println!("{}", operation.id);
        }
        Command::Serve => {
            let cfg = service.config();
            tracing::info!("MEV engine serving with:");
            tracing::info!("  - Storage backend: {}", cfg.storage.backend);
            tracing::info!("  - Executed operations dir: {:?}", cfg.execution.executed_operations_dir);
            tracing::info!("  - Poll interval: {}s", cfg.execution.poll_interval_secs);
            tracing::info!("  - Local docker: {}", cfg.docker.enabled);
            tracing::info!("  - Cromwell: {} ({})", cfg.cromwell.enabled, cfg.cromwell.base_url);

            let results = service.ingest_configured().await;
            let rejected = results.iter().filter(|(_, r)| r.is_err()).count();
            tracing::info!(
                ingested = results.len() - rejected,
                rejected,
                "configured operations processed"
            );

            service
                .poll_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for ctrl-c: {}", e);
                    }
                })
                .await;
            tracing::info!("MEV engine shutting down");
        }
    }

    Ok(())
}
