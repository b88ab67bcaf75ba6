//! 规则引擎服务
//!
//! 从标准输入逐行读取 JSON 事件并发评估，执行记录以 JSON 行输出到标准输出。
//! 收到 Ctrl+C 或 SIGTERM 后停止读取，等待进行中的评估完成再退出。
//! 指标与健康检查端点由 observability 模块在 metrics_port 上提供。

use anyhow::Result;
use engine_shared::config::AppConfig;
use engine_shared::observability;
use rule_engine::{ExecutionRecord, RuleEngine, ingest, loader};
use tokio::io::BufReader;
use tokio::signal;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "script-rule-engine";

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(environment = %config.environment, "Starting {}...", SERVICE_NAME);

    let engine = RuleEngine::new(&config.engine);

    if let Some(path) = &config.engine.rules_file {
        match loader::load_file(path, engine.store()) {
            Ok(summary) => info!(
                rules = summary.rules,
                triggers = summary.triggers,
                actions = summary.actions,
                "Loaded rules from {}",
                path
            ),
            Err(e) => warn!(error = %e, "Failed to load rules from {}, starting with empty store", path),
        }
    }

    let limit = config.engine.max_concurrent_evaluations.max(1);
    let stdin = BufReader::new(tokio::io::stdin());
    let summary = ingest::process_stream(&engine, stdin, limit, shutdown_signal(), print_records).await?;

    info!(
        accepted = summary.accepted,
        skipped = summary.skipped,
        "Service shutdown complete"
    );
    Ok(())
}

/// 执行记录以 JSON 行输出到标准输出
fn print_records(records: Vec<ExecutionRecord>) {
    for record in records {
        match serde_json::to_string(&record) {
            Ok(json) => println!("{}", json),
            Err(e) => error!(event_id = %record.event_id, error = %e, "Failed to serialize record"),
        }
    }
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
