use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use token_stats_rs::model::config::Config;
use token_stats_rs::model::settings::SettingsStore;
use token_stats_rs::recorder::{LogRecorder, PricingTable};
use token_stats_rs::token_stats::{
    RetentionConfigProvider, TokenStats, TokenStatsState, create_token_stats_router,
    spawn_maintenance,
};

#[derive(Parser, Debug)]
#[command(name = "token-stats-rs", version, about = "本地 Token 用量统计服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = Config::default_config_path())]
    config: PathBuf,

    /// 数据库文件路径（覆盖配置文件中的 dbPath）
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("加载配置失败: {}", args.config.display()))?;
    if let Some(db) = args.db {
        config.db_path = db;
    }
    tracing::info!(config = %args.config.display(), db = %config.db_path.display(), "配置已加载");

    let stats = Arc::new(
        TokenStats::open(&config.db_path, config.batch.clone())
            .with_context(|| format!("打开数据库失败: {}", config.db_path.display()))?,
    );
    let retention: Arc<dyn RetentionConfigProvider> = Arc::new(SettingsStore::new(config.clone()));
    let recorder = Arc::new(LogRecorder::new(
        stats.clone(),
        PricingTable::new(config.pricing.clone()),
    ));

    let maintenance = spawn_maintenance(stats.clone(), retention.clone(), config.maintenance.clone());

    let state = TokenStatsState {
        admin_api_key: config.admin_api_key.clone(),
        stats: stats.clone(),
        recorder,
        retention,
    };
    if state.admin_api_key.is_none() {
        tracing::warn!("未配置 adminApiKey，Token 统计 API 不做认证");
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = Router::new()
        .nest("/api/token-stats", create_token_stats_router(state))
        .layer(cors);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听失败: {}", addr))?;
    tracing::info!("Token 统计服务已启动: http://{}/api/token-stats", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP 服务异常退出")?;

    // 先停维护任务，再刷盘关闭
    maintenance.stop().await;
    stats.shutdown().await;
    tracing::info!("已退出");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // 无法监听信号时保持运行
        tracing::error!(error = %e, "监听 Ctrl-C 失败");
        std::future::pending::<()>().await;
    }
    tracing::info!("收到退出信号，开始关闭");
}
