mod control;
mod dash;
mod http_client;
mod model;

use std::sync::Arc;

use clap::Parser;
use control::{ControlService, create_control_router};
use dash::db::Database;
use dash::fleet::FleetApi;
use dash::registrar::PartnerRegistrar;
use dash::scheduler::PollingScheduler;
use dash::sink::{DashboardSink, WatchSink};
use dash::token_manager::TokenManager;
use model::arg::Args;
use model::config::Config;

#[tokio::main]
async fn main() {
    // 解析命令行参数
    let args = Args::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    if let Err(e) = run(args).await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    // 加载配置
    let config_path = args
        .config
        .unwrap_or_else(|| Config::default_config_path().to_string());
    let config = Config::load(&config_path)?;

    // 打开 SQLite 数据库
    let db = Database::open(&config.database_path)?;
    tracing::info!("数据库已打开: {}", config.database_path);

    // 首次启动时用配置文件填充记录
    let first_run = !db.has_record()?;
    let mut record = db.load_record()?;
    if record.seed_from(&config) || first_run {
        db.save_record(&record)?;
        tracing::info!("已从配置文件初始化仪表盘记录");
    }

    tracing::debug!("凭据: {:?}", record.credentials);
    if !record.credentials.is_complete() {
        tracing::warn!("未配置 clientId / clientSecret，请通过 PUT /api/settings 设置");
    }
    if let Some(proxy_url) = record.polling.proxy_url() {
        tracing::info!("已配置 CORS 代理: {}", proxy_url);
    }
    if let Some(telemetry_url) = record.polling.telemetry_url() {
        tracing::info!("已配置遥测中继: {}", telemetry_url);
    }

    // 组装核心组件
    let client = http_client::build_client(config.request_timeout_secs)?;
    let sink = Arc::new(WatchSink::new());
    let dashboard_sink: Arc<dyn DashboardSink> = sink.clone();
    let fleet = FleetApi::new(client.clone(), &config.api_base);
    let tokens = Arc::new(TokenManager::new(
        db.clone(),
        client.clone(),
        &config.auth_base,
        &config.api_base,
    ));
    let registrar = Arc::new(PartnerRegistrar::new(
        tokens.clone(),
        fleet.clone(),
        dashboard_sink.clone(),
        config.fallback_domain(),
    ));
    let scheduler = PollingScheduler::new(
        tokens.clone(),
        registrar.clone(),
        dashboard_sink,
        fleet.clone(),
        client,
    );
    let service = ControlService::new(tokens, registrar, scheduler, sink, fleet);

    // 有 Token 和车辆时恢复轮询
    if record.token.access_token.is_some()
        && (record.vehicle.vehicle_id().is_some() || record.vehicle.vin().is_some())
    {
        match service.resume().await {
            Ok(_) => tracing::info!("已恢复轮询"),
            Err(e) => tracing::warn!("恢复轮询失败: {}", e),
        }
    }

    let app = create_control_router(service);

    // 启动服务器
    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("启动仪表盘控制接口: {}", addr);
    tracing::info!("可用 API:");
    tracing::info!("  GET  /api/status");
    tracing::info!("  POST /api/oauth/start");
    tracing::info!("  GET  /oauth/callback");
    tracing::info!("  GET  /api/vehicles");
    tracing::info!("  POST /api/vehicles/select");
    tracing::info!("  PUT  /api/settings");
    tracing::info!("  POST /api/polling/start");
    tracing::info!("  POST /api/polling/stop");
    tracing::info!("  POST /api/polling/refresh");
    tracing::info!("  POST /api/visibility");
    tracing::info!("OAuth 回调地址: {}", record.redirect_uri().unwrap_or("-"));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
