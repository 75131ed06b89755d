//! 控制接口路由配置

use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::cors::CorsLayer;

use super::handlers::{
    get_status, get_vehicles, oauth_callback, refresh_now, select_vehicle, start_oauth,
    start_polling, stop_polling, update_settings, visibility,
};
use super::service::ControlService;

/// 创建控制接口路由
///
/// # 端点
/// - `GET /api/status` - 仪表盘状态
/// - `POST /api/oauth/start` - 生成授权地址
/// - `GET /oauth/callback` - 授权回调
/// - `GET /api/vehicles` - 车辆列表
/// - `POST /api/vehicles/select` - 选择车辆
/// - `PUT /api/settings` - 保存设置
/// - `POST /api/polling/start` / `stop` / `refresh` - 轮询控制
/// - `POST /api/visibility` - 页面可见性
pub fn create_control_router(service: ControlService) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/oauth/start", post(start_oauth))
        .route("/oauth/callback", get(oauth_callback))
        .route("/api/vehicles", get(get_vehicles))
        .route("/api/vehicles/select", post(select_vehicle))
        .route("/api/settings", put(update_settings))
        .route("/api/polling/start", post(start_polling))
        .route("/api/polling/stop", post(stop_polling))
        .route("/api/polling/refresh", post(refresh_now))
        .route("/api/visibility", post(visibility))
        .layer(CorsLayer::permissive())
        .with_state(service)
}
