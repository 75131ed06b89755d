//! 控制接口 HTTP 处理器

use axum::{
    Json,
    extract::{Query, State},
    response::{Html, IntoResponse, Response},
};
use http::StatusCode;

use super::error::ControlError;
use super::service::ControlService;
use super::types::{
    AuthorizeResponse, CallbackQuery, PollingResponse, RefreshResponse, SelectVehicleRequest,
    SettingsRequest, StatusResponse, VehiclesResponse, VisibilityRequest,
};

/// GET /api/status
pub async fn get_status(
    State(service): State<ControlService>,
) -> Result<Json<StatusResponse>, ControlError> {
    service.status().map(Json)
}

/// POST /api/oauth/start
pub async fn start_oauth(
    State(service): State<ControlService>,
) -> Result<Json<AuthorizeResponse>, ControlError> {
    let authorize_url = service.begin_authorization()?;
    Ok(Json(AuthorizeResponse { authorize_url }))
}

/// GET /oauth/callback
///
/// 浏览器直接访问，返回 HTML 页面
pub async fn oauth_callback(
    State(service): State<ControlService>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    match service.handle_callback(query).await {
        Ok(Some(vehicles)) => {
            let detail = match &vehicles.selected {
                Some(vehicle) if vehicles.polling => format!(
                    "已选择车辆 {}，开始读取数据。",
                    vehicle.display_name.as_deref().or(vehicle.vin()).unwrap_or("-")
                ),
                _ => format!("找到 {} 辆车，请在仪表盘中选择。", vehicles.vehicles.len()),
            };
            callback_page(StatusCode::OK, "登录成功", &detail)
        }
        Ok(None) => callback_page(StatusCode::BAD_REQUEST, "无效的回调", "缺少 code 或 state 参数。"),
        Err(e) => callback_page(e.status_code(), "登录失败", &e.to_string()),
    }
}

fn callback_page(status: StatusCode, title: &str, detail: &str) -> Response {
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n<body><h1>{title}</h1><p>{detail}</p><p>可以关闭此窗口。</p></body>\n</html>",
        title = escape_html(title),
        detail = escape_html(detail),
    );
    (status, Html(body)).into_response()
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// GET /api/vehicles
pub async fn get_vehicles(
    State(service): State<ControlService>,
) -> Result<Json<VehiclesResponse>, ControlError> {
    service.discover_vehicles().await.map(Json)
}

/// POST /api/vehicles/select
pub async fn select_vehicle(
    State(service): State<ControlService>,
    Json(payload): Json<SelectVehicleRequest>,
) -> Result<Json<VehiclesResponse>, ControlError> {
    service.select_vehicle(payload).await.map(Json)
}

/// PUT /api/settings
pub async fn update_settings(
    State(service): State<ControlService>,
    Json(payload): Json<SettingsRequest>,
) -> Result<Json<PollingResponse>, ControlError> {
    service.update_settings(payload).await.map(Json)
}

/// POST /api/polling/start
pub async fn start_polling(
    State(service): State<ControlService>,
) -> Result<Json<PollingResponse>, ControlError> {
    service.start_polling().await.map(Json)
}

/// POST /api/polling/stop
pub async fn stop_polling(State(service): State<ControlService>) -> Json<PollingResponse> {
    Json(service.stop_polling())
}

/// POST /api/polling/refresh
pub async fn refresh_now(State(service): State<ControlService>) -> Json<RefreshResponse> {
    Json(service.refresh_now().await)
}

/// POST /api/visibility
pub async fn visibility(
    State(service): State<ControlService>,
    Json(payload): Json<VisibilityRequest>,
) -> Json<PollingResponse> {
    Json(service.visibility_changed(payload.visible))
}
