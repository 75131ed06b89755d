//! 控制接口请求/响应类型

use serde::{Deserialize, Serialize};

use crate::dash::model::vehicle::{VehicleIdentity, VehicleSnapshot, VehicleSummary};
use crate::dash::scheduler::SchedulerStatus;
use crate::dash::sink::DashboardView;
use crate::dash::token_manager::OAuthPhase;

// ============ 错误响应 ============

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorResponse {
    fn new(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                error_type: error_type.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", message)
    }

    pub fn api_error(message: impl Into<String>) -> Self {
        Self::new("api_error", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

// ============ 状态 ============

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub dashboard: DashboardView,
    pub scheduler: SchedulerStatus,
    pub oauth: OAuthPhase,
    pub vehicle: VehicleIdentity,
    pub authenticated: bool,
    pub token_expires_at: Option<i64>,
}

// ============ 授权 ============

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub authorize_url: String,
}

/// 授权回调参数
#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

// ============ 车辆 ============

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclesResponse {
    pub vehicles: Vec<VehicleSummary>,
    /// 自动或手动选中的车辆
    pub selected: Option<VehicleIdentity>,
    /// 选中车辆后是否已开始轮询
    pub polling: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectVehicleRequest {
    pub vehicle_id: String,
    #[serde(default)]
    pub vin: Option<String>,
}

// ============ 设置 ============

/// 设置更新，未提供的字段保持不变，空字符串表示清除
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRequest {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    /// 手动填入的访问令牌
    pub access_token: Option<String>,
    pub vehicle_id: Option<String>,
    pub vin: Option<String>,
    pub update_interval: Option<u64>,
    pub proxy_url: Option<String>,
    pub telemetry_url: Option<String>,
}

// ============ 轮询 ============

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingResponse {
    pub running: bool,
    /// 本次调用是否改变了运行状态
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    pub visible: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub outcome: &'static str,
    pub snapshot: Option<VehicleSnapshot>,
    pub message: Option<String>,
}
