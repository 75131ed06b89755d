//! 控制接口错误类型定义

use std::fmt;

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;

use super::types::ErrorResponse;
use crate::dash::error::DashError;

/// 控制服务错误类型
#[derive(Debug)]
pub enum ControlError {
    /// 请求参数无效或缺少必要配置
    InvalidRequest(String),

    /// 需要用户（重新）授权
    Unauthorized(String),

    /// 上游服务调用失败（网络、API 错误等）
    Upstream(String),

    /// 内部状态错误
    Internal(String),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::InvalidRequest(msg) => write!(f, "请求参数无效: {}", msg),
            ControlError::Unauthorized(msg) => write!(f, "需要授权: {}", msg),
            ControlError::Upstream(msg) => write!(f, "上游服务错误: {}", msg),
            ControlError::Internal(msg) => write!(f, "内部错误: {}", msg),
        }
    }
}

impl std::error::Error for ControlError {}

impl ControlError {
    /// 获取对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ControlError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ControlError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 转换为 API 错误响应
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            ControlError::InvalidRequest(msg) => ErrorResponse::invalid_request(msg),
            ControlError::Unauthorized(msg) => ErrorResponse::unauthorized(msg),
            ControlError::Upstream(msg) => ErrorResponse::api_error(msg),
            ControlError::Internal(msg) => ErrorResponse::internal_error(msg),
        }
    }
}

impl From<DashError> for ControlError {
    fn from(err: DashError) -> Self {
        let message = err.to_string();
        if err.requires_reauthentication() {
            return ControlError::Unauthorized(message);
        }
        match err {
            DashError::NotConfigured(_) => ControlError::InvalidRequest(message),
            DashError::AuthExpired => ControlError::Unauthorized(message),
            DashError::Storage(_) => ControlError::Internal(message),
            _ => ControlError::Upstream(message),
        }
    }
}

impl From<anyhow::Error> for ControlError {
    fn from(err: anyhow::Error) -> Self {
        ControlError::Internal(format!("{:#}", err))
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_error_response())).into_response()
    }
}
