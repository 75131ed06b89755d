//! 仪表盘核心错误类型

use super::model::vehicle::VehicleIdentity;

/// 区域注册错误的特征短语
const REGISTRATION_PHRASES: [&str; 2] = ["must be registered", "registered in the current region"];

/// 核心操作错误
#[derive(Debug, Clone, thiserror::Error)]
pub enum DashError {
    /// 传输层失败（主机不可达、连接被拒、超时等）
    #[error("网络请求失败: {0}")]
    NetworkFailure(String),

    /// 非 2xx 响应
    #[error("API 错误: {status} - {body}")]
    HttpError { status: u16, body: String },

    /// 授权端点拒绝了授权码或刷新令牌
    #[error("授权无效: {0}")]
    InvalidGrant(String),

    /// 访问令牌已过期（本地检查或 401）
    #[error("Token 已过期")]
    AuthExpired,

    /// 账户尚未注册到当前区域（412）
    #[error("账户需要注册到区域: {body}")]
    RegionNotRegistered { body: String },

    /// 响应结构不符合预期
    #[error("无效的响应数据: {reason}")]
    MalformedResponse {
        reason: String,
        /// 响应中顺带捕获到的车辆身份，用于修正本地记录
        identity: Option<VehicleIdentity>,
    },

    /// OAuth state 校验失败
    #[error("State 验证失败，可能存在安全风险")]
    StateMismatch,

    /// 用户在授权页拒绝或授权服务返回 error
    #[error("授权失败: {0}")]
    AuthorizationDenied(String),

    /// 缺少必要配置
    #[error("未配置: {0}")]
    NotConfigured(String),

    /// 持久化失败
    #[error("存储错误: {0}")]
    Storage(String),
}

impl DashError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        DashError::MalformedResponse {
            reason: reason.into(),
            identity: None,
        }
    }

    /// 根据状态码和响应体归类非 2xx 响应
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 401 {
            return DashError::AuthExpired;
        }
        if is_registration_required(status, &body) {
            return DashError::RegionNotRegistered { body };
        }
        DashError::HttpError { status, body }
    }

    /// 需要用户重新走授权流程
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            DashError::InvalidGrant(_)
                | DashError::StateMismatch
                | DashError::AuthorizationDenied(_)
        )
    }
}

/// 412 且错误信息包含注册短语时需要区域注册
pub fn is_registration_required(status: u16, body: &str) -> bool {
    if status != 412 {
        return false;
    }
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string());
    REGISTRATION_PHRASES
        .iter()
        .any(|phrase| message.contains(phrase))
}

impl From<reqwest::Error> for DashError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            DashError::malformed(err.to_string())
        } else {
            DashError::NetworkFailure(err.to_string())
        }
    }
}

impl From<anyhow::Error> for DashError {
    fn from(err: anyhow::Error) -> Self {
        DashError::Storage(format!("{:#}", err))
    }
}
