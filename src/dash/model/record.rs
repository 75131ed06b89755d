//! 持久化记录
//!
//! 凭据、Token、轮询设置和车辆身份作为一个整体序列化存储，
//! 每次外部触发的操作开始时重新读取

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::token::TokenState;
use super::vehicle::VehicleIdentity;
use crate::model::config::Config;

pub const MIN_INTERVAL_SECONDS: u64 = 1;
pub const MAX_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_INTERVAL_SECONDS: u64 = 2;

/// OAuth 客户端凭据
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.client_secret.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id_prefix: String = self.client_id.chars().take(10).collect();
        f.debug_struct("Credentials")
            .field("client_id", &format!("{}...", id_prefix))
            .field(
                "client_secret",
                &format!("已设置（长度: {}）", self.client_secret.len()),
            )
            .finish()
    }
}

/// 轮询设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollingConfig {
    /// 轮询间隔（秒，1-60）
    pub interval_seconds: u64,
    /// 遥测中继地址，配置后优先使用遥测数据源
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_url: Option<String>,
    /// CORS 代理地址
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
            telemetry_url: None,
            proxy_url: None,
        }
    }
}

impl PollingConfig {
    /// 配置的基础轮询间隔
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(
            self.interval_seconds
                .clamp(MIN_INTERVAL_SECONDS, MAX_INTERVAL_SECONDS),
        )
    }

    pub fn telemetry_url(&self) -> Option<&str> {
        self.telemetry_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }

    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

pub fn is_valid_interval(seconds: u64) -> bool {
    (MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&seconds)
}

/// 仪表盘的完整持久化状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashRecord {
    pub credentials: Credentials,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    pub token: TokenState,
    pub polling: PollingConfig,
    pub vehicle: VehicleIdentity,
}

impl DashRecord {
    /// 用配置文件中的初始值填充尚未设置的字段
    ///
    /// 返回是否有字段被填充
    pub fn seed_from(&mut self, config: &Config) -> bool {
        let mut changed = false;

        if self.credentials.client_id.is_empty()
            && let Some(client_id) = &config.client_id
        {
            self.credentials.client_id = client_id.trim().to_string();
            changed = true;
        }
        if self.credentials.client_secret.is_empty()
            && let Some(client_secret) = &config.client_secret
        {
            self.credentials.client_secret = client_secret.trim().to_string();
            changed = true;
        }
        if self.redirect_uri.is_none() {
            self.redirect_uri = Some(
                config
                    .redirect_uri
                    .clone()
                    .unwrap_or_else(|| config.default_redirect_uri()),
            );
            changed = true;
        }
        if self.polling.proxy_url.is_none() && config.proxy_url.is_some() {
            self.polling.proxy_url = config.proxy_url.clone();
            changed = true;
        }
        if self.polling.telemetry_url.is_none() && config.telemetry_url.is_some() {
            self.polling.telemetry_url = config.telemetry_url.clone();
            changed = true;
        }
        if let Some(interval) = config.update_interval
            && self.polling.interval_seconds == DEFAULT_INTERVAL_SECONDS
            && interval != DEFAULT_INTERVAL_SECONDS
        {
            self.polling.interval_seconds = interval;
            changed = true;
        }

        changed
    }

    pub fn redirect_uri(&self) -> Option<&str> {
        self.redirect_uri
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}
