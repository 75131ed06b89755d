//! 服务配置
//!
//! 静态配置来自 JSON 文件；运行期可变的状态（Token、车辆、轮询设置）
//! 存放在 SQLite 记录里，配置文件只负责首次启动时的初始值

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::dash::model::record::{MAX_INTERVAL_SECONDS, MIN_INTERVAL_SECONDS};

/// Tesla 授权服务默认地址（中国区使用 .cn）
pub const DEFAULT_AUTH_BASE: &str = "https://auth.tesla.com";

/// Tesla Fleet API 默认地址（北美区）
pub const DEFAULT_API_BASE: &str = "https://fleet-api.prd.na.vn.cloud.tesla.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_auth_base")]
    pub auth_base: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// 区域注册时无法从 redirectUri 解析域名时使用的主机名
    #[serde(default)]
    pub public_host: Option<String>,

    /// 出站 HTTP 请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // ======== 以下字段仅用于首次启动时写入持久化记录 ========
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default)]
    pub redirect_uri: Option<String>,

    /// 轮询间隔（秒，1-60）
    #[serde(default)]
    pub update_interval: Option<u64>,

    /// CORS 代理地址
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// 遥测中继地址
    #[serde(default)]
    pub telemetry_url: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_database_path() -> String {
    "dash.db".to_string()
}

fn default_auth_base() -> String {
    DEFAULT_AUTH_BASE.to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_path: default_database_path(),
            auth_base: default_auth_base(),
            api_base: default_api_base(),
            public_host: None,
            request_timeout_secs: default_request_timeout_secs(),
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            update_interval: None,
            proxy_url: None,
            telemetry_url: None,
        }
    }
}

impl Config {
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// 加载配置文件
    ///
    /// 文件不存在时使用默认配置；解析失败则返回错误
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("配置文件不存在，使用默认配置: {:?}", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {:?}", path))?;
        config.normalize();
        Ok(config)
    }

    /// 规范化配置：去掉地址末尾的斜杠，把越界的轮询间隔拉回合法范围
    fn normalize(&mut self) {
        self.auth_base = self.auth_base.trim_end_matches('/').to_string();
        self.api_base = self.api_base.trim_end_matches('/').to_string();

        if let Some(interval) = self.update_interval {
            let clamped = interval.clamp(MIN_INTERVAL_SECONDS, MAX_INTERVAL_SECONDS);
            if clamped != interval {
                tracing::warn!(
                    "updateInterval={} 超出范围 [{}, {}]，已调整为 {}",
                    interval,
                    MIN_INTERVAL_SECONDS,
                    MAX_INTERVAL_SECONDS,
                    clamped
                );
                self.update_interval = Some(clamped);
            }
        }
    }

    /// 未配置 redirectUri 时使用本服务的回调地址
    pub fn default_redirect_uri(&self) -> String {
        format!("http://{}:{}/oauth/callback", self.host, self.port)
    }

    /// 区域注册的兜底域名
    pub fn fallback_domain(&self) -> &str {
        self.public_host.as_deref().unwrap_or(&self.host)
    }
}
