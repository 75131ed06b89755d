//! 出站 HTTP 客户端
//!
//! 浏览器无法直接调用 Fleet API 时，请求会被改写为经由 CORS 代理转发：
//! `{proxyUrl}?url=<urlencoded target>`，代理原样转发 Authorization 头

use std::time::Duration;

use reqwest::Client;

/// CORS 代理配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    url: String,
}

impl ProxyConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// 空字符串视为未配置
    pub fn from_optional(url: Option<&str>) -> Option<Self> {
        url.map(str::trim)
            .filter(|u| !u.is_empty())
            .map(Self::new)
    }

    /// 把目标地址改写为代理地址
    pub fn rewrite(&self, target: &str) -> String {
        format!("{}?url={}", self.url, urlencoding::encode(target))
    }
}

/// 按需经代理转发
pub fn route_url(proxy: Option<&ProxyConfig>, target: &str) -> String {
    match proxy {
        Some(proxy) => proxy.rewrite(target),
        None => target.to_string(),
    }
}

/// 构建 HTTP Client
///
/// 超时交给网络层处理，上层不再额外设置应用级超时
pub fn build_client(timeout_secs: u64) -> anyhow::Result<Client> {
    let client = Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("tesla-dash/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}
