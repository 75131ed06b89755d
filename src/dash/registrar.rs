//! 账户区域注册
//!
//! Fleet API 返回 412 且提示账户未注册到当前区域时，
//! 用 Partner Token 注册应用域名，然后重试原请求一次

use std::future::Future;
use std::sync::Arc;

use crate::dash::error::DashError;
use crate::dash::fleet::FleetApi;
use crate::dash::sink::{DashStatus, DashboardSink};
use crate::dash::token_manager::TokenManager;
use crate::http_client::ProxyConfig;

/// 每次操作最多触发的注册次数
const MAX_REGISTRATIONS: u32 = 1;

pub struct PartnerRegistrar {
    tokens: Arc<TokenManager>,
    fleet: FleetApi,
    sink: Arc<dyn DashboardSink>,
    /// 重定向地址无法解析出主机名时使用的域名
    fallback_domain: String,
}

impl PartnerRegistrar {
    pub fn new(
        tokens: Arc<TokenManager>,
        fleet: FleetApi,
        sink: Arc<dyn DashboardSink>,
        fallback_domain: impl Into<String>,
    ) -> Self {
        Self {
            tokens,
            fleet,
            sink,
            fallback_domain: fallback_domain.into(),
        }
    }

    /// 注册指定域名
    pub async fn register_account_for_domain(&self, domain: &str) -> Result<(), DashError> {
        let record = self.tokens.database().load_record()?;
        let proxy = ProxyConfig::from_optional(record.polling.proxy_url());
        let partner_token = self.tokens.partner_token().await?;

        self.fleet
            .register_partner_account(proxy.as_ref(), &partner_token, domain)
            .await?;
        tracing::info!("账户注册成功: {}", domain);
        Ok(())
    }

    /// 按当前记录的重定向地址注册
    pub async fn register_current_domain(&self) -> Result<(), DashError> {
        let record = self.tokens.database().load_record()?;
        let domain = domain_for(record.redirect_uri(), &self.fallback_domain);
        self.register_account_for_domain(&domain).await
    }

    /// 执行操作，遇到区域未注册错误时注册后重试一次
    ///
    /// 注册结果被忽略（重复注册同一域名不视为失败）；
    /// 重试后仍然 412 则直接返回错误
    pub async fn with_registration_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, DashError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DashError>>,
    {
        let mut registrations = 0;
        loop {
            match operation().await {
                Err(DashError::RegionNotRegistered { body }) if registrations < MAX_REGISTRATIONS => {
                    registrations += 1;
                    tracing::warn!("账户未注册到当前区域，正在注册: {}", body);
                    self.sink.on_status(DashStatus::Registering);
                    if let Err(e) = self.register_current_domain().await {
                        tracing::error!("账户注册失败: {}", e);
                    }
                }
                Err(DashError::RegionNotRegistered { body }) => {
                    tracing::error!("注册后仍提示账户未注册，放弃重试");
                    return Err(DashError::RegionNotRegistered { body });
                }
                other => return other,
            }
        }
    }
}

/// 从重定向地址中取主机名作为注册域名
pub fn domain_for(redirect_uri: Option<&str>, fallback: &str) -> String {
    redirect_uri
        .and_then(|uri| url::Url::parse(uri).ok())
        .and_then(|url| url.host_str().map(str::to_string))
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
