//! Tesla Fleet API 调用

use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dash::error::DashError;
use crate::dash::model::vehicle::VehicleSummary;
use crate::http_client::{ProxyConfig, route_url};

/// vehicle_data 默认请求的数据分组（Fleet API 以分号分隔）
pub const VEHICLE_DATA_ENDPOINTS: &str = "drive_state;charge_state;vehicle_state";

/// 只请求 drive_state 的补充查询
pub const DRIVE_STATE_ENDPOINT: &str = "drive_state";

#[derive(Deserialize)]
struct VehicleListEnvelope {
    #[serde(default)]
    response: Vec<VehicleSummary>,
}

#[derive(Serialize)]
struct PartnerAccountRequest<'a> {
    domain: &'a str,
}

/// Fleet API 客户端
#[derive(Clone)]
pub struct FleetApi {
    client: Client,
    api_base: String,
}

impl FleetApi {
    pub fn new(client: Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// 获取车辆列表
    pub async fn vehicles(
        &self,
        proxy: Option<&ProxyConfig>,
        access_token: &str,
    ) -> Result<Vec<VehicleSummary>, DashError> {
        let target = format!("{}/api/1/vehicles", self.api_base);
        let url = route_url(proxy, &target);
        tracing::debug!("获取车辆列表: {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .header("Content-Type", "application/json")
            .send()
            .await?;

        let response = ensure_success(response).await?;
        let envelope: VehicleListEnvelope = response.json().await?;
        Ok(envelope.response)
    }

    /// 获取车辆数据，返回信封中的 `response` 字段
    pub async fn vehicle_data(
        &self,
        proxy: Option<&ProxyConfig>,
        vehicle_id: &str,
        access_token: &str,
        endpoints: &str,
    ) -> Result<Value, DashError> {
        let target = format!(
            "{}/api/1/vehicles/{}/vehicle_data?endpoints={}",
            self.api_base,
            urlencoding::encode(vehicle_id),
            urlencoding::encode(endpoints)
        );
        let url = route_url(proxy, &target);
        tracing::debug!("获取车辆数据: {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .header("Content-Type", "application/json")
            .send()
            .await?;

        let response = ensure_success(response).await?;
        let mut envelope: Value = response.json().await?;
        match envelope.get_mut("response").map(Value::take) {
            Some(data) if !data.is_null() => Ok(data),
            _ => Err(DashError::malformed("缺少 response 字段")),
        }
    }

    /// 把应用域名注册到账户所在区域
    pub async fn register_partner_account(
        &self,
        proxy: Option<&ProxyConfig>,
        partner_token: &str,
        domain: &str,
    ) -> Result<Value, DashError> {
        let target = format!("{}/api/1/partner_accounts", self.api_base);
        let url = route_url(proxy, &target);
        tracing::info!("注册账户 - 使用域名: {}", domain);

        let response = self
            .client
            .post(&url)
            .bearer_auth(partner_token)
            .header("Accept", "application/json")
            .json(&PartnerAccountRequest { domain })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误信息".to_string());
            return Err(DashError::HttpError {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await.unwrap_or(Value::Null))
    }
}

/// 非 2xx 响应转换为错误
async fn ensure_success(response: Response) -> Result<Response, DashError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| status.canonical_reason().unwrap_or_default().to_string());
    Err(DashError::from_status(status.as_u16(), body))
}
