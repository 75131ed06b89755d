//! 遥测中继数据源

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::dash::error::DashError;
use crate::dash::model::vehicle::{ChargingState, SourceTag, VehicleSnapshot, mph_to_kmh};
use crate::dash::source::{DataSource, FetchOutcome, number};

/// 从遥测中继读取车辆最新上报的数据
pub struct TelemetryDataSource {
    client: Client,
    endpoint: String,
    vin: String,
}

impl TelemetryDataSource {
    pub fn new(client: Client, endpoint: &str, vin: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            vin: vin.into(),
        }
    }
}

#[async_trait]
impl DataSource for TelemetryDataSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Telemetry
    }

    async fn fetch_snapshot(&self) -> Result<FetchOutcome, DashError> {
        let url = format!(
            "{}/api/vehicle/{}",
            self.endpoint,
            urlencoding::encode(&self.vin)
        );
        tracing::debug!("读取遥测数据: {}", url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            tracing::debug!("遥测中继暂无车辆 {} 的数据", self.vin);
            return Ok(FetchOutcome::Unavailable);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DashError::from_status(status.as_u16(), body));
        }

        let data: Value = response.json().await?;
        normalize_telemetry(&data).map(FetchOutcome::Snapshot)
    }
}

/// 归一化遥测数据
///
/// `speed` 已是 km/h，`speedMph` 需要换算；缺失的字段不补零
pub fn normalize_telemetry(data: &Value) -> Result<VehicleSnapshot, DashError> {
    if !data.is_object() {
        return Err(DashError::malformed("遥测数据不是 JSON 对象"));
    }

    let speed_kmh = number(data, "speed")
        .or_else(|| number(data, "speedMph").map(mph_to_kmh))
        .unwrap_or(0.0);

    Ok(VehicleSnapshot {
        speed_kmh,
        battery_percent: number(data, "batteryLevel"),
        charging_state: data
            .get("chargingState")
            .and_then(Value::as_str)
            .map(ChargingState::from_api),
        odometer_km: number(data, "odometer"),
        source_tag: SourceTag::Telemetry,
    })
}
