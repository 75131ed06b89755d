//! 车辆身份与车辆状态快照

use serde::{Deserialize, Deserializer, Serialize};

/// 英里/小时 → 公里/小时
pub const MPH_TO_KMH: f64 = 1.60934;

pub fn mph_to_kmh(mph: f64) -> f64 {
    mph * MPH_TO_KMH
}

/// 充电状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingState {
    Charging,
    Disconnected,
    Complete,
    Standby,
    Unknown,
}

impl ChargingState {
    /// 解析 API 返回的 charging_state 字符串
    pub fn from_api(value: &str) -> Self {
        match value {
            "Charging" => ChargingState::Charging,
            "Disconnected" => ChargingState::Disconnected,
            "Complete" => ChargingState::Complete,
            "Standby" | "Stopped" => ChargingState::Standby,
            _ => ChargingState::Unknown,
        }
    }
}

/// 快照来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceTag {
    Telemetry,
    RestApi,
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceTag::Telemetry => write!(f, "telemetry"),
            SourceTag::RestApi => write!(f, "rest"),
        }
    }
}

/// 归一化后的车辆状态快照
///
/// 每次成功读取都生成新的快照，只替换不修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleSnapshot {
    pub speed_kmh: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_state: Option<ChargingState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub odometer_km: Option<f64>,
    pub source_tag: SourceTag,
}

/// 当前选中的车辆
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VehicleIdentity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl VehicleIdentity {
    pub fn vehicle_id(&self) -> Option<&str> {
        self.vehicle_id.as_deref().filter(|v| !v.is_empty())
    }

    pub fn vin(&self) -> Option<&str> {
        self.vin.as_deref().filter(|v| !v.is_empty())
    }

    /// 用响应中捕获的身份信息修正当前记录，返回是否有变化
    pub fn absorb(&mut self, hint: &VehicleIdentity) -> bool {
        let mut changed = false;
        if let Some(id) = hint.vehicle_id()
            && self.vehicle_id() != Some(id)
        {
            self.vehicle_id = Some(id.to_string());
            changed = true;
        }
        if let Some(vin) = hint.vin()
            && self.vin() != Some(vin)
        {
            self.vin = Some(vin.to_string());
            changed = true;
        }
        changed
    }
}

/// 车辆列表中的条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase"))]
pub struct VehicleSummary {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub vin: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl VehicleSummary {
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.vin.as_deref())
            .unwrap_or(&self.id)
    }
}

impl From<&VehicleSummary> for VehicleIdentity {
    fn from(summary: &VehicleSummary) -> Self {
        VehicleIdentity {
            vehicle_id: Some(summary.id.clone()),
            vin: summary.vin.clone(),
            display_name: summary.display_name.clone(),
        }
    }
}

/// Fleet API 的车辆 id 是数字，也接受字符串
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    json_id_to_string(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("无效的车辆 id: {}", value)))
}

/// 把 JSON 中的 id 字段转换为字符串
pub fn json_id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
