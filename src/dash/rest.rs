//! Fleet API REST 数据源

use async_trait::async_trait;
use serde_json::Value;

use crate::dash::error::DashError;
use crate::dash::fleet::{DRIVE_STATE_ENDPOINT, FleetApi, VEHICLE_DATA_ENDPOINTS};
use crate::dash::model::vehicle::{
    ChargingState, SourceTag, VehicleIdentity, VehicleSnapshot, json_id_to_string, mph_to_kmh,
};
use crate::dash::source::{DataSource, FetchOutcome, number};
use crate::http_client::ProxyConfig;

/// 裸 `speed` 字段低于该值按 mph 换算，否则视为 km/h
///
/// 经验阈值，API 没有说明该字段的单位
pub const AMBIGUOUS_SPEED_MPH_LIMIT: f64 = 150.0;

pub struct RestDataSource {
    fleet: FleetApi,
    proxy: Option<ProxyConfig>,
    vehicle_id: String,
    access_token: String,
}

impl RestDataSource {
    pub fn new(
        fleet: FleetApi,
        proxy: Option<ProxyConfig>,
        vehicle_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            fleet,
            proxy,
            vehicle_id: vehicle_id.into(),
            access_token: access_token.into(),
        }
    }

    async fn request(&self, endpoints: &str) -> Result<Value, DashError> {
        self.fleet
            .vehicle_data(
                self.proxy.as_ref(),
                &self.vehicle_id,
                &self.access_token,
                endpoints,
            )
            .await
    }
}

#[async_trait]
impl DataSource for RestDataSource {
    fn tag(&self) -> SourceTag {
        SourceTag::RestApi
    }

    async fn fetch_snapshot(&self) -> Result<FetchOutcome, DashError> {
        let mut data = self.request(VEHICLE_DATA_ENDPOINTS).await?;

        if !is_vehicle_data_shape(&data) {
            let identity = capture_identity(&data);
            tracing::warn!("响应不是车辆数据，捕获到的身份: {:?}", identity);
            return Err(DashError::MalformedResponse {
                reason: "响应是车辆列表或车辆信息，不包含车辆状态".to_string(),
                identity,
            });
        }

        if data.get("drive_state").is_none_or(Value::is_null) {
            tracing::debug!("响应缺少 drive_state，单独请求");
            match self.request(DRIVE_STATE_ENDPOINT).await {
                Ok(extra) => merge_drive_state(&mut data, extra),
                Err(DashError::AuthExpired) => return Err(DashError::AuthExpired),
                Err(e) => tracing::warn!("获取 drive_state 失败: {}", e),
            }
        }

        Ok(FetchOutcome::Snapshot(normalize_vehicle_data(&data)))
    }
}

/// 车辆数据至少包含 charge_state 或 vehicle_state
fn is_vehicle_data_shape(data: &Value) -> bool {
    data.is_object()
        && ["charge_state", "vehicle_state"]
            .iter()
            .any(|key| data.get(*key).is_some_and(Value::is_object))
}

/// 从车辆列表或车辆信息中提取身份
fn capture_identity(data: &Value) -> Option<VehicleIdentity> {
    let item = match data {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let identity = VehicleIdentity {
        vehicle_id: item
            .get("vehicle_id")
            .or_else(|| item.get("id"))
            .and_then(json_id_to_string),
        vin: item
            .get("vin")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(str::to_string),
        display_name: None,
    };
    (identity.vehicle_id.is_some() || identity.vin.is_some()).then_some(identity)
}

/// 合并单独请求到的 drive_state，兼容带或不带外层的结构
fn merge_drive_state(data: &mut Value, extra: Value) {
    let drive_state = match extra {
        Value::Object(mut map) if map.contains_key("drive_state") => map.remove("drive_state"),
        Value::Object(map) => Some(Value::Object(map)),
        _ => None,
    };
    if let (Some(drive_state), Some(target)) = (drive_state, data.as_object_mut()) {
        target.insert("drive_state".to_string(), drive_state);
    }
}

/// 解析速度（km/h）
///
/// `VehicleSpeed` 单位是 mph，总是换算；裸 `speed` 按阈值判断
fn resolve_speed_kmh(data: &Value) -> f64 {
    let drive_state = data.get("drive_state").unwrap_or(&Value::Null);

    if let Some(mph) = number(drive_state, "VehicleSpeed").or_else(|| number(data, "VehicleSpeed")) {
        return mph_to_kmh(mph);
    }

    match number(drive_state, "speed").or_else(|| number(data, "speed")) {
        Some(speed) if speed < AMBIGUOUS_SPEED_MPH_LIMIT => mph_to_kmh(speed),
        Some(speed) => speed,
        None => 0.0,
    }
}

/// 归一化 vehicle_data 响应
pub fn normalize_vehicle_data(data: &Value) -> VehicleSnapshot {
    let charge_state = data.get("charge_state").unwrap_or(&Value::Null);
    let vehicle_state = data.get("vehicle_state").unwrap_or(&Value::Null);

    VehicleSnapshot {
        speed_kmh: resolve_speed_kmh(data),
        battery_percent: number(charge_state, "battery_level"),
        charging_state: charge_state
            .get("charging_state")
            .and_then(Value::as_str)
            .map(ChargingState::from_api),
        odometer_km: number(vehicle_state, "odometer"),
        source_tag: SourceTag::RestApi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dash::model::vehicle::MPH_TO_KMH;
    use reqwest::Client;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(server: &MockServer) -> RestDataSource {
        RestDataSource::new(FleetApi::new(Client::new(), server.uri()), None, "V1", "T")
    }

    #[test]
    fn test_ambiguous_speed_threshold() {
        for s in [0.5, 1.0, 60.0, 149.9] {
            let snapshot = normalize_vehicle_data(&json!({"drive_state": {"speed": s}}));
            assert!((snapshot.speed_kmh - s * MPH_TO_KMH).abs() < 1e-9);
        }
        for s in [150.0, 151.0, 240.0] {
            let snapshot = normalize_vehicle_data(&json!({"drive_state": {"speed": s}}));
            assert_eq!(snapshot.speed_kmh, s);
        }
    }

    #[test]
    fn test_vehicle_speed_field_wins() {
        let snapshot = normalize_vehicle_data(&json!({
            "drive_state": {"VehicleSpeed": 200.0, "speed": 10.0}
        }));
        assert!((snapshot.speed_kmh - 200.0 * MPH_TO_KMH).abs() < 1e-9);
    }

    #[test]
    fn test_null_speed_is_zero() {
        let snapshot = normalize_vehicle_data(&json!({
            "drive_state": {"speed": null},
            "charge_state": {"battery_level": 55}
        }));
        assert_eq!(snapshot.speed_kmh, 0.0);
        assert_eq!(snapshot.battery_percent, Some(55.0));
        assert_eq!(snapshot.odometer_km, None);
    }

    #[test]
    fn test_capture_identity_from_list_and_object() {
        let identity = capture_identity(&json!([{"id": 11, "vin": "VIN1"}])).unwrap();
        assert_eq!(identity.vehicle_id(), Some("11"));
        assert_eq!(identity.vin(), Some("VIN1"));

        let identity = capture_identity(&json!({"vehicle_id": 22, "id": 33})).unwrap();
        assert_eq!(identity.vehicle_id(), Some("22"));

        assert!(capture_identity(&json!({"state": "online"})).is_none());
    }

    #[tokio::test]
    async fn test_end_to_end_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .and(query_param("endpoints", VEHICLE_DATA_ENDPOINTS))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": {
                    "drive_state": {"speed": 60},
                    "charge_state": {"battery_level": 80, "charging_state": "Charging"},
                    "vehicle_state": {"odometer": 1000.0}
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let FetchOutcome::Snapshot(snapshot) = source(&server).fetch_snapshot().await.unwrap()
        else {
            panic!("应返回快照");
        };
        assert!((snapshot.speed_kmh - 96.5604).abs() < 1e-3);
        assert_eq!(snapshot.battery_percent, Some(80.0));
        assert_eq!(snapshot.charging_state, Some(ChargingState::Charging));
        assert_eq!(snapshot.odometer_km, Some(1000.0));
        assert_eq!(snapshot.source_tag, SourceTag::RestApi);
    }

    #[tokio::test]
    async fn test_missing_drive_state_triggers_supplementary_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .and(query_param("endpoints", VEHICLE_DATA_ENDPOINTS))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": {"charge_state": {"battery_level": 70}}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .and(query_param("endpoints", DRIVE_STATE_ENDPOINT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": {"drive_state": {"speed": 30}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let FetchOutcome::Snapshot(snapshot) = source(&server).fetch_snapshot().await.unwrap()
        else {
            panic!("应返回快照");
        };
        assert!((snapshot.speed_kmh - 30.0 * MPH_TO_KMH).abs() < 1e-9);
        assert_eq!(snapshot.battery_percent, Some(70.0));
    }

    #[tokio::test]
    async fn test_identity_shape_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": {"id": 100021, "vehicle_id": 99, "vin": "5YJ3", "state": "online"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        match source(&server).fetch_snapshot().await {
            Err(DashError::MalformedResponse {
                identity: Some(identity),
                ..
            }) => {
                assert_eq!(identity.vehicle_id(), Some("99"));
                assert_eq!(identity.vin(), Some("5YJ3"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_401_is_auth_expired() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        assert!(matches!(
            source(&server).fetch_snapshot().await,
            Err(DashError::AuthExpired)
        ));
    }
}
