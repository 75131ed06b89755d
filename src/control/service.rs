//! 控制接口业务逻辑服务

use std::sync::Arc;

use crate::dash::error::DashError;
use crate::dash::fleet::FleetApi;
use crate::dash::model::record::is_valid_interval;
use crate::dash::model::token::{DEFAULT_EXPIRES_IN_SECS, now_ms};
use crate::dash::model::vehicle::{VehicleIdentity, VehicleSummary};
use crate::dash::registrar::PartnerRegistrar;
use crate::dash::scheduler::{CycleOutcome, PollingScheduler, SkipReason};
use crate::dash::sink::{DashStatus, DashboardSink, WatchSink};
use crate::dash::token_manager::TokenManager;
use crate::http_client::ProxyConfig;

use super::error::ControlError;
use super::types::{
    CallbackQuery, PollingResponse, RefreshResponse, SelectVehicleRequest, SettingsRequest,
    StatusResponse, VehiclesResponse,
};

/// 控制服务
///
/// 封装所有控制接口的业务逻辑
#[derive(Clone)]
pub struct ControlService {
    tokens: Arc<TokenManager>,
    registrar: Arc<PartnerRegistrar>,
    scheduler: PollingScheduler,
    sink: Arc<WatchSink>,
    fleet: FleetApi,
}

impl ControlService {
    pub fn new(
        tokens: Arc<TokenManager>,
        registrar: Arc<PartnerRegistrar>,
        scheduler: PollingScheduler,
        sink: Arc<WatchSink>,
        fleet: FleetApi,
    ) -> Self {
        Self {
            tokens,
            registrar,
            scheduler,
            sink,
            fleet,
        }
    }

    /// 当前仪表盘状态
    pub fn status(&self) -> Result<StatusResponse, ControlError> {
        let record = self.tokens.database().load_record()?;
        Ok(StatusResponse {
            dashboard: self.sink.view(),
            scheduler: self.scheduler.status()?,
            oauth: self.tokens.phase(),
            authenticated: !record.token.is_expired(now_ms()),
            token_expires_at: record.token.expires_at,
            vehicle: record.vehicle,
        })
    }

    /// 生成授权地址
    pub fn begin_authorization(&self) -> Result<String, ControlError> {
        Ok(self.tokens.begin_authorization()?)
    }

    /// 处理授权回调，成功后自动获取车辆列表
    ///
    /// 不是回调请求时返回 `Ok(None)`
    pub async fn handle_callback(
        &self,
        query: CallbackQuery,
    ) -> Result<Option<VehiclesResponse>, ControlError> {
        let error = query
            .error_description
            .as_deref()
            .or(query.error.as_deref())
            .filter(|_| query.error.is_some());

        let token = self
            .tokens
            .handle_callback(query.code.as_deref(), query.state.as_deref(), error)
            .await
            .inspect_err(|e| tracing::error!("OAuth 回调处理失败: {}", e))?;
        if token.is_none() {
            return Ok(None);
        }

        tracing::info!("登录成功，正在获取车辆列表...");
        self.discover_vehicles().await.map(Some)
    }

    /// 获取车辆列表
    pub async fn list_vehicles(&self) -> Result<Vec<VehicleSummary>, ControlError> {
        let access_token = self.valid_token().await?;
        let record = self.tokens.database().load_record()?;
        let proxy = ProxyConfig::from_optional(record.polling.proxy_url());

        let vehicles = self
            .registrar
            .with_registration_retry(|| self.fleet.vehicles(proxy.as_ref(), &access_token))
            .await?;
        tracing::info!("找到 {} 辆车", vehicles.len());
        Ok(vehicles)
    }

    /// 获取车辆列表；只有一辆车时自动选中并开始轮询
    pub async fn discover_vehicles(&self) -> Result<VehiclesResponse, ControlError> {
        let vehicles = self.list_vehicles().await?;
        match vehicles.as_slice() {
            [] => Err(DashError::NotConfigured("账户下没有车辆".to_string()).into()),
            [only] => {
                let identity = VehicleIdentity::from(only);
                tracing::info!("自动选择车辆: {}", only.label());
                self.save_vehicle(identity.clone())?;
                let polling = self.resume().await?;
                Ok(VehiclesResponse {
                    vehicles,
                    selected: Some(identity),
                    polling,
                })
            }
            _ => {
                let selected = Some(self.tokens.database().load_record()?.vehicle)
                    .filter(|v| v.vehicle_id().is_some());
                Ok(VehiclesResponse {
                    vehicles,
                    selected,
                    polling: self.scheduler.is_running(),
                })
            }
        }
    }

    /// 选择车辆
    ///
    /// id 在车辆列表中时使用列表中的信息，否则按手动输入保存
    pub async fn select_vehicle(
        &self,
        request: SelectVehicleRequest,
    ) -> Result<VehiclesResponse, ControlError> {
        let vehicle_id = request.vehicle_id.trim().to_string();
        if vehicle_id.is_empty() {
            return Err(ControlError::InvalidRequest("vehicleId 不能为空".to_string()));
        }

        let vehicles = match self.list_vehicles().await {
            Ok(vehicles) => vehicles,
            Err(e) => {
                tracing::warn!("获取车辆列表失败，按手动输入保存: {}", e);
                Vec::new()
            }
        };

        let identity = match vehicles.iter().find(|v| v.id == vehicle_id) {
            Some(summary) => VehicleIdentity::from(summary),
            None => VehicleIdentity {
                vehicle_id: Some(vehicle_id),
                vin: request
                    .vin
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty()),
                display_name: None,
            },
        };

        self.save_vehicle(identity.clone())?;
        let polling = self.resume().await?;
        Ok(VehiclesResponse {
            vehicles,
            selected: Some(identity),
            polling,
        })
    }

    fn save_vehicle(&self, identity: VehicleIdentity) -> Result<(), ControlError> {
        self.tokens
            .database()
            .update_record(|record| record.vehicle = identity)?;
        Ok(())
    }

    /// 保存设置并恢复轮询
    pub async fn update_settings(
        &self,
        request: SettingsRequest,
    ) -> Result<PollingResponse, ControlError> {
        if let Some(interval) = request.update_interval
            && !is_valid_interval(interval)
        {
            return Err(ControlError::InvalidRequest(format!(
                "updateInterval 必须在 1-60 之间: {}",
                interval
            )));
        }

        let now = now_ms();
        self.tokens.database().update_record(|record| {
            if let Some(client_id) = request.client_id {
                record.credentials.client_id = client_id.trim().to_string();
            }
            if let Some(client_secret) = request.client_secret {
                record.credentials.client_secret = client_secret.trim().to_string();
            }
            if let Some(redirect_uri) = request.redirect_uri {
                record.redirect_uri = non_empty(redirect_uri);
            }
            if let Some(access_token) = request.access_token.and_then(non_empty)
                && record.token.access_token.as_deref() != Some(access_token.as_str())
            {
                // 手动填入的令牌没有有效期信息，按默认有效期处理
                record.token.access_token = Some(access_token);
                record.token.expires_at = Some(now + DEFAULT_EXPIRES_IN_SECS * 1000);
            }
            if let Some(vehicle_id) = request.vehicle_id {
                let vehicle_id = non_empty(vehicle_id);
                if record.vehicle.vehicle_id != vehicle_id {
                    record.vehicle = VehicleIdentity {
                        vehicle_id,
                        ..Default::default()
                    };
                }
            }
            if let Some(vin) = request.vin {
                record.vehicle.vin = non_empty(vin);
            }
            if let Some(interval) = request.update_interval {
                record.polling.interval_seconds = interval;
            }
            if let Some(proxy_url) = request.proxy_url {
                record.polling.proxy_url = non_empty(proxy_url);
            }
            if let Some(telemetry_url) = request.telemetry_url {
                record.polling.telemetry_url = non_empty(telemetry_url);
            }
        })?;
        tracing::info!("设置已保存");

        let changed = match self.resume().await {
            Ok(changed) => changed,
            Err(ControlError::InvalidRequest(msg)) => {
                tracing::debug!("设置不完整，暂不启动轮询: {}", msg);
                false
            }
            Err(e) => return Err(e),
        };
        Ok(PollingResponse {
            running: self.scheduler.is_running(),
            changed,
        })
    }

    /// 恢复轮询
    ///
    /// 使用 REST 数据源且 Token 已过期时先刷新，刷新失败则要求重新授权，不启动调度器
    pub async fn resume(&self) -> Result<bool, ControlError> {
        let record = self.tokens.database().load_record()?;
        if record.polling.telemetry_url().is_none() {
            if record.token.access_token.is_none() {
                return Err(DashError::NotConfigured("accessToken".to_string()).into());
            }
            if record.token.is_expired(now_ms()) {
                self.valid_token().await?;
            }
        }
        Ok(self.scheduler.start()?)
    }

    /// 获取有效访问令牌，刷新失败时通知需要重新授权
    async fn valid_token(&self) -> Result<String, ControlError> {
        let token = self.tokens.token_state()?;
        if let Some(access_token) = token.usable_access_token(now_ms()) {
            return Ok(access_token.to_string());
        }

        self.sink.on_status(DashStatus::Refreshing);
        match self.tokens.ensure_valid_token().await {
            Ok(access_token) => Ok(access_token),
            Err(e) => {
                tracing::error!("Token 刷新失败: {}", e);
                self.sink.on_status(DashStatus::ReauthenticationRequired);
                Err(ControlError::Unauthorized(e.to_string()))
            }
        }
    }

    pub async fn start_polling(&self) -> Result<PollingResponse, ControlError> {
        let changed = self.resume().await?;
        Ok(PollingResponse {
            running: self.scheduler.is_running(),
            changed,
        })
    }

    pub fn stop_polling(&self) -> PollingResponse {
        let changed = self.scheduler.stop();
        PollingResponse {
            running: false,
            changed,
        }
    }

    /// 立即读取一次
    pub async fn refresh_now(&self) -> RefreshResponse {
        match self.scheduler.refresh_now().await {
            CycleOutcome::Snapshot(snapshot) => RefreshResponse {
                outcome: "snapshot",
                snapshot: Some(snapshot),
                message: None,
            },
            CycleOutcome::Unavailable => RefreshResponse {
                outcome: "unavailable",
                snapshot: None,
                message: None,
            },
            CycleOutcome::Refreshed => RefreshResponse {
                outcome: "tokenRefreshed",
                snapshot: None,
                message: None,
            },
            CycleOutcome::Failed(e) => RefreshResponse {
                outcome: "failed",
                snapshot: None,
                message: Some(e.to_string()),
            },
            CycleOutcome::Discarded => RefreshResponse {
                outcome: "discarded",
                snapshot: None,
                message: None,
            },
            CycleOutcome::Skipped(reason) => RefreshResponse {
                outcome: match reason {
                    SkipReason::InFlight => "skippedInFlight",
                    SkipReason::TooSoon => "skippedTooSoon",
                    SkipReason::Stopped => "skippedStopped",
                },
                snapshot: None,
                message: None,
            },
        }
    }

    pub fn visibility_changed(&self, visible: bool) -> PollingResponse {
        let was_running = self.scheduler.is_running();
        self.scheduler.visibility_changed(visible);
        let running = self.scheduler.is_running();
        PollingResponse {
            running,
            changed: was_running != running,
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
