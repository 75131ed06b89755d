//! 轮询调度
//!
//! 同一时间只允许一个读取周期在执行；新的触发在有周期执行中时直接丢弃。
//! 停止后，已经在执行的周期会跑完，但结果被丢弃

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::dash::db::Database;
use crate::dash::error::DashError;
use crate::dash::fleet::FleetApi;
use crate::dash::model::record::DashRecord;
use crate::dash::model::token::now_ms;
use crate::dash::model::vehicle::{SourceTag, VehicleSnapshot};
use crate::dash::registrar::PartnerRegistrar;
use crate::dash::rest::RestDataSource;
use crate::dash::sink::{DashStatus, DashboardSink};
use crate::dash::source::{DataSource, FetchOutcome};
use crate::dash::telemetry::TelemetryDataSource;
use crate::dash::token_manager::TokenManager;
use crate::http_client::ProxyConfig;

/// 两次读取之间的最小间隔
pub const MIN_FETCH_SPACING: Duration = Duration::from_millis(2000);

/// 连续失败超过该次数后开始退避
pub const BACKOFF_THRESHOLD: u32 = 5;

const BACKOFF_START_MS: u64 = 10_000;
const BACKOFF_STEP_MS: u64 = 2_000;
const BACKOFF_CAP_MS: u64 = 30_000;

/// 根据连续失败次数计算实际轮询间隔
pub fn effective_interval(base: Duration, failures: u32) -> Duration {
    let interval = if failures > BACKOFF_THRESHOLD {
        let extra = u64::from(failures - BACKOFF_THRESHOLD - 1) * BACKOFF_STEP_MS;
        let backoff = Duration::from_millis((BACKOFF_START_MS + extra).min(BACKOFF_CAP_MS));
        backoff.max(base)
    } else {
        base
    };
    interval.max(MIN_FETCH_SPACING)
}

/// 触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// 定时器触发，携带启动时的代数
    Scheduled(u64),
    /// 用户手动刷新
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    TooSoon,
    Stopped,
}

/// 单个周期的结果
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    Snapshot(VehicleSnapshot),
    Unavailable,
    /// 本周期只刷新了 Token，不产出快照
    Refreshed,
    Failed(DashError),
    /// 执行期间调度器被停止或重启，结果丢弃
    Discarded,
}

/// 定时器句柄
enum SchedulerHandle {
    Running {
        cancel: CancellationToken,
        generation: u64,
    },
    Stopped,
}

/// 各数据源的连续失败次数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureCounters {
    pub telemetry: u32,
    pub rest: u32,
}

impl FailureCounters {
    pub fn get(&self, tag: SourceTag) -> u32 {
        match tag {
            SourceTag::Telemetry => self.telemetry,
            SourceTag::RestApi => self.rest,
        }
    }

    fn slot(&mut self, tag: SourceTag) -> &mut u32 {
        match tag {
            SourceTag::Telemetry => &mut self.telemetry,
            SourceTag::RestApi => &mut self.rest,
        }
    }
}

/// 调度器状态快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub running: bool,
    pub active_source: SourceTag,
    pub failures: FailureCounters,
    pub effective_interval_ms: u64,
    pub latest: Option<VehicleSnapshot>,
}

/// 读取中标志，离开作用域时自动清除
struct FetchGuard<'a>(&'a AtomicBool);

impl<'a> FetchGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FetchGuard(flag))
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 调度器共享状态
pub struct SchedulerContext {
    tokens: Arc<TokenManager>,
    registrar: Arc<PartnerRegistrar>,
    sink: Arc<dyn DashboardSink>,
    fleet: FleetApi,
    client: Client,
    fetching: AtomicBool,
    handle: Mutex<SchedulerHandle>,
    /// 每次启动/停止都递增，用于丢弃过期周期的结果
    generation: AtomicU64,
    failures: Mutex<FailureCounters>,
    last_fetch: Mutex<Option<Instant>>,
    latest: Mutex<Option<VehicleSnapshot>>,
}

/// 轮询调度器
#[derive(Clone)]
pub struct PollingScheduler {
    ctx: Arc<SchedulerContext>,
}

impl PollingScheduler {
    pub fn new(
        tokens: Arc<TokenManager>,
        registrar: Arc<PartnerRegistrar>,
        sink: Arc<dyn DashboardSink>,
        fleet: FleetApi,
        client: Client,
    ) -> Self {
        Self {
            ctx: Arc::new(SchedulerContext {
                tokens,
                registrar,
                sink,
                fleet,
                client,
                fetching: AtomicBool::new(false),
                handle: Mutex::new(SchedulerHandle::Stopped),
                generation: AtomicU64::new(0),
                failures: Mutex::new(FailureCounters::default()),
                last_fetch: Mutex::new(None),
                latest: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.ctx.handle.lock(), SchedulerHandle::Running { .. })
    }

    /// 启动定时轮询
    ///
    /// 已在运行时不做任何事，返回 `Ok(false)`
    pub fn start(&self) -> Result<bool, DashError> {
        let record = self.ctx.db().load_record()?;
        ensure_source_configured(&record)?;

        let mut handle = self.ctx.handle.lock();
        if matches!(*handle, SchedulerHandle::Running { .. }) {
            tracing::debug!("调度器已在运行");
            return Ok(false);
        }

        let generation = self.ctx.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let cancel = CancellationToken::new();
        *handle = SchedulerHandle::Running {
            cancel: cancel.clone(),
            generation,
        };
        drop(handle);

        tracing::info!(
            "开始轮询，间隔 {} 秒",
            record.polling.base_interval().as_secs()
        );
        self.ctx.sink.on_status(DashStatus::Connecting);
        tokio::spawn(run_loop(self.ctx.clone(), cancel, generation));
        Ok(true)
    }

    /// 停止轮询并清零失败计数
    ///
    /// 返回之前是否在运行
    pub fn stop(&self) -> bool {
        let previous = std::mem::replace(&mut *self.ctx.handle.lock(), SchedulerHandle::Stopped);
        self.ctx.generation.fetch_add(1, Ordering::AcqRel);
        *self.ctx.failures.lock() = FailureCounters::default();

        let was_running = match previous {
            SchedulerHandle::Running { cancel, .. } => {
                cancel.cancel();
                true
            }
            SchedulerHandle::Stopped => false,
        };
        if was_running {
            tracing::info!("轮询已停止");
        }
        self.ctx.sink.on_status(DashStatus::Paused);
        was_running
    }

    /// 宿主可见性变化
    ///
    /// 不可见时停止；重新可见时保持停止，等待显式启动
    pub fn visibility_changed(&self, visible: bool) {
        if visible {
            tracing::debug!("页面重新可见，保持当前状态");
        } else if self.stop() {
            tracing::info!("页面不可见，已暂停轮询");
        }
    }

    /// 手动触发一次读取
    pub async fn refresh_now(&self) -> CycleOutcome {
        self.ctx.run_cycle(Trigger::Manual).await
    }

    pub fn latest_snapshot(&self) -> Option<VehicleSnapshot> {
        self.ctx.latest.lock().clone()
    }

    pub fn failures(&self) -> FailureCounters {
        *self.ctx.failures.lock()
    }

    pub fn status(&self) -> Result<SchedulerStatus, DashError> {
        let record = self.ctx.db().load_record()?;
        let active_source = active_source(&record);
        let failures = self.failures();
        let interval = effective_interval(
            record.polling.base_interval(),
            failures.get(active_source),
        );
        Ok(SchedulerStatus {
            running: self.is_running(),
            active_source,
            failures,
            effective_interval_ms: interval.as_millis() as u64,
            latest: self.latest_snapshot(),
        })
    }
}

/// 定时循环：先立即执行一次，之后每个周期结束后再安排下一次
async fn run_loop(ctx: Arc<SchedulerContext>, cancel: CancellationToken, generation: u64) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        // 手动刷新可能刚执行过，定时读取同样要满足最小间隔
        if let Some(wait) = ctx.spacing_remaining() {
            tracing::debug!("距离上次读取不足最小间隔，等待 {} ms", wait.as_millis());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        match ctx.run_cycle(Trigger::Scheduled(generation)).await {
            CycleOutcome::Skipped(SkipReason::Stopped) => break,
            CycleOutcome::Skipped(SkipReason::TooSoon) => continue,
            _ => {}
        }

        let delay = match ctx.next_delay() {
            Ok(delay) => delay,
            Err(e) => {
                tracing::warn!("读取轮询设置失败: {}", e);
                MIN_FETCH_SPACING
            }
        };
        tracing::debug!("下一次读取在 {} ms 后", delay.as_millis());

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::debug!("轮询循环 #{} 退出", generation);
}

/// 配置了遥测中继时使用遥测，否则使用 REST
fn active_source(record: &DashRecord) -> SourceTag {
    if record.polling.telemetry_url().is_some() {
        SourceTag::Telemetry
    } else {
        SourceTag::RestApi
    }
}

fn ensure_source_configured(record: &DashRecord) -> Result<(), DashError> {
    match active_source(record) {
        SourceTag::Telemetry if record.vehicle.vin().is_none() => {
            Err(DashError::NotConfigured("vin".to_string()))
        }
        SourceTag::RestApi if record.vehicle.vehicle_id().is_none() => {
            Err(DashError::NotConfigured("vehicleId".to_string()))
        }
        SourceTag::RestApi if record.token.access_token.is_none() => {
            Err(DashError::NotConfigured("accessToken".to_string()))
        }
        _ => Ok(()),
    }
}

impl SchedulerContext {
    fn db(&self) -> &Arc<Database> {
        self.tokens.database()
    }

    fn next_delay(&self) -> Result<Duration, DashError> {
        let record = self.db().load_record()?;
        let failures = self.failures.lock().get(active_source(&record));
        Ok(effective_interval(record.polling.base_interval(), failures))
    }

    /// 距离满足最小读取间隔还需等待的时间
    fn spacing_remaining(&self) -> Option<Duration> {
        let last = (*self.last_fetch.lock())?;
        MIN_FETCH_SPACING
            .checked_sub(last.elapsed())
            .filter(|wait| !wait.is_zero())
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// 执行一个读取周期
    async fn run_cycle(&self, trigger: Trigger) -> CycleOutcome {
        let (_guard, generation) = match trigger {
            Trigger::Scheduled(generation) => {
                // 持有句柄锁检查运行状态并占用读取标志，stop() 返回后不会再开始新的读取
                let handle = self.handle.lock();
                let running = matches!(
                    *handle,
                    SchedulerHandle::Running { generation: current, .. } if current == generation
                );
                if !running {
                    return CycleOutcome::Skipped(SkipReason::Stopped);
                }
                let Some(guard) = FetchGuard::try_acquire(&self.fetching) else {
                    tracing::debug!("上一次读取尚未完成，跳过本次触发");
                    return CycleOutcome::Skipped(SkipReason::InFlight);
                };
                drop(handle);
                if self.spacing_remaining().is_some() {
                    return CycleOutcome::Skipped(SkipReason::TooSoon);
                }
                (guard, generation)
            }
            Trigger::Manual => {
                let Some(guard) = FetchGuard::try_acquire(&self.fetching) else {
                    tracing::debug!("上一次读取尚未完成，跳过手动刷新");
                    return CycleOutcome::Skipped(SkipReason::InFlight);
                };
                if self.spacing_remaining().is_some() {
                    tracing::debug!("距离上次读取不足 {} ms", MIN_FETCH_SPACING.as_millis());
                    return CycleOutcome::Skipped(SkipReason::TooSoon);
                }
                (guard, self.current_generation())
            }
        };

        *self.last_fetch.lock() = Some(Instant::now());
        self.execute_cycle(generation).await
    }

    /// 读取并应用结果，调用方负责并发控制
    async fn execute_cycle(&self, generation: u64) -> CycleOutcome {
        let record = match self.db().load_record() {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("读取记录失败: {}", e);
                return CycleOutcome::Failed(e.into());
            }
        };

        let source: Box<dyn DataSource> = match active_source(&record) {
            SourceTag::Telemetry => {
                let (Some(endpoint), Some(vin)) =
                    (record.polling.telemetry_url(), record.vehicle.vin())
                else {
                    return self.apply_failure(
                        generation,
                        SourceTag::Telemetry,
                        DashError::NotConfigured("vin".to_string()),
                    );
                };
                Box::new(TelemetryDataSource::new(self.client.clone(), endpoint, vin))
            }
            SourceTag::RestApi => {
                let Some(vehicle_id) = record.vehicle.vehicle_id() else {
                    return self.apply_failure(
                        generation,
                        SourceTag::RestApi,
                        DashError::NotConfigured("vehicleId".to_string()),
                    );
                };
                let Some(access_token) = record.token.usable_access_token(now_ms()) else {
                    tracing::info!("Token 已过期，本周期只刷新 Token");
                    return self.refresh_token(record.token.access_token.as_deref()).await;
                };
                Box::new(RestDataSource::new(
                    self.fleet.clone(),
                    ProxyConfig::from_optional(record.polling.proxy_url()),
                    vehicle_id,
                    access_token,
                ))
            }
        };

        let tag = source.tag();
        let result = self
            .registrar
            .with_registration_retry(|| source.fetch_snapshot())
            .await;

        match result {
            Err(DashError::AuthExpired) if tag == SourceTag::RestApi => {
                tracing::warn!("API 返回 401，刷新 Token");
                self.refresh_token(record.token.access_token.as_deref())
                    .await
            }
            Err(DashError::MalformedResponse {
                reason,
                identity: Some(identity),
            }) => {
                match self
                    .db()
                    .update_record(|record| record.vehicle.absorb(&identity))
                {
                    Ok(true) => tracing::info!("已根据响应修正车辆身份: {:?}", identity),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("保存车辆身份失败: {}", e),
                }
                self.apply_failure(
                    generation,
                    tag,
                    DashError::MalformedResponse {
                        reason,
                        identity: Some(identity),
                    },
                )
            }
            Err(e) => self.apply_failure(generation, tag, e),
            Ok(outcome) => self.apply_outcome(generation, tag, outcome),
        }
    }

    /// 周期内刷新 Token，不产出快照
    async fn refresh_token(&self, observed: Option<&str>) -> CycleOutcome {
        self.sink.on_status(DashStatus::Refreshing);
        match self.tokens.refresh_access_token(observed).await {
            Ok(_) => {
                tracing::info!("Token 已刷新，下一周期继续读取");
                CycleOutcome::Refreshed
            }
            Err(e) => {
                tracing::error!("Token 刷新失败，需要重新授权: {}", e);
                self.sink.on_status(DashStatus::ReauthenticationRequired);
                CycleOutcome::Failed(e)
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        if self.current_generation() == generation {
            true
        } else {
            tracing::debug!("调度器已停止或重启，丢弃本周期结果");
            false
        }
    }

    fn apply_outcome(&self, generation: u64, tag: SourceTag, outcome: FetchOutcome) -> CycleOutcome {
        if !self.is_current(generation) {
            return CycleOutcome::Discarded;
        }
        match outcome {
            FetchOutcome::Snapshot(snapshot) => {
                *self.failures.lock().slot(tag) = 0;
                *self.latest.lock() = Some(snapshot.clone());
                tracing::debug!(
                    "读取成功 ({}): {:.1} km/h",
                    snapshot.source_tag,
                    snapshot.speed_kmh
                );
                self.sink.on_snapshot(&snapshot);
                CycleOutcome::Snapshot(snapshot)
            }
            FetchOutcome::Unavailable => {
                let failures = self.increment_failures(tag);
                tracing::debug!("{} 暂无数据（连续 {} 次）", tag, failures);
                self.sink.on_status(DashStatus::NoData);
                CycleOutcome::Unavailable
            }
        }
    }

    fn apply_failure(&self, generation: u64, tag: SourceTag, error: DashError) -> CycleOutcome {
        if !self.is_current(generation) {
            return CycleOutcome::Discarded;
        }
        let failures = self.increment_failures(tag);
        tracing::warn!("读取失败 ({}, 连续 {} 次): {}", tag, failures, error);
        self.sink.on_status(DashStatus::Error(error.to_string()));
        CycleOutcome::Failed(error)
    }

    fn increment_failures(&self, tag: SourceTag) -> u32 {
        let mut failures = self.failures.lock();
        let slot = failures.slot(tag);
        *slot = slot.saturating_add(1);
        *slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dash::model::record::Credentials;
    use crate::dash::sink::WatchSink;
    use serde_json::json;
    use tempfile::{TempDir, tempdir};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        _dir: TempDir,
        db: Arc<Database>,
        sink: Arc<WatchSink>,
        scheduler: PollingScheduler,
    }

    fn fixture(server: &MockServer, seed: impl FnOnce(&mut DashRecord)) -> Fixture {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).unwrap();
        db.update_record(|record| {
            record.credentials = Credentials {
                client_id: "cid".to_string(),
                client_secret: "secret".to_string(),
            };
            record.redirect_uri = Some("https://dash.example.com/callback".to_string());
            record.token.access_token = Some("T".to_string());
            record.token.refresh_token = Some("R".to_string());
            record.token.expires_at = Some(now_ms() + 3_600_000);
            record.vehicle.vehicle_id = Some("V1".to_string());
            seed(record);
        })
        .unwrap();

        let client = Client::new();
        let sink = Arc::new(WatchSink::new());
        let tokens = Arc::new(TokenManager::new(
            db.clone(),
            client.clone(),
            server.uri(),
            server.uri(),
        ));
        let fleet = FleetApi::new(client.clone(), server.uri());
        let registrar = Arc::new(PartnerRegistrar::new(
            tokens.clone(),
            fleet.clone(),
            sink.clone(),
            "localhost",
        ));
        let scheduler = PollingScheduler::new(tokens, registrar, sink.clone(), fleet, client);
        Fixture {
            _dir: dir,
            db,
            sink,
            scheduler,
        }
    }

    fn vehicle_data_body() -> serde_json::Value {
        json!({
            "response": {
                "drive_state": {"speed": 60},
                "charge_state": {"battery_level": 80, "charging_state": "Charging"},
                "vehicle_state": {"odometer": 1000.0}
            }
        })
    }

    #[test]
    fn test_effective_interval_backoff() {
        let base = Duration::from_secs(2);
        for failures in 0..=5 {
            assert_eq!(effective_interval(base, failures), base);
        }
        assert_eq!(effective_interval(base, 6), Duration::from_millis(10_000));
        assert_eq!(effective_interval(base, 7), Duration::from_millis(12_000));
        assert_eq!(effective_interval(base, 15), Duration::from_millis(28_000));
        assert_eq!(effective_interval(base, 16), Duration::from_millis(30_000));
        assert_eq!(effective_interval(base, 100), Duration::from_millis(30_000));
    }

    #[test]
    fn test_effective_interval_floor_and_long_base() {
        assert_eq!(
            effective_interval(Duration::from_secs(1), 0),
            MIN_FETCH_SPACING
        );
        assert_eq!(
            effective_interval(Duration::from_secs(60), 8),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn test_rest_cycle_emits_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vehicle_data_body()))
            .expect(1)
            .mount(&server)
            .await;
        let f = fixture(&server, |_| {});

        let CycleOutcome::Snapshot(snapshot) = f.scheduler.refresh_now().await else {
            panic!("应返回快照");
        };
        assert!((snapshot.speed_kmh - 96.5604).abs() < 1e-3);
        assert_eq!(snapshot.battery_percent, Some(80.0));
        assert_eq!(snapshot.odometer_km, Some(1000.0));
        assert_eq!(f.sink.view().status, DashStatus::Connected);
        assert_eq!(f.scheduler.latest_snapshot(), Some(snapshot));
    }

    #[tokio::test]
    async fn test_manual_trigger_too_soon_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vehicle_data_body()))
            .expect(1)
            .mount(&server)
            .await;
        let f = fixture(&server, |_| {});

        assert!(matches!(
            f.scheduler.refresh_now().await,
            CycleOutcome::Snapshot(_)
        ));
        assert!(matches!(
            f.scheduler.refresh_now().await,
            CycleOutcome::Skipped(SkipReason::TooSoon)
        ));
    }

    #[tokio::test]
    async fn test_in_flight_trigger_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(vehicle_data_body())
                    .set_delay(Duration::from_millis(500)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let f = fixture(&server, |_| {});

        let first = {
            let scheduler = f.scheduler.clone();
            tokio::spawn(async move { scheduler.refresh_now().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            f.scheduler.refresh_now().await,
            CycleOutcome::Skipped(SkipReason::InFlight)
        ));
        assert!(matches!(first.await.unwrap(), CycleOutcome::Snapshot(_)));
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_without_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v3/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"access_token": "T2", "expires_in": 3600}),
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vehicle_data_body()))
            .expect(0)
            .mount(&server)
            .await;
        let f = fixture(&server, |record| record.token.expires_at = Some(now_ms()));

        assert!(matches!(
            f.scheduler.refresh_now().await,
            CycleOutcome::Refreshed
        ));
        assert_eq!(f.scheduler.latest_snapshot(), None);
        let token = f.db.load_record().unwrap().token;
        assert_eq!(token.access_token.as_deref(), Some("T2"));
        assert_eq!(token.refresh_token.as_deref(), Some("R"));
    }

    #[tokio::test]
    async fn test_failed_refresh_requires_reauthentication() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v3/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;
        let f = fixture(&server, |record| record.token.expires_at = Some(0));

        assert!(matches!(
            f.scheduler.refresh_now().await,
            CycleOutcome::Failed(DashError::InvalidGrant(_))
        ));
        assert_eq!(
            f.sink.view().status,
            DashStatus::ReauthenticationRequired
        );
        assert!(!f.scheduler.is_running());
        assert_eq!(
            f.db.load_record().unwrap().token.access_token.as_deref(),
            Some("T")
        );
    }

    #[tokio::test]
    async fn test_registration_then_single_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .respond_with(ResponseTemplate::new(412).set_body_json(
                json!({"error": "Account must be registered in the current region"}),
            ))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v3/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"access_token": "P", "expires_in": 3600}),
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/1/partner_accounts"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let f = fixture(&server, |_| {});

        assert!(matches!(
            f.scheduler.refresh_now().await,
            CycleOutcome::Failed(DashError::RegionNotRegistered { .. })
        ));
        assert_eq!(f.scheduler.failures().rest, 1);
    }

    #[tokio::test]
    async fn test_malformed_identity_corrects_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"response": {"vehicle_id": 777, "vin": "VIN9"}}),
            ))
            .mount(&server)
            .await;
        let f = fixture(&server, |_| {});

        assert!(matches!(
            f.scheduler.refresh_now().await,
            CycleOutcome::Failed(DashError::MalformedResponse { .. })
        ));
        let vehicle = f.db.load_record().unwrap().vehicle;
        assert_eq!(vehicle.vehicle_id(), Some("777"));
        assert_eq!(vehicle.vin(), Some("VIN9"));
    }

    #[tokio::test]
    async fn test_telemetry_failures_widen_interval_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/vehicle/VIN1"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(7)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/vehicle/VIN1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"speed": 12.0})))
            .mount(&server)
            .await;
        let uri = server.uri();
        let f = fixture(&server, |record| {
            record.polling.telemetry_url = Some(uri);
            record.vehicle.vin = Some("VIN1".to_string());
        });
        let ctx = &f.scheduler.ctx;
        let generation = ctx.current_generation();

        for _ in 0..6 {
            assert!(matches!(
                ctx.execute_cycle(generation).await,
                CycleOutcome::Unavailable
            ));
        }
        assert_eq!(f.sink.view().status, DashStatus::NoData);
        assert!(ctx.next_delay().unwrap() >= Duration::from_millis(10_000));

        ctx.execute_cycle(generation).await;
        assert_eq!(ctx.next_delay().unwrap(), Duration::from_millis(12_000));

        assert!(matches!(
            ctx.execute_cycle(generation).await,
            CycleOutcome::Snapshot(_)
        ));
        assert_eq!(f.scheduler.failures().telemetry, 0);
        assert_eq!(ctx.next_delay().unwrap(), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn test_start_twice_runs_one_timer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vehicle_data_body()))
            .expect(1)
            .mount(&server)
            .await;
        let f = fixture(&server, |_| {});

        assert!(f.scheduler.start().unwrap());
        assert!(!f.scheduler.start().unwrap());
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(f.scheduler.stop());
        assert!(!f.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_start_after_manual_refresh_waits_for_spacing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vehicle_data_body()))
            .mount(&server)
            .await;
        let f = fixture(&server, |_| {});

        assert!(matches!(
            f.scheduler.refresh_now().await,
            CycleOutcome::Snapshot(_)
        ));
        let manual_at = Instant::now();
        assert!(f.scheduler.start().unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), 1);

        let settle = MIN_FETCH_SPACING.saturating_sub(manual_at.elapsed());
        tokio::time::sleep(settle + Duration::from_millis(700)).await;
        f.scheduler.stop();
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_result_discarded_after_stop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(vehicle_data_body())
                    .set_delay(Duration::from_millis(400)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let f = fixture(&server, |_| {});

        assert!(f.scheduler.start().unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.scheduler.stop();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(f.scheduler.latest_snapshot(), None);
        assert_eq!(f.sink.view().status, DashStatus::Paused);
    }

    #[tokio::test]
    async fn test_hidden_stops_and_visible_does_not_restart() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/1/vehicles/V1/vehicle_data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vehicle_data_body()))
            .mount(&server)
            .await;
        let f = fixture(&server, |_| {});

        f.scheduler.start().unwrap();
        f.scheduler.visibility_changed(false);
        assert!(!f.scheduler.is_running());

        f.scheduler.visibility_changed(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!f.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_stop_resets_failure_counters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let f = fixture(&server, |_| {});
        let ctx = &f.scheduler.ctx;

        ctx.execute_cycle(ctx.current_generation()).await;
        assert_eq!(f.scheduler.failures().rest, 1);

        f.scheduler.stop();
        assert_eq!(f.scheduler.failures(), FailureCounters::default());
    }

    #[test]
    fn test_start_requires_configured_source() {
        let mut record = DashRecord::default();
        assert!(matches!(
            ensure_source_configured(&record),
            Err(DashError::NotConfigured(_))
        ));
        record.polling.telemetry_url = Some("http://relay".to_string());
        record.vehicle.vin = Some("VIN".to_string());
        assert!(ensure_source_configured(&record).is_ok());
    }
}
