//! 仪表盘输出
//!
//! 核心只产出数据（快照与状态），渲染由外部完成

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::dash::model::vehicle::VehicleSnapshot;

/// 连接状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "message")]
pub enum DashStatus {
    Connecting,
    Connected,
    Paused,
    /// 遥测中继暂时没有该车辆的数据
    NoData,
    Refreshing,
    Registering,
    ReauthenticationRequired,
    Error(String),
}

/// 快照和状态的消费方
pub trait DashboardSink: Send + Sync {
    fn on_snapshot(&self, snapshot: &VehicleSnapshot);
    fn on_status(&self, status: DashStatus);
}

/// 当前展示内容
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardView {
    pub snapshot: Option<VehicleSnapshot>,
    pub status: DashStatus,
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for DashboardView {
    fn default() -> Self {
        Self {
            snapshot: None,
            status: DashStatus::Paused,
            last_update: None,
        }
    }
}

/// 基于 watch channel 的实现，只保留最新内容
pub struct WatchSink {
    tx: watch::Sender<DashboardView>,
}

impl WatchSink {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DashboardView::default());
        Self { tx }
    }

    pub fn view(&self) -> DashboardView {
        self.tx.borrow().clone()
    }
}

impl Default for WatchSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DashboardSink for WatchSink {
    fn on_snapshot(&self, snapshot: &VehicleSnapshot) {
        let snapshot = snapshot.clone();
        self.tx.send_modify(|view| {
            view.snapshot = Some(snapshot);
            view.status = DashStatus::Connected;
            view.last_update = Some(Utc::now());
        });
    }

    fn on_status(&self, status: DashStatus) {
        tracing::debug!("状态更新: {:?}", status);
        self.tx.send_modify(|view| view.status = status);
    }
}
