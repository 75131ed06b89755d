//! 数据源抽象
//!
//! 遥测中继和 REST API 都产出归一化的车辆快照

use async_trait::async_trait;
use serde_json::Value;

use crate::dash::error::DashError;
use crate::dash::model::vehicle::{SourceTag, VehicleSnapshot};

/// 单次读取的结果
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Snapshot(VehicleSnapshot),
    /// 数据源暂时没有数据（不是错误）
    Unavailable,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    fn tag(&self) -> SourceTag;

    async fn fetch_snapshot(&self) -> Result<FetchOutcome, DashError>;
}

/// 读取数值字段，null 或非数值视为缺失
pub(crate) fn number(value: &Value, key: &str) -> Option<f64> {
    value.get(key).and_then(Value::as_f64)
}
