//! 仪表盘核心：Token 生命周期、数据源与轮询调度

pub mod db;
pub mod error;
pub mod fleet;
pub mod model;
pub mod registrar;
pub mod rest;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod token_manager;
