//! 本地控制接口
//!
//! 浏览器页面通过这些接口驱动授权流程、选择车辆、调整设置和控制轮询

mod error;
mod handlers;
mod router;
mod service;
mod types;

pub use router::create_control_router;
pub use service::ControlService;
