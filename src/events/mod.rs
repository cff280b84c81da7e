//! 事件模块
//!
//! 任务状态变化通过 broadcast 通道推送给订阅者，替代轮询任务列表
//! - `types.rs`: 上传事件与终态结果

mod types;

pub use types::*;
