//! 任务持久化模块
//!
//! 每个上传任务保存为一个 JSON 快照，用于进程重启后恢复：
//!
//! ```text
//! {persist_dir}/
//! └── {task_id}.json    # 任务快照（状态、已确认分片、元数据）
//! ```
//!
//! 写入采用"临时文件 + 原子重命名"，写入中断不会留下损坏的快照。
//! 快照带递增的修订号，并发写入时旧修订不会覆盖新修订。

mod store;

pub use store::{TaskSnapshot, TaskStore};
