//! 上传事件类型定义

use crate::uploader::task::UploadTaskStatus;
use serde::{Deserialize, Serialize};

/// 任务单次运行的终态结果
///
/// 结果ID与错误互斥：Completed / Skipped 只带结果，Failed 只带错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UploadOutcome {
    /// 上传并合并成功
    Completed { result_id: String },
    /// 内容已存在，未上传
    Skipped { result_id: String, reason: String },
    /// 失败（retryable 表示调用方可以重试）
    Failed { error: String, retryable: bool },
    /// 已取消
    Cancelled,
}

impl UploadOutcome {
    /// 结果ID（仅 Completed / Skipped）
    pub fn result_id(&self) -> Option<&str> {
        match self {
            UploadOutcome::Completed { result_id } | UploadOutcome::Skipped { result_id, .. } => {
                Some(result_id)
            }
            UploadOutcome::Failed { .. } | UploadOutcome::Cancelled => None,
        }
    }

    /// 内容是否已在服务端可用
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            UploadOutcome::Completed { .. } | UploadOutcome::Skipped { .. }
        )
    }

    /// 对应的任务终态
    pub fn status(&self) -> UploadTaskStatus {
        match self {
            UploadOutcome::Completed { .. } => UploadTaskStatus::Completed,
            UploadOutcome::Skipped { .. } => UploadTaskStatus::Skipped,
            UploadOutcome::Failed { .. } => UploadTaskStatus::Failed,
            UploadOutcome::Cancelled => UploadTaskStatus::Cancelled,
        }
    }
}

/// 上传任务事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 任务创建
    Created {
        task_id: String,
        file_name: String,
        total_size: u64,
    },
    /// 状态变更
    StatusChanged {
        task_id: String,
        old_status: UploadTaskStatus,
        new_status: UploadTaskStatus,
    },
    /// 进度更新（每次分片确认）
    Progress {
        task_id: String,
        progress: u8,
        uploaded_chunks: usize,
        total_chunks: usize,
        uploaded_size: u64,
        total_size: u64,
        speed: u64,
    },
    /// 本次运行结束
    Finished {
        task_id: String,
        outcome: UploadOutcome,
    },
    /// 任务已清除
    Deleted { task_id: String },
}

impl UploadEvent {
    /// 获取任务 ID
    pub fn task_id(&self) -> &str {
        match self {
            UploadEvent::Created { task_id, .. } => task_id,
            UploadEvent::StatusChanged { task_id, .. } => task_id,
            UploadEvent::Progress { task_id, .. } => task_id,
            UploadEvent::Finished { task_id, .. } => task_id,
            UploadEvent::Deleted { task_id } => task_id,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Created { .. } => "created",
            UploadEvent::StatusChanged { .. } => "status_changed",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::Finished { .. } => "finished",
            UploadEvent::Deleted { .. } => "deleted",
        }
    }
}
