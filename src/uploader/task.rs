// 上传任务状态机
//
// 状态流转：
// Pending → Calculating → Uploading → Merging → Completed
//                       ↘ Skipped（内容已存在）
// 任意非终态 → Failed / Cancelled
// 调用方显式重试（已确认分片保留）：
//   去重已未命中 Failed → Uploading
//   去重结果未知 Failed → Calculating，重新检查后再决定上传或跳过

use crate::uploader::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 等待中
    Pending,
    /// 指纹计算 / 去重检查中
    Calculating,
    /// 上传中
    Uploading,
    /// 合并中
    Merging,
    /// 已完成
    Completed,
    /// 已跳过（内容已存在）
    Skipped,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl UploadTaskStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadTaskStatus::Completed
                | UploadTaskStatus::Skipped
                | UploadTaskStatus::Failed
                | UploadTaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadTaskStatus::Pending => "pending",
            UploadTaskStatus::Calculating => "calculating",
            UploadTaskStatus::Uploading => "uploading",
            UploadTaskStatus::Merging => "merging",
            UploadTaskStatus::Completed => "completed",
            UploadTaskStatus::Skipped => "skipped",
            UploadTaskStatus::Failed => "failed",
            UploadTaskStatus::Cancelled => "cancelled",
        }
    }

    /// 状态转换是否合法
    pub fn can_transition_to(&self, to: UploadTaskStatus) -> bool {
        use UploadTaskStatus::*;
        match (self, to) {
            (Pending, Calculating) => true,
            (Calculating, Uploading) | (Calculating, Skipped) => true,
            (Uploading, Merging) => true,
            (Merging, Completed) => true,
            (from, Failed) | (from, Cancelled) => !from.is_terminal(),
            // 离开 Failed 只能通过 mark_retrying
            _ => false,
        }
    }
}

impl fmt::Display for UploadTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 状态机拒绝的操作
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("非法状态转换: {from} → {to}")]
    Illegal {
        from: UploadTaskStatus,
        to: UploadTaskStatus,
    },
    #[error("指纹已设置，不可修改")]
    FingerprintImmutable,
    #[error("指纹尚未计算")]
    MissingFingerprint,
    #[error("分片索引越界: {index} >= {total}")]
    ChunkOutOfRange { index: usize, total: usize },
    #[error("分片未全部确认: {acked}/{total}")]
    Incomplete { acked: usize, total: usize },
    #[error("当前状态不接受分片确认: {0}")]
    NotUploading(UploadTaskStatus),
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 本地文件路径（内存数据源为 None）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    /// 文件名
    pub file_name: String,
    /// 文件大小
    pub total_size: u64,
    /// 分片大小
    pub chunk_size: u64,
    /// 内容指纹（设置后不可修改）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    /// 任务状态
    pub status: UploadTaskStatus,

    // === 分片信息字段 ===
    /// 总分片数
    #[serde(default)]
    pub total_chunks: usize,
    /// 已确认分片索引
    #[serde(default)]
    pub uploaded_chunks: BTreeSet<usize>,
    /// 进度 0-100（按分片数计算）
    #[serde(default)]
    pub progress: u8,
    /// 已上传大小
    #[serde(default)]
    pub uploaded_size: u64,
    /// 上传速度 (bytes/s)
    #[serde(default)]
    pub speed: u64,

    // === 结果字段 ===
    /// 服务端媒体ID（仅 Completed / Skipped）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    /// 跳过原因（仅 Skipped）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// 错误信息（仅 Failed）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 重试次数
    #[serde(default)]
    pub retry_count: u32,

    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(
        local_path: Option<PathBuf>,
        file_name: String,
        total_size: u64,
        chunk_size: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            local_path,
            file_name,
            total_size,
            chunk_size,
            fingerprint: None,
            status: UploadTaskStatus::Pending,
            total_chunks: 0,
            uploaded_chunks: BTreeSet::new(),
            progress: 0,
            uploaded_size: 0,
            speed: 0,
            result_id: None,
            skip_reason: None,
            error: None,
            retry_count: 0,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 已确认分片数
    pub fn acked_count(&self) -> usize {
        self.uploaded_chunks.len()
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self) -> Option<u64> {
        if self.speed == 0 || self.uploaded_size >= self.total_size {
            return None;
        }
        let remaining = self.total_size - self.uploaded_size;
        Some(remaining / self.speed)
    }

    fn transition(&mut self, to: UploadTaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(chrono::Utc::now().timestamp());
            self.speed = 0;
        }
        Ok(())
    }

    /// 标记为计算中
    pub fn mark_calculating(&mut self) -> Result<(), TransitionError> {
        self.transition(UploadTaskStatus::Calculating)?;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
        Ok(())
    }

    /// 设置内容指纹（只能设置一次；重复设置相同值视为成功）
    pub fn set_fingerprint(
        &mut self,
        fingerprint: Fingerprint,
        total_size: u64,
    ) -> Result<(), TransitionError> {
        match &self.fingerprint {
            Some(existing) if *existing == fingerprint => Ok(()),
            Some(_) => Err(TransitionError::FingerprintImmutable),
            None => {
                self.fingerprint = Some(fingerprint);
                self.total_size = total_size;
                Ok(())
            }
        }
    }

    /// 标记为上传中（去重未命中）
    pub fn mark_uploading(&mut self, total_chunks: usize) -> Result<(), TransitionError> {
        if self.fingerprint.is_none() {
            return Err(TransitionError::MissingFingerprint);
        }
        self.transition(UploadTaskStatus::Uploading)?;
        self.total_chunks = total_chunks;
        self.uploaded_chunks.retain(|&i| i < total_chunks);
        self.recompute_progress();
        Ok(())
    }

    /// 是否已经进入过上传阶段（去重检查未命中）
    pub fn upload_started(&self) -> bool {
        self.total_chunks > 0
    }

    /// 失败后重试，保留已确认分片，返回重试从哪个状态开始
    ///
    /// 曾进入上传阶段的任务回到 Uploading 补传；
    /// 在去重检查阶段失败的任务回到 Calculating，必须重新检查。
    pub fn mark_retrying(&mut self, total_chunks: usize) -> Result<UploadTaskStatus, TransitionError> {
        if self.fingerprint.is_none() {
            return Err(TransitionError::MissingFingerprint);
        }
        let to = if self.upload_started() {
            UploadTaskStatus::Uploading
        } else {
            UploadTaskStatus::Calculating
        };
        if self.status != UploadTaskStatus::Failed {
            return Err(TransitionError::Illegal {
                from: self.status,
                to,
            });
        }

        self.status = to;
        if to == UploadTaskStatus::Uploading {
            self.total_chunks = total_chunks;
            self.uploaded_chunks.retain(|&i| i < total_chunks);
        }
        self.error = None;
        self.completed_at = None;
        self.retry_count += 1;
        self.recompute_progress();
        Ok(to)
    }

    /// 记录分片确认，返回是否为首次确认
    ///
    /// 进度只允许在这里变化，且单调不减
    pub fn record_chunk_ack(&mut self, index: usize, bytes: u64) -> Result<bool, TransitionError> {
        if self.status != UploadTaskStatus::Uploading {
            return Err(TransitionError::NotUploading(self.status));
        }
        if index >= self.total_chunks {
            return Err(TransitionError::ChunkOutOfRange {
                index,
                total: self.total_chunks,
            });
        }

        let first = self.uploaded_chunks.insert(index);
        if first {
            self.uploaded_size = (self.uploaded_size + bytes).min(self.total_size);
            self.recompute_progress();
        }
        Ok(first)
    }

    fn recompute_progress(&mut self) {
        if self.total_chunks == 0 {
            return;
        }
        let progress = (self.uploaded_chunks.len() * 100 / self.total_chunks) as u8;
        self.progress = self.progress.max(progress);
    }

    /// 标记为合并中（全部分片确认后）
    pub fn mark_merging(&mut self) -> Result<(), TransitionError> {
        if self.status == UploadTaskStatus::Uploading && self.acked_count() != self.total_chunks {
            return Err(TransitionError::Incomplete {
                acked: self.acked_count(),
                total: self.total_chunks,
            });
        }
        self.transition(UploadTaskStatus::Merging)
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self, result_id: String) -> Result<(), TransitionError> {
        self.transition(UploadTaskStatus::Completed)?;
        self.result_id = Some(result_id);
        self.uploaded_size = self.total_size;
        Ok(())
    }

    /// 标记为已跳过（内容已存在）
    pub fn mark_skipped(&mut self, result_id: String, reason: String) -> Result<(), TransitionError> {
        self.transition(UploadTaskStatus::Skipped)?;
        self.result_id = Some(result_id);
        self.skip_reason = Some(reason);
        self.progress = 100;
        self.uploaded_size = self.total_size;
        Ok(())
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) -> Result<(), TransitionError> {
        self.transition(UploadTaskStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) -> Result<(), TransitionError> {
        self.transition(UploadTaskStatus::Cancelled)
    }
}
