// 上传分片规划
//
// 分片规则：
// - 按固定分片大小切分，最后一个分片可以更短
// - 索引从 0 开始连续编号
// - 空文件也产生一个空分片，保证合并前至少有一次分片确认

use std::collections::BTreeSet;
use std::ops::Range;
use tracing::{debug, info};

/// 默认分片大小: 2MB
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// 分片确认状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAckStatus {
    Pending,
    Acked,
}

/// 上传分片信息
#[derive(Debug, Clone)]
pub struct UploadChunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 确认状态
    pub ack_status: ChunkAckStatus,
    /// 是否已提交到队列（防止重复调度）
    pub uploading: bool,
}

impl UploadChunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            ack_status: ChunkAckStatus::Pending,
            uploading: false,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_acked(&self) -> bool {
        self.ack_status == ChunkAckStatus::Acked
    }
}

/// 分片规划器
pub struct ChunkPlanner;

impl ChunkPlanner {
    /// 计算分片数量（常数时间）
    ///
    /// # Panics
    /// `chunk_size == 0` 属于调用方编程错误
    pub fn chunk_count(file_size: u64, chunk_size: u64) -> usize {
        assert!(chunk_size > 0, "分片大小必须大于 0");
        file_size.div_ceil(chunk_size).max(1) as usize
    }

    /// 计算单个分片的字节范围（常数时间）
    pub fn chunk_range(file_size: u64, chunk_size: u64, index: usize) -> Option<Range<u64>> {
        if index >= Self::chunk_count(file_size, chunk_size) {
            return None;
        }
        let start = index as u64 * chunk_size;
        let end = (start + chunk_size).min(file_size);
        Some(start..end)
    }

    /// 生成全部分片描述
    pub fn plan(file_size: u64, chunk_size: u64) -> Vec<UploadChunk> {
        let count = Self::chunk_count(file_size, chunk_size);
        (0..count)
            .filter_map(|index| {
                Self::chunk_range(file_size, chunk_size, index)
                    .map(|range| UploadChunk::new(index, range))
            })
            .collect()
    }
}

/// 上传分片管理器
///
/// 跟踪每个分片的调度状态（是否已确认、是否在队列中）。
/// 分片确认列表以 `UploadTask::uploaded_chunks` 为准，这里是它的镜像。
#[derive(Debug)]
pub struct UploadChunkManager {
    /// 所有分片
    chunks: Vec<UploadChunk>,
}

impl UploadChunkManager {
    /// 创建新的上传分片管理器
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        let chunks = ChunkPlanner::plan(total_size, chunk_size);

        info!(
            "创建上传分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );

        Self { chunks }
    }

    /// 恢复分片管理器（已确认的分片不会再次调度）
    pub fn with_acked(total_size: u64, chunk_size: u64, acked: &BTreeSet<usize>) -> Self {
        let mut manager = Self::new(total_size, chunk_size);
        for &index in acked {
            manager.mark_acked(index);
        }
        debug!(
            "恢复分片状态: 已确认 {}/{}",
            manager.acked_count(),
            manager.chunk_count()
        );
        manager
    }

    /// 获取下一个待上传的分片
    pub fn next_pending(&mut self) -> Option<&mut UploadChunk> {
        self.chunks
            .iter_mut()
            .find(|c| !c.is_acked() && !c.uploading)
    }

    /// 取出所有待上传分片并标记为上传中
    pub fn take_pending(&mut self) -> Vec<UploadChunk> {
        let mut taken = Vec::new();
        while let Some(chunk) = self.next_pending() {
            chunk.uploading = true;
            taken.push(chunk.clone());
        }
        taken
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn acked_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_acked()).count()
    }

    /// 标记分片已确认，返回是否为首次确认
    pub fn mark_acked(&mut self, index: usize) -> bool {
        match self.chunks.get_mut(index) {
            Some(chunk) => {
                let first = !chunk.is_acked();
                chunk.ack_status = ChunkAckStatus::Acked;
                chunk.uploading = false;
                first
            }
            None => false,
        }
    }

    /// 清除所有上传中标记（重试前调用）
    pub fn reset_in_flight(&mut self) {
        for chunk in &mut self.chunks {
            chunk.uploading = false;
        }
    }
}
