// 传输层模块
//
// 每个方法对应一次后端网络调用，返回带分类的结果

pub mod client;
pub mod types;

pub use client::HttpTransport;
pub use types::{
    ChunkAck, DedupCheckRequest, DedupCheckResponse, MediaMetadata, MergeRequest, MergeResponse,
    TransportError, TransportErrorKind,
};

use crate::uploader::fingerprint::Fingerprint;
use async_trait::async_trait;
use bytes::Bytes;

/// 后端传输接口
///
/// 四个操作都可以安全重试：
/// - `check_exists` / `fetch_preview` 只读
/// - `upload_chunk` 按索引幂等，重复上传已确认分片视为成功
/// - `merge` 由服务端校验分片完整性，不完整返回 409
#[async_trait]
pub trait Transport: Send + Sync {
    /// 去重检查
    async fn check_exists(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<DedupCheckResponse, TransportError>;

    /// 上传单个分片
    ///
    /// # 参数
    /// * `task_id` - 任务ID
    /// * `index` - 分片索引
    /// * `data` - 分片数据
    /// * `md5` - 分片数据的 MD5（十六进制）
    async fn upload_chunk(
        &self,
        task_id: &str,
        index: usize,
        data: Bytes,
        md5: &str,
    ) -> Result<ChunkAck, TransportError>;

    /// 合并分片，返回媒体ID
    async fn merge(
        &self,
        task_id: &str,
        request: &MergeRequest,
    ) -> Result<MergeResponse, TransportError>;

    /// 获取预览数据
    async fn fetch_preview(&self, fingerprint: &Fingerprint) -> Result<Bytes, TransportError>;
}
