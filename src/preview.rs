// 预览获取
//
// 按指纹获取预览数据：先查缓存，未命中时经队列获取并写入缓存。
// 批量获取并发执行，并发度受队列限制，结果按输入顺序返回。

use crate::cache::{CacheKey, PreviewBlob, ResultCache};
use crate::queue::{ConcurrencyQueue, RetryPolicy};
use crate::transport::{Transport, TransportError};
use crate::uploader::fingerprint::Fingerprint;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// 预览请求在队列中的分组
const PREVIEW_GROUP: &str = "preview";

/// 预览获取错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("预览获取已被移出队列")]
    Cancelled,
    #[error("预览数据落盘失败: {0}")]
    Spill(String),
}

/// 带缓存的预览获取器
#[derive(Clone)]
pub struct PreviewFetcher {
    transport: Arc<dyn Transport>,
    queue: ConcurrencyQueue,
    cache: Arc<ResultCache<PreviewBlob>>,
    policy: RetryPolicy,
    /// 设置时预览数据写入文件，释放时删除
    spill_dir: Option<PathBuf>,
}

impl PreviewFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: ConcurrencyQueue,
        cache: Arc<ResultCache<PreviewBlob>>,
        policy: RetryPolicy,
        spill_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            transport,
            queue,
            cache,
            policy,
            spill_dir,
        }
    }

    pub fn cache(&self) -> &ResultCache<PreviewBlob> {
        &self.cache
    }

    pub fn queue(&self) -> &ConcurrencyQueue {
        &self.queue
    }

    /// 获取预览（优先使用缓存）
    ///
    /// 并发请求同一指纹时都可能发起网络获取，但缓存里只保留先写入的那份，
    /// 后到的数据立即释放。
    pub async fn fetch_cached(&self, fingerprint: &Fingerprint) -> Result<Arc<PreviewBlob>, FetchError> {
        let key = CacheKey::preview(fingerprint.clone());
        if let Some(blob) = self.cache.get(&key) {
            debug!("预览缓存命中: {}", fingerprint.short());
            return Ok(blob);
        }

        debug!("预览缓存未命中，加入队列: {}", fingerprint.short());

        let transport = self.transport.clone();
        let label = format!("[预览] fingerprint={}", fingerprint.short());
        let data = self
            .queue
            .submit_with_retry(PREVIEW_GROUP, &label, self.policy, || {
                let transport = transport.clone();
                let fingerprint = fingerprint.clone();
                async move { transport.fetch_preview(&fingerprint).await }
            })
            .await
            .map_err(|_| FetchError::Cancelled)??;

        let blob = match &self.spill_dir {
            Some(dir) => PreviewBlob::spill_to_file(fingerprint.clone(), data, dir)
                .await
                .map_err(|e| FetchError::Spill(format!("{:#}", e)))?,
            None => PreviewBlob::in_memory(fingerprint.clone(), data),
        };

        debug!(
            "预览获取完成: {}, size={} bytes",
            fingerprint.short(),
            blob.size()
        );
        Ok(self.cache.get_or_insert(key, blob))
    }

    /// 批量获取，结果顺序与输入一致
    pub async fn fetch_batch(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Vec<Result<Arc<PreviewBlob>, FetchError>> {
        info!("批量获取预览: {} 个", fingerprints.len());
        futures::future::join_all(fingerprints.iter().map(|fp| self.fetch_cached(fp))).await
    }

    /// 清空预览缓存，返回释放的条目数
    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }
}
