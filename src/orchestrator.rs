// 编排入口
//
// 组合上传管理器与预览获取器：
// - 默认上传与预览共用一个并发队列，进程内所有后端调用受同一上限约束
// - 配置 queue.preview 时预览使用独立队列

use crate::cache::{PreviewBlob, ResultCache};
use crate::config::AppConfig;
use crate::events::UploadEvent;
use crate::persistence::TaskStore;
use crate::preview::{FetchError, PreviewFetcher};
use crate::queue::{ConcurrencyQueue, RetryPolicy};
use crate::transport::{HttpTransport, MediaMetadata, Transport};
use crate::uploader::{
    Fingerprint, ManagerError, UploadHandle, UploadManager, UploadSource, UploadTask,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

/// 上传与预览获取的统一入口
#[derive(Clone)]
pub struct Orchestrator {
    uploads: UploadManager,
    previews: PreviewFetcher,
}

impl Orchestrator {
    /// 使用指定传输创建
    pub fn new(config: &AppConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate().context("配置校验失败")?;

        let limits = config.queue.limits();
        let queue = ConcurrencyQueue::new(
            "shared",
            limits.max_concurrent,
            limits.inter_dispatch_delay(),
        );
        let preview_queue = match &config.queue.preview {
            Some(preview) => ConcurrencyQueue::new(
                "preview",
                preview.max_concurrent,
                preview.inter_dispatch_delay(),
            ),
            None => queue.clone(),
        };

        let mut uploads = UploadManager::new(transport.clone(), queue, config.upload.clone());
        if let Some(dir) = &config.upload.persist_dir {
            let store = TaskStore::new(dir).context("初始化任务持久化失败")?;
            uploads = uploads.with_store(Arc::new(store));
        }

        let previews = PreviewFetcher::new(
            transport,
            preview_queue,
            Arc::new(ResultCache::new(config.cache.max_entries)),
            RetryPolicy::new(config.upload.max_retries, config.upload.retry_delay()),
            config.cache.spill_dir.clone(),
        );

        info!(
            "编排器初始化完成: 并发上限={}, 预览独立队列={}, 缓存上限={}",
            limits.max_concurrent,
            config.queue.preview.is_some(),
            config.cache.max_entries
        );

        Ok(Self { uploads, previews })
    }

    /// 按配置创建 HTTP 传输
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.transport)?;
        Self::new(config, Arc::new(transport))
    }

    pub fn uploads(&self) -> &UploadManager {
        &self.uploads
    }

    pub fn previews(&self) -> &PreviewFetcher {
        &self.previews
    }

    /// 上传使用的队列
    pub fn queue(&self) -> &ConcurrencyQueue {
        self.uploads.queue()
    }

    /// 预览使用的队列（未单独配置时与上传共用）
    pub fn preview_queue(&self) -> &ConcurrencyQueue {
        self.previews.queue()
    }

    pub fn cache(&self) -> &ResultCache<PreviewBlob> {
        self.previews.cache()
    }

    // === 上传 ===

    pub fn submit_upload(&self, source: UploadSource, metadata: MediaMetadata) -> UploadHandle {
        self.uploads.submit_upload(source, metadata)
    }

    pub fn cancel(&self, task_id: &str) -> Result<(), ManagerError> {
        self.uploads.cancel(task_id)
    }

    pub fn retry(&self, task_id: &str) -> Result<UploadHandle, ManagerError> {
        self.uploads.retry(task_id)
    }

    pub fn get_task(&self, task_id: &str) -> Option<UploadTask> {
        self.uploads.get_task(task_id)
    }

    pub fn get_all_tasks(&self) -> Vec<UploadTask> {
        self.uploads.get_all_tasks()
    }

    pub fn clear_completed(&self) -> usize {
        self.uploads.clear_completed()
    }

    pub fn clear_failed(&self) -> usize {
        self.uploads.clear_failed()
    }

    pub fn progress_stream(&self, task_id: &str) -> Result<watch::Receiver<UploadTask>, ManagerError> {
        self.uploads.progress_stream(task_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.uploads.subscribe()
    }

    pub fn restore_tasks(&self) -> usize {
        self.uploads.restore_tasks()
    }

    // === 预览 ===

    pub async fn fetch_cached(&self, fingerprint: &Fingerprint) -> Result<Arc<PreviewBlob>, FetchError> {
        self.previews.fetch_cached(fingerprint).await
    }

    pub async fn fetch_batch(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Vec<Result<Arc<PreviewBlob>, FetchError>> {
        self.previews.fetch_batch(fingerprints).await
    }

    pub fn clear_cache(&self) -> usize {
        self.previews.clear_cache()
    }
}
