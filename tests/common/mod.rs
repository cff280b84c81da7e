// 集成测试公共工具
//
// 内存中的脚本化传输：统计调用次数、记录峰值并发、按脚本注入失败

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use media_ingest::config::AppConfig;
use media_ingest::transport::{
    ChunkAck, DedupCheckResponse, MergeRequest, MergeResponse, Transport, TransportError,
    TransportErrorKind,
};
use media_ingest::{Fingerprint, Orchestrator, UploadHandle, UploadOutcome, UploadTaskStatus};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 测试使用的分片大小（chunk_size_kb = 1）
pub const CHUNK: usize = 1024;

#[derive(Default)]
struct Script {
    dedup: VecDeque<TransportErrorKind>,
    merge: VecDeque<TransportErrorKind>,
    preview: VecDeque<TransportErrorKind>,
    chunks: HashMap<usize, VecDeque<TransportErrorKind>>,
}

struct CallGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockTransport {
    latency: Duration,
    script: Mutex<Script>,
    /// 服务端已有内容 fingerprint -> result_id
    existing: Mutex<HashMap<Fingerprint, String>>,
    /// 分片调用记录 (task_id, index, 调用时刻)
    chunk_log: Mutex<Vec<(String, usize, Instant)>>,
    pub dedup_calls: AtomicUsize,
    pub merge_calls: AtomicUsize,
    pub preview_calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            script: Mutex::new(Script::default()),
            existing: Mutex::new(HashMap::new()),
            chunk_log: Mutex::new(Vec::new()),
            dedup_calls: AtomicUsize::new(0),
            merge_calls: AtomicUsize::new(0),
            preview_calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn add_existing(&self, fingerprint: Fingerprint, result_id: &str) {
        self.existing
            .lock()
            .insert(fingerprint, result_id.to_string());
    }

    pub fn fail_chunk(&self, index: usize, kind: TransportErrorKind, times: usize) {
        let mut script = self.script.lock();
        let queue = script.chunks.entry(index).or_default();
        queue.extend(std::iter::repeat(kind).take(times));
    }

    pub fn fail_dedup(&self, kind: TransportErrorKind, times: usize) {
        self.script
            .lock()
            .dedup
            .extend(std::iter::repeat(kind).take(times));
    }

    pub fn fail_merge(&self, kind: TransportErrorKind, times: usize) {
        self.script
            .lock()
            .merge
            .extend(std::iter::repeat(kind).take(times));
    }

    pub fn fail_preview(&self, kind: TransportErrorKind, times: usize) {
        self.script
            .lock()
            .preview
            .extend(std::iter::repeat(kind).take(times));
    }

    pub fn chunk_calls(&self) -> usize {
        self.chunk_log.lock().len()
    }

    pub fn chunk_calls_for(&self, index: usize) -> usize {
        self.chunk_log
            .lock()
            .iter()
            .filter(|(_, i, _)| *i == index)
            .count()
    }

    pub fn chunk_calls_for_task(&self, task_id: &str) -> usize {
        self.chunk_log
            .lock()
            .iter()
            .filter(|(id, _, _)| id == task_id)
            .count()
    }

    /// 某个任务的分片调用时刻，按调用顺序
    pub fn chunk_call_times(&self, task_id: &str, index: Option<usize>) -> Vec<Instant> {
        self.chunk_log
            .lock()
            .iter()
            .filter(|(id, i, _)| id == task_id && index.map_or(true, |want| *i == want))
            .map(|(_, _, at)| *at)
            .collect()
    }

    /// 观察到的最大并发调用数
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) -> CallGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        CallGuard {
            active: &self.active,
        }
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn scripted(queue: Option<&mut VecDeque<TransportErrorKind>>) -> Result<(), TransportError> {
        match queue.and_then(|q| q.pop_front()) {
            Some(kind) => Err(TransportError::new(kind, "scripted failure")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn check_exists(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<DedupCheckResponse, TransportError> {
        let _guard = self.enter();
        self.dedup_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        Self::scripted(Some(&mut self.script.lock().dedup))?;
        Ok(match self.existing.lock().get(fingerprint) {
            Some(result_id) => DedupCheckResponse::hit(result_id.clone()),
            None => DedupCheckResponse::miss(),
        })
    }

    async fn upload_chunk(
        &self,
        task_id: &str,
        index: usize,
        data: Bytes,
        md5: &str,
    ) -> Result<ChunkAck, TransportError> {
        let _guard = self.enter();
        self.chunk_log
            .lock()
            .push((task_id.to_string(), index, Instant::now()));
        self.simulate_latency().await;

        Self::scripted(self.script.lock().chunks.get_mut(&index))?;

        let computed = format!("{:x}", md5::compute(&data));
        assert_eq!(computed, md5, "客户端计算的分片 MD5 不正确");
        Ok(ChunkAck {
            acked_index: index,
            md5: Some(computed),
        })
    }

    async fn merge(
        &self,
        task_id: &str,
        request: &MergeRequest,
    ) -> Result<MergeResponse, TransportError> {
        let _guard = self.enter();
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        Self::scripted(Some(&mut self.script.lock().merge))?;

        let result_id = format!("media-{}", task_id);
        self.existing
            .lock()
            .insert(request.fingerprint.clone(), result_id.clone());
        Ok(MergeResponse { result_id })
    }

    async fn fetch_preview(&self, fingerprint: &Fingerprint) -> Result<Bytes, TransportError> {
        let _guard = self.enter();
        self.preview_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        Self::scripted(Some(&mut self.script.lock().preview))?;
        Ok(Bytes::from(format!("thumbnail:{}", fingerprint)))
    }
}

/// 小分片、短重试间隔的测试配置
pub fn test_config(max_concurrent: usize) -> AppConfig {
    let mut config = AppConfig::default();
    config.upload.chunk_size_kb = 1;
    config.upload.max_retries = 3;
    config.upload.retry_delay_ms = 10;
    config.queue.max_concurrent = max_concurrent;
    config.queue.inter_dispatch_ms = 0;
    config.log.enabled = false;
    config
}

pub fn orchestrator(config: &AppConfig, transport: Arc<MockTransport>) -> Orchestrator {
    Orchestrator::new(config, transport).expect("创建编排器失败")
}

/// 生成指定分片数的确定性内容，seed 不同内容不同
pub fn content(chunks: usize, seed: u8) -> Bytes {
    (0..chunks * CHUNK)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect::<Vec<u8>>()
        .into()
}

pub async fn wait_outcome(handle: UploadHandle) -> UploadOutcome {
    tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("等待上传结果超时")
        .expect("结果通道已关闭")
}

pub async fn wait_for_status(orchestrator: &Orchestrator, task_id: &str, status: UploadTaskStatus) {
    let mut rx = orchestrator.progress_stream(task_id).expect("任务不存在");
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if rx.borrow_and_update().status == status {
                return;
            }
            rx.changed().await.expect("进度通道已关闭");
        }
    })
    .await
    .expect("等待任务状态超时");
}
