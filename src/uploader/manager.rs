// 上传管理器
//
// 负责编排上传任务的完整生命周期：
// - 指纹计算，相同内容的并发任务只上传一次
// - 服务端去重检查（命中即跳过）
// - 分片上传（经共享队列限流，可重试错误等待后重新入队）
// - 合并、取消、重试
// - 任务快照持久化与重启恢复

use crate::config::UploadConfig;
use crate::events::{UploadEvent, UploadOutcome};
use crate::persistence::{TaskSnapshot, TaskStore};
use crate::queue::{ConcurrencyQueue, QueueError, RetryPolicy, Retryable};
use crate::transport::{
    MediaMetadata, MergeRequest, Transport, TransportError, TransportErrorKind,
};
use crate::uploader::chunk::{ChunkPlanner, UploadChunk, UploadChunkManager};
use crate::uploader::fingerprint::Fingerprint;
use crate::uploader::source::UploadSource;
use crate::uploader::task::{TransitionError, UploadTask, UploadTaskStatus};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 事件通道容量
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 速度计算窗口
const SPEED_WINDOW: Duration = Duration::from_millis(500);

/// 进程重启时未结束任务的失败原因
pub const INTERRUPTED_ERROR: &str = "interrupted";

/// 上传管理器错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    #[error("任务不存在: {0}")]
    TaskNotFound(String),
    #[error("任务 {task_id} 当前状态 {status} 不允许该操作")]
    InvalidState {
        task_id: String,
        status: UploadTaskStatus,
    },
    #[error("任务 {task_id} 无法重试: {reason}")]
    RetryUnavailable { task_id: String, reason: String },
    #[error("相同内容正在由任务 {owner_id} 上传，任务 {task_id} 暂不能重试")]
    DuplicateInFlight { task_id: String, owner_id: String },
    #[error("任务 {0} 的结果通道已关闭")]
    OutcomeDropped(String),
}

/// 提交上传后的句柄，用于等待本次运行的终态结果
#[derive(Debug)]
pub struct UploadHandle {
    task_id: String,
    outcome_rx: oneshot::Receiver<UploadOutcome>,
}

impl UploadHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 等待终态结果（每次运行恰好一个）
    pub async fn wait(self) -> Result<UploadOutcome, ManagerError> {
        let UploadHandle {
            task_id,
            outcome_rx,
        } = self;
        outcome_rx
            .await
            .map_err(|_| ManagerError::OutcomeDropped(task_id))
    }
}

/// 单次运行内部错误
#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("读取数据源失败: {0}")]
    Source(String),
    #[error("状态迁移失败: {0}")]
    State(#[from] TransitionError),
    #[error("任务已取消")]
    Cancelled,
}

impl Retryable for RunError {
    fn is_retryable(&self) -> bool {
        matches!(self, RunError::Transport(e) if e.is_retryable())
    }
}

impl From<QueueError> for RunError {
    fn from(_: QueueError) -> Self {
        RunError::Cancelled
    }
}

impl RunError {
    fn into_outcome(self) -> UploadOutcome {
        match self {
            RunError::Cancelled => UploadOutcome::Cancelled,
            RunError::Transport(e) => UploadOutcome::Failed {
                retryable: e.is_retryable(),
                error: e.to_string(),
            },
            other => UploadOutcome::Failed {
                error: other.to_string(),
                retryable: false,
            },
        }
    }
}

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// 新提交：计算指纹 → 去重检查 → 上传 → 合并
    Fresh,
    /// 失败后重试：只补传未确认的分片再合并
    Retry,
}

/// 已确认分片
#[derive(Debug)]
struct ChunkDone {
    index: usize,
    bytes: u64,
}

/// 速度采样
#[derive(Debug)]
struct SpeedTracker {
    last_time: Instant,
    last_bytes: u64,
}

impl SpeedTracker {
    fn new(bytes: u64) -> Self {
        Self {
            last_time: Instant::now(),
            last_bytes: bytes,
        }
    }

    /// 距上次采样超过窗口时返回新速度 (bytes/s)
    fn sample(&mut self, bytes: u64) -> Option<u64> {
        let elapsed = self.last_time.elapsed();
        if elapsed < SPEED_WINDOW {
            return None;
        }
        let delta = bytes.saturating_sub(self.last_bytes);
        let speed = (delta as f64 / elapsed.as_secs_f64()) as u64;
        self.last_time = Instant::now();
        self.last_bytes = bytes;
        Some(speed)
    }
}

/// 当前运行的控制句柄
struct RunState {
    cancel_token: CancellationToken,
    outcome_tx: Option<oneshot::Sender<UploadOutcome>>,
}

impl RunState {
    fn new(cancel_token: CancellationToken, outcome_tx: oneshot::Sender<UploadOutcome>) -> Self {
        Self {
            cancel_token,
            outcome_tx: Some(outcome_tx),
        }
    }

    /// 恢复的任务没有正在进行的运行
    fn idle() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            outcome_tx: None,
        }
    }
}

/// 上传任务信息
struct UploadTaskInfo {
    /// 任务（状态以此为准）
    task: Mutex<UploadTask>,
    /// 分片管理器（指纹计算后创建）
    chunk_manager: Mutex<Option<UploadChunkManager>>,
    /// 数据源（恢复的内存任务为 None）
    source: Option<UploadSource>,
    /// 合并时提交的元数据
    metadata: MediaMetadata,
    /// 当前运行
    run: Mutex<RunState>,
    /// 进度订阅
    progress_tx: watch::Sender<UploadTask>,
    /// 快照修订号
    revision: AtomicU64,
    /// 速度采样
    speed: Mutex<SpeedTracker>,
}

impl UploadTaskInfo {
    fn new(
        task: UploadTask,
        source: Option<UploadSource>,
        metadata: MediaMetadata,
        run: RunState,
    ) -> Self {
        let uploaded_size = task.uploaded_size;
        let (progress_tx, _) = watch::channel(task.clone());
        Self {
            task: Mutex::new(task),
            chunk_manager: Mutex::new(None),
            source,
            metadata,
            run: Mutex::new(run),
            progress_tx,
            revision: AtomicU64::new(0),
            speed: Mutex::new(SpeedTracker::new(uploaded_size)),
        }
    }

    fn task_id(&self) -> String {
        self.task.lock().id.clone()
    }

    fn status(&self) -> UploadTaskStatus {
        self.task.lock().status
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// 指纹占用记录
#[derive(Clone)]
struct InflightClaim {
    task_id: String,
    outcome_rx: watch::Receiver<Option<UploadOutcome>>,
}

enum ClaimAttempt {
    Owner(ClaimGuard),
    Attached {
        owner_id: String,
        outcome_rx: watch::Receiver<Option<UploadOutcome>>,
    },
}

/// 指纹所有权
///
/// 释放时先移除占用记录再通知等待者；未显式释放就被丢弃时，
/// 等待者看到通道关闭，按所有者失败处理。
struct ClaimGuard {
    inflight: Arc<DashMap<Fingerprint, InflightClaim>>,
    fingerprint: Fingerprint,
    task_id: String,
    outcome_tx: Option<watch::Sender<Option<UploadOutcome>>>,
}

impl ClaimGuard {
    fn release(mut self, outcome: &UploadOutcome) {
        self.remove_claim();
        if let Some(tx) = self.outcome_tx.take() {
            tx.send_replace(Some(outcome.clone()));
        }
    }

    fn remove_claim(&self) {
        self.inflight
            .remove_if(&self.fingerprint, |_, claim| claim.task_id == self.task_id);
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.outcome_tx.is_some() {
            self.remove_claim();
        }
    }
}

/// 等待进行中任务的结果，通道关闭且没有结果时返回 None
async fn wait_for_owner(
    mut outcome_rx: watch::Receiver<Option<UploadOutcome>>,
) -> Option<UploadOutcome> {
    loop {
        let current = outcome_rx.borrow_and_update().clone();
        if current.is_some() {
            return current;
        }
        if outcome_rx.changed().await.is_err() {
            let last = outcome_rx.borrow().clone();
            return last;
        }
    }
}

fn progress_event(task: &UploadTask) -> UploadEvent {
    UploadEvent::Progress {
        task_id: task.id.clone(),
        progress: task.progress,
        uploaded_chunks: task.acked_count(),
        total_chunks: task.total_chunks,
        uploaded_size: task.uploaded_size,
        total_size: task.total_size,
        speed: task.speed,
    }
}

/// 从任务终态推出结果
fn outcome_of(task: &UploadTask) -> UploadOutcome {
    match task.status {
        UploadTaskStatus::Completed => UploadOutcome::Completed {
            result_id: task.result_id.clone().unwrap_or_default(),
        },
        UploadTaskStatus::Skipped => UploadOutcome::Skipped {
            result_id: task.result_id.clone().unwrap_or_default(),
            reason: task.skip_reason.clone().unwrap_or_default(),
        },
        UploadTaskStatus::Failed => UploadOutcome::Failed {
            error: task.error.clone().unwrap_or_default(),
            retryable: false,
        },
        _ => UploadOutcome::Cancelled,
    }
}

/// 上传管理器
#[derive(Clone)]
pub struct UploadManager {
    /// 后端传输
    transport: Arc<dyn Transport>,
    /// 共享并发队列
    queue: ConcurrencyQueue,
    /// 上传配置
    config: UploadConfig,
    /// 所有任务（task_id -> TaskInfo）
    tasks: Arc<DashMap<String, Arc<UploadTaskInfo>>>,
    /// 进行中的指纹（fingerprint -> 占用任务）
    inflight: Arc<DashMap<Fingerprint, InflightClaim>>,
    /// 事件广播
    events_tx: broadcast::Sender<UploadEvent>,
    /// 快照存储
    store: Option<Arc<TaskStore>>,
}

impl UploadManager {
    /// 创建上传管理器
    ///
    /// # 参数
    /// * `transport` - 后端传输
    /// * `queue` - 共享并发队列（去重检查、分片、合并都经过它）
    /// * `config` - 上传配置
    pub fn new(transport: Arc<dyn Transport>, queue: ConcurrencyQueue, config: UploadConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            "创建上传管理器: 分片大小={} bytes, 最大重试={}, 重试间隔={:?}",
            config.chunk_size_bytes(),
            config.max_retries,
            config.retry_delay()
        );

        Self {
            transport,
            queue,
            config,
            tasks: Arc::new(DashMap::new()),
            inflight: Arc::new(DashMap::new()),
            events_tx,
            store: None,
        }
    }

    /// 启用任务快照持久化
    pub fn with_store(mut self, store: Arc<TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn queue(&self) -> &ConcurrencyQueue {
        &self.queue
    }

    /// 订阅所有任务的事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events_tx.subscribe()
    }

    fn publish_event(&self, event: UploadEvent) {
        // 没有订阅者时发送失败是正常的
        let _ = self.events_tx.send(event);
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries, self.config.retry_delay())
    }

    fn task_info(&self, task_id: &str) -> Result<Arc<UploadTaskInfo>, ManagerError> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ManagerError::TaskNotFound(task_id.to_string()))
    }

    /// 提交上传
    ///
    /// 立即返回句柄，上传在后台运行（需要在 tokio 运行时中调用）。
    pub fn submit_upload(&self, source: UploadSource, metadata: MediaMetadata) -> UploadHandle {
        let file_name = if metadata.file_name.is_empty() {
            source
                .local_path()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "untitled".to_string())
        } else {
            metadata.file_name.clone()
        };
        // 文件大小在指纹计算时确定，这里不做阻塞的文件访问
        let total_size = match &source {
            UploadSource::Memory(data) => data.len() as u64,
            UploadSource::File(_) => 0,
        };

        let task = UploadTask::new(
            source.local_path().map(Path::to_path_buf),
            file_name,
            total_size,
            self.config.chunk_size_bytes(),
        );
        let task_id = task.id.clone();

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let cancel_token = CancellationToken::new();
        let info = Arc::new(UploadTaskInfo::new(
            task.clone(),
            Some(source),
            metadata,
            RunState::new(cancel_token.clone(), outcome_tx),
        ));
        self.tasks.insert(task_id.clone(), info.clone());

        info!(
            "创建上传任务: id={}, 文件={}, 大小={} bytes",
            task_id, task.file_name, task.total_size
        );

        self.publish_event(UploadEvent::Created {
            task_id: task_id.clone(),
            file_name: task.file_name.clone(),
            total_size: task.total_size,
        });
        self.persist_current(&info);

        self.spawn_run(info, cancel_token, RunMode::Fresh, None);

        UploadHandle {
            task_id,
            outcome_rx,
        }
    }

    /// 取消任务
    ///
    /// 任务立即进入 Cancelled；尚未开始的队列项被移除，
    /// 已经在进行的调用允许完成但结果被丢弃。
    pub fn cancel(&self, task_id: &str) -> Result<(), ManagerError> {
        let info = self.task_info(task_id)?;

        if !self.apply_terminal(&info, &UploadOutcome::Cancelled) {
            return Err(ManagerError::InvalidState {
                task_id: task_id.to_string(),
                status: info.status(),
            });
        }

        info!("取消上传任务: {}", task_id);
        self.notify_finished(&info, UploadOutcome::Cancelled);
        Ok(())
    }

    /// 重试失败的任务
    ///
    /// 已确认的分片不会重新上传。在去重检查阶段失败的任务会重新检查，
    /// 命中时以 Skipped 结束。失败发生在指纹计算之前的任务没有指纹，
    /// 只能重新提交。
    pub fn retry(&self, task_id: &str) -> Result<UploadHandle, ManagerError> {
        let info = self.task_info(task_id)?;

        let (status, fingerprint, total_size, chunk_size) = {
            let task = info.task.lock();
            (
                task.status,
                task.fingerprint.clone(),
                task.total_size,
                task.chunk_size,
            )
        };

        if status != UploadTaskStatus::Failed {
            return Err(ManagerError::InvalidState {
                task_id: task_id.to_string(),
                status,
            });
        }
        if info.source.is_none() {
            return Err(ManagerError::RetryUnavailable {
                task_id: task_id.to_string(),
                reason: "内存数据源已随进程重启丢失".to_string(),
            });
        }
        let fingerprint = fingerprint.ok_or_else(|| ManagerError::RetryUnavailable {
            task_id: task_id.to_string(),
            reason: "内容指纹尚未计算".to_string(),
        })?;

        let claim = match self.try_claim(&fingerprint, task_id) {
            ClaimAttempt::Owner(guard) => guard,
            ClaimAttempt::Attached { owner_id, .. } => {
                warn!(
                    "相同内容正在由任务 {} 上传，拒绝重试: task={}",
                    owner_id, task_id
                );
                return Err(ManagerError::DuplicateInFlight {
                    task_id: task_id.to_string(),
                    owner_id,
                });
            }
        };

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let cancel_token = CancellationToken::new();
        *info.run.lock() = RunState::new(cancel_token.clone(), outcome_tx);

        let total_chunks = ChunkPlanner::chunk_count(total_size, chunk_size);
        let resumed_at = match self.update_task(&info, |task| task.mark_retrying(total_chunks)) {
            Ok(status) => status,
            Err(e) => {
                warn!("重试任务失败: task={}, {}", task_id, e);
                return Err(ManagerError::InvalidState {
                    task_id: task_id.to_string(),
                    status: info.status(),
                });
            }
        };

        let (acked, uploaded_size, retry_count) = {
            let task = info.task.lock();
            (
                task.uploaded_chunks.clone(),
                task.uploaded_size,
                task.retry_count,
            )
        };
        // 回到 Calculating 的任务在去重未命中后再规划分片
        *info.chunk_manager.lock() = (resumed_at == UploadTaskStatus::Uploading)
            .then(|| UploadChunkManager::with_acked(total_size, chunk_size, &acked));
        *info.speed.lock() = SpeedTracker::new(uploaded_size);

        info!(
            "重试上传任务: id={}, 第 {} 次, 从 {} 继续, 已确认分片 {}/{}",
            task_id,
            retry_count,
            resumed_at,
            acked.len(),
            total_chunks
        );

        self.spawn_run(info, cancel_token, RunMode::Retry, Some(claim));

        Ok(UploadHandle {
            task_id: task_id.to_string(),
            outcome_rx,
        })
    }

    /// 获取任务
    pub fn get_task(&self, task_id: &str) -> Option<UploadTask> {
        self.tasks.get(task_id).map(|info| info.task.lock().clone())
    }

    /// 获取所有任务（按创建时间倒序）
    pub fn get_all_tasks(&self) -> Vec<UploadTask> {
        let mut tasks: Vec<UploadTask> = self
            .tasks
            .iter()
            .map(|entry| entry.task.lock().clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// 订阅单个任务的进度
    ///
    /// 接收端总是持有最新的任务快照，慢消费者只会错过中间值
    pub fn progress_stream(&self, task_id: &str) -> Result<watch::Receiver<UploadTask>, ManagerError> {
        let info = self.task_info(task_id)?;
        Ok(info.progress_tx.subscribe())
    }

    /// 清除已完成、已跳过和已取消的任务
    pub fn clear_completed(&self) -> usize {
        let to_remove = self.collect_tasks(|status| {
            matches!(
                status,
                UploadTaskStatus::Completed | UploadTaskStatus::Skipped | UploadTaskStatus::Cancelled
            )
        });
        let count = self.remove_tasks(&to_remove);
        info!("清除了 {} 个已完成的上传任务", count);
        count
    }

    /// 清除失败的任务
    pub fn clear_failed(&self) -> usize {
        let to_remove = self.collect_tasks(|status| status == UploadTaskStatus::Failed);
        let count = self.remove_tasks(&to_remove);
        info!("清除了 {} 个失败的上传任务", count);
        count
    }

    fn collect_tasks(&self, filter: impl Fn(UploadTaskStatus) -> bool) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|entry| filter(entry.status()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn remove_tasks(&self, task_ids: &[String]) -> usize {
        let mut removed = 0;
        for task_id in task_ids {
            if self.tasks.remove(task_id).is_none() {
                continue;
            }
            removed += 1;
            if let Some(store) = &self.store {
                if let Err(e) = store.delete(task_id) {
                    warn!("删除任务快照失败: task={}, {:#}", task_id, e);
                }
            }
            self.publish_event(UploadEvent::Deleted {
                task_id: task_id.clone(),
            });
        }
        removed
    }

    /// 从快照恢复任务
    ///
    /// 未结束的任务标记为 Failed("interrupted")，保留已确认分片，
    /// 之后可以调用 `retry` 续传（文件数据源）。
    pub fn restore_tasks(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let mut restored = 0;
        for snapshot in store.load_all() {
            let TaskSnapshot {
                mut task,
                metadata,
                revision,
                ..
            } = snapshot;

            if self.tasks.contains_key(&task.id) {
                debug!("任务已在内存中，跳过恢复: {}", task.id);
                continue;
            }

            if !task.status.is_terminal() {
                let interrupted_at = task.status;
                if let Err(e) = task.mark_failed(INTERRUPTED_ERROR.to_string()) {
                    warn!("恢复任务失败: task={}, {}", task.id, e);
                    continue;
                }
                info!(
                    "任务在 {} 状态中断，已标记为失败: id={}, 已确认分片 {}/{}",
                    interrupted_at,
                    task.id,
                    task.acked_count(),
                    task.total_chunks
                );
            }

            let source = task.local_path.clone().map(UploadSource::File);
            let task_id = task.id.clone();
            let info = Arc::new(UploadTaskInfo::new(
                task,
                source,
                metadata,
                RunState::idle(),
            ));
            info.revision.store(revision, Ordering::SeqCst);
            self.persist_current(&info);
            self.tasks.insert(task_id, info);
            restored += 1;
        }

        info!("从快照恢复了 {} 个上传任务", restored);
        restored
    }

    // === 状态更新 ===

    /// 在任务锁内修改任务，发布事件并保存快照
    ///
    /// 事件在锁内发布，同一任务的事件顺序与状态变化顺序一致
    fn update_task<R>(
        &self,
        info: &UploadTaskInfo,
        f: impl FnOnce(&mut UploadTask) -> Result<R, TransitionError>,
    ) -> Result<R, TransitionError> {
        let (result, snapshot, revision) = {
            let mut task = info.task.lock();
            let old_status = task.status;
            let old_acked = task.acked_count();

            let result = f(&mut task)?;
            let revision = info.next_revision();

            if task.status != old_status {
                debug!(
                    "任务状态变更: id={}, {} -> {}",
                    task.id, old_status, task.status
                );
                self.publish_event(UploadEvent::StatusChanged {
                    task_id: task.id.clone(),
                    old_status,
                    new_status: task.status,
                });
            }
            if task.acked_count() != old_acked {
                self.publish_event(progress_event(&task));
            }
            info.progress_tx.send_replace(task.clone());

            (result, task.clone(), revision)
        };

        self.persist(info, snapshot, revision);
        Ok(result)
    }

    fn persist(&self, info: &UploadTaskInfo, task: UploadTask, revision: u64) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = TaskSnapshot::new(task, info.metadata.clone(), revision);
        if let Err(e) = store.save(&snapshot) {
            warn!("保存任务快照失败: task={}, {:#}", snapshot.task.id, e);
        }
    }

    fn persist_current(&self, info: &UploadTaskInfo) {
        let (task, revision) = {
            let task = info.task.lock();
            (task.clone(), info.next_revision())
        };
        self.persist(info, task, revision);
    }

    /// 应用终态，返回是否由本次调用完成迁移
    fn apply_terminal(&self, info: &UploadTaskInfo, outcome: &UploadOutcome) -> bool {
        let applied = self.update_task(info, |task| match outcome {
            UploadOutcome::Completed { result_id } => task.mark_completed(result_id.clone()),
            UploadOutcome::Skipped { result_id, reason } => {
                task.mark_skipped(result_id.clone(), reason.clone())
            }
            UploadOutcome::Failed { error, .. } => task.mark_failed(error.clone()),
            UploadOutcome::Cancelled => task.mark_cancelled(),
        });

        let task_id = info.task_id();
        if let Err(e) = applied {
            debug!("任务已处于终态，忽略结果: task={}, {}", task_id, e);
            return false;
        }

        info.run.lock().cancel_token.cancel();
        let removed = self.queue.cancel_group(&task_id);
        if removed > 0 {
            debug!("已移除任务 {} 的 {} 个排队工作项", task_id, removed);
        }
        if let Some(manager) = info.chunk_manager.lock().as_mut() {
            manager.reset_in_flight();
        }
        true
    }

    /// 发布结束事件并交付结果
    fn notify_finished(&self, info: &UploadTaskInfo, outcome: UploadOutcome) {
        let task_id = info.task_id();
        let outcome_tx = info.run.lock().outcome_tx.take();

        match &outcome {
            UploadOutcome::Completed { result_id } => {
                info!("上传完成: task={}, result_id={}", task_id, result_id)
            }
            UploadOutcome::Skipped { result_id, reason } => info!(
                "上传跳过: task={}, result_id={}, 原因={}",
                task_id, result_id, reason
            ),
            UploadOutcome::Failed { error, retryable } => error!(
                "上传失败: task={}, 可重试={}, 错误={}",
                task_id, retryable, error
            ),
            UploadOutcome::Cancelled => info!("上传已取消: task={}", task_id),
        }

        self.publish_event(UploadEvent::Finished {
            task_id,
            outcome: outcome.clone(),
        });

        if let Some(tx) = outcome_tx {
            let _ = tx.send(outcome);
        }
    }

    // === 运行 ===

    fn spawn_run(
        &self,
        info: Arc<UploadTaskInfo>,
        cancel_token: CancellationToken,
        mode: RunMode,
        claim: Option<ClaimGuard>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_task(info, cancel_token, mode, claim).await;
        });
    }

    async fn run_task(
        self,
        info: Arc<UploadTaskInfo>,
        cancel_token: CancellationToken,
        mode: RunMode,
        mut claim: Option<ClaimGuard>,
    ) {
        let outcome = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => UploadOutcome::Cancelled,
            result = self.drive(&info, mode, &mut claim) => match result {
                Ok(outcome) => outcome,
                Err(e) => e.into_outcome(),
            },
        };

        let applied = self.apply_terminal(&info, &outcome);
        let effective = if applied {
            outcome
        } else {
            outcome_of(&info.task.lock())
        };

        // 先释放指纹再交付结果，调用方拿到结果后可以立即重试
        if let Some(claim) = claim.take() {
            claim.release(&effective);
        }
        if applied {
            self.notify_finished(&info, effective);
        }
    }

    async fn drive(
        &self,
        info: &Arc<UploadTaskInfo>,
        mode: RunMode,
        claim: &mut Option<ClaimGuard>,
    ) -> Result<UploadOutcome, RunError> {
        let task_id = info.task_id();
        let source = info
            .source
            .clone()
            .ok_or_else(|| RunError::Source("数据源不可用".to_string()))?;

        match mode {
            RunMode::Fresh => {
                self.update_task(info, |task| task.mark_calculating())?;

                let digest = source
                    .digest()
                    .await
                    .map_err(|e| RunError::Source(format!("{:#}", e)))?;
                info!(
                    "指纹计算完成: task={}, fingerprint={}, 大小={} bytes",
                    task_id,
                    digest.fingerprint.short(),
                    digest.size
                );
                self.update_task(info, |task| {
                    task.set_fingerprint(digest.fingerprint.clone(), digest.size)
                })?;

                if let Some(outcome) = self
                    .acquire_fingerprint(&task_id, &digest.fingerprint, claim)
                    .await
                {
                    return Ok(outcome);
                }

                if let Some(outcome) = self.resolve_dedup(info, &task_id, &digest.fingerprint).await? {
                    return Ok(outcome);
                }
            }
            RunMode::Retry => {
                let (expected, status) = {
                    let task = info.task.lock();
                    (task.fingerprint.clone(), task.status)
                };
                let expected =
                    expected.ok_or(RunError::State(TransitionError::MissingFingerprint))?;

                if let UploadSource::File(path) = &source {
                    // 文件在失败后可能被修改
                    let digest = source
                        .digest()
                        .await
                        .map_err(|e| RunError::Source(format!("{:#}", e)))?;
                    if digest.fingerprint != expected {
                        return Err(RunError::Source(format!(
                            "文件内容已变化，请重新提交: {:?}",
                            path
                        )));
                    }
                }

                // 上次在去重检查阶段失败，服务端可能已经有这份内容
                if status == UploadTaskStatus::Calculating {
                    if let Some(outcome) = self.resolve_dedup(info, &task_id, &expected).await? {
                        return Ok(outcome);
                    }
                }
            }
        }

        self.upload_chunks(info, &source).await?;

        self.update_task(info, |task| task.mark_merging())?;
        self.merge(info, &task_id).await
    }

    /// 获取指纹所有权；相同内容已有任务在上传时等待其结果
    ///
    /// 返回 Some 表示内容已由其他任务上传，本任务跳过
    async fn acquire_fingerprint(
        &self,
        task_id: &str,
        fingerprint: &Fingerprint,
        claim: &mut Option<ClaimGuard>,
    ) -> Option<UploadOutcome> {
        loop {
            match self.try_claim(fingerprint, task_id) {
                ClaimAttempt::Owner(guard) => {
                    *claim = Some(guard);
                    return None;
                }
                ClaimAttempt::Attached {
                    owner_id,
                    outcome_rx,
                } => {
                    info!(
                        "相同内容正在由任务 {} 上传，等待其结果: task={}",
                        owner_id, task_id
                    );
                    match wait_for_owner(outcome_rx).await {
                        Some(outcome) if outcome.is_success() => {
                            let result_id = outcome.result_id().unwrap_or_default().to_string();
                            return Some(UploadOutcome::Skipped {
                                result_id,
                                reason: format!("与进行中的任务 {} 内容相同", owner_id),
                            });
                        }
                        _ => info!(
                            "任务 {} 未成功结束，重新获取指纹所有权: task={}",
                            owner_id, task_id
                        ),
                    }
                }
            }
        }
    }

    fn try_claim(&self, fingerprint: &Fingerprint, task_id: &str) -> ClaimAttempt {
        match self.inflight.entry(fingerprint.clone()) {
            Entry::Occupied(entry) => ClaimAttempt::Attached {
                owner_id: entry.get().task_id.clone(),
                outcome_rx: entry.get().outcome_rx.clone(),
            },
            Entry::Vacant(entry) => {
                let (outcome_tx, outcome_rx) = watch::channel(None);
                entry.insert(InflightClaim {
                    task_id: task_id.to_string(),
                    outcome_rx,
                });
                ClaimAttempt::Owner(ClaimGuard {
                    inflight: self.inflight.clone(),
                    fingerprint: fingerprint.clone(),
                    task_id: task_id.to_string(),
                    outcome_tx: Some(outcome_tx),
                })
            }
        }
    }

    /// 去重检查：命中返回 Skipped，未命中规划分片并进入 Uploading
    async fn resolve_dedup(
        &self,
        info: &UploadTaskInfo,
        task_id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<UploadOutcome>, RunError> {
        if let Some(outcome) = self.check_exists(task_id, fingerprint).await? {
            return Ok(Some(outcome));
        }

        let chunk_manager = {
            let task = info.task.lock();
            UploadChunkManager::with_acked(task.total_size, task.chunk_size, &task.uploaded_chunks)
        };
        let total_chunks = chunk_manager.chunk_count();
        *info.chunk_manager.lock() = Some(chunk_manager);
        self.update_task(info, |task| task.mark_uploading(total_chunks))?;
        Ok(None)
    }

    /// 服务端去重检查，命中时返回 Skipped
    async fn check_exists(
        &self,
        task_id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<UploadOutcome>, RunError> {
        let transport = self.transport.clone();
        let label = format!("[去重检查] task={}", task_id);
        let response = self
            .queue
            .submit_with_retry(task_id, &label, self.retry_policy(), || {
                let transport = transport.clone();
                let fingerprint = fingerprint.clone();
                async move {
                    transport
                        .check_exists(&fingerprint)
                        .await
                        .map_err(RunError::from)
                }
            })
            .await??;

        if !response.exists {
            debug!("服务端不存在相同内容: task={}", task_id);
            return Ok(None);
        }

        let result_id = response.result_id.ok_or_else(|| {
            RunError::Transport(TransportError::new(
                TransportErrorKind::MalformedResponse,
                "去重命中但缺少 resultId",
            ))
        })?;
        info!(
            "服务端已存在相同内容，跳过上传: task={}, result_id={}",
            task_id, result_id
        );
        Ok(Some(UploadOutcome::Skipped {
            result_id,
            reason: "服务端已存在相同内容".to_string(),
        }))
    }

    /// 上传所有未确认的分片
    async fn upload_chunks(
        &self,
        info: &Arc<UploadTaskInfo>,
        source: &UploadSource,
    ) -> Result<(), RunError> {
        let task_id = info.task_id();
        let pending = {
            let mut guard = info.chunk_manager.lock();
            let manager = guard.get_or_insert_with(|| {
                let task = info.task.lock();
                UploadChunkManager::with_acked(task.total_size, task.chunk_size, &task.uploaded_chunks)
            });
            manager.take_pending()
        };

        if pending.is_empty() {
            debug!("没有待上传的分片: task={}", task_id);
            return Ok(());
        }
        info!("开始上传分片: task={}, 待上传 {} 个", task_id, pending.len());

        let mut uploads: FuturesUnordered<_> = pending
            .into_iter()
            .map(|chunk| self.upload_chunk(&task_id, source, chunk))
            .collect();

        let mut failure = None;
        while let Some(result) = uploads.next().await {
            match result {
                Ok(done) => self.record_ack(info, done)?,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(uploads);

        match failure {
            Some(e) => {
                // 一个分片最终失败，其余排队的分片不再发送
                self.queue.cancel_group(&task_id);
                if let Some(manager) = info.chunk_manager.lock().as_mut() {
                    manager.reset_in_flight();
                }
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// 上传单个分片
    ///
    /// 数据在队列槽位内读取，排队中的分片不占内存
    async fn upload_chunk(
        &self,
        task_id: &str,
        source: &UploadSource,
        chunk: UploadChunk,
    ) -> Result<ChunkDone, RunError> {
        let index = chunk.index;
        let label = format!("[分片#{}] task={}", index, task_id);
        let transport = self.transport.clone();

        let md5 = self
            .queue
            .submit_with_retry(task_id, &label, self.retry_policy(), || {
                let transport = transport.clone();
                let source = source.clone();
                let range = chunk.range.clone();
                let task_id = task_id.to_string();
                async move {
                    let data = source
                        .read_range(range)
                        .await
                        .map_err(|e| RunError::Source(format!("{:#}", e)))?;
                    let md5 = format!("{:x}", md5::compute(&data));
                    let ack = transport.upload_chunk(&task_id, index, data, &md5).await?;
                    ack.verify(index, &md5)?;
                    Ok::<_, RunError>(md5)
                }
            })
            .await??;

        debug!("{} 上传成功: {} bytes, md5={}", label, chunk.size(), md5);
        Ok(ChunkDone {
            index,
            bytes: chunk.size(),
        })
    }

    fn record_ack(&self, info: &UploadTaskInfo, done: ChunkDone) -> Result<(), RunError> {
        if let Some(manager) = info.chunk_manager.lock().as_mut() {
            manager.mark_acked(done.index);
        }

        self.update_task(info, |task| {
            if task.record_chunk_ack(done.index, done.bytes)? {
                if let Some(speed) = info.speed.lock().sample(task.uploaded_size) {
                    task.speed = speed;
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    async fn merge(&self, info: &UploadTaskInfo, task_id: &str) -> Result<UploadOutcome, RunError> {
        let request = {
            let task = info.task.lock();
            MergeRequest {
                fingerprint: task
                    .fingerprint
                    .clone()
                    .ok_or(TransitionError::MissingFingerprint)?,
                total_size: task.total_size,
                total_chunks: task.total_chunks,
                metadata: info.metadata.clone(),
            }
        };

        info!(
            "开始合并: task={}, 分片数={}, 大小={} bytes",
            task_id, request.total_chunks, request.total_size
        );

        let transport = self.transport.clone();
        let label = format!("[合并] task={}", task_id);
        let response = self
            .queue
            .submit_with_retry(task_id, &label, self.retry_policy(), || {
                let transport = transport.clone();
                let request = request.clone();
                let task_id = task_id.to_string();
                async move {
                    transport
                        .merge(&task_id, &request)
                        .await
                        .map_err(RunError::from)
                }
            })
            .await??;

        Ok(UploadOutcome::Completed {
            result_id: response.result_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_error_outcome_mapping() {
        let outcome =
            RunError::Transport(TransportError::from_status(503, "busy")).into_outcome();
        assert!(matches!(
            outcome,
            UploadOutcome::Failed {
                retryable: true,
                ..
            }
        ));

        let outcome =
            RunError::Transport(TransportError::from_status(413, "too big")).into_outcome();
        assert!(matches!(
            outcome,
            UploadOutcome::Failed {
                retryable: false,
                ..
            }
        ));

        assert_eq!(RunError::Cancelled.into_outcome(), UploadOutcome::Cancelled);
        assert!(!RunError::Source("gone".to_string()).is_retryable());
    }

    #[test]
    fn test_speed_tracker_window() {
        let mut tracker = SpeedTracker::new(0);
        assert_eq!(tracker.sample(1024), None);

        tracker.last_time = Instant::now() - Duration::from_secs(1);
        let speed = tracker.sample(1024).unwrap();
        assert!(speed > 0 && speed <= 1024);
    }

    #[test]
    fn test_outcome_of_terminal_task() {
        let mut task = UploadTask::new(None, "a.jpg".to_string(), 10, 10);
        task.status = UploadTaskStatus::Skipped;
        task.result_id = Some("m-1".to_string());
        task.skip_reason = Some("dup".to_string());
        assert_eq!(
            outcome_of(&task),
            UploadOutcome::Skipped {
                result_id: "m-1".to_string(),
                reason: "dup".to_string()
            }
        );

        task.status = UploadTaskStatus::Cancelled;
        assert_eq!(outcome_of(&task), UploadOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_claim_guard_drop_notifies_waiters() {
        let inflight = Arc::new(DashMap::new());
        let fingerprint = Fingerprint::from_hex("ab".repeat(32)).unwrap();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        inflight.insert(
            fingerprint.clone(),
            InflightClaim {
                task_id: "owner".to_string(),
                outcome_rx: outcome_rx.clone(),
            },
        );

        let guard = ClaimGuard {
            inflight: inflight.clone(),
            fingerprint: fingerprint.clone(),
            task_id: "owner".to_string(),
            outcome_tx: Some(outcome_tx),
        };

        let waiter = tokio::spawn(wait_for_owner(outcome_rx));
        drop(guard);

        assert_eq!(waiter.await.unwrap(), None);
        assert!(!inflight.contains_key(&fingerprint));
    }

    #[tokio::test]
    async fn test_claim_release_delivers_outcome() {
        let inflight = Arc::new(DashMap::new());
        let fingerprint = Fingerprint::from_hex("cd".repeat(32)).unwrap();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        inflight.insert(
            fingerprint.clone(),
            InflightClaim {
                task_id: "owner".to_string(),
                outcome_rx: outcome_rx.clone(),
            },
        );
        let guard = ClaimGuard {
            inflight: inflight.clone(),
            fingerprint: fingerprint.clone(),
            task_id: "owner".to_string(),
            outcome_tx: Some(outcome_tx),
        };

        let waiter = tokio::spawn(wait_for_owner(outcome_rx));
        let outcome = UploadOutcome::Completed {
            result_id: "m-9".to_string(),
        };
        guard.release(&outcome);

        assert_eq!(waiter.await.unwrap(), Some(outcome));
        assert!(inflight.is_empty());
    }
}
