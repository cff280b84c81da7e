// 有界并发队列
//
// 调度规则：
// 1. 同时运行的工作项不超过 max_concurrent（所有任务共享）
// 2. 严格 FIFO 准入，无优先级
// 3. 每个工作项完成后（无论成败）等待 inter_dispatch_delay 再释放槽位
// 4. 取消分组只移除尚未开始的工作项，不影响其他分组

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// 队列错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// 工作项在执行前被移出队列，或执行中异常终止
    #[error("工作项已被取消")]
    Cancelled,
}

/// 失败是否值得重新入队
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// 重试策略：固定次数、固定间隔
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }
}

/// 队列中的工作项
struct QueueItem {
    id: u64,
    /// 分组（通常是任务ID），用于按任务取消
    group: String,
    job: BoxFuture<'static, ()>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueItem>,
    running: usize,
    next_id: u64,
}

struct QueueInner {
    name: String,
    max_concurrent: usize,
    inter_dispatch_delay: Duration,
    state: Mutex<QueueState>,
    peak_running: AtomicUsize,
}

/// 工作项的完成句柄
pub struct QueueTicket<T> {
    id: u64,
    rx: oneshot::Receiver<T>,
}

impl<T> QueueTicket<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 等待工作项执行完成
    pub async fn wait(self) -> Result<T, QueueError> {
        self.rx.await.map_err(|_| QueueError::Cancelled)
    }
}

/// 有界并发队列
///
/// 克隆后共享同一个队列实例
#[derive(Clone)]
pub struct ConcurrencyQueue {
    inner: Arc<QueueInner>,
}

impl ConcurrencyQueue {
    /// 创建队列
    ///
    /// # 参数
    /// * `name` - 队列名称（日志用）
    /// * `max_concurrent` - 最大并发数，0 会被当作 1
    /// * `inter_dispatch_delay` - 工作项完成后释放槽位前的等待时间
    pub fn new(name: impl Into<String>, max_concurrent: usize, inter_dispatch_delay: Duration) -> Self {
        let name = name.into();
        let max_concurrent = max_concurrent.max(1);

        info!(
            "创建并发队列: name={}, max_concurrent={}, inter_dispatch_delay={:?}",
            name, max_concurrent, inter_dispatch_delay
        );

        Self {
            inner: Arc::new(QueueInner {
                name,
                max_concurrent,
                inter_dispatch_delay,
                state: Mutex::new(QueueState::default()),
                peak_running: AtomicUsize::new(0),
            }),
        }
    }

    /// 提交工作项
    ///
    /// 立即返回，结果通过 `QueueTicket::wait` 获取
    pub fn submit<T, F>(&self, group: &str, fut: F) -> QueueTicket<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let output = fut.await;
            let _ = tx.send(output);
        }
        .boxed();

        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.pending.push_back(QueueItem {
                id,
                group: group.to_string(),
                job,
            });
            debug!(
                "队列[{}] 入队: item={}, group={}, pending={}",
                self.inner.name,
                id,
                group,
                state.pending.len()
            );
            id
        };

        self.pump();
        QueueTicket { id, rx }
    }

    /// 提交工作项，可重试的失败在等待后重新入队
    ///
    /// 等待期间不占用槽位，重新提交排在队尾，其他任务可以继续调度。
    ///
    /// # 返回
    /// - `Ok(Ok(T))` - 成功
    /// - `Ok(Err(E))` - 不可重试的失败，或重试次数用尽
    /// - `Err(QueueError)` - 工作项被移出队列
    pub async fn submit_with_retry<T, E, F, Fut>(
        &self,
        group: &str,
        label: &str,
        policy: RetryPolicy,
        mut make: F,
    ) -> Result<Result<T, E>, QueueError>
    where
        T: Send + 'static,
        E: Retryable + Display + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut attempt = 0u32;
        loop {
            match self.submit(group, make()).wait().await? {
                Ok(value) => return Ok(Ok(value)),
                Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                    attempt += 1;
                    warn!(
                        "{} 失败，{:?} 后重新入队 ({}/{}): {}",
                        label, policy.delay, attempt, policy.max_retries, e
                    );
                    tokio::time::sleep(policy.delay).await;
                }
                Err(e) => return Ok(Err(e)),
            }
        }
    }

    /// 移除分组中尚未开始的工作项，返回移除数量
    ///
    /// 正在执行的工作项不受影响
    pub fn cancel_group(&self, group: &str) -> usize {
        let removed: Vec<QueueItem> = {
            let mut state = self.inner.state.lock();
            let (removed, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|item| item.group == group);
            state.pending = kept;
            removed.into_iter().collect()
        };

        if !removed.is_empty() {
            info!(
                "队列[{}] 取消分组: group={}, 移除 {} 个待执行项",
                self.inner.name,
                group,
                removed.len()
            );
        }

        // 在锁外丢弃，关闭对应的完成通道
        let count = removed.len();
        drop(removed);
        count
    }

    /// 从队首开始调度，直到并发上限
    fn pump(&self) {
        loop {
            let item = {
                let mut state = self.inner.state.lock();
                if state.running >= self.inner.max_concurrent {
                    return;
                }
                let Some(item) = state.pending.pop_front() else {
                    return;
                };
                state.running += 1;
                self.inner
                    .peak_running
                    .fetch_max(state.running, Ordering::SeqCst);
                debug!(
                    "队列[{}] 调度: item={}, group={}, running={}/{}, pending={}",
                    self.inner.name,
                    item.id,
                    item.group,
                    state.running,
                    self.inner.max_concurrent,
                    state.pending.len()
                );
                item
            };

            let queue = self.clone();
            tokio::spawn(async move {
                if AssertUnwindSafe(item.job).catch_unwind().await.is_err() {
                    error!(
                        "队列[{}] 工作项异常终止: item={}, group={}",
                        queue.inner.name, item.id, item.group
                    );
                }

                if !queue.inner.inter_dispatch_delay.is_zero() {
                    tokio::time::sleep(queue.inner.inter_dispatch_delay).await;
                }

                queue.inner.state.lock().running -= 1;
                queue.pump();
            });
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// 当前占用的槽位数（含完成后的等待期）
    pub fn running(&self) -> usize {
        self.inner.state.lock().running
    }

    /// 等待中的工作项数量
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// 历史最大并发
    pub fn peak_running(&self) -> usize {
        self.inner.peak_running.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ConcurrencyQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyQueue")
            .field("name", &self.inner.name)
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("running", &self.running())
            .field("pending", &self.pending_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_submit_returns_result() {
        let queue = ConcurrencyQueue::new("test", 2, Duration::ZERO);
        let ticket = queue.submit("g", async { 21 * 2 });
        assert_eq!(ticket.wait().await, Ok(42));
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let queue = ConcurrencyQueue::new("test", 3, Duration::ZERO);
        let active = Arc::new(AtomicUsize::new(0));
        let observed_max = Arc::new(AtomicUsize::new(0));

        let tickets: Vec<_> = (0..12)
            .map(|i| {
                let active = active.clone();
                let observed_max = observed_max.clone();
                queue.submit(&format!("task-{}", i % 4), async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    observed_max.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        assert!(observed_max.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.peak_running(), 3);
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_fifo_admission() {
        let queue = ConcurrencyQueue::new("test", 1, Duration::ZERO);
        let order = Arc::new(Mutex::new(Vec::new()));

        let tickets: Vec<_> = (0..5)
            .map(|i| {
                let order = order.clone();
                queue.submit("g", async move {
                    order.lock().push(i);
                })
            })
            .collect();

        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_inter_dispatch_delay() {
        let queue = ConcurrencyQueue::new("test", 1, Duration::from_millis(50));
        let start = Instant::now();

        let first = queue.submit("g", async {});
        let second = queue.submit("g", async { Instant::now() });

        first.wait().await.unwrap();
        let second_started = second.wait().await.unwrap();

        assert!(second_started.duration_since(start) >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_cancel_group_only_removes_pending_of_that_group() {
        let queue = ConcurrencyQueue::new("test", 1, Duration::ZERO);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // 占住唯一的槽位
        let blocker = queue.submit("a", async move {
            let _ = release_rx.await;
            "blocker"
        });
        let a1 = queue.submit("a", async { "a1" });
        let b1 = queue.submit("b", async { "b1" });
        let a2 = queue.submit("a", async { "a2" });

        assert_eq!(queue.cancel_group("a"), 2);
        assert_eq!(queue.pending_len(), 1);

        let _ = release_tx.send(());

        assert_eq!(blocker.wait().await, Ok("blocker"));
        assert_eq!(a1.wait().await, Err(QueueError::Cancelled));
        assert_eq!(a2.wait().await, Err(QueueError::Cancelled));
        assert_eq!(b1.wait().await, Ok("b1"));
    }

    #[derive(Debug)]
    struct Flaky(bool);

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(retryable={})", self.0)
        }
    }

    #[tokio::test]
    async fn test_submit_with_retry_recovers() {
        let queue = ConcurrencyQueue::new("test", 1, Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(5));

        let result = queue
            .submit_with_retry("g", "测试", policy, || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(Flaky(true))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_submit_with_retry_gives_up() {
        let queue = ConcurrencyQueue::new("test", 1, Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(2, Duration::from_millis(1));

        let retryable = queue
            .submit_with_retry("g", "测试", policy, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Flaky(true))
                }
            })
            .await
            .unwrap();
        assert!(retryable.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        calls.store(0, Ordering::SeqCst);
        let terminal = queue
            .submit_with_retry("g", "测试", policy, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Flaky(false))
                }
            })
            .await
            .unwrap();
        assert!(terminal.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_job_releases_slot() {
        let queue = ConcurrencyQueue::new("test", 1, Duration::ZERO);

        let bad = queue.submit("g", async {
            panic!("boom");
        });
        let good = queue.submit("g", async { 7 });

        assert_eq!(bad.wait().await, Err::<(), _>(QueueError::Cancelled));
        assert_eq!(good.wait().await, Ok(7));
    }
}
