// 结果缓存
//
// 按指纹缓存预览数据等资源句柄：
// - 条目数超过上限时按插入顺序淘汰最旧的条目（不是 LRU）
// - 被淘汰或清空的条目在 put/clear 返回前同步释放底层资源
// - 每个条目只会从表中移除一次，因此只会被释放一次

mod blob;

pub use blob::PreviewBlob;

use crate::uploader::fingerprint::Fingerprint;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// 可释放的资源句柄
///
/// 可以是内存缓冲、临时文件或平台相关的句柄
pub trait Releasable: Send + Sync + 'static {
    /// 释放底层资源（可能被调用多次，实现方需保证幂等）
    fn release(&self);
}

/// 缓存键：指纹 + 作用域
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fingerprint: Fingerprint,
    pub scope: String,
}

impl CacheKey {
    pub fn new(fingerprint: Fingerprint, scope: impl Into<String>) -> Self {
        Self {
            fingerprint,
            scope: scope.into(),
        }
    }

    /// 预览数据的缓存键
    pub fn preview(fingerprint: Fingerprint) -> Self {
        Self::new(fingerprint, "preview")
    }
}

struct CacheEntry<H> {
    handle: Arc<H>,
    inserted_at: Instant,
}

struct CacheState<H> {
    entries: HashMap<CacheKey, CacheEntry<H>>,
    /// 插入顺序（队首最旧）
    order: VecDeque<CacheKey>,
}

/// 有界结果缓存
pub struct ResultCache<H: Releasable> {
    max_entries: usize,
    state: Mutex<CacheState<H>>,
}

impl<H: Releasable> ResultCache<H> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// 查询缓存，未命中返回 None
    pub fn get(&self, key: &CacheKey) -> Option<Arc<H>> {
        let state = self.state.lock();
        state.entries.get(key).map(|entry| entry.handle.clone())
    }

    /// 写入缓存
    ///
    /// 同一个键重复写入会替换并释放旧条目，插入顺序按最新一次写入计算
    pub fn put(&self, key: CacheKey, handle: H) -> Arc<H> {
        let handle = Arc::new(handle);
        let mut released = Vec::new();

        {
            let mut state = self.state.lock();
            if let Some(old) = state.entries.remove(&key) {
                state.order.retain(|k| k != &key);
                released.push((key.clone(), old));
            }
            state.entries.insert(
                key.clone(),
                CacheEntry {
                    handle: handle.clone(),
                    inserted_at: Instant::now(),
                },
            );
            state.order.push_back(key);
            released.extend(Self::evict_overflow(&mut state, self.max_entries));
        }

        Self::release_all(released, "淘汰");
        handle
    }

    /// 已存在则返回已有条目并释放新句柄，否则写入
    ///
    /// 用于多个请求并发获取同一资源的场景，保证只有一份被缓存
    pub fn get_or_insert(&self, key: CacheKey, handle: H) -> Arc<H> {
        let mut released = Vec::new();

        let result = {
            let mut state = self.state.lock();
            let existing = state.entries.get(&key).map(|entry| entry.handle.clone());
            if let Some(existing) = existing {
                drop(state);
                debug!("缓存已存在，丢弃重复结果: {}", key.fingerprint.short());
                handle.release();
                return existing;
            }

            let handle = Arc::new(handle);
            state.entries.insert(
                key.clone(),
                CacheEntry {
                    handle: handle.clone(),
                    inserted_at: Instant::now(),
                },
            );
            state.order.push_back(key);
            released.extend(Self::evict_overflow(&mut state, self.max_entries));
            handle
        };

        Self::release_all(released, "淘汰");
        result
    }

    /// 清空缓存并释放所有条目，返回释放数量
    pub fn clear(&self) -> usize {
        let released: Vec<_> = {
            let mut state = self.state.lock();
            state.order.clear();
            state.entries.drain().collect()
        };

        let count = released.len();
        Self::release_all(released, "清空");
        if count > 0 {
            info!("缓存已清空: 释放 {} 个条目", count);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    fn evict_overflow(
        state: &mut CacheState<H>,
        max_entries: usize,
    ) -> Vec<(CacheKey, CacheEntry<H>)> {
        let mut evicted = Vec::new();
        while state.entries.len() > max_entries {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            if let Some(entry) = state.entries.remove(&oldest) {
                evicted.push((oldest, entry));
            }
        }
        evicted
    }

    fn release_all(entries: Vec<(CacheKey, CacheEntry<H>)>, reason: &str) {
        for (key, entry) in entries {
            debug!(
                "缓存{}: fingerprint={}, scope={}, 存活 {:?}",
                reason,
                key.fingerprint.short(),
                key.scope,
                entry.inserted_at.elapsed()
            );
            entry.handle.release();
        }
    }
}

impl<H: Releasable> Drop for ResultCache<H> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.entries.is_empty() {
            debug!("缓存销毁: 释放 {} 个条目", state.entries.len());
        }
        state.order.clear();
        for (_, entry) in state.entries.drain() {
            entry.handle.release();
        }
    }
}
