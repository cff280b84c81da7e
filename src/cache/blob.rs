// 预览数据句柄
//
// 两种存储方式：
// - 内存：释放时丢弃缓冲区
// - 文件：写入 spill 目录，释放时删除文件

use crate::cache::Releasable;
use crate::uploader::fingerprint::Fingerprint;
use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug)]
enum BlobStorage {
    Memory(RwLock<Option<Bytes>>),
    File(PathBuf),
}

/// 预览数据
#[derive(Debug)]
pub struct PreviewBlob {
    fingerprint: Fingerprint,
    size: u64,
    storage: BlobStorage,
    released: AtomicBool,
}

impl PreviewBlob {
    /// 内存存储
    pub fn in_memory(fingerprint: Fingerprint, data: Bytes) -> Self {
        Self {
            fingerprint,
            size: data.len() as u64,
            storage: BlobStorage::Memory(RwLock::new(Some(data))),
            released: AtomicBool::new(false),
        }
    }

    /// 写入 spill 目录，以文件形式存储
    ///
    /// 文件名带随机后缀，同一指纹的并发写入互不覆盖
    pub async fn spill_to_file(fingerprint: Fingerprint, data: Bytes, dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("创建缓存目录失败: {:?}", dir))?;

        let path = dir.join(format!("{}-{}.bin", fingerprint.short(), Uuid::new_v4().simple()));
        tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("写入缓存文件失败: {:?}", path))?;

        debug!("预览数据已写入文件: {:?}, size={}", path, data.len());

        Ok(Self {
            fingerprint,
            size: data.len() as u64,
            storage: BlobStorage::File(path),
            released: AtomicBool::new(false),
        })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// 文件存储时的路径
    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            BlobStorage::File(path) => Some(path),
            BlobStorage::Memory(_) => None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// 读取数据，已释放返回 None
    pub async fn bytes(&self) -> Option<Bytes> {
        if self.is_released() {
            return None;
        }
        match &self.storage {
            BlobStorage::Memory(data) => data.read().clone(),
            BlobStorage::File(path) => match tokio::fs::read(path).await {
                Ok(data) => Some(Bytes::from(data)),
                Err(e) => {
                    debug!("读取缓存文件失败: {:?}, {}", path, e);
                    None
                }
            },
        }
    }
}

impl Releasable for PreviewBlob {
    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.storage {
            BlobStorage::Memory(data) => {
                data.write().take();
            }
            BlobStorage::File(path) => {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("删除缓存文件失败: {:?}, {}", path, e);
                }
            }
        }
    }
}
