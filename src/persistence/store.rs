use crate::transport::MediaMetadata;
use crate::uploader::task::UploadTask;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 任务快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task: UploadTask,
    #[serde(default)]
    pub metadata: MediaMetadata,
    /// 修订号，每次状态变化递增
    #[serde(default)]
    pub revision: u64,
    /// 保存时间 (Unix timestamp)
    #[serde(default)]
    pub saved_at: i64,
}

impl TaskSnapshot {
    pub fn new(task: UploadTask, metadata: MediaMetadata, revision: u64) -> Self {
        Self {
            task,
            metadata,
            revision,
            saved_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// 任务快照存储
#[derive(Debug)]
pub struct TaskStore {
    dir: PathBuf,
    /// 已写入的最新修订号
    written: Mutex<HashMap<String, u64>>,
}

impl TaskStore {
    /// 创建存储，目录不存在时自动创建
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("创建持久化目录失败: {:?}", dir))?;

        info!("任务持久化目录: {:?}", dir);

        Ok(Self {
            dir,
            written: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    /// 保存快照
    ///
    /// # 返回
    /// - `Ok(true)` - 已写入
    /// - `Ok(false)` - 已有更新的修订，跳过
    pub fn save(&self, snapshot: &TaskSnapshot) -> Result<bool> {
        let task_id = &snapshot.task.id;
        let mut written = self.written.lock();

        if let Some(&last) = written.get(task_id) {
            if snapshot.revision < last {
                debug!(
                    "跳过过期快照: task={}, revision={} < {}",
                    task_id, snapshot.revision, last
                );
                return Ok(false);
            }
        }

        let path = self.snapshot_path(task_id);
        let temp_path = path.with_extension("json.tmp");

        let file = File::create(&temp_path)
            .with_context(|| format!("创建快照临时文件失败: {:?}", temp_path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, snapshot).context("序列化任务快照失败")?;
        writer.flush().context("写入任务快照失败")?;
        drop(writer);

        fs::rename(&temp_path, &path)
            .with_context(|| format!("重命名快照文件失败: {:?}", path))?;

        written.insert(task_id.clone(), snapshot.revision);
        debug!(
            "已保存任务快照: task={}, status={}, revision={}",
            task_id, snapshot.task.status, snapshot.revision
        );

        Ok(true)
    }

    /// 加载单个快照
    pub fn load(&self, task_id: &str) -> Option<TaskSnapshot> {
        let path = self.snapshot_path(task_id);
        if !path.exists() {
            return None;
        }
        match Self::load_from_path(&path) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("加载任务快照失败 {:?}: {:#}", path, e);
                None
            }
        }
    }

    fn load_from_path(path: &Path) -> Result<TaskSnapshot> {
        let file = File::open(path)?;
        let snapshot: TaskSnapshot =
            serde_json::from_reader(BufReader::new(file)).context("解析任务快照失败")?;
        Ok(snapshot)
    }

    /// 加载目录下所有快照（损坏的文件会被跳过）
    pub fn load_all(&self) -> Vec<TaskSnapshot> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("读取持久化目录失败: {:?}, {}", self.dir, e);
                return Vec::new();
            }
        };

        let mut snapshots = Vec::new();
        let mut written = self.written.lock();

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match Self::load_from_path(&path) {
                Ok(snapshot) => {
                    written
                        .entry(snapshot.task.id.clone())
                        .and_modify(|rev| *rev = (*rev).max(snapshot.revision))
                        .or_insert(snapshot.revision);
                    snapshots.push(snapshot);
                }
                Err(e) => warn!("跳过损坏的任务快照 {:?}: {:#}", path, e),
            }
        }

        info!("已加载 {} 个任务快照", snapshots.len());
        snapshots
    }

    /// 删除快照
    pub fn delete(&self, task_id: &str) -> Result<()> {
        let mut written = self.written.lock();
        let path = self.snapshot_path(task_id);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("删除任务快照失败: {:?}", path))?;
            debug!("已删除任务快照: task={}", task_id);
        }
        // 保留修订号，防止删除后迟到的写入把快照写回来
        written.insert(task_id.to_string(), u64::MAX);
        Ok(())
    }
}
