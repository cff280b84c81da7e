// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 并发队列配置
    #[serde(default)]
    pub queue: QueueConfig,
    /// 结果缓存配置
    #[serde(default)]
    pub cache: CacheConfig,
    /// 后端连接配置
    #[serde(default)]
    pub transport: TransportConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片大小 (KB)，默认 2048 即 2MB
    #[serde(default = "default_chunk_size_kb")]
    pub chunk_size_kb: u64,
    /// 可重试错误的最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试前等待时间（毫秒）
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 任务快照目录，None 表示不持久化
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,
}

fn default_chunk_size_kb() -> u64 {
    2048
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size_kb: default_chunk_size_kb(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            persist_dir: None,
        }
    }
}

impl UploadConfig {
    /// 分片大小（字节）
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_kb * 1024
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// 队列并发限制
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLimits {
    /// 最大并发数
    pub max_concurrent: usize,
    /// 工作项完成后的调度间隔（毫秒）
    pub inter_dispatch_ms: u64,
}

impl QueueLimits {
    pub fn inter_dispatch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_dispatch_ms)
    }
}

/// 并发队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 最大并发数（所有任务共享）
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 工作项完成后的调度间隔（毫秒）
    #[serde(default = "default_inter_dispatch_ms")]
    pub inter_dispatch_ms: u64,
    /// 预览获取使用独立队列（不设置则与上传共用）
    #[serde(default)]
    pub preview: Option<QueueLimits>,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_inter_dispatch_ms() -> u64 {
    100
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            inter_dispatch_ms: default_inter_dispatch_ms(),
            preview: None,
        }
    }
}

impl QueueConfig {
    /// 主队列限制
    pub fn limits(&self) -> QueueLimits {
        QueueLimits {
            max_concurrent: self.max_concurrent,
            inter_dispatch_ms: self.inter_dispatch_ms,
        }
    }
}

/// 结果缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 最大缓存条目数
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// 预览数据落盘目录，None 表示保存在内存
    #[serde(default)]
    pub spill_dir: Option<PathBuf>,
}

fn default_cache_max_entries() -> usize {
    50
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            spill_dir: None,
        }
    }
}

/// 后端连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// 后端地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bearer 令牌
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080/api/media".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            auth_token: None,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
        }
        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.upload.chunk_size_kb == 0 {
            anyhow::bail!("upload.chunk_size_kb 必须大于 0");
        }
        if self.queue.max_concurrent == 0 {
            anyhow::bail!("queue.max_concurrent 必须大于 0");
        }
        if let Some(preview) = &self.queue.preview {
            if preview.max_concurrent == 0 {
                anyhow::bail!("queue.preview.max_concurrent 必须大于 0");
            }
        }
        if self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries 必须大于 0");
        }
        if self.transport.request_timeout_secs == 0 {
            anyhow::bail!("transport.request_timeout_secs 必须大于 0");
        }
        reqwest::Url::parse(&self.transport.base_url)
            .with_context(|| format!("transport.base_url 无效: {}", self.transport.base_url))?;
        Ok(())
    }
}
