// Media Ingest Library
// 媒体上传编排核心库：内容去重、分片续传、有界请求队列、预览缓存

// 结果缓存模块
pub mod cache;

// 配置管理模块
pub mod config;

// 事件模块
pub mod events;

// 日志系统
pub mod logging;

// 编排入口
pub mod orchestrator;

// 任务持久化模块
pub mod persistence;

// 预览获取模块
pub mod preview;

// 并发队列模块
pub mod queue;

// 传输层模块
pub mod transport;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use cache::{CacheKey, PreviewBlob, Releasable, ResultCache};
pub use config::AppConfig;
pub use events::{UploadEvent, UploadOutcome};
pub use orchestrator::Orchestrator;
pub use preview::{FetchError, PreviewFetcher};
pub use queue::{ConcurrencyQueue, QueueError, QueueTicket, RetryPolicy};
pub use transport::{HttpTransport, MediaMetadata, Transport, TransportError, TransportErrorKind};
pub use uploader::{
    Fingerprint, FingerprintError, Fingerprinter, ManagerError, UploadHandle, UploadManager, UploadSource,
    UploadTask, UploadTaskStatus,
};
