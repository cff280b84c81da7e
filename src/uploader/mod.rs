// 上传模块
//
// - 内容指纹（SHA-256）与数据源
// - 分片规划与分片状态跟踪
// - 任务状态机
// - 上传管理器（去重、分片上传、合并、取消、重试、恢复）

pub mod chunk;
pub mod fingerprint;
pub mod manager;
pub mod source;
pub mod task;

pub use chunk::{ChunkPlanner, UploadChunk, UploadChunkManager, DEFAULT_CHUNK_SIZE};
pub use fingerprint::{ContentDigest, Fingerprint, FingerprintError, FingerprintResult, Fingerprinter};
pub use manager::{ManagerError, UploadHandle, UploadManager, INTERRUPTED_ERROR};
pub use source::UploadSource;
pub use task::{TransitionError, UploadTask, UploadTaskStatus};
