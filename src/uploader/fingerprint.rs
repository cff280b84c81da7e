// 内容指纹计算
//
// 去重检查和预览缓存共用同一个指纹：
// 1. 对内容全部字节计算 SHA-256，输出小写十六进制
// 2. 文件按固定大小缓冲区流式读取，内存占用与文件大小无关
// 3. 读取源文件失败不可重试（本地文件不会"暂时"读失败）

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// SHA-256 十六进制长度
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// 指纹格式错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FingerprintError {
    #[error("指纹长度应为 {FINGERPRINT_HEX_LEN}，实际为 {0}")]
    Length(usize),
    #[error("指纹包含非十六进制字符")]
    NotHex,
}

/// 内容指纹（SHA-256 小写十六进制）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// 从十六进制字符串构造（统一转为小写）
    ///
    /// 只接受 64 位十六进制，外部传入的指纹会进入日志和 URL 路径
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, FingerprintError> {
        let hex = hex.into();
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FingerprintError::NotHex);
        }
        if hex.len() != FINGERPRINT_HEX_LEN {
            return Err(FingerprintError::Length(hex.len()));
        }
        Ok(Self(hex.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 日志里使用的短格式（前 12 位）
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(value)
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 文件摘要：指纹 + 实际读取的字节数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub fingerprint: Fingerprint,
    pub size: u64,
}

/// 批量计算结果
#[derive(Debug, Clone)]
pub struct FingerprintResult {
    /// 文件路径
    pub path: PathBuf,
    /// 摘要（计算成功时）
    pub digest: Option<ContentDigest>,
    /// 错误信息（计算失败时）
    pub error: Option<String>,
}

/// 指纹计算器
pub struct Fingerprinter;

impl Fingerprinter {
    /// 读缓冲区大小
    const BUFFER_SIZE: usize = 64 * 1024;

    /// BufReader 容量
    const READER_CAPACITY: usize = 1024 * 1024;

    /// 计算内存数据的指纹
    pub fn from_bytes(data: &[u8]) -> Fingerprint {
        Fingerprint(hex::encode(Sha256::digest(data)))
    }

    /// 从任意 Reader 流式计算指纹
    pub fn from_reader<R: Read>(mut reader: R) -> std::io::Result<ContentDigest> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; Self::BUFFER_SIZE];
        let mut size = 0u64;

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
            size += bytes_read as u64;
        }

        Ok(ContentDigest {
            fingerprint: Fingerprint(hex::encode(hasher.finalize())),
            size,
        })
    }

    /// 计算文件指纹
    ///
    /// 文件 I/O 在阻塞线程池中执行，不占用异步工作线程
    pub async fn from_path(path: &Path) -> Result<ContentDigest> {
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || Self::from_path_sync(&path))
            .await
            .context("计算指纹任务执行失败")?
    }

    fn from_path_sync(path: &Path) -> Result<ContentDigest> {
        let file = std::fs::File::open(path).with_context(|| format!("无法打开文件: {:?}", path))?;
        let reader = std::io::BufReader::with_capacity(Self::READER_CAPACITY, file);
        let digest =
            Self::from_reader(reader).with_context(|| format!("读取文件失败: {:?}", path))?;

        debug!(
            "文件指纹计算完成: path={:?}, size={}, fingerprint={}",
            path,
            digest.size,
            digest.fingerprint.short()
        );

        Ok(digest)
    }

    /// 批量顺序计算文件指纹
    ///
    /// 顺序处理：并发读取会让磁盘在多个文件间来回寻道
    pub async fn batch_from_paths(paths: Vec<PathBuf>) -> Vec<FingerprintResult> {
        let total = paths.len();
        info!("开始批量计算指纹: {} 个文件", total);

        let mut results = Vec::with_capacity(total);

        for (index, path) in paths.into_iter().enumerate() {
            debug!("计算文件指纹 {}/{}: {:?}", index + 1, total, path);

            match Self::from_path(&path).await {
                Ok(digest) => results.push(FingerprintResult {
                    path,
                    digest: Some(digest),
                    error: None,
                }),
                Err(e) => {
                    warn!("计算文件指纹失败: {:?}, 错误: {:#}", path, e);
                    results.push(FingerprintResult {
                        path,
                        digest: None,
                        error: Some(format!("{:#}", e)),
                    });
                }
            }
        }

        info!(
            "批量指纹计算完成: {}/{} 成功",
            results.iter().filter(|r| r.digest.is_some()).count(),
            total
        );

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            Fingerprinter::from_bytes(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            Fingerprinter::from_bytes(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        // 跨越多个缓冲区
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let streamed = Fingerprinter::from_reader(&content[..]).unwrap();
        assert_eq!(streamed.size, content.len() as u64);
        assert_eq!(streamed.fingerprint, Fingerprinter::from_bytes(&content));
    }

    #[test]
    fn test_from_hex_normalizes_case() {
        let fp = Fingerprint::from_hex("ABCDEF0123".repeat(6) + "ABCD").unwrap();
        assert_eq!(fp.as_str(), "abcdef0123".repeat(6) + "abcd");
        assert_eq!(fp.short(), "abcdef0123ab");
    }

    #[test]
    fn test_from_hex_rejects_malformed_input() {
        // 多字节字符不能进入日志切片和 URL 路径
        assert_eq!(
            Fingerprint::from_hex("aaaaaaaaaaaé"),
            Err(FingerprintError::NotHex)
        );
        assert_eq!(
            Fingerprint::from_hex("../../etc/passwd"),
            Err(FingerprintError::NotHex)
        );
        assert_eq!(Fingerprint::from_hex("abc123"), Err(FingerprintError::Length(6)));
        assert!("zz".repeat(32).parse::<Fingerprint>().is_err());
        assert!("ab".repeat(32).parse::<Fingerprint>().is_ok());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Fingerprint = serde_json::from_str(&format!("\"{}\"", "AB".repeat(32))).unwrap();
        assert_eq!(ok.as_str(), "ab".repeat(32));
        assert_eq!(serde_json::to_string(&ok).unwrap(), format!("\"{}\"", "ab".repeat(32)));

        assert!(serde_json::from_str::<Fingerprint>("\"not-a-fingerprint\"").is_err());
    }

    #[tokio::test]
    async fn test_same_content_same_fingerprint() {
        let content = b"identical media payload";

        let mut file1 = NamedTempFile::new().unwrap();
        file1.write_all(content).unwrap();
        file1.flush().unwrap();

        let mut file2 = NamedTempFile::new().unwrap();
        file2.write_all(content).unwrap();
        file2.flush().unwrap();

        let d1 = Fingerprinter::from_path(file1.path()).await.unwrap();
        let d2 = Fingerprinter::from_path(file2.path()).await.unwrap();

        assert_eq!(d1, d2);
        assert_eq!(d1.fingerprint, Fingerprinter::from_bytes(content));
    }

    #[tokio::test]
    async fn test_nonexistent_file() {
        let result = Fingerprinter::from_path(Path::new("/nonexistent/media.mp4")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_batch_reports_each_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"frame data").unwrap();
        file.flush().unwrap();

        let paths = vec![
            file.path().to_path_buf(),
            PathBuf::from("/nonexistent/clip.mov"),
        ];
        let results = Fingerprinter::batch_from_paths(paths).await;

        assert_eq!(results.len(), 2);
        assert!(results[0].digest.is_some());
        assert!(results[0].error.is_none());
        assert!(results[1].digest.is_none());
        assert!(results[1].error.is_some());
    }
}
