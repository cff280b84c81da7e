// 上传数据源
//
// 文件路径或内存中的内容引用，两者都支持按字节范围读取分片

use crate::uploader::fingerprint::{ContentDigest, Fingerprinter};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// 上传数据源
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// 本地文件
    File(PathBuf),
    /// 内存数据
    Memory(Bytes),
}

impl UploadSource {
    /// 本地文件路径（内存数据源返回 None）
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            UploadSource::File(path) => Some(path),
            UploadSource::Memory(_) => None,
        }
    }

    /// 计算内容指纹和大小
    pub async fn digest(&self) -> Result<ContentDigest> {
        match self {
            UploadSource::File(path) => Fingerprinter::from_path(path).await,
            UploadSource::Memory(data) => Ok(ContentDigest {
                fingerprint: Fingerprinter::from_bytes(data),
                size: data.len() as u64,
            }),
        }
    }

    /// 读取指定字节范围
    pub async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
        match self {
            UploadSource::Memory(data) => {
                let end = range.end as usize;
                if end > data.len() {
                    anyhow::bail!("读取范围越界: {:?}, 数据长度={}", range, data.len());
                }
                Ok(data.slice(range.start as usize..end))
            }
            UploadSource::File(path) => {
                let path = path.clone();
                let size = (range.end - range.start) as usize;

                tokio::task::spawn_blocking(move || -> Result<Bytes> {
                    let mut file = std::fs::File::open(&path)
                        .with_context(|| format!("无法打开文件: {:?}", path))?;
                    file.seek(SeekFrom::Start(range.start))
                        .context("文件定位失败")?;

                    let mut buffer = vec![0u8; size];
                    file.read_exact(&mut buffer)
                        .with_context(|| format!("读取分片数据失败: {:?}", range))?;

                    Ok(Bytes::from(buffer))
                })
                .await
                .context("读取分片任务执行失败")?
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_memory_range() {
        let source = UploadSource::Memory(Bytes::from_static(b"0123456789"));
        assert_eq!(&source.read_range(2..5).await.unwrap()[..], b"234");
        assert!(source.read_range(8..12).await.is_err());
        assert!(source.local_path().is_none());
    }

    #[tokio::test]
    async fn test_file_range_and_digest() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abcdefghij").unwrap();
        file.flush().unwrap();

        let source = UploadSource::File(file.path().to_path_buf());
        assert_eq!(&source.read_range(6..10).await.unwrap()[..], b"ghij");

        let digest = source.digest().await.unwrap();
        assert_eq!(digest.size, 10);
        assert_eq!(digest.fingerprint, Fingerprinter::from_bytes(b"abcdefghij"));
    }
}
