// 后端协议数据类型与错误分类

use crate::queue::Retryable;
use crate::uploader::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 去重检查请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupCheckRequest {
    pub fingerprint: Fingerprint,
}

/// 去重检查响应
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupCheckResponse {
    /// 内容是否已存在
    pub exists: bool,
    /// 已存在内容的媒体ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
}

impl DedupCheckResponse {
    pub fn miss() -> Self {
        Self::default()
    }

    pub fn hit(result_id: impl Into<String>) -> Self {
        Self {
            exists: true,
            result_id: Some(result_id.into()),
        }
    }
}

/// 分片确认
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    /// 服务端确认的分片索引
    pub acked_index: usize,
    /// 服务端计算的分片 MD5（可选回显）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

impl ChunkAck {
    /// 校验确认是否对应本次上传的分片
    pub fn verify(&self, index: usize, md5: &str) -> Result<(), TransportError> {
        if self.acked_index != index {
            return Err(TransportError::new(
                TransportErrorKind::MalformedResponse,
                format!("分片确认索引不匹配: 期望 {}, 实际 {}", index, self.acked_index),
            ));
        }
        if let Some(echo) = &self.md5 {
            if !echo.eq_ignore_ascii_case(md5) {
                return Err(TransportError::new(
                    TransportErrorKind::MalformedResponse,
                    format!("分片 MD5 不匹配: 本地 {}, 服务端 {}", md5, echo),
                ));
            }
        }
        Ok(())
    }
}

/// 媒体元数据（由上层表单收集，原样传给合并接口）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl MediaMetadata {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Default::default()
        }
    }
}

/// 合并请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub fingerprint: Fingerprint,
    pub total_size: u64,
    pub total_chunks: usize,
    pub metadata: MediaMetadata,
}

/// 合并响应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub result_id: String,
}

/// 传输错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// 超时（可重试）
    Timeout,
    /// 网络错误（可重试）
    Network,
    /// 服务器错误 5xx（可重试）
    ServerError,
    /// 限流 429（可重试）
    RateLimited,
    /// 请求体过大 413
    PayloadTooLarge,
    /// 未认证 401
    Unauthorized,
    /// 权限不足 403
    Forbidden,
    /// 资源不存在 404
    NotFound,
    /// 状态冲突 409（合并时分片不完整）
    Conflict,
    /// 其他 4xx
    BadRequest,
    /// 响应无法解析或校验失败
    MalformedResponse,
}

impl TransportErrorKind {
    /// 是否可重试
    ///
    /// 任务状态机和队列都以此为准决定是否重新入队
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::Timeout
                | TransportErrorKind::Network
                | TransportErrorKind::ServerError
                | TransportErrorKind::RateLimited
        )
    }

    /// 从 HTTP 状态码转换（成功状态返回 None）
    pub fn from_status(status: u16) -> Option<Self> {
        let kind = match status {
            200..=399 => return None,
            429 => TransportErrorKind::RateLimited,
            413 => TransportErrorKind::PayloadTooLarge,
            401 => TransportErrorKind::Unauthorized,
            403 => TransportErrorKind::Forbidden,
            404 => TransportErrorKind::NotFound,
            408 => TransportErrorKind::Timeout,
            409 => TransportErrorKind::Conflict,
            500..=599 => TransportErrorKind::ServerError,
            _ => TransportErrorKind::BadRequest,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Network => "network",
            TransportErrorKind::ServerError => "server_error",
            TransportErrorKind::RateLimited => "rate_limited",
            TransportErrorKind::PayloadTooLarge => "payload_too_large",
            TransportErrorKind::Unauthorized => "unauthorized",
            TransportErrorKind::Forbidden => "forbidden",
            TransportErrorKind::NotFound => "not_found",
            TransportErrorKind::Conflict => "conflict",
            TransportErrorKind::BadRequest => "bad_request",
            TransportErrorKind::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次传输调用的失败
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 从失败的 HTTP 状态构造
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = TransportErrorKind::from_status(status).unwrap_or(TransportErrorKind::BadRequest);
        let snippet: String = body.chars().take(200).collect();
        Self::new(kind, format!("HTTP {}: {}", status, snippet))
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if e.is_decode() {
            TransportErrorKind::MalformedResponse
        } else if let Some(status) = e.status() {
            TransportErrorKind::from_status(status.as_u16()).unwrap_or(TransportErrorKind::Network)
        } else {
            TransportErrorKind::Network
        };
        Self::new(kind, e.to_string())
    }
}
