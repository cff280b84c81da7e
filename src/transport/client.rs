// HTTP 传输实现
//
// 协议：
// - POST /dedup-check        {fingerprint}          -> {exists, resultId?}
// - PUT  /chunk/{id}/{index} 二进制分片 + X-Chunk-Md5 -> {ackedIndex, md5?}
// - POST /merge/{id}         {fingerprint, ...}     -> {resultId}
// - GET  /preview/{fingerprint}                     -> 二进制数据

use crate::config::TransportConfig;
use crate::transport::types::*;
use crate::transport::Transport;
use crate::uploader::fingerprint::Fingerprint;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 分片 MD5 请求头
pub const CHUNK_MD5_HEADER: &str = "X-Chunk-Md5";

/// 基于 reqwest 的后端客户端
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    /// 创建客户端
    ///
    /// 每次请求都带 `request_timeout_secs` 的超时，超时按可重试处理
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        info!(
            "初始化传输客户端: base_url={}, timeout={}s, 认证={}",
            config.base_url,
            config.request_timeout_secs,
            if config.auth_token.is_some() {
                "已设置"
            } else {
                "未设置"
            }
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// 发送请求并把非 2xx 状态转换为分类错误
    async fn send(&self, builder: RequestBuilder, op: &str) -> Result<Response, TransportError> {
        let response = self.authorize(builder).send().await.map_err(|e| {
            let err = TransportError::from(e);
            warn!("{} 请求发送失败: {}", op, err);
            err
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = TransportError::from_status(status.as_u16(), &body);
        warn!(
            "{} 请求失败: status={}, retryable={}",
            op,
            status,
            err.is_retryable()
        );
        Err(err)
    }

    async fn read_json<T: DeserializeOwned>(response: Response, op: &str) -> Result<T, TransportError> {
        let body = response.bytes().await.map_err(TransportError::from)?;
        serde_json::from_slice(&body).map_err(|e| {
            TransportError::new(
                TransportErrorKind::MalformedResponse,
                format!(
                    "解析{}响应失败: {}, body={}",
                    op,
                    e,
                    String::from_utf8_lossy(&body[..body.len().min(200)])
                ),
            )
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn check_exists(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<DedupCheckResponse, TransportError> {
        debug!("去重检查: fingerprint={}", fingerprint.short());

        let request = DedupCheckRequest {
            fingerprint: fingerprint.clone(),
        };
        let builder = self.client.post(self.url("/dedup-check")).json(&request);
        let response = self.send(builder, "去重检查").await?;
        let result: DedupCheckResponse = Self::read_json(response, "去重检查").await?;

        if result.exists && result.result_id.is_none() {
            return Err(TransportError::new(
                TransportErrorKind::MalformedResponse,
                "去重检查命中但缺少 resultId",
            ));
        }
        Ok(result)
    }

    async fn upload_chunk(
        &self,
        task_id: &str,
        index: usize,
        data: Bytes,
        md5: &str,
    ) -> Result<ChunkAck, TransportError> {
        debug!(
            "[分片#{}] 上传: task={}, size={}, md5={}",
            index,
            task_id,
            data.len(),
            md5
        );

        let builder = self
            .client
            .put(self.url(&format!("/chunk/{}/{}", task_id, index)))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(CHUNK_MD5_HEADER, md5)
            .body(data);
        let response = self.send(builder, "上传分片").await?;
        Self::read_json(response, "上传分片").await
    }

    async fn merge(
        &self,
        task_id: &str,
        request: &MergeRequest,
    ) -> Result<MergeResponse, TransportError> {
        info!(
            "合并分片: task={}, total_chunks={}, total_size={}",
            task_id, request.total_chunks, request.total_size
        );

        let builder = self
            .client
            .post(self.url(&format!("/merge/{}", task_id)))
            .json(request);
        let response = self.send(builder, "合并分片").await?;
        Self::read_json(response, "合并分片").await
    }

    async fn fetch_preview(&self, fingerprint: &Fingerprint) -> Result<Bytes, TransportError> {
        debug!("获取预览: fingerprint={}", fingerprint.short());

        let builder = self
            .client
            .get(self.url(&format!("/preview/{}", fingerprint)));
        let response = self.send(builder, "获取预览").await?;
        response.bytes().await.map_err(TransportError::from)
    }
}
