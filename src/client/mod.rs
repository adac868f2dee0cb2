// 存储 API 客户端
//
// 只负责请求构造与响应解析，不做重试；重试与状态推进由上传/下载引擎负责

pub mod multipart;
pub mod types;

pub use multipart::XmlMultipartClient;
pub use types::{
    ChunkResponse, CompletedMultipart, EncryptionKey, ObjectMetadata, ObjectRef, Preconditions,
    UploadOptions,
};

use crate::config::StorageConfig;
use crate::error::{Result, TransferError};
use crate::http::{HttpExecutor, HttpRequest, HttpResponse};
use bytes::Bytes;
use reqwest::Method;
use std::ops::Range;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 可续传协议的"未完成"状态码
pub const RESUME_INCOMPLETE: u16 = 308;

/// 构造 Content-Range 请求头
///
/// # 参数
/// * `start` - 本次数据在对象中的起始偏移
/// * `len` - 本次数据长度
/// * `total` - 对象总长度（未知时为 None）
/// * `is_final` - 是否为最后一片
pub fn content_range(start: u64, len: u64, total: Option<u64>, is_final: bool) -> String {
    let total = match total {
        Some(total) => total.to_string(),
        None if is_final => (start + len).to_string(),
        None => "*".to_string(),
    };

    if len == 0 {
        if is_final {
            format!("bytes */{}", total)
        } else {
            "bytes */*".to_string()
        }
    } else {
        format!("bytes {}-{}/{}", start, start + len - 1, total)
    }
}

/// 解析 308 响应的 Range 头
///
/// `bytes=0-122` 表示服务端已持久化 123 字节；没有 Range 头表示一个字节都没有
pub fn parse_range_header(value: Option<&str>) -> Result<u64> {
    let value = match value {
        Some(v) => v.trim(),
        None => return Ok(0),
    };

    let end = value
        .strip_prefix("bytes=")
        .and_then(|r| r.split_once('-'))
        .map(|(_, end)| end)
        .ok_or_else(|| TransferError::Malformed(format!("无法解析 Range 头: {}", value)))?;

    end.parse::<u64>()
        .ok()
        .and_then(|end| end.checked_add(1))
        .ok_or_else(|| TransferError::Malformed(format!("无法解析 Range 头: {}", value)))
}

/// 解析分片上传 / 偏移探测响应
pub fn interpret_chunk_response(response: HttpResponse) -> Result<ChunkResponse> {
    match response.status {
        RESUME_INCOMPLETE => Ok(ChunkResponse::Incomplete {
            offset: parse_range_header(response.header("range"))?,
        }),
        200 | 201 => Ok(ChunkResponse::Complete(response.json()?)),
        _ => Err(response.into_error()),
    }
}

/// 存储 API 客户端
#[derive(Clone)]
pub struct StorageClient {
    executor: Arc<dyn HttpExecutor>,
    endpoint: String,
    user_project: Option<String>,
}

impl StorageClient {
    pub fn new(executor: Arc<dyn HttpExecutor>, config: &StorageConfig) -> Self {
        Self {
            executor,
            endpoint: config.api_endpoint.trim_end_matches('/').to_string(),
            user_project: config.user_project.clone(),
        }
    }

    pub fn executor(&self) -> Arc<dyn HttpExecutor> {
        self.executor.clone()
    }

    fn object_url(&self, object: &ObjectRef) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            urlencoding::encode(&object.bucket),
            urlencoding::encode(&object.name)
        )
    }

    fn upload_url(&self, bucket: &str) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o",
            self.endpoint,
            urlencoding::encode(bucket)
        )
    }

    fn with_user_project(&self, mut request: HttpRequest) -> HttpRequest {
        if let Some(project) = &self.user_project {
            request = request.query("userProject", project.clone());
        }
        request
    }

    fn with_encryption(request: HttpRequest, key: Option<&EncryptionKey>) -> HttpRequest {
        match key {
            Some(key) => key
                .headers()
                .into_iter()
                .fold(request, |req, (name, value)| req.header(name, value)),
            None => request,
        }
    }

    fn with_write_options(&self, mut request: HttpRequest, options: &UploadOptions) -> HttpRequest {
        request = request.query("name", options.object.name.clone());
        for (key, value) in options.preconditions.query_pairs() {
            request = request.query(key, value);
        }
        if let Some(kms) = &options.kms_key_name {
            request = request.query("kmsKeyName", kms.clone());
        }
        if let Some(acl) = &options.predefined_acl {
            request = request.query("predefinedAcl", acl.clone());
        }
        let request = self.with_user_project(request);
        Self::with_encryption(request, options.encryption.as_ref())
    }

    /// 会话初始化请求体：对象元数据
    fn session_metadata(options: &UploadOptions) -> serde_json::Value {
        let mut body = match &options.metadata {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        body.insert(
            "name".to_string(),
            serde_json::Value::String(options.object.name.clone()),
        );
        if let Some(content_type) = &options.content_type {
            body.insert(
                "contentType".to_string(),
                serde_json::Value::String(content_type.clone()),
            );
        }
        serde_json::Value::Object(body)
    }

    /// 创建可续传上传会话
    ///
    /// # 返回
    /// 服务端分配的会话 URI（来自 Location 响应头）
    pub async fn create_resumable_session(
        &self,
        options: &UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let body = Self::session_metadata(options).to_string();
        let mut request = HttpRequest::new(Method::POST, self.upload_url(&options.object.bucket))
            .query("uploadType", "resumable")
            .header("Content-Type", "application/json; charset=UTF-8")
            .body(body);
        request = self.with_write_options(request, options);
        if let Some(content_type) = &options.content_type {
            request = request.header("X-Upload-Content-Type", content_type.clone());
        }
        if let Some(len) = options.content_length {
            request = request.header("X-Upload-Content-Length", len.to_string());
        }

        let response = self.executor.execute(request, cancel).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }

        let uri = response
            .header("location")
            .map(str::to_string)
            .ok_or_else(|| TransferError::Malformed("会话创建响应缺少 Location 头".to_string()))?;

        debug!("创建可续传会话成功: {} -> {}", options.object, uri);
        Ok(uri)
    }

    /// 上传一个分片
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_chunk(
        &self,
        uri: &str,
        range_start: u64,
        data: Bytes,
        is_final: bool,
        total: Option<u64>,
        encryption: Option<&EncryptionKey>,
        cancel: &CancellationToken,
    ) -> Result<ChunkResponse> {
        let range = content_range(range_start, data.len() as u64, total, is_final);
        let request = HttpRequest::new(Method::PUT, uri)
            .header("Content-Range", range)
            .header("Content-Length", data.len().to_string())
            .body(data);
        let request = Self::with_encryption(request, encryption);

        let response = self.executor.execute(request, cancel).await?;
        interpret_chunk_response(response)
    }

    /// 探测会话已持久化的偏移
    pub async fn query_offset(&self, uri: &str, cancel: &CancellationToken) -> Result<ChunkResponse> {
        let request = HttpRequest::new(Method::PUT, uri)
            .header("Content-Range", content_range(0, 0, None, false))
            .header("Content-Length", "0");

        let response = self.executor.execute(request, cancel).await?;
        interpret_chunk_response(response)
    }

    /// 取消服务端的可续传会话
    pub async fn cancel_resumable_session(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = HttpRequest::new(Method::DELETE, uri).header("Content-Length", "0");
        let response = self.executor.execute(request, cancel).await?;
        // 499 表示会话已被客户端取消；404/410 表示会话已不存在
        match response.status {
            499 | 404 | 410 => Ok(()),
            _ if response.is_success() => Ok(()),
            _ => Err(response.into_error()),
        }
    }

    /// 单次请求上传（小文件）
    pub async fn upload_simple(
        &self,
        options: &UploadOptions,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<ObjectMetadata> {
        let content_type = options
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let request = HttpRequest::new(Method::POST, self.upload_url(&options.object.bucket))
            .query("uploadType", "media")
            .header("Content-Type", content_type)
            .header("Content-Length", data.len().to_string())
            .body(data);
        let request = self.with_write_options(request, options);

        let response = self.executor.execute(request, cancel).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        response.json()
    }

    /// 获取对象元数据
    pub async fn get_object_metadata(
        &self,
        object: &ObjectRef,
        encryption: Option<&EncryptionKey>,
        cancel: &CancellationToken,
    ) -> Result<ObjectMetadata> {
        let request = self.with_user_project(HttpRequest::new(Method::GET, self.object_url(object)));
        let request = Self::with_encryption(request, encryption);

        let response = self.executor.execute(request, cancel).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        response.json()
    }

    /// 下载对象的一个字节区间
    pub async fn download_range(
        &self,
        object: &ObjectRef,
        range: Range<u64>,
        encryption: Option<&EncryptionKey>,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }

        let request = HttpRequest::new(Method::GET, self.object_url(object))
            .query("alt", "media")
            .header("Range", format!("bytes={}-{}", range.start, range.end - 1));
        let request = Self::with_encryption(self.with_user_project(request), encryption);

        let response = self.executor.execute(request, cancel).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }

        let expected = range.end - range.start;
        let body = response.body;
        if response.status == 200 && body.len() as u64 > expected {
            // 服务端忽略 Range 返回了整个对象
            let start = range.start as usize;
            let end = range.end as usize;
            if end > body.len() {
                return Err(TransferError::Malformed(format!(
                    "响应长度 {} 小于请求区间末尾 {}",
                    body.len(),
                    end
                )));
            }
            return Ok(body.slice(start..end));
        }

        if body.len() as u64 != expected {
            return Err(TransferError::Malformed(format!(
                "区间 {}-{} 期望 {} 字节，实际收到 {} 字节",
                range.start,
                range.end,
                expected,
                body.len()
            )));
        }
        Ok(body)
    }
}
