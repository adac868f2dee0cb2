// XML API 分段上传客户端

use super::types::{CompletedMultipart, EncryptionKey, ObjectRef};
use crate::error::{Result, TransferError};
use crate::http::{HttpExecutor, HttpRequest, HttpResponse};
use crate::uploader::multipart::MultipartClient;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct InitiateMultipartUploadResult {
    #[serde(rename = "UploadId")]
    upload_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CompleteMultipartUploadResult {
    #[serde(rename = "Bucket")]
    bucket: Option<String>,
    #[serde(rename = "Key")]
    key: Option<String>,
    #[serde(rename = "ETag")]
    etag: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload {
    #[serde(rename = "Part", default)]
    parts: Vec<CompletedPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CompletedPart {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

/// 解析 XML 响应体（实体在此解码）
fn parse_xml<'de, T: Deserialize<'de>>(body: &'de [u8]) -> Result<T> {
    let text = std::str::from_utf8(body)
        .map_err(|e| TransferError::Malformed(format!("响应不是 UTF-8: {}", e)))?;
    quick_xml::de::from_str(text)
        .map_err(|e| TransferError::Malformed(format!("XML 解析失败: {}", e)))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// 构造 CompleteMultipartUpload 请求体（分段按编号升序）
pub fn complete_body(parts: &[(u32, String)]) -> Result<String> {
    let mut parts: Vec<CompletedPart> = parts
        .iter()
        .map(|(number, etag)| CompletedPart {
            part_number: *number,
            etag: etag.clone(),
        })
        .collect();
    parts.sort_by_key(|part| part.part_number);

    quick_xml::se::to_string(&CompleteMultipartUpload { parts })
        .map_err(|e| TransferError::Malformed(format!("构造完成请求失败: {}", e)))
}

/// XML API 分段上传客户端
#[derive(Clone)]
pub struct XmlMultipartClient {
    executor: Arc<dyn HttpExecutor>,
    endpoint: String,
    object: ObjectRef,
    content_type: Option<String>,
    encryption: Option<EncryptionKey>,
}

impl XmlMultipartClient {
    pub fn new(executor: Arc<dyn HttpExecutor>, endpoint: &str, object: ObjectRef) -> Self {
        Self {
            executor,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            object,
            content_type: None,
            encryption: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_encryption(mut self, key: EncryptionKey) -> Self {
        self.encryption = Some(key);
        self
    }

    fn object_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            urlencoding::encode(&self.object.bucket),
            urlencoding::encode(&self.object.name)
        )
    }

    fn request(&self, method: Method) -> HttpRequest {
        let request = HttpRequest::new(method, self.object_url());
        match &self.encryption {
            Some(key) => key
                .headers()
                .into_iter()
                .fold(request, |req, (name, value)| req.header(name, value)),
            None => request,
        }
    }

    async fn send(&self, request: HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse> {
        let response = self.executor.execute(request, cancel).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        Ok(response)
    }
}

#[async_trait]
impl MultipartClient for XmlMultipartClient {
    async fn initiate_upload(&self, cancel: &CancellationToken) -> Result<String> {
        let mut request = self.request(Method::POST).query("uploads", "");
        if let Some(content_type) = &self.content_type {
            request = request.header("Content-Type", content_type.clone());
        }

        let response = self.send(request, cancel).await?;
        let result: InitiateMultipartUploadResult = parse_xml(&response.body)?;
        let upload_id = non_empty(result.upload_id)
            .ok_or_else(|| TransferError::Malformed("初始化响应缺少 UploadId".to_string()))?;

        debug!("分段上传已初始化: {} upload_id={}", self.object, upload_id);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let request = self
            .request(Method::PUT)
            .query("partNumber", part_number.to_string())
            .query("uploadId", upload_id)
            .header("Content-Length", data.len().to_string())
            .body(data);

        let response = self.send(request, cancel).await?;
        response
            .header("etag")
            .map(str::to_string)
            .ok_or_else(|| {
                TransferError::Malformed(format!("分段 {} 响应缺少 ETag", part_number))
            })
    }

    async fn complete_upload(
        &self,
        upload_id: &str,
        parts: &[(u32, String)],
        cancel: &CancellationToken,
    ) -> Result<CompletedMultipart> {
        let request = self
            .request(Method::POST)
            .query("uploadId", upload_id)
            .header("Content-Type", "application/xml")
            .body(complete_body(parts)?);

        let response = self.send(request, cancel).await?;
        // 部分实现完成时不返回响应体
        let result: CompleteMultipartUploadResult = if response.body.is_empty() {
            CompleteMultipartUploadResult::default()
        } else {
            parse_xml(&response.body)?
        };
        Ok(CompletedMultipart {
            bucket: non_empty(result.bucket),
            key: non_empty(result.key),
            etag: non_empty(result.etag),
        })
    }

    async fn abort_upload(&self, upload_id: &str, cancel: &CancellationToken) -> Result<()> {
        let request = self.request(Method::DELETE).query("uploadId", upload_id);
        self.send(request, cancel).await?;
        debug!("分段上传已放弃: {} upload_id={}", self.object, upload_id);
        Ok(())
    }
}
