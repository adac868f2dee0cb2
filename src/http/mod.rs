// HTTP 执行层
//
// 传输引擎只依赖 `HttpExecutor` 这一个契约：
// - 请求/响应使用自有类型，便于测试替身直接断言
// - 认证由可注入的 `Authenticator` 负责
// - 取消令牌随请求传递，取消时立即中止当前网络调用

pub mod reqwest_executor;

#[cfg(test)]
pub mod mock;

pub use reqwest_executor::ReqwestExecutor;

use crate::error::{Result, TransferError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// 错误响应正文最多保留的字符数
const MAX_ERROR_BODY_CHARS: usize = 512;

/// HTTP 请求
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// 追加查询参数
    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    /// 追加请求头
    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    /// 设置请求体
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// 查询参数值
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// 请求头值（不区分大小写）
    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP 响应
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// 响应头（键统一为小写）
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// 以 JSON 作为响应体
    pub fn with_json(self, value: &serde_json::Value) -> Self {
        let body = value.to_string();
        self.with_header("content-type", "application/json")
            .with_body(body)
    }

    /// 响应头值（不区分大小写）
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 解析 JSON 响应体
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            TransferError::Malformed(format!("status={}, {}", self.status, e))
        })
    }

    /// 将非成功响应转换为错误
    ///
    /// 优先解析服务端 JSON 错误结构（message + reason），否则使用截断后的正文
    pub fn into_error(self) -> TransferError {
        #[derive(Deserialize)]
        struct ErrorItem {
            reason: Option<String>,
        }

        #[derive(Deserialize)]
        struct ErrorBody {
            message: Option<String>,
            #[serde(default)]
            errors: Vec<ErrorItem>,
        }

        #[derive(Deserialize)]
        struct ErrorEnvelope {
            error: ErrorBody,
        }

        if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(&self.body) {
            let reason = envelope.error.errors.into_iter().find_map(|e| e.reason);
            return TransferError::Http {
                status: self.status,
                message: envelope
                    .error
                    .message
                    .unwrap_or_else(|| format!("HTTP {}", self.status)),
                reason,
            };
        }

        let text = String::from_utf8_lossy(&self.body);
        let message = if text.trim().is_empty() {
            format!("HTTP {}", self.status)
        } else {
            text.chars().take(MAX_ERROR_BODY_CHARS).collect()
        };
        TransferError::http(self.status, message)
    }
}

/// 请求认证
pub trait Authenticator: Send + Sync {
    /// 为请求附加认证信息
    fn authorize(&self, request: &mut HttpRequest) -> Result<()>;
}

/// 不附加任何认证信息（公开桶或测试环境）
#[derive(Debug, Clone, Default)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn authorize(&self, _request: &mut HttpRequest) -> Result<()> {
        Ok(())
    }
}

/// 固定 Bearer Token 认证
#[derive(Clone)]
pub struct BearerTokenAuthenticator {
    token: String,
}

impl BearerTokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for BearerTokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerTokenAuthenticator")
            .field("token", &"***")
            .finish()
    }
}

impl Authenticator for BearerTokenAuthenticator {
    fn authorize(&self, request: &mut HttpRequest) -> Result<()> {
        if self.token.is_empty() {
            return Err(TransferError::InvalidArgument(
                "访问令牌为空".to_string(),
            ));
        }
        request
            .headers
            .push(("Authorization".to_string(), format!("Bearer {}", self.token)));
        Ok(())
    }
}

/// HTTP 请求执行器
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    /// 执行请求；任何收到的响应（包括非 2xx）都以 Ok 返回
    async fn execute(&self, request: HttpRequest, cancel: &CancellationToken)
        -> Result<HttpResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builder() {
        let req = HttpRequest::new(Method::POST, "https://example.com/o")
            .query("uploadType", "resumable")
            .header("X-Upload-Content-Type", "text/plain")
            .body("{}");
        assert_eq!(req.query_value("uploadType"), Some("resumable"));
        assert_eq!(req.header_value("x-upload-content-type"), Some("text/plain"));
        assert_eq!(req.body.as_ref(), b"{}");
    }

    #[test]
    fn test_response_header_case_insensitive() {
        let resp = HttpResponse::new(308).with_header("Range", "bytes=0-99");
        assert_eq!(resp.header("range"), Some("bytes=0-99"));
        assert_eq!(resp.header("RANGE"), Some("bytes=0-99"));
        assert!(!resp.is_success());
    }

    #[test]
    fn test_json_parse_failure_is_malformed() {
        let resp = HttpResponse::new(200).with_body("not json");
        let result: Result<serde_json::Value> = resp.json();
        assert!(matches!(result, Err(TransferError::Malformed(_))));
    }

    #[test]
    fn test_into_error_extracts_reason() {
        let resp = HttpResponse::new(403).with_json(&json!({
            "error": {
                "code": 403,
                "message": "Rate limit exceeded",
                "errors": [{"reason": "userRateLimitExceeded"}]
            }
        }));
        match resp.into_error() {
            TransferError::Http {
                status,
                message,
                reason,
            } => {
                assert_eq!(status, 403);
                assert_eq!(message, "Rate limit exceeded");
                assert_eq!(reason.as_deref(), Some("userRateLimitExceeded"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_into_error_plain_body() {
        let err = HttpResponse::new(503).into_error();
        assert_eq!(err.status(), Some(503));
        assert!(err.to_string().contains("HTTP 503"));

        let err = HttpResponse::new(500).with_body("backend error").into_error();
        assert!(err.to_string().contains("backend error"));
    }

    #[test]
    fn test_bearer_authenticator() {
        let auth = BearerTokenAuthenticator::new("token-123");
        let mut req = HttpRequest::new(Method::GET, "https://example.com");
        auth.authorize(&mut req).unwrap();
        assert_eq!(req.header_value("authorization"), Some("Bearer token-123"));
        assert!(!format!("{:?}", auth).contains("token-123"));

        let empty = BearerTokenAuthenticator::new("");
        assert!(empty.authorize(&mut req).is_err());
    }
}
