// 基于 reqwest 的 HTTP 执行器

use super::{Authenticator, HttpExecutor, HttpRequest, HttpResponse};
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const USER_AGENT: &str = concat!("storage-transfer-rust/", env!("CARGO_PKG_VERSION"));

/// reqwest 执行器
#[derive(Clone)]
pub struct ReqwestExecutor {
    client: reqwest::Client,
    authenticator: Arc<dyn Authenticator>,
}

impl ReqwestExecutor {
    /// 创建执行器
    ///
    /// # 参数
    /// * `timeout` - 单个请求的传输超时（与重试总预算相互独立）
    /// * `authenticator` - 认证器
    pub fn new(timeout: Duration, authenticator: Arc<dyn Authenticator>) -> Result<Self> {
        // 可续传协议用 308 表示"未完成"，不能被当作重定向跟随
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TransferError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            authenticator,
        })
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.query);

        for (key, value) in &request.headers {
            // Content-Length 由请求体决定
            if key.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| TransferError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| TransferError::Transport(format!("读取响应失败: {}", e)))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(
        &self,
        mut request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        self.authenticator.authorize(&mut request)?;

        debug!(
            "HTTP {} {} (body {} 字节)",
            request.method,
            request.url,
            request.body.len()
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = self.send(request) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::NoAuth;
    use reqwest::Method;

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let executor = ReqwestExecutor::new(Duration::from_secs(5), Arc::new(NoAuth)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        // 非路由地址：只有取消分支能先完成
        let request = HttpRequest::new(Method::GET, "http://10.255.255.1:81/");
        let result = executor.execute(request, &cancel).await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
    }
}
