// 测试用 HTTP 执行器：记录请求，按处理函数返回响应

use super::{HttpExecutor, HttpRequest, HttpResponse};
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

type Handler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync>;

pub struct MockExecutor {
    handler: Handler,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockExecutor {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 已收到的全部请求
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// 满足条件的请求数
    pub fn count<P>(&self, pred: P) -> usize
    where
        P: Fn(&HttpRequest) -> bool,
    {
        self.requests.lock().iter().filter(|r| pred(r)).count()
    }
}

#[async_trait]
impl HttpExecutor for MockExecutor {
    async fn execute(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let result = (self.handler)(&request);
        self.requests.lock().push(request);
        result
    }
}
