// 重试判定策略
//
// 判定分三种结果：
// - Retry：瞬时错误，按退避策略重试
// - Restart：已知会话返回 404/410，会话已过期，需要重建会话（不是重试）
// - Fail：不可恢复，直接返回给调用方

use crate::config::{IdempotencyStrategy, RetryConfig};
use crate::error::TransferError;
use reqwest::Method;
use std::fmt::Debug;
use std::sync::Arc;

use super::state::RetryState;

/// 服务端声明的限流原因
const RATE_LIMIT_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded"];

/// 一次请求的结果（仅失败结果参与判定）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 网络层错误，未收到响应
    Transport { message: String },
    /// 收到非成功状态码
    Status { status: u16, reason: Option<String> },
    /// 响应无法解析
    Malformed { message: String },
    /// 请求被取消
    Cancelled,
}

impl Outcome {
    /// 从传输错误中提取判定所需的结果
    ///
    /// 返回 None 表示该错误不是网络请求结果（参数错误、内容不一致等），永不重试
    pub fn from_error(err: &TransferError) -> Option<Self> {
        match err {
            TransferError::Transport(message) => Some(Outcome::Transport {
                message: message.clone(),
            }),
            TransferError::Http { status, reason, .. } => Some(Outcome::Status {
                status: *status,
                reason: reason.clone(),
            }),
            TransferError::Malformed(message) => Some(Outcome::Malformed {
                message: message.clone(),
            }),
            TransferError::Cancelled => Some(Outcome::Cancelled),
            _ => None,
        }
    }
}

/// 请求上下文：判定幂等性所需的信息
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// HTTP 方法
    pub method: Method,
    /// 是否携带 ifGenerationMatch / ifMetagenerationMatch / ETag 等前置条件
    pub has_precondition: bool,
    /// 是否发往服务端分配的可续传会话 URI（分片上传、偏移探测）
    pub has_session_uri: bool,
}

impl RequestContext {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            has_precondition: false,
            has_session_uri: false,
        }
    }

    /// 携带前置条件
    pub fn with_precondition(mut self, has_precondition: bool) -> Self {
        self.has_precondition = has_precondition;
        self
    }

    /// 发往可续传会话 URI 的请求
    pub fn session(method: Method) -> Self {
        Self {
            method,
            has_precondition: false,
            has_session_uri: true,
        }
    }

    /// 请求是否幂等
    ///
    /// GET/HEAD 天然幂等；其他方法需要前置条件或会话 URI 才能确认重放是安全的
    pub fn is_idempotent(&self) -> bool {
        self.method == Method::GET
            || self.method == Method::HEAD
            || self.has_precondition
            || self.has_session_uri
    }
}

/// 可注入的重试判定策略
pub trait RetryStrategy: Send + Sync + Debug {
    /// 该结果是否应当重试
    fn should_retry(&self, outcome: &Outcome, ctx: &RequestContext) -> bool;
}

/// 默认重试判定策略
#[derive(Debug, Clone, Default)]
pub struct DefaultRetryStrategy {
    pub idempotency: IdempotencyStrategy,
}

impl DefaultRetryStrategy {
    pub fn new(idempotency: IdempotencyStrategy) -> Self {
        Self { idempotency }
    }
}

impl RetryStrategy for DefaultRetryStrategy {
    fn should_retry(&self, outcome: &Outcome, ctx: &RequestContext) -> bool {
        let idempotent = match self.idempotency {
            IdempotencyStrategy::RetryNever => return false,
            IdempotencyStrategy::RetryAlways => true,
            IdempotencyStrategy::RetryConditional => ctx.is_idempotent(),
        };

        match outcome {
            Outcome::Cancelled => false,
            // 限流时请求未被处理，无论是否幂等都可以重放
            Outcome::Status { status: 429, .. } => true,
            Outcome::Status {
                reason: Some(reason),
                ..
            } if RATE_LIMIT_REASONS.contains(&reason.as_str()) => true,
            Outcome::Status { status, .. } => {
                (*status == 408 || (500..=599).contains(status)) && idempotent
            }
            Outcome::Transport { .. } | Outcome::Malformed { .. } => idempotent,
        }
    }
}

/// 失败后的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 退避后重试
    Retry,
    /// 会话已过期，重建会话
    Restart,
    /// 直接失败
    Fail,
}

/// 重试策略：配置 + 判定策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    strategy: Arc<dyn RetryStrategy>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        let strategy = Arc::new(DefaultRetryStrategy::new(config.idempotency));
        Self { config, strategy }
    }

    /// 替换判定策略
    pub fn with_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 为一次新的逻辑操作创建重试状态
    pub fn new_state(&self) -> RetryState {
        RetryState::new(&self.config)
    }

    /// 判定失败后的处理方式
    pub fn decide(&self, err: &TransferError, ctx: &RequestContext) -> RetryDecision {
        if ctx.has_session_uri && matches!(err.status(), Some(404) | Some(410)) {
            return RetryDecision::Restart;
        }

        if !self.config.auto_retry {
            return RetryDecision::Fail;
        }

        match Outcome::from_error(err) {
            Some(outcome) if self.strategy.should_retry(&outcome, ctx) => RetryDecision::Retry,
            _ => RetryDecision::Fail,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
