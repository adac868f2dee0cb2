// 重试模块
//
// 负责：
// - 失败结果分类（重试 / 重建会话 / 失败）
// - 指数退避 + 随机抖动
// - 次数上限与总时间预算

pub mod policy;
pub mod state;

pub use policy::{
    DefaultRetryStrategy, Outcome, RequestContext, RetryDecision, RetryPolicy, RetryStrategy,
};
pub use state::{backoff_delay, RetryState};

use crate::error::{Result, TransferError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 可取消的等待
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// 按重试策略执行一个操作
///
/// 只处理 `RetryDecision::Retry`；`Restart` 和 `Fail` 原样返回错误，由调用方处理
///
/// # 参数
/// * `policy` - 重试策略
/// * `ctx` - 请求上下文（幂等性判定）
/// * `cancel` - 取消令牌
/// * `op_name` - 操作名称（用于日志）
/// * `op` - 每次尝试都会重新调用的操作
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    ctx: &RequestContext,
    cancel: &CancellationToken,
    op_name: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut state = policy.new_state();
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if policy.decide(&err, ctx) != RetryDecision::Retry {
            return Err(err);
        }

        let delay = state.record_failure(&err)?;
        warn!(
            "{} 失败，{}ms 后重试 (第 {} 次): {}",
            op_name,
            delay.as_millis(),
            state.attempt(),
            err
        );
        sleep_or_cancel(delay, cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use reqwest::Method;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_run_with_retry_recovers() {
        let policy = RetryPolicy::default();
        let ctx = RequestContext::new(Method::GET);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let value = run_with_retry(&policy, &ctx, &cancel, "test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransferError::http(503, "busy"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_retry_gives_up() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            ..RetryConfig::default()
        });
        let ctx = RequestContext::new(Method::GET);
        let cancel = CancellationToken::new();

        let result: Result<()> = run_with_retry(&policy, &ctx, &cancel, "test", || async {
            Err(TransferError::http(500, "internal"))
        })
        .await;

        match result {
            Err(TransferError::RetryLimitExceeded {
                attempts,
                last_message,
                ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_message, "internal");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_retry_does_not_retry_fatal() {
        let policy = RetryPolicy::default();
        let ctx = RequestContext::new(Method::GET);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<()> = run_with_retry(&policy, &ctx, &cancel, "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TransferError::http(403, "forbidden")) }
        })
        .await;

        assert!(matches!(result, Err(TransferError::Http { status: 403, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy::default();
        let ctx = RequestContext::new(Method::GET);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let result: Result<()> = run_with_retry(&policy, &ctx, &cancel, "test", || {
            trigger.cancel();
            async { Err(TransferError::http(503, "busy")) }
        })
        .await;

        assert!(matches!(result, Err(TransferError::Cancelled)));
    }
}
