// 重试状态与退避计算

use crate::config::RetryConfig;
use crate::error::{Result, TransferError};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// 基础退避时间（毫秒）
pub const BASE_BACKOFF_MS: u64 = 1000;

/// 随机抖动上限（毫秒，不含）
pub const MAX_JITTER_MS: u64 = 1000;

/// 计算退避延迟
///
/// `delay = multiplier^attempt * 1000ms + jitter`，并限制在 `max_delay` 以内
///
/// # 参数
/// * `multiplier` - 退避倍数
/// * `attempt` - 已重试次数（从 0 开始）
/// * `max_delay` - 单次延迟上限
/// * `jitter_ms` - 抖动毫秒数（应小于 MAX_JITTER_MS）
pub fn backoff_delay(multiplier: f64, attempt: u32, max_delay: Duration, jitter_ms: u64) -> Duration {
    let base = multiplier.powi(attempt as i32) * BASE_BACKOFF_MS as f64;
    let max_ms = max_delay.as_millis() as f64;
    let delay_ms = (base + jitter_ms as f64).min(max_ms);
    Duration::from_millis(delay_ms as u64)
}

/// 单次逻辑操作的重试状态
///
/// 同一逻辑传输的多个分片共享一个状态，只有新的逻辑操作才会 reset
#[derive(Debug, Clone)]
pub struct RetryState {
    attempt: u32,
    first_attempt: Instant,
    delay_multiplier: f64,
    max_delay: Duration,
    total_timeout: Duration,
    max_attempts: u32,
    last_status: Option<u16>,
    last_message: String,
}

impl RetryState {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            attempt: 0,
            first_attempt: Instant::now(),
            delay_multiplier: config.retry_delay_multiplier,
            max_delay: config.max_retry_delay(),
            total_timeout: config.total_timeout(),
            max_attempts: config.max_retries,
            last_status: None,
            last_message: String::new(),
        }
    }

    /// 已重试次数
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// 从第一次尝试起已经过的时间
    pub fn elapsed(&self) -> Duration {
        self.first_attempt.elapsed()
    }

    /// 开始新的逻辑操作
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.first_attempt = Instant::now();
        self.last_status = None;
        self.last_message.clear();
    }

    /// 记录一次失败
    ///
    /// # 返回
    /// 下次重试前应等待的时间；次数或时间预算耗尽时返回 `RetryLimitExceeded`
    pub fn record_failure(&mut self, err: &TransferError) -> Result<Duration> {
        self.last_status = err.status();
        self.last_message = match err {
            TransferError::Http { message, .. } => message.clone(),
            other => other.to_string(),
        };

        let elapsed = self.elapsed();
        if self.attempt >= self.max_attempts || elapsed >= self.total_timeout {
            return Err(self.exhausted());
        }

        let jitter = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
        let delay = backoff_delay(self.delay_multiplier, self.attempt, self.max_delay, jitter);
        let remaining = self.total_timeout.saturating_sub(elapsed);

        self.attempt += 1;
        Ok(delay.min(remaining))
    }

    fn exhausted(&self) -> TransferError {
        TransferError::RetryLimitExceeded {
            attempts: self.attempt,
            status: self.last_status,
            last_message: self.last_message.clone(),
        }
    }
}
