// 传输错误定义
//
// 错误分类：
// - 瞬时错误（网络、5xx、429、响应解析失败）：按退避策略重试
// - 会话过期（已知会话返回 404/410）：重建会话，不重试
// - 调用方错误（参数错误、续传内容不一致）：立即返回
// - 重试耗尽：携带重试次数与最后一次服务端消息
// - 批量部分失败：由协调器汇总为成功/失败列表，不在此处表达

use crate::checksum::ChecksumError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// 传输引擎统一错误类型
#[derive(Debug, Error)]
pub enum TransferError {
    /// 服务端返回非成功状态码
    #[error("请求失败: status={status}, {message}")]
    Http {
        status: u16,
        message: String,
        /// 服务端声明的错误原因（如 rateLimitExceeded）
        reason: Option<String>,
    },

    /// 网络层错误（未收到响应）
    #[error("网络错误: {0}")]
    Transport(String),

    /// 响应格式错误（解析失败）
    #[error("响应解析失败: {0}")]
    Malformed(String),

    /// 续传时数据源首部与会话记录不一致
    #[error("续传内容校验失败: 数据源与已缓存会话的首部内容不一致")]
    ContentMismatch,

    /// 重试次数或时间预算耗尽
    #[error("重试次数已达上限 (已重试 {attempts} 次): {last_message}")]
    RetryLimitExceeded {
        attempts: u32,
        status: Option<u16>,
        last_message: String,
    },

    /// 已取消
    #[error("传输已取消")]
    Cancelled,

    /// 参数错误
    #[error("参数错误: {0}")]
    InvalidArgument(String),

    /// 已有字节无法重放，不能重新开始上传
    #[error("无法重新开始上传: {0}")]
    RestartNotPossible(String),

    /// 会话存储读写失败
    #[error("会话存储失败: {0}")]
    Persistence(String),

    /// 本地文件读写失败
    #[error("文件读写失败: {0}")]
    Io(#[from] std::io::Error),

    /// 校验值格式错误
    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    /// 下载内容与服务端 CRC32C 不一致
    #[error("CRC32C 校验失败: 期望 {expected}, 实际 {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// 分段上传存在无法恢复的分段失败
    #[error(
        "分段上传失败: upload_id={upload_id}, 已完成 {} 个分段, 失败 {} 个分段",
        .parts.len(),
        .errors.len()
    )]
    MultipartFailed {
        upload_id: String,
        /// 已完成分段（part_number -> ETag），可用于后续续传
        parts: BTreeMap<u32, String>,
        errors: Vec<(u32, ErrorDetail)>,
    },

    /// 传输任务执行过程中 panic
    #[error("传输任务异常退出: {0}")]
    WorkerPanicked(String),

    /// 快速失败模式下批量任务中止
    #[error("批量传输已中止: 任务 {job_id} 失败: {source}")]
    BatchAborted {
        job_id: String,
        #[source]
        source: Box<TransferError>,
    },
}

impl TransferError {
    /// 构造 HTTP 错误
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        TransferError::Http {
            status,
            message: message.into(),
            reason: None,
        }
    }

    /// 获取关联的 HTTP 状态码
    pub fn status(&self) -> Option<u16> {
        match self {
            TransferError::Http { status, .. } => Some(*status),
            TransferError::RetryLimitExceeded { status, .. } => *status,
            TransferError::BatchAborted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// 是否为取消
    pub fn is_cancelled(&self) -> bool {
        match self {
            TransferError::Cancelled => true,
            TransferError::BatchAborted { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// 已经历的重试次数（仅重试耗尽时有意义）
    pub fn attempts(&self) -> u32 {
        match self {
            TransferError::RetryLimitExceeded { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

/// 可序列化的错误摘要
///
/// 用于批量任务结果和分段失败列表，保留调用方决定是否手动续传所需的上下文
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// 错误描述
    pub message: String,
    /// HTTP 状态码（如有）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// 重试次数
    #[serde(default)]
    pub attempts: u32,
}

impl From<&TransferError> for ErrorDetail {
    fn from(err: &TransferError) -> Self {
        Self {
            message: err.to_string(),
            status: err.status(),
            attempts: err.attempts(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "[{}] {}", status, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_limit_message_carries_context() {
        let err = TransferError::RetryLimitExceeded {
            attempts: 5,
            status: Some(503),
            last_message: "backend unavailable".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains("backend unavailable"));
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.attempts(), 5);
    }

    #[test]
    fn test_error_detail_from_http() {
        let err = TransferError::http(404, "No such object");
        let detail = ErrorDetail::from(&err);
        assert_eq!(detail.status, Some(404));
        assert_eq!(detail.attempts, 0);
        assert!(detail.to_string().starts_with("[404]"));
    }

    #[test]
    fn test_multipart_failed_message() {
        let mut parts = BTreeMap::new();
        parts.insert(1, "etag-1".to_string());
        let err = TransferError::MultipartFailed {
            upload_id: "u-1".to_string(),
            parts,
            errors: vec![(
                2,
                ErrorDetail {
                    message: "boom".to_string(),
                    status: None,
                    attempts: 0,
                },
            )],
        };
        let msg = err.to_string();
        assert!(msg.contains("u-1"));
        assert!(msg.contains("已完成 1 个分段"));
    }

    #[test]
    fn test_batch_aborted_propagates_cancel() {
        let err = TransferError::BatchAborted {
            job_id: "job".to_string(),
            source: Box::new(TransferError::Cancelled),
        };
        assert!(err.is_cancelled());
    }
}
