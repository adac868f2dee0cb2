// 上传会话模型

use crate::client::EncryptionKey;
use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// 可续传上传状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// 尚未建立会话
    Uninitialized,
    /// 会话已建立，待确认偏移
    SessionCreated,
    /// 正在发送分片
    Uploading,
    /// 已暂停
    Paused,
    /// 会话过期，正在丢弃状态并重建
    Restarting,
    /// 上传完成
    Completed,
    /// 失败（终态）
    Errored,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Errored)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "未初始化",
            SessionState::SessionCreated => "会话已建立",
            SessionState::Uploading => "上传中",
            SessionState::Paused => "已暂停",
            SessionState::Restarting => "重建会话",
            SessionState::Completed => "已完成",
            SessionState::Errored => "失败",
        };
        f.write_str(name)
    }
}

/// 单个对象的上传会话
///
/// 不变量：`offset <= bytes_written`；`session_uri` 设置后在重建之前不再改变
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// 服务端会话 URI
    pub session_uri: Option<String>,
    /// 会话缓存键
    pub cache_key: String,
    /// 服务端已确认的偏移
    pub offset: u64,
    /// 对象总大小（未知时为 None）
    pub total_size: Option<u64>,
    /// 已发送的字节数
    pub bytes_written: u64,
    /// 重试次数（含重建）
    pub retry_count: u32,
    /// 会话 URI 是否由调用方手动提供
    pub uri_provided_manually: bool,
    /// 客户提供的加密密钥
    pub encryption: Option<EncryptionKey>,
}

impl UploadSession {
    pub fn new(cache_key: String, total_size: Option<u64>) -> Self {
        Self {
            session_uri: None,
            cache_key,
            offset: 0,
            total_size,
            bytes_written: 0,
            retry_count: 0,
            uri_provided_manually: false,
            encryption: None,
        }
    }

    /// 服务端确认了新的偏移
    pub fn acknowledge(&mut self, offset: u64) {
        self.offset = offset;
        self.bytes_written = self.bytes_written.max(offset);
    }

    /// 丢弃会话状态（重建前调用）
    pub fn reset(&mut self) {
        self.session_uri = None;
        self.offset = 0;
        self.bytes_written = 0;
    }
}

/// 上传进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    /// 服务端已确认的累计字节数
    pub bytes_written: u64,
    /// 总大小
    pub total: Option<u64>,
}

/// 上传控制句柄（暂停 / 继续 / 取消）
#[derive(Debug, Clone, Default)]
pub struct UploadControl {
    paused: Arc<AtomicBool>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl UploadControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用外部取消令牌（批量任务共享）
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 暂停期间阻塞，直到继续或取消
    pub async fn wait_if_paused(&self) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if !self.is_paused() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = notified => {}
            }
        }
    }
}
