// 传输任务定义

use crate::client::{ObjectMetadata, ObjectRef};
use crate::error::{ErrorDetail, TransferError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// 传输端点：本地路径或远端对象
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferEndpoint {
    Path(PathBuf),
    Object(ObjectRef),
}

impl fmt::Display for TransferEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferEndpoint::Path(path) => write!(f, "{}", path.display()),
            TransferEndpoint::Object(object) => write!(f, "gs://{}", object),
        }
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// 等待调度
    Pending,
    /// 执行中
    InFlight,
    /// 成功
    Succeeded,
    /// 失败
    Failed,
}

impl JobStatus {
    /// 获取状态的中文描述
    pub fn description(&self) -> &'static str {
        match self {
            JobStatus::Pending => "等待中",
            JobStatus::InFlight => "传输中",
            JobStatus::Succeeded => "已完成",
            JobStatus::Failed => "失败",
        }
    }

    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// 传输任务
///
/// 由协调器独占；执行者只读取任务内容并返回结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferJob {
    /// 任务 ID
    pub id: String,
    pub source: TransferEndpoint,
    pub destination: TransferEndpoint,
    /// 字节数（已知时）
    pub size_bytes: Option<u64>,
    pub status: JobStatus,
    pub error: Option<ErrorDetail>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 更新时间 (Unix timestamp)
    pub updated_at: i64,
}

impl TransferJob {
    pub fn new(source: TransferEndpoint, destination: TransferEndpoint, size_bytes: Option<u64>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            destination,
            size_bytes,
            status: JobStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 上传任务：本地文件 -> 对象
    pub fn upload(path: impl Into<PathBuf>, object: ObjectRef, size_bytes: Option<u64>) -> Self {
        Self::new(
            TransferEndpoint::Path(path.into()),
            TransferEndpoint::Object(object),
            size_bytes,
        )
    }

    /// 下载任务：对象 -> 本地文件
    pub fn download(object: ObjectRef, path: impl Into<PathBuf>) -> Self {
        Self::new(
            TransferEndpoint::Object(object),
            TransferEndpoint::Path(path.into()),
            None,
        )
    }

    pub fn mark_in_flight(&mut self) {
        self.set_status(JobStatus::InFlight);
    }

    pub fn mark_succeeded(&mut self) {
        self.error = None;
        self.set_status(JobStatus::Succeeded);
    }

    pub fn mark_failed(&mut self, err: &TransferError) {
        self.error = Some(ErrorDetail::from(err));
        self.set_status(JobStatus::Failed);
    }

    fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = chrono::Utc::now().timestamp();
    }
}

/// 单个任务的产出
#[derive(Debug, Clone)]
pub enum TransferOutput {
    /// 上传完成，服务端返回的对象元数据
    Uploaded(ObjectMetadata),
    /// 下载完成
    Downloaded {
        path: PathBuf,
        bytes: u64,
        /// 是否通过 CRC32C 校验
        validated: bool,
    },
}

/// 批量传输结果
///
/// 部分失败不视为整体错误：成功与失败分别列出，均保持提交顺序
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<(TransferJob, TransferOutput)>,
    pub failed: Vec<(TransferJob, TransferError)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// 汇总描述
    pub fn summary(&self) -> String {
        format!(
            "共 {} 个任务: 成功 {}, 失败 {}",
            self.total(),
            self.succeeded.len(),
            self.failed.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_lifecycle() {
        let mut job = TransferJob::upload("/tmp/a.txt", ObjectRef::new("bucket", "a.txt"), Some(3));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.status.is_terminal());

        job.mark_in_flight();
        assert_eq!(job.status, JobStatus::InFlight);

        job.mark_failed(&TransferError::http(500, "internal"));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_ref().and_then(|e| e.status), Some(500));
        assert!(job.status.is_terminal());

        job.mark_succeeded();
        assert!(job.error.is_none());
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = TransferJob::download(ObjectRef::new("b", "o"), "/tmp/o");
        let b = TransferJob::download(ObjectRef::new("b", "o"), "/tmp/o");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = TransferEndpoint::Object(ObjectRef::new("bucket", "dir/file"));
        assert_eq!(endpoint.to_string(), "gs://bucket/dir/file");
    }

    #[test]
    fn test_report_summary() {
        let mut report = BatchReport::default();
        let job = TransferJob::download(ObjectRef::new("b", "o"), "/tmp/o");
        report.failed.push((job, TransferError::Cancelled));
        assert!(!report.is_success());
        assert_eq!(report.total(), 1);
        assert!(report.summary().contains("失败 1"));
    }
}
