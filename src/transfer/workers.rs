// 文件传输执行者与目录展开

use super::coordinator::TransferWorker;
use super::job::{TransferEndpoint, TransferJob, TransferOutput};
use crate::client::{ObjectRef, StorageClient, UploadOptions};
use crate::config::UploadConfig;
use crate::downloader::ChunkedDownloader;
use crate::error::{Result, TransferError};
use crate::persistence::SessionStore;
use crate::retry::{run_with_retry, RequestContext, RetryPolicy};
use crate::uploader::{should_use_resumable, ResumableUpload, UploadControl};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 把本地路径展开为上传任务
///
/// 文件直接对应一个对象；目录递归展开，对象名为 `prefix` + 相对路径（以 `/` 分隔）
///
/// # 参数
/// * `paths` - 本地文件或目录
/// * `bucket` - 目标存储桶
/// * `prefix` - 对象名前缀
pub fn expand_upload_jobs(paths: &[PathBuf], bucket: &str, prefix: &str) -> Result<Vec<TransferJob>> {
    let mut jobs = Vec::new();

    for path in paths {
        let metadata = std::fs::metadata(path).map_err(|e| {
            TransferError::InvalidArgument(format!("无法访问本地路径 {:?}: {}", path, e))
        })?;

        if metadata.is_file() {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| TransferError::InvalidArgument(format!("无效的文件路径: {:?}", path)))?;
            jobs.push(TransferJob::upload(
                path.clone(),
                ObjectRef::new(bucket, format!("{}{}", prefix, file_name)),
                Some(metadata.len()),
            ));
            continue;
        }

        let mut count = 0usize;
        for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("扫描目录时跳过条目: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            let size = entry.metadata().ok().map(|m| m.len());

            jobs.push(TransferJob::upload(
                entry.path().to_path_buf(),
                ObjectRef::new(bucket, format!("{}{}", prefix, name)),
                size,
            ));
            count += 1;
        }
        debug!("目录 {:?} 展开为 {} 个文件", path, count);
    }

    info!("共 {} 个上传任务", jobs.len());
    Ok(jobs)
}

fn upload_endpoints(job: &TransferJob) -> Result<(&Path, &ObjectRef)> {
    match (&job.source, &job.destination) {
        (TransferEndpoint::Path(path), TransferEndpoint::Object(object)) => Ok((path, object)),
        _ => Err(TransferError::InvalidArgument(format!(
            "上传任务需要 本地路径 -> 对象: {} -> {}",
            job.source, job.destination
        ))),
    }
}

fn download_endpoints(job: &TransferJob) -> Result<(&ObjectRef, &Path)> {
    match (&job.source, &job.destination) {
        (TransferEndpoint::Object(object), TransferEndpoint::Path(path)) => Ok((object, path)),
        _ => Err(TransferError::InvalidArgument(format!(
            "下载任务需要 对象 -> 本地路径: {} -> {}",
            job.source, job.destination
        ))),
    }
}

/// 文件上传执行者
///
/// 小于可续传阈值的文件单次请求上传，其余走可续传会话
pub struct FileUploadWorker {
    client: StorageClient,
    store: Arc<dyn SessionStore>,
    policy: RetryPolicy,
    config: UploadConfig,
    /// 每个任务的上传选项模板（前置条件、加密等）
    template: UploadOptions,
}

impl FileUploadWorker {
    pub fn new(
        client: StorageClient,
        store: Arc<dyn SessionStore>,
        policy: RetryPolicy,
        config: UploadConfig,
    ) -> Self {
        Self {
            client,
            store,
            policy,
            config,
            template: UploadOptions::default(),
        }
    }

    pub fn with_template(mut self, template: UploadOptions) -> Self {
        self.template = template;
        self
    }

    async fn upload_simple(
        &self,
        path: &Path,
        options: &UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<TransferOutput> {
        let data = Bytes::from(tokio::fs::read(path).await?);
        let ctx = RequestContext::new(Method::POST)
            .with_precondition(options.preconditions.is_idempotent());
        let op_name = format!("单次上传 {}", options.object);

        let metadata = run_with_retry(&self.policy, &ctx, cancel, &op_name, || {
            self.client.upload_simple(options, data.clone(), cancel)
        })
        .await?;
        Ok(TransferOutput::Uploaded(metadata))
    }

    async fn upload_resumable(
        &self,
        path: &Path,
        options: UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<TransferOutput> {
        let file = tokio::fs::File::open(path).await?;
        let mut upload = ResumableUpload::new(
            self.client.clone(),
            self.store.clone(),
            self.policy.clone(),
            options,
            &self.config,
        )
        .with_control(UploadControl::with_cancel(cancel.clone()));

        let metadata = upload.upload(file).await?;
        Ok(TransferOutput::Uploaded(metadata))
    }
}

#[async_trait]
impl TransferWorker for FileUploadWorker {
    async fn run(&self, job: &TransferJob, cancel: &CancellationToken) -> Result<TransferOutput> {
        let (path, object) = upload_endpoints(job)?;
        let size = match job.size_bytes {
            Some(size) => size,
            None => tokio::fs::metadata(path).await?.len(),
        };

        let mut options = self.template.clone();
        options.object = object.clone();
        options.content_length = Some(size);

        if should_use_resumable(Some(size), self.config.resumable_threshold) {
            debug!("可续传上传: {:?} -> {} ({} bytes)", path, object, size);
            self.upload_resumable(path, options, cancel).await
        } else {
            debug!("单次上传: {:?} -> {} ({} bytes)", path, object, size);
            self.upload_simple(path, &options, cancel).await
        }
    }
}

/// 文件下载执行者
pub struct FileDownloadWorker {
    downloader: ChunkedDownloader,
}

impl FileDownloadWorker {
    pub fn new(downloader: ChunkedDownloader) -> Self {
        Self { downloader }
    }
}

#[async_trait]
impl TransferWorker for FileDownloadWorker {
    async fn run(&self, job: &TransferJob, cancel: &CancellationToken) -> Result<TransferOutput> {
        let (object, path) = download_endpoints(job)?;
        let outcome = self.downloader.download(object, path, cancel).await?;
        Ok(TransferOutput::Downloaded {
            path: outcome.path,
            bytes: outcome.bytes,
            validated: outcome.validated,
        })
    }
}
