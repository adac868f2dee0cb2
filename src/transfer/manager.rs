// 传输管理器
//
// 组装配置、存储客户端、会话存储与协调器，对外提供批量上传 / 批量下载 / 分段上传

use super::coordinator::{TransferCoordinator, TransferWorker};
use super::job::{BatchReport, TransferJob};
use super::workers::{expand_upload_jobs, FileDownloadWorker, FileUploadWorker};
use crate::client::{ObjectRef, StorageClient, UploadOptions, XmlMultipartClient};
use crate::config::AppConfig;
use crate::downloader::ChunkedDownloader;
use crate::error::Result;
use crate::http::HttpExecutor;
use crate::persistence::{FileSessionStore, SessionStore};
use crate::retry::RetryPolicy;
use crate::uploader::{MultipartOptions, MultipartOutcome, MultipartUploader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 传输管理器
pub struct TransferManager {
    config: AppConfig,
    executor: Arc<dyn HttpExecutor>,
    client: StorageClient,
    store: Arc<dyn SessionStore>,
    policy: RetryPolicy,
    /// 批量任务快速失败
    fail_fast: bool,
    cancel: CancellationToken,
}

impl TransferManager {
    /// 创建传输管理器（会话记录保存在配置的 JSON 文件中）
    pub fn new(config: AppConfig, executor: Arc<dyn HttpExecutor>) -> Self {
        let store: Arc<dyn SessionStore> =
            Arc::new(FileSessionStore::new(config.persistence.session_file.clone()));
        let client = StorageClient::new(executor.clone(), &config.storage);
        let policy = RetryPolicy::new(config.retry.clone());
        info!(
            "创建传输管理器: endpoint={}, 会话文件={:?}",
            config.storage.api_endpoint, config.persistence.session_file
        );

        Self {
            config,
            executor,
            client,
            store,
            policy,
            fail_fast: false,
            cancel: CancellationToken::new(),
        }
    }

    /// 替换会话存储
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn client(&self) -> &StorageClient {
        &self.client
    }

    /// 取消所有进行中的传输
    pub fn cancel_all(&self) {
        info!("取消所有传输");
        self.cancel.cancel();
    }

    /// 批量上传本地文件 / 目录
    ///
    /// # 参数
    /// * `paths` - 本地文件或目录（目录递归展开）
    /// * `bucket` - 目标存储桶
    /// * `prefix` - 对象名前缀
    /// * `template` - 每个对象共用的上传选项（前置条件、加密等）
    pub async fn upload_many(
        &self,
        paths: &[PathBuf],
        bucket: &str,
        prefix: &str,
        template: UploadOptions,
    ) -> Result<BatchReport> {
        let jobs = expand_upload_jobs(paths, bucket, prefix)?;
        let worker = FileUploadWorker::new(
            self.client.clone(),
            self.store.clone(),
            self.policy.clone(),
            self.config.upload.clone(),
        )
        .with_template(template);

        self.run_jobs(jobs, Arc::new(worker), self.config.upload.max_concurrent_files)
            .await
    }

    /// 批量下载对象
    pub async fn download_many(&self, objects: Vec<(ObjectRef, PathBuf)>) -> Result<BatchReport> {
        let jobs = objects
            .into_iter()
            .map(|(object, path)| TransferJob::download(object, path))
            .collect();
        let downloader = ChunkedDownloader::new(
            self.client.clone(),
            self.policy.clone(),
            self.config.download.clone(),
        );

        self.run_jobs(
            jobs,
            Arc::new(FileDownloadWorker::new(downloader)),
            self.config.download.max_concurrent_files,
        )
        .await
    }

    /// 通过 XML API 分段上传单个大文件
    ///
    /// `options` 为 None 时使用配置中的分段参数新建上传
    pub async fn upload_file_in_parts(
        &self,
        path: &Path,
        object: ObjectRef,
        options: Option<MultipartOptions>,
    ) -> Result<MultipartOutcome> {
        let options = options.unwrap_or_else(|| MultipartOptions::from_config(&self.config.upload));
        let client = XmlMultipartClient::new(
            self.executor.clone(),
            &self.config.storage.xml_endpoint,
            object,
        );
        let uploader = MultipartUploader::new(Arc::new(client), self.policy.clone(), options);
        uploader.upload_file(path, &self.cancel).await
    }

    async fn run_jobs(
        &self,
        jobs: Vec<TransferJob>,
        worker: Arc<dyn TransferWorker>,
        limit: usize,
    ) -> Result<BatchReport> {
        TransferCoordinator::new(limit)
            .with_fail_fast(self.fail_fast)
            .with_cancel(self.cancel.clone())
            .run_many(jobs, worker)
            .await
    }
}
