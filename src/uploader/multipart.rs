// 分段上传
//
// 一个大对象切成可独立上传的分段：
// - 初始化（或接续调用方提供的 upload_id / 已完成分段）
// - 使用 Semaphore 控制最大并发分段数，JoinSet 管理并发任务
// - 全部成功后按分段编号升序完成；放弃（显式或分段失败）时只调用 abort，不调用 complete
// - 本次上传了全部分段时，合并各分段 CRC32C 得到整体校验值

use super::chunk::{read_range, PartPlan, UploadPart};
use crate::checksum::Crc32c;
use crate::client::CompletedMultipart;
use crate::config::UploadConfig;
use crate::error::{ErrorDetail, Result, TransferError};
use crate::retry::{run_with_retry, RequestContext, RetryPolicy};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 分段上传接口
#[async_trait]
pub trait MultipartClient: Send + Sync {
    /// 初始化分段上传
    async fn initiate_upload(&self, cancel: &CancellationToken) -> Result<String>;

    /// 上传一个分段，返回 ETag
    async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// 完成分段上传（分段按编号升序）
    async fn complete_upload(
        &self,
        upload_id: &str,
        parts: &[(u32, String)],
        cancel: &CancellationToken,
    ) -> Result<CompletedMultipart>;

    /// 放弃分段上传
    async fn abort_upload(&self, upload_id: &str, cancel: &CancellationToken) -> Result<()>;
}

/// 分段上传选项
#[derive(Debug, Clone)]
pub struct MultipartOptions {
    /// 接续已有的分段上传
    pub upload_id: Option<String>,
    /// 已完成的分段（编号 -> ETag）
    pub parts_map: BTreeMap<u32, String>,
    /// 放弃已有的分段上传（不上传任何分段）
    pub abort_existing: bool,
    /// 分段大小
    pub part_size: u64,
    /// 最大并发分段数
    pub max_concurrent_parts: usize,
    /// 分段失败时是否自动放弃
    pub auto_abort_on_failure: bool,
}

impl MultipartOptions {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            upload_id: None,
            parts_map: BTreeMap::new(),
            abort_existing: false,
            part_size: config.part_size,
            max_concurrent_parts: config.max_concurrent_parts,
            auto_abort_on_failure: config.auto_abort_on_failure,
        }
    }
}

/// 分段上传结果
#[derive(Debug, Clone)]
pub enum MultipartOutcome {
    /// 已完成
    Completed {
        upload_id: String,
        parts: BTreeMap<u32, String>,
        result: CompletedMultipart,
        /// 整体 CRC32C（仅当本次上传了全部分段）
        crc32c: Option<Crc32c>,
    },
    /// 已放弃
    Aborted { upload_id: String },
}

/// 单个分段的上传结果
struct PartResult {
    number: u32,
    etag: String,
    crc: Crc32c,
    len: u64,
}

/// 分段上传器
pub struct MultipartUploader {
    client: Arc<dyn MultipartClient>,
    policy: RetryPolicy,
    options: MultipartOptions,
}

impl MultipartUploader {
    pub fn new(client: Arc<dyn MultipartClient>, policy: RetryPolicy, options: MultipartOptions) -> Self {
        Self {
            client,
            policy,
            options,
        }
    }

    /// 上传本地文件
    pub async fn upload_file(&self, path: &Path, cancel: &CancellationToken) -> Result<MultipartOutcome> {
        if self.options.abort_existing {
            let upload_id = self.options.upload_id.clone().ok_or_else(|| {
                TransferError::InvalidArgument("abort_existing 需要提供 upload_id".to_string())
            })?;
            self.client.abort_upload(&upload_id, cancel).await?;
            info!("已放弃已有分段上传: upload_id={}", upload_id);
            return Ok(MultipartOutcome::Aborted { upload_id });
        }

        if self.options.upload_id.is_none() && !self.options.parts_map.is_empty() {
            return Err(TransferError::InvalidArgument(
                "提供已完成分段时必须同时提供 upload_id".to_string(),
            ));
        }

        let size = tokio::fs::metadata(path).await?.len();
        let plan = PartPlan::new(size, self.options.part_size);
        if let Some(unknown) = self
            .options
            .parts_map
            .keys()
            .find(|n| **n == 0 || **n as usize > plan.part_count())
        {
            return Err(TransferError::InvalidArgument(format!(
                "已完成分段编号 {} 超出分段范围 1..={}",
                unknown,
                plan.part_count()
            )));
        }

        let upload_id = match &self.options.upload_id {
            Some(id) => {
                info!(
                    "接续分段上传: upload_id={}, 已完成 {}/{} 个分段",
                    id,
                    self.options.parts_map.len(),
                    plan.part_count()
                );
                id.clone()
            }
            None => {
                // 初始化不写入对象，重复初始化只会留下一个闲置的分段上传
                let ctx = RequestContext::new(Method::POST).with_precondition(true);
                run_with_retry(&self.policy, &ctx, cancel, "初始化分段上传", || {
                    self.client.initiate_upload(cancel)
                })
                .await?
            }
        };

        let mut parts = self.options.parts_map.clone();
        let missing: Vec<UploadPart> = plan.missing(&parts).cloned().collect();
        let uploaded_all = missing.len() == plan.part_count();

        let (results, errors) = self
            .upload_parts(path.to_path_buf(), &upload_id, missing, cancel)
            .await;

        let mut crcs: BTreeMap<u32, (Crc32c, u64)> = BTreeMap::new();
        for part in results {
            parts.insert(part.number, part.etag);
            crcs.insert(part.number, (part.crc, part.len));
        }

        if !errors.is_empty() || cancel.is_cancelled() {
            return Err(self.fail(upload_id, parts, errors).await);
        }

        let ordered: Vec<(u32, String)> = parts.iter().map(|(n, e)| (*n, e.clone())).collect();
        let ctx = RequestContext::new(Method::POST);
        let result = run_with_retry(&self.policy, &ctx, cancel, "完成分段上传", || {
            self.client.complete_upload(&upload_id, &ordered, cancel)
        })
        .await?;

        let crc32c = if uploaded_all {
            Some(Crc32c::combine_all(crcs.into_values()))
        } else {
            None
        };

        info!(
            "分段上传完成: upload_id={}, 分段数={}",
            upload_id,
            parts.len()
        );

        Ok(MultipartOutcome::Completed {
            upload_id,
            parts,
            result,
            crc32c,
        })
    }

    /// 分段失败：按配置放弃，并把已完成分段交还给调用方
    async fn fail(
        &self,
        upload_id: String,
        parts: BTreeMap<u32, String>,
        mut errors: Vec<(u32, ErrorDetail)>,
    ) -> TransferError {
        if errors.is_empty() {
            return TransferError::Cancelled;
        }
        errors.sort_by_key(|(n, _)| *n);

        if self.options.auto_abort_on_failure {
            // 调用方的取消令牌可能已触发，放弃请求使用独立令牌
            let abort_token = CancellationToken::new();
            match self.client.abort_upload(&upload_id, &abort_token).await {
                Ok(()) => warn!("分段失败，已放弃分段上传: upload_id={}", upload_id),
                Err(e) => error!("放弃分段上传失败: upload_id={}, {}", upload_id, e),
            }
        }

        TransferError::MultipartFailed {
            upload_id,
            parts,
            errors,
        }
    }

    async fn upload_parts(
        &self,
        path: PathBuf,
        upload_id: &str,
        missing: Vec<UploadPart>,
        cancel: &CancellationToken,
    ) -> (Vec<PartResult>, Vec<(u32, ErrorDetail)>) {
        let max_concurrent = self.options.max_concurrent_parts.max(1);
        info!(
            "[并发上传] 开始上传 {} 个分段，并发数: {}",
            missing.len(),
            max_concurrent
        );

        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut join_set: JoinSet<(u32, Result<PartResult>)> = JoinSet::new();
        // 分段失败时停止调度后续分段
        let part_cancel = cancel.child_token();

        let mut results = Vec::new();
        let mut errors = Vec::new();

        for part in missing {
            if part_cancel.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = part_cancel.cancelled() => break,
            };

            let client = self.client.clone();
            let policy = self.policy.clone();
            let token = part_cancel.clone();
            let path = path.clone();
            let upload_id = upload_id.to_string();

            join_set.spawn(async move {
                let number = part.number;
                let result = upload_single_part(client, policy, &path, &upload_id, part, &token).await;
                drop(permit);
                (number, result)
            });

            // 非阻塞检查是否有任务完成
            while let Some(joined) = join_set.try_join_next() {
                self.collect(joined, &part_cancel, &mut results, &mut errors);
            }
        }

        // 等待所有剩余任务完成
        while let Some(joined) = join_set.join_next().await {
            self.collect(joined, &part_cancel, &mut results, &mut errors);
        }

        (results, errors)
    }

    fn collect(
        &self,
        joined: std::result::Result<(u32, Result<PartResult>), tokio::task::JoinError>,
        part_cancel: &CancellationToken,
        results: &mut Vec<PartResult>,
        errors: &mut Vec<(u32, ErrorDetail)>,
    ) {
        let (number, err) = match joined {
            Ok((_, Ok(part))) => {
                results.push(part);
                return;
            }
            // 因其他分段失败（或调用方取消）而中止的分段不计入失败
            Ok((_, Err(e))) if e.is_cancelled() && part_cancel.is_cancelled() => return,
            Ok((number, Err(e))) => (number, ErrorDetail::from(&e)),
            Err(e) => (
                0,
                ErrorDetail {
                    message: format!("分段任务异常: {}", e),
                    status: None,
                    attempts: 0,
                },
            ),
        };

        error!("分段 #{} 上传失败: {}", number, err);
        errors.push((number, err));
        if self.options.auto_abort_on_failure {
            part_cancel.cancel();
        }
    }
}

/// 上传单个分段（含重试）
async fn upload_single_part(
    client: Arc<dyn MultipartClient>,
    policy: RetryPolicy,
    path: &Path,
    upload_id: &str,
    part: UploadPart,
    cancel: &CancellationToken,
) -> Result<PartResult> {
    let data = read_range(path, part.range.clone()).await?;
    let crc = Crc32c::of(&data);
    let len = data.len() as u64;

    // 同一分段编号重复上传会覆盖，重放是安全的
    let ctx = RequestContext::new(Method::PUT).with_precondition(true);
    let label = format!("上传分段 #{}", part.number);
    let etag = run_with_retry(&policy, &ctx, cancel, &label, || {
        client.upload_part(upload_id, part.number, data.clone(), cancel)
    })
    .await?;

    Ok(PartResult {
        number: part.number,
        etag,
        crc,
        len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    /// 记录调用的分段客户端
    #[derive(Default)]
    struct RecordingClient {
        initiated: AtomicUsize,
        uploaded: Mutex<Vec<u32>>,
        completed: Mutex<Vec<Vec<(u32, String)>>>,
        aborted: AtomicUsize,
        fail_part: Option<u32>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl MultipartClient for RecordingClient {
        async fn initiate_upload(&self, _cancel: &CancellationToken) -> Result<String> {
            self.initiated.fetch_add(1, Ordering::SeqCst);
            Ok("upload-1".to_string())
        }

        async fn upload_part(
            &self,
            _upload_id: &str,
            part_number: u32,
            _data: Bytes,
            _cancel: &CancellationToken,
        ) -> Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_part == Some(part_number) {
                return Err(TransferError::http(400, "bad part"));
            }
            self.uploaded.lock().push(part_number);
            Ok(format!("etag-{}", part_number))
        }

        async fn complete_upload(
            &self,
            _upload_id: &str,
            parts: &[(u32, String)],
            _cancel: &CancellationToken,
        ) -> Result<CompletedMultipart> {
            self.completed.lock().push(parts.to_vec());
            Ok(CompletedMultipart::default())
        }

        async fn abort_upload(&self, _upload_id: &str, _cancel: &CancellationToken) -> Result<()> {
            self.aborted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn temp_file(len: usize) -> (NamedTempFile, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        (file, data)
    }

    fn options(part_size: u64) -> MultipartOptions {
        MultipartOptions {
            upload_id: None,
            parts_map: BTreeMap::new(),
            abort_existing: false,
            part_size,
            max_concurrent_parts: 2,
            auto_abort_on_failure: true,
        }
    }

    #[tokio::test]
    async fn test_full_upload_completes_in_order() {
        let (file, data) = temp_file(100);
        let client = Arc::new(RecordingClient::default());
        let uploader = MultipartUploader::new(client.clone(), RetryPolicy::default(), options(30));

        let outcome = uploader
            .upload_file(file.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(client.initiated.load(Ordering::SeqCst), 1);
        assert!(client.max_in_flight.load(Ordering::SeqCst) <= 2);
        let completed = client.completed.lock().clone();
        let numbers: Vec<u32> = completed[0].iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);

        match outcome {
            MultipartOutcome::Completed { crc32c, parts, .. } => {
                assert_eq!(parts.len(), 4);
                assert_eq!(crc32c, Some(Crc32c::of(&data)));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resume_skips_initiate_and_done_parts() {
        let (file, _) = temp_file(100);
        let client = Arc::new(RecordingClient::default());
        let mut opts = options(30);
        opts.upload_id = Some("existing".to_string());
        opts.parts_map.insert(1, "etag-1".to_string());
        opts.parts_map.insert(3, "etag-3".to_string());

        let uploader = MultipartUploader::new(client.clone(), RetryPolicy::default(), opts);
        let outcome = uploader
            .upload_file(file.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(client.initiated.load(Ordering::SeqCst), 0);
        let mut uploaded = client.uploaded.lock().clone();
        uploaded.sort();
        assert_eq!(uploaded, vec![2, 4]);
        match outcome {
            MultipartOutcome::Completed {
                upload_id, crc32c, ..
            } => {
                assert_eq!(upload_id, "existing");
                assert_eq!(crc32c, None);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_existing() {
        let (file, _) = temp_file(100);
        let client = Arc::new(RecordingClient::default());
        let mut opts = options(30);
        opts.upload_id = Some("existing".to_string());
        opts.abort_existing = true;

        let uploader = MultipartUploader::new(client.clone(), RetryPolicy::default(), opts);
        let outcome = uploader
            .upload_file(file.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, MultipartOutcome::Aborted { .. }));
        assert_eq!(client.aborted.load(Ordering::SeqCst), 1);
        assert!(client.uploaded.lock().is_empty());
        assert!(client.completed.lock().is_empty());
        assert_eq!(client.initiated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_part_failure_aborts_without_complete() {
        let (file, _) = temp_file(100);
        let client = Arc::new(RecordingClient {
            fail_part: Some(2),
            ..Default::default()
        });
        let uploader = MultipartUploader::new(client.clone(), RetryPolicy::default(), options(30));

        let err = uploader
            .upload_file(file.path(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            TransferError::MultipartFailed { errors, .. } => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].0, 2);
                assert_eq!(errors[0].1.status, Some(400));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(client.aborted.load(Ordering::SeqCst), 1);
        assert!(client.completed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failure_without_auto_abort_keeps_parts() {
        let (file, _) = temp_file(100);
        let client = Arc::new(RecordingClient {
            fail_part: Some(4),
            ..Default::default()
        });
        let mut opts = options(30);
        opts.auto_abort_on_failure = false;
        let uploader = MultipartUploader::new(client.clone(), RetryPolicy::default(), opts);

        let err = uploader
            .upload_file(file.path(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            TransferError::MultipartFailed { parts, upload_id, .. } => {
                assert_eq!(upload_id, "upload-1");
                assert_eq!(parts.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(client.aborted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parts_without_upload_id_rejected() {
        let (file, _) = temp_file(10);
        let client = Arc::new(RecordingClient::default());
        let mut opts = options(5);
        opts.parts_map.insert(1, "etag".to_string());
        let uploader = MultipartUploader::new(client, RetryPolicy::default(), opts);
        assert!(matches!(
            uploader.upload_file(file.path(), &CancellationToken::new()).await,
            Err(TransferError::InvalidArgument(_))
        ));
    }
}
