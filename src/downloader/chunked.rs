use crate::checksum::Crc32c;
use crate::client::{EncryptionKey, ObjectMetadata, ObjectRef, StorageClient};
use crate::config::DownloadConfig;
use crate::error::{Result, TransferError};
use crate::retry::{run_with_retry, RequestContext, RetryPolicy};
use bytes::Bytes;
use reqwest::Method;
use std::io::{Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 下载分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadChunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
}

impl DownloadChunk {
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 按分片大小切分对象
pub fn split_ranges(total_size: u64, chunk_size: u64) -> Vec<DownloadChunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut offset = 0u64;
    while offset < total_size {
        let end = (offset + chunk_size).min(total_size);
        chunks.push(DownloadChunk {
            index: chunks.len(),
            range: offset..end,
        });
        offset = end;
    }
    chunks
}

/// 下载结果
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub metadata: ObjectMetadata,
    pub path: PathBuf,
    pub bytes: u64,
    /// 各分片合并得到的整体校验值
    pub crc32c: Crc32c,
    /// 是否与服务端校验值比对过
    pub validated: bool,
}

/// 分片并发下载器
#[derive(Clone)]
pub struct ChunkedDownloader {
    client: StorageClient,
    policy: RetryPolicy,
    config: DownloadConfig,
    encryption: Option<EncryptionKey>,
    progress: Option<mpsc::UnboundedSender<u64>>,
}

impl ChunkedDownloader {
    pub fn new(client: StorageClient, policy: RetryPolicy, config: DownloadConfig) -> Self {
        Self {
            client,
            policy,
            config,
            encryption: None,
            progress: None,
        }
    }

    pub fn with_encryption(mut self, key: Option<EncryptionKey>) -> Self {
        self.encryption = key;
        self
    }

    /// 订阅进度（累计已下载字节数）
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<u64>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// 下载对象到本地文件
    ///
    /// 失败或校验不一致时删除未完成的文件
    pub async fn download(
        &self,
        object: &ObjectRef,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let ctx = RequestContext::new(Method::GET);
        let metadata = run_with_retry(&self.policy, &ctx, cancel, "获取对象元数据", || {
            self.client
                .get_object_metadata(object, self.encryption.as_ref(), cancel)
        })
        .await?;

        let size = metadata
            .size
            .ok_or_else(|| TransferError::Malformed(format!("对象元数据缺少 size: {}", object)))?;

        info!(
            "开始下载: {} -> {:?} ({} bytes, 分片大小 {} bytes)",
            object, dest, size, self.config.chunk_size
        );

        prepare_file(dest, size).await?;

        let crc32c = match self.download_chunks(object, dest, size, cancel).await {
            Ok(crc) => crc,
            Err(e) => {
                remove_partial(dest).await;
                return Err(e);
            }
        };

        let mut validated = false;
        if self.config.validate_checksum {
            match &metadata.crc32c {
                Some(expected) => {
                    if !crc32c.validate(expected) {
                        error!(
                            "CRC32C 校验失败: {} 期望 {} 实际 {}",
                            object,
                            expected,
                            crc32c.to_base64()
                        );
                        remove_partial(dest).await;
                        return Err(TransferError::ChecksumMismatch {
                            expected: expected.clone(),
                            actual: crc32c.to_base64(),
                        });
                    }
                    validated = true;
                }
                None => warn!("对象没有 CRC32C，跳过校验: {}", object),
            }
        }

        info!("下载完成: {} ({} bytes, 校验={})", object, size, validated);
        Ok(DownloadOutcome {
            metadata,
            path: dest.to_path_buf(),
            bytes: size,
            crc32c,
            validated,
        })
    }

    /// 并发下载所有分片，返回合并后的校验值
    async fn download_chunks(
        &self,
        object: &ObjectRef,
        dest: &Path,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<Crc32c> {
        let chunks = split_ranges(size, self.config.chunk_size);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_chunks.max(1)));
        let chunk_cancel = cancel.child_token();
        let downloaded = Arc::new(AtomicU64::new(0));
        let mut join_set = JoinSet::new();

        debug!("{} 切分为 {} 个分片", object, chunks.len());

        for chunk in chunks.iter().cloned() {
            let semaphore = semaphore.clone();
            let downloader = self.clone();
            let object = object.clone();
            let dest = dest.to_path_buf();
            let chunk_cancel = chunk_cancel.clone();
            let downloaded = downloaded.clone();

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| TransferError::Cancelled)?;
                let crc = downloader
                    .download_chunk(&object, &dest, &chunk, &chunk_cancel)
                    .await?;

                let total = downloaded.fetch_add(chunk.size(), Ordering::SeqCst) + chunk.size();
                if let Some(tx) = &downloader.progress {
                    let _ = tx.send(total);
                }
                Ok::<_, TransferError>((chunk.index, crc))
            });
        }

        let mut crcs: Vec<Option<Crc32c>> = vec![None; chunks.len()];
        let mut first_error: Option<TransferError> = None;

        while let Some(joined) = join_set.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("分片任务异常退出: {}", e),
                )))
            });
            match result {
                Ok((index, crc)) => crcs[index] = Some(crc),
                Err(e) => {
                    // 首个失败取消其余分片，保留非取消的错误
                    chunk_cancel.cancel();
                    let replace = match &first_error {
                        None => true,
                        Some(prev) => prev.is_cancelled() && !e.is_cancelled(),
                    };
                    if replace {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let parts = chunks
            .iter()
            .map(|chunk| {
                crcs[chunk.index]
                    .map(|crc| (crc, chunk.size()))
                    .ok_or(TransferError::Cancelled)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Crc32c::combine_all(parts))
    }

    async fn download_chunk(
        &self,
        object: &ObjectRef,
        dest: &Path,
        chunk: &DownloadChunk,
        cancel: &CancellationToken,
    ) -> Result<Crc32c> {
        let ctx = RequestContext::new(Method::GET);
        let op_name = format!("下载分片 #{} ({})", chunk.index, object);
        let data = run_with_retry(&self.policy, &ctx, cancel, &op_name, || {
            self.client.download_range(
                object,
                chunk.range.clone(),
                self.encryption.as_ref(),
                cancel,
            )
        })
        .await?;

        let crc = Crc32c::of(&data);
        write_at(dest, chunk.range.start, data).await?;
        debug!(
            "分片 #{} 下载完成: bytes={}-{}",
            chunk.index,
            chunk.range.start,
            chunk.range.end
        );
        Ok(crc)
    }
}

/// 创建目标文件并预分配空间
async fn prepare_file(path: &Path, size: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let file = tokio::fs::File::create(path).await?;
    file.set_len(size).await?;
    Ok(())
}

/// 在指定偏移写入数据（阻塞线程池中执行）
async fn write_at(path: &Path, offset: u64, data: Bytes) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&data)?;
        file.flush()?;
        Ok(())
    })
    .await
    .map_err(|e| TransferError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("删除未完成的文件失败: {:?}: {}", path, e);
    }
}
