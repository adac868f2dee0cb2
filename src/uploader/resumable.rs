// 可续传上传
//
// 状态机：
//   Uninitialized -> SessionCreated -> Uploading <-> Paused / Restarting -> Completed
//   任意非终态都可能进入 Errored
//
// - Uninitialized：使用手动 URI / 缓存会话 / 新建会话
// - SessionCreated：偏移未知时发送零长度探测（bytes */*）同步偏移
// - Uploading：逐片发送，308 更新偏移，成功响应完成上传
// - Restarting：会话过期（404/410），丢弃状态重新初始化；手动 URI 不重建
// - 每次建立或变更会话 URI 都写入会话存储，新进程可以接续上传

use super::pipeline::{align_chunk_size, ChunkPipeline};
use super::session::{SessionState, UploadControl, UploadProgress, UploadSession};
use crate::client::{ChunkResponse, ObjectMetadata, StorageClient, UploadOptions};
use crate::config::UploadConfig;
use crate::error::{Result, TransferError};
use crate::persistence::{cache_key, SessionRecord, SessionStore};
use crate::retry::{sleep_or_cancel, RequestContext, RetryDecision, RetryPolicy, RetryState};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use reqwest::Method;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 一次状态推进的结果
enum Step {
    Continue,
    Done(ObjectMetadata),
    Expired(TransferError),
}

/// 可续传上传
pub struct ResumableUpload {
    client: StorageClient,
    store: Arc<dyn SessionStore>,
    policy: RetryPolicy,
    options: UploadOptions,
    chunk_size: u64,
    prefix_len: usize,
    session: UploadSession,
    state: SessionState,
    control: UploadControl,
    progress: Option<mpsc::UnboundedSender<UploadProgress>>,
    /// 偏移需要向服务端确认
    needs_probe: bool,
    /// 首部已写入会话记录
    prefix_persisted: bool,
    /// 触发重建的错误
    restart_cause: Option<TransferError>,
}

impl ResumableUpload {
    pub fn new(
        client: StorageClient,
        store: Arc<dyn SessionStore>,
        policy: RetryPolicy,
        options: UploadOptions,
        config: &UploadConfig,
    ) -> Self {
        let chunk_size = align_chunk_size(options.chunk_size.unwrap_or(config.chunk_size));
        let key = cache_key(&options.object.bucket, &options.object.name, options.generation);

        let mut session = UploadSession::new(key, options.content_length);
        session.uri_provided_manually = options.uri.is_some();
        session.encryption = options.encryption.clone();

        Self {
            client,
            store,
            policy,
            options,
            chunk_size,
            prefix_len: config.first_chunk_prefix,
            session,
            state: SessionState::Uninitialized,
            control: UploadControl::new(),
            progress: None,
            needs_probe: false,
            prefix_persisted: false,
            restart_cause: None,
        }
    }

    /// 使用外部控制句柄
    pub fn with_control(mut self, control: UploadControl) -> Self {
        self.control = control;
        self
    }

    /// 订阅进度
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<UploadProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn control(&self) -> UploadControl {
        self.control.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    /// 上传数据源（从对象偏移 0 开始）
    ///
    /// 已被服务端确认的字节会被跳过，不会重复发送
    pub async fn upload<R>(&mut self, source: R) -> Result<ObjectMetadata>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        match self.state {
            SessionState::Completed => {
                return Err(TransferError::InvalidArgument(format!(
                    "上传已完成: {}",
                    self.options.object
                )));
            }
            SessionState::Uninitialized => {}
            // 上一次运行中断，重新走初始化（优先接续已有会话）
            _ => self.transition(SessionState::Uninitialized),
        }

        let mut pipeline = ChunkPipeline::new(source, self.prefix_len);
        let mut retry = self.policy.new_state();

        let result = self.drive(&mut pipeline, &mut retry).await;
        match &result {
            Ok(meta) => {
                info!(
                    "上传完成: {} ({} bytes, 重试 {} 次)",
                    self.options.object,
                    meta.size.unwrap_or(self.session.bytes_written),
                    self.session.retry_count
                );
            }
            Err(e) => {
                self.transition(SessionState::Errored);
                error!("上传失败: {}: {}", self.options.object, e);
            }
        }
        result
    }

    /// 重新开始上传
    ///
    /// 丢弃会话 URI 与缓存记录，下一次 `upload` 会新建会话；手动提供的 URI 不能重建
    pub fn restart(&mut self) -> Result<()> {
        if self.session.uri_provided_manually {
            return Err(TransferError::RestartNotPossible(
                "会话 URI 由调用方提供，无法重建会话".to_string(),
            ));
        }
        if self.state == SessionState::Completed {
            return Err(TransferError::RestartNotPossible("上传已完成".to_string()));
        }

        self.store.delete(&self.session.cache_key)?;
        self.discard_session();
        self.transition(SessionState::Uninitialized);
        Ok(())
    }

    /// 删除会话：取消服务端会话并移除缓存记录
    pub async fn delete_session(&mut self) -> Result<()> {
        if let Some(uri) = self.session.session_uri.clone() {
            self.client
                .cancel_resumable_session(&uri, self.control.cancel_token())
                .await?;
        }
        self.store.delete(&self.session.cache_key)?;
        self.discard_session();
        self.session.uri_provided_manually = false;
        self.options.uri = None;
        self.transition(SessionState::Uninitialized);
        Ok(())
    }

    // =====================================================
    // 状态推进
    // =====================================================

    async fn drive(
        &mut self,
        pipeline: &mut ChunkPipeline,
        retry: &mut RetryState,
    ) -> Result<ObjectMetadata> {
        loop {
            if self.control.is_paused() {
                let resume_to = self.state;
                self.transition(SessionState::Paused);
                self.control.wait_if_paused().await?;
                self.transition(resume_to);
            }
            if self.control.cancel_token().is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let step = match self.state {
                SessionState::Uninitialized => {
                    self.initialize(pipeline, retry).await?;
                    Step::Continue
                }
                SessionState::SessionCreated => self.resync(pipeline, retry).await?,
                SessionState::Uploading => self.send_next_chunk(pipeline, retry).await?,
                SessionState::Restarting => {
                    self.restart_session(pipeline, retry)?;
                    Step::Continue
                }
                SessionState::Paused => {
                    self.transition(SessionState::SessionCreated);
                    Step::Continue
                }
                SessionState::Completed | SessionState::Errored => {
                    return Err(TransferError::InvalidArgument(format!(
                        "上传已处于终态: {}",
                        self.state
                    )));
                }
            };

            match step {
                Step::Continue => {}
                Step::Done(meta) => return self.finish(meta),
                Step::Expired(err) => {
                    if self.session.uri_provided_manually {
                        // 手动提供的会话过期不能重建，原样返回
                        return Err(err);
                    }
                    warn!("会话已过期，准备重建: {}: {}", self.options.object, err);
                    self.restart_cause = Some(err);
                    self.transition(SessionState::Restarting);
                }
            }
        }
    }

    /// 建立会话：手动 URI > 缓存会话 > 新建会话
    async fn initialize(&mut self, pipeline: &mut ChunkPipeline, retry: &mut RetryState) -> Result<()> {
        if let Some(uri) = self.options.uri.clone() {
            debug!("使用调用方提供的会话 URI: {}", uri);
            self.session.session_uri = Some(uri);
            self.session.uri_provided_manually = true;
            self.needs_probe = true;
            self.transition(SessionState::SessionCreated);
            return Ok(());
        }

        if let Some(record) = self.store.get(&self.session.cache_key)? {
            info!(
                "发现缓存会话，尝试续传: {} (创建于 {})",
                self.session.cache_key, record.created_at
            );
            match record.first_chunk.as_deref().map(|s| BASE64.decode(s)) {
                Some(Ok(prefix)) => {
                    pipeline.expect_prefix(Bytes::from(prefix));
                    self.prefix_persisted = true;
                }
                Some(Err(e)) => warn!("缓存会话首部无法解析，跳过内容校验: {}", e),
                None => {}
            }
            self.session.session_uri = Some(record.uri);
            self.needs_probe = true;
            self.transition(SessionState::SessionCreated);
            return Ok(());
        }

        // 会话初始化不写入对象，重复创建只会留下一个闲置会话
        let ctx = RequestContext::new(Method::POST).with_precondition(true);
        let uri = loop {
            match self
                .client
                .create_resumable_session(&self.options, self.control.cancel_token())
                .await
            {
                Ok(uri) => break uri,
                Err(err) => match self.policy.decide(&err, &ctx) {
                    RetryDecision::Retry => self.backoff(err, retry).await?,
                    _ => return Err(err),
                },
            }
        };

        self.store.set(
            &self.session.cache_key,
            &SessionRecord::new(uri.clone(), self.options.generation),
        )?;
        info!("已创建上传会话: {}", self.options.object);

        self.session.session_uri = Some(uri);
        self.needs_probe = false;
        self.prefix_persisted = false;
        self.transition(SessionState::SessionCreated);
        Ok(())
    }

    /// 同步服务端偏移
    async fn resync(&mut self, pipeline: &mut ChunkPipeline, retry: &mut RetryState) -> Result<Step> {
        if !self.needs_probe {
            self.transition(SessionState::Uploading);
            return Ok(Step::Continue);
        }

        let uri = self.session_uri()?;
        let ctx = RequestContext::session(Method::PUT);
        loop {
            match self
                .client
                .query_offset(&uri, self.control.cancel_token())
                .await
            {
                Ok(ChunkResponse::Incomplete { offset }) => {
                    debug!("服务端已持久化 {} 字节: {}", offset, self.options.object);
                    self.acknowledge(pipeline, offset)?;
                    self.needs_probe = false;
                    self.transition(SessionState::Uploading);
                    return Ok(Step::Continue);
                }
                Ok(ChunkResponse::Complete(meta)) => return Ok(Step::Done(meta)),
                Err(err) => match self.policy.decide(&err, &ctx) {
                    RetryDecision::Restart => return Ok(Step::Expired(err)),
                    RetryDecision::Retry => self.backoff(err, retry).await?,
                    RetryDecision::Fail => return Err(err),
                },
            }
        }
    }

    /// 发送下一个分片
    async fn send_next_chunk(
        &mut self,
        pipeline: &mut ChunkPipeline,
        retry: &mut RetryState,
    ) -> Result<Step> {
        let chunk = pipeline.next_chunk(self.chunk_size).await?;
        self.persist_prefix(pipeline)?;

        let uri = self.session_uri()?;
        self.session.bytes_written = self.session.bytes_written.max(chunk.range_end());
        debug!(
            "发送分片: {} bytes {}-{} (final={})",
            self.options.object,
            chunk.range_start,
            chunk.range_end(),
            chunk.is_final
        );

        let response = self
            .client
            .upload_chunk(
                &uri,
                chunk.range_start,
                chunk.data,
                chunk.is_final,
                self.session.total_size,
                self.session.encryption.as_ref(),
                self.control.cancel_token(),
            )
            .await;

        match response {
            Ok(ChunkResponse::Incomplete { offset }) => {
                self.acknowledge(pipeline, offset)?;
                Ok(Step::Continue)
            }
            Ok(ChunkResponse::Complete(meta)) => Ok(Step::Done(meta)),
            Err(err) => match self.policy.decide(&err, &RequestContext::session(Method::PUT)) {
                RetryDecision::Restart => Ok(Step::Expired(err)),
                RetryDecision::Retry => {
                    self.backoff(err, retry).await?;
                    // 不知道失败的请求写入了多少，重新探测偏移
                    self.needs_probe = true;
                    self.transition(SessionState::SessionCreated);
                    Ok(Step::Continue)
                }
                RetryDecision::Fail => Err(err),
            },
        }
    }

    /// 丢弃过期会话，从头开始
    fn restart_session(&mut self, pipeline: &mut ChunkPipeline, retry: &mut RetryState) -> Result<()> {
        let cause = self
            .restart_cause
            .take()
            .unwrap_or_else(|| TransferError::http(410, "会话已过期"));

        // 已确认并丢弃的字节无法重放
        pipeline.acknowledge(0)?;
        // 重建计入重试预算
        retry.record_failure(&cause)?;
        self.session.retry_count = retry.attempt();

        self.store.delete(&self.session.cache_key)?;
        self.discard_session();
        pipeline.clear_expected_prefix();
        self.transition(SessionState::Uninitialized);
        Ok(())
    }

    fn finish(&mut self, meta: ObjectMetadata) -> Result<ObjectMetadata> {
        self.store.delete(&self.session.cache_key)?;
        let written = meta.size.unwrap_or(self.session.bytes_written);
        self.session.acknowledge(written);
        self.emit_progress();
        self.transition(SessionState::Completed);
        Ok(meta)
    }

    // =====================================================
    // 辅助函数
    // =====================================================

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("{}: {} -> {}", self.options.object, self.state, next);
            self.state = next;
        }
    }

    fn session_uri(&self) -> Result<String> {
        self.session
            .session_uri
            .clone()
            .ok_or_else(|| TransferError::InvalidArgument("会话 URI 尚未建立".to_string()))
    }

    fn discard_session(&mut self) {
        self.session.reset();
        self.needs_probe = false;
        self.prefix_persisted = false;
        self.restart_cause = None;
    }

    fn acknowledge(&mut self, pipeline: &mut ChunkPipeline, offset: u64) -> Result<()> {
        pipeline.acknowledge(offset)?;
        self.session.acknowledge(offset);
        self.emit_progress();
        Ok(())
    }

    fn emit_progress(&self) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(UploadProgress {
                bytes_written: self.session.offset,
                total: self.session.total_size,
            });
        }
    }

    /// 首部可用后写入会话记录
    fn persist_prefix(&mut self, pipeline: &ChunkPipeline) -> Result<()> {
        if self.prefix_persisted || self.session.uri_provided_manually {
            return Ok(());
        }
        let prefix = match pipeline.captured_prefix() {
            Some(prefix) => prefix,
            None => return Ok(()),
        };
        let uri = self.session_uri()?;

        let mut record = self
            .store
            .get(&self.session.cache_key)?
            .filter(|r| r.uri == uri)
            .unwrap_or_else(|| SessionRecord::new(uri, self.options.generation));
        record.first_chunk = Some(BASE64.encode(&prefix));
        record.touch();
        self.store.set(&self.session.cache_key, &record)?;

        self.prefix_persisted = true;
        Ok(())
    }

    async fn backoff(&mut self, err: TransferError, retry: &mut RetryState) -> Result<()> {
        let delay = retry.record_failure(&err)?;
        self.session.retry_count = retry.attempt();
        warn!(
            "{} 请求失败，{}ms 后重试 (第 {} 次): {}",
            self.options.object,
            delay.as_millis(),
            retry.attempt(),
            err
        );
        sleep_or_cancel(delay, self.control.cancel_token()).await
    }
}
