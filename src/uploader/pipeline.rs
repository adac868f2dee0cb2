// 分片流水线
//
// 读取任务把数据源切成数据块，经有界通道送入流水线（通道容量即背压）；
// 流水线按服务端确认的偏移切出协议对齐的分片：
// - 已确认的字节直接丢弃，永不重发
// - 未确认的字节保留在缓冲区，重试或重建会话时重新发送
// - 首部前若干字节原样保留，用于续传时的内容一致性校验

use crate::config::UPLOAD_GRANULARITY;
use crate::error::{Result, TransferError};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// 读取任务每次读取的块大小
const READ_BLOCK_SIZE: usize = 64 * 1024;

/// 读取任务与流水线之间的通道容量
const SOURCE_CHANNEL_CAPACITY: usize = 8;

/// 对齐到协议粒度（向下取整，至少一个粒度）
pub fn align_chunk_size(size: u64) -> u64 {
    (size / UPLOAD_GRANULARITY).max(1) * UPLOAD_GRANULARITY
}

/// 一个待发送的分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 在对象中的起始偏移
    pub range_start: u64,
    /// 分片数据
    pub data: Bytes,
    /// 是否为最后一片（数据源已读完）
    pub is_final: bool,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 结束偏移（不含）
    pub fn range_end(&self) -> u64 {
        self.range_start + self.len()
    }
}

/// 读取任务发出的事件
#[derive(Debug)]
enum SourceEvent {
    Data(Bytes),
    Eof,
    Error(String),
}

async fn read_source<R>(mut reader: R, tx: mpsc::Sender<SourceEvent>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut buf = BytesMut::with_capacity(READ_BLOCK_SIZE);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(SourceEvent::Eof).await;
                return;
            }
            Ok(_) => {
                if tx.send(SourceEvent::Data(buf.freeze())).await.is_err() {
                    // 流水线已丢弃
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(SourceEvent::Error(e.to_string())).await;
                return;
            }
        }
    }
}

/// 分片流水线
pub struct ChunkPipeline {
    rx: mpsc::Receiver<SourceEvent>,
    reader: JoinHandle<()>,
    /// 保留的字节，对应对象区间 [base, read_pos)
    buffer: BytesMut,
    base: u64,
    /// 从数据源读到的累计字节数
    read_pos: u64,
    /// 服务端已确认的偏移
    acked: u64,
    eof: bool,
    prefix_len: usize,
    /// 实际捕获的首部长度：不小于 prefix_len，也不小于期望首部的长度
    capture_len: usize,
    prefix: BytesMut,
    expected_prefix: Option<Bytes>,
}

impl ChunkPipeline {
    /// 创建流水线并启动读取任务
    ///
    /// # 参数
    /// * `source` - 数据源（从对象偏移 0 开始）
    /// * `prefix_len` - 保留的首部长度
    pub fn new<R>(source: R, prefix_len: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_source(source, tx));
        Self {
            rx,
            reader,
            buffer: BytesMut::new(),
            base: 0,
            read_pos: 0,
            acked: 0,
            eof: false,
            prefix_len,
            capture_len: prefix_len,
            prefix: BytesMut::with_capacity(prefix_len),
            expected_prefix: None,
        }
    }

    /// 设置续传时期望的首部内容
    ///
    /// 缓存的首部可能比本次配置的首部更长，此时按缓存的长度捕获
    pub fn expect_prefix(&mut self, prefix: Bytes) {
        self.capture_len = self.capture_len.max(prefix.len());
        self.expected_prefix = if prefix.is_empty() { None } else { Some(prefix) };
    }

    /// 不再校验首部（会话重建后数据从头发送）
    pub fn clear_expected_prefix(&mut self) {
        self.expected_prefix = None;
    }

    /// 已捕获的首部（最多 prefix_len 字节）；数据不足首部长度且未读完时返回 None
    pub fn captured_prefix(&self) -> Option<Bytes> {
        if self.prefix.len() >= self.prefix_len || (self.eof && !self.prefix.is_empty()) {
            let len = self.prefix.len().min(self.prefix_len);
            Some(Bytes::copy_from_slice(&self.prefix[..len]))
        } else {
            None
        }
    }

    /// 已从数据源读取的字节数
    pub fn bytes_read(&self) -> u64 {
        self.read_pos
    }

    /// 服务端已确认的偏移
    pub fn acknowledged(&self) -> u64 {
        self.acked
    }

    /// 是否还能从指定偏移重新发送
    pub fn can_rewind_to(&self, offset: u64) -> bool {
        offset >= self.base
    }

    /// 更新服务端确认的偏移
    ///
    /// 低于该偏移的字节被丢弃；偏移回退到已丢弃区间时返回 `RestartNotPossible`
    pub fn acknowledge(&mut self, offset: u64) -> Result<()> {
        if !self.can_rewind_to(offset) {
            return Err(TransferError::RestartNotPossible(format!(
                "需要从偏移 {} 重新发送，但 {} 之前的数据已确认并丢弃",
                offset, self.base
            )));
        }

        self.acked = offset;
        let drop = (offset - self.base).min(self.buffer.len() as u64) as usize;
        self.buffer.advance(drop);
        self.base += drop as u64;
        Ok(())
    }

    /// 取出从已确认偏移开始的下一个分片
    ///
    /// 非最后一片的长度恰好为 `chunk_size`
    pub async fn next_chunk(&mut self, chunk_size: u64) -> Result<Chunk> {
        let start = self.acked;
        // 多读一个字节，才能判断本片是否为最后一片
        self.fill(start + chunk_size + 1).await?;

        let end = (start + chunk_size).min(self.read_pos);
        let data = if end > start {
            let from = (start - self.base) as usize;
            let to = (end - self.base) as usize;
            Bytes::copy_from_slice(&self.buffer[from..to])
        } else {
            Bytes::new()
        };

        Ok(Chunk {
            range_start: start,
            data,
            is_final: self.eof && end == self.read_pos,
        })
    }

    /// 读取数据直到缓冲区覆盖 `upto` 或数据源结束
    async fn fill(&mut self, upto: u64) -> Result<()> {
        while !self.eof && self.read_pos < upto {
            match self.rx.recv().await {
                Some(SourceEvent::Data(data)) => self.push(data)?,
                Some(SourceEvent::Eof) => {
                    self.eof = true;
                    self.verify_prefix()?;
                    debug!("数据源读取完毕: {} 字节", self.read_pos);
                }
                Some(SourceEvent::Error(e)) => {
                    return Err(TransferError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("读取数据源失败: {}", e),
                    )));
                }
                None => {
                    return Err(TransferError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "数据源意外关闭",
                    )));
                }
            }
        }
        Ok(())
    }

    fn push(&mut self, data: Bytes) -> Result<()> {
        let start = self.read_pos;
        self.read_pos += data.len() as u64;
        self.capture_prefix(start, &data)?;

        // 已确认的字节直接跳过
        let keep_from = self.acked.max(start);
        if keep_from >= self.read_pos {
            self.buffer.clear();
            self.base = self.read_pos;
            return Ok(());
        }

        if self.buffer.is_empty() {
            self.base = keep_from;
        }
        let skip = (keep_from - start) as usize;
        self.buffer.extend_from_slice(&data[skip..]);
        Ok(())
    }

    fn capture_prefix(&mut self, start: u64, data: &[u8]) -> Result<()> {
        let captured = self.prefix.len() as u64;
        if start != captured || self.prefix.len() >= self.capture_len {
            return Ok(());
        }
        let take = (self.capture_len - self.prefix.len()).min(data.len());
        self.prefix.extend_from_slice(&data[..take]);
        self.verify_prefix()
    }

    fn verify_prefix(&mut self) -> Result<()> {
        let expected = match &self.expected_prefix {
            Some(expected) => expected,
            None => return Ok(()),
        };

        if self.prefix.len() < expected.len() && !self.eof {
            return Ok(());
        }

        let matches = self.prefix.len() >= expected.len()
            && self.prefix[..expected.len()] == expected[..];
        if !matches {
            return Err(TransferError::ContentMismatch);
        }

        self.expected_prefix = None;
        Ok(())
    }
}

impl Drop for ChunkPipeline {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
