// 分段规划与本地文件区间读取
//
// 分段上传把文件切成编号从 1 开始的分段；除最后一段外大小相同

use crate::error::{Result, TransferError};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 分段编号上限
pub const MAX_PART_COUNT: u32 = 10_000;

/// 一个分段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPart {
    /// 分段编号（从 1 开始）
    pub number: u32,
    /// 字节范围
    pub range: Range<u64>,
}

impl UploadPart {
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 分段规划
#[derive(Debug, Clone)]
pub struct PartPlan {
    parts: Vec<UploadPart>,
    total_size: u64,
    part_size: u64,
}

impl PartPlan {
    /// 按分段大小切分
    ///
    /// 分段数超过上限时自动放大分段大小；空文件也占一个空分段
    pub fn new(total_size: u64, part_size: u64) -> Self {
        let mut part_size = part_size.max(1);
        if total_size.div_ceil(part_size) > MAX_PART_COUNT as u64 {
            part_size = total_size.div_ceil(MAX_PART_COUNT as u64);
        }

        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut number = 1u32;
        while offset < total_size {
            let end = (offset + part_size).min(total_size);
            parts.push(UploadPart {
                number,
                range: offset..end,
            });
            offset = end;
            number += 1;
        }
        if parts.is_empty() {
            parts.push(UploadPart {
                number: 1,
                range: 0..0,
            });
        }

        info!(
            "创建分段规划: 文件大小={} bytes, 分段大小={} bytes, 分段数量={}",
            total_size,
            part_size,
            parts.len()
        );

        Self {
            parts,
            total_size,
            part_size,
        }
    }

    pub fn parts(&self) -> &[UploadPart] {
        &self.parts
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// 尚未完成的分段
    pub fn missing<'a>(&'a self, done: &'a BTreeMap<u32, String>) -> impl Iterator<Item = &'a UploadPart> {
        self.parts.iter().filter(move |p| !done.contains_key(&p.number))
    }
}

/// 读取本地文件的一个区间（阻塞线程池中执行）
pub async fn read_range(path: &Path, range: Range<u64>) -> Result<Bytes> {
    let path: PathBuf = path.to_path_buf();
    let len = (range.end - range.start) as usize;

    tokio::task::spawn_blocking(move || -> Result<Bytes> {
        let mut file = std::fs::File::open(&path)?;
        file.seek(SeekFrom::Start(range.start))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        debug!(
            "读取区间: {:?} bytes={}-{} ({} bytes)",
            path,
            range.start,
            range.end,
            len
        );
        Ok(Bytes::from(buffer))
    })
    .await
    .map_err(|e| TransferError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}
