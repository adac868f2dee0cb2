// 上传引擎模块
//
// - 可续传上传：会话状态机 + 分片流水线
// - 并行分段上传：分段规划 + 并发上传 + 失败回收

pub mod chunk;
pub mod multipart;
pub mod pipeline;
pub mod resumable;
pub mod session;

pub use chunk::{read_range, PartPlan, UploadPart, MAX_PART_COUNT};
pub use multipart::{MultipartClient, MultipartOptions, MultipartOutcome, MultipartUploader};
pub use pipeline::{align_chunk_size, Chunk, ChunkPipeline};
pub use resumable::ResumableUpload;
pub use session::{SessionState, UploadControl, UploadProgress, UploadSession};

/// 根据内容大小选择上传方式
///
/// # 参数
/// * `size` - 内容大小（未知时为 None）
/// * `threshold` - 可续传阈值
///
/// # 返回
/// 是否使用可续传上传；大小未知时总是使用可续传上传
pub fn should_use_resumable(size: Option<u64>, threshold: u64) -> bool {
    match size {
        Some(size) => size >= threshold,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_use_resumable() {
        assert!(!should_use_resumable(Some(10), 100));
        assert!(should_use_resumable(Some(100), 100));
        assert!(should_use_resumable(None, 100));
    }
}
