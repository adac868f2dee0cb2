// 下载引擎模块
//
// 分片并发下载：元数据 -> 预分配文件 -> 区间并发下载 -> CRC32C 合并校验

pub mod chunked;

pub use chunked::{split_ranges, ChunkedDownloader, DownloadChunk, DownloadOutcome};
