// Object Storage Transfer Engine
// 对象存储传输引擎核心库

// 完整性校验模块
pub mod checksum;

// 配置管理模块
pub mod config;

// 错误定义
pub mod error;

// 日志系统
pub mod logging;

// 重试策略模块
pub mod retry;

// HTTP 执行器
pub mod http;

// 存储 API 客户端
pub mod client;

// 会话持久化模块
pub mod persistence;

// 上传引擎模块
pub mod uploader;

// 下载引擎模块
pub mod downloader;

// 批量传输模块
pub mod transfer;

// 导出常用类型
pub use checksum::Crc32c;
pub use client::{ObjectMetadata, ObjectRef, StorageClient, UploadOptions};
pub use config::AppConfig;
pub use downloader::ChunkedDownloader;
pub use error::{ErrorDetail, Result, TransferError};
pub use persistence::{FileSessionStore, MemorySessionStore, SessionStore};
pub use retry::{RetryPolicy, RetryStrategy};
pub use uploader::{MultipartUploader, ResumableUpload, SessionState, UploadControl};

// 导出批量传输相关类型
pub use transfer::{
    BatchReport, TransferCoordinator, TransferJob, TransferManager, TransferOutput, TransferWorker,
};
