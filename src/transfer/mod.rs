// 传输模块
//
// 批量传输：任务模型 + 并行协调器 + 文件上传 / 下载执行者

pub mod coordinator;
pub mod job;
pub mod manager;
pub mod workers;

pub use coordinator::{TransferCoordinator, TransferWorker, DEFAULT_CONCURRENCY_LIMIT};
pub use job::{BatchReport, JobStatus, TransferEndpoint, TransferJob, TransferOutput};
pub use manager::TransferManager;
pub use workers::{expand_upload_jobs, FileDownloadWorker, FileUploadWorker};
