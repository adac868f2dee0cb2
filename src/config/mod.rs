// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 可续传上传的字节粒度：非最后一个分片的大小必须是它的整数倍
pub const UPLOAD_GRANULARITY: u64 = 256 * 1024;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 存储服务配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 重试配置
    #[serde(default)]
    pub retry: RetryConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 存储服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON API 地址
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    /// XML API 地址（分段上传使用）
    #[serde(default = "default_xml_endpoint")]
    pub xml_endpoint: String,
    /// 请求者付费项目
    #[serde(default)]
    pub user_project: Option<String>,
    /// 单个请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_xml_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            xml_endpoint: default_xml_endpoint(),
            user_project: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 可续传上传的分片大小（字节，必须是 256KB 的整数倍）
    #[serde(default = "default_upload_chunk_size")]
    pub chunk_size: u64,
    /// 小于该大小的文件使用单次请求上传
    #[serde(default = "default_resumable_threshold")]
    pub resumable_threshold: u64,
    /// 缓存到会话记录中的数据首部长度（用于续传内容一致性校验）
    #[serde(default = "default_first_chunk_prefix")]
    pub first_chunk_prefix: usize,
    /// 最大同时上传文件数
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    /// 分段上传时最大并发分段数
    #[serde(default = "default_max_concurrent_parts")]
    pub max_concurrent_parts: usize,
    /// 分段上传的分段大小（字节）
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// 分段失败时是否自动放弃整个分段上传
    #[serde(default = "default_auto_abort_on_failure")]
    pub auto_abort_on_failure: bool,
}

fn default_upload_chunk_size() -> u64 {
    32 * UPLOAD_GRANULARITY // 8MB
}

fn default_resumable_threshold() -> u64 {
    5 * 1024 * 1024
}

fn default_first_chunk_prefix() -> usize {
    512
}

fn default_max_concurrent_files() -> usize {
    10
}

fn default_max_concurrent_parts() -> usize {
    5
}

fn default_part_size() -> u64 {
    32 * 1024 * 1024
}

fn default_auto_abort_on_failure() -> bool {
    true
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_upload_chunk_size(),
            resumable_threshold: default_resumable_threshold(),
            first_chunk_prefix: default_first_chunk_prefix(),
            max_concurrent_files: default_max_concurrent_files(),
            max_concurrent_parts: default_max_concurrent_parts(),
            part_size: default_part_size(),
            auto_abort_on_failure: default_auto_abort_on_failure(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 分片大小（字节）
    #[serde(default = "default_download_chunk_size")]
    pub chunk_size: u64,
    /// 单个对象的最大并发分片数
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// 最大同时下载文件数
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    /// 下载完成后是否校验 CRC32C
    #[serde(default = "default_validate_checksum")]
    pub validate_checksum: bool,
}

fn default_download_chunk_size() -> u64 {
    32 * 1024 * 1024
}

fn default_max_concurrent_chunks() -> usize {
    5
}

fn default_validate_checksum() -> bool {
    true
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_download_chunk_size(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            max_concurrent_files: default_max_concurrent_files(),
            validate_checksum: default_validate_checksum(),
        }
    }
}

/// 幂等性判定策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStrategy {
    /// 所有请求都视为幂等
    RetryAlways,
    /// 仅携带前置条件 / ETag / 会话 URI 的请求视为幂等
    RetryConditional,
    /// 从不重试
    RetryNever,
}

impl Default for IdempotencyStrategy {
    fn default() -> Self {
        Self::RetryConditional
    }
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 是否自动重试
    #[serde(default = "default_auto_retry")]
    pub auto_retry: bool,
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 退避倍数
    #[serde(default = "default_retry_delay_multiplier")]
    pub retry_delay_multiplier: f64,
    /// 单次退避上限（秒）
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
    /// 从第一次尝试起的总时间预算（秒）
    #[serde(default = "default_total_timeout_secs")]
    pub total_timeout_secs: u64,
    /// 幂等性判定策略
    #[serde(default)]
    pub idempotency: IdempotencyStrategy,
}

fn default_auto_retry() -> bool {
    true
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_multiplier() -> f64 {
    2.0
}

fn default_max_retry_delay_secs() -> u64 {
    64
}

fn default_total_timeout_secs() -> u64 {
    600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            auto_retry: default_auto_retry(),
            max_retries: default_max_retries(),
            retry_delay_multiplier: default_retry_delay_multiplier(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
            total_timeout_secs: default_total_timeout_secs(),
            idempotency: IdempotencyStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// 单次退避上限
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    /// 总时间预算
    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 上传会话缓存文件
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
}

fn default_session_file() -> PathBuf {
    PathBuf::from("config/resumable-sessions.json")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            session_file: default_session_file(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.upload.chunk_size == 0 || self.upload.chunk_size % UPLOAD_GRANULARITY != 0 {
            anyhow::bail!(
                "上传分片大小必须是 {} 字节的整数倍，当前为 {}",
                UPLOAD_GRANULARITY,
                self.upload.chunk_size
            );
        }
        if self.upload.part_size == 0 || self.download.chunk_size == 0 {
            anyhow::bail!("分段大小和下载分片大小必须大于 0");
        }
        if self.upload.max_concurrent_files == 0
            || self.upload.max_concurrent_parts == 0
            || self.download.max_concurrent_chunks == 0
            || self.download.max_concurrent_files == 0
        {
            anyhow::bail!("并发数必须大于 0");
        }
        if self.retry.retry_delay_multiplier < 1.0 {
            anyhow::bail!(
                "退避倍数不能小于 1，当前为 {}",
                self.retry.retry_delay_multiplier
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.upload.max_concurrent_files, 10);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.idempotency, IdempotencyStrategy::RetryConditional);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.max_concurrent_files = 3;
        config.retry.idempotency = IdempotencyStrategy::RetryAlways;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.max_concurrent_files, 3);
        assert_eq!(loaded.retry.idempotency, IdempotencyStrategy::RetryAlways);
        assert_eq!(loaded.storage.api_endpoint, config.storage.api_endpoint);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [retry]
            max_retries = 2
            idempotency = "retry_never"
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.idempotency, IdempotencyStrategy::RetryNever);
        assert_eq!(config.retry.max_retry_delay_secs, 64);
        assert_eq!(config.upload.first_chunk_prefix, 512);
    }

    #[test]
    fn test_chunk_size_must_be_aligned() {
        let mut config = AppConfig::default();
        config.upload.chunk_size = UPLOAD_GRANULARITY + 1;
        assert!(config.validate().is_err());

        config.upload.chunk_size = 4 * UPLOAD_GRANULARITY;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = AppConfig::default();
        config.download.max_concurrent_chunks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }
}
