use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storage_transfer_rust::{
    client::ObjectRef,
    config::AppConfig,
    http::{Authenticator, BearerTokenAuthenticator, HttpExecutor, NoAuth, ReqwestExecutor},
    logging,
    uploader::MultipartOutcome,
    BatchReport, TransferManager, UploadOptions,
};
use tracing::{info, warn};

const TOKEN_ENV: &str = "STORAGE_ACCESS_TOKEN";

#[derive(Parser)]
#[command(name = "storage-transfer")]
#[command(version, about = "对象存储传输工具", long_about = None)]
struct Cli {
    /// 配置文件路径
    #[arg(
        short = 'c',
        long = "config",
        value_name = "PATH",
        default_value = "config/app.toml",
        global = true
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 上传本地文件或目录（目录递归展开）
    Upload {
        /// 目标存储桶
        bucket: String,

        /// 本地文件或目录
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,

        /// 对象名前缀
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// 下载对象并校验 CRC32C
    Download {
        bucket: String,
        object: String,
        dest: PathBuf,
    },
    /// 通过 XML API 分段上传单个文件
    Multipart {
        bucket: String,
        object: String,
        path: PathBuf,
    },
}

/// 加载配置文件，失败时使用默认配置
async fn load_config(path: &Path) -> (AppConfig, Option<anyhow::Error>) {
    match AppConfig::load_from_file(path).await {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    }
}

fn build_authenticator() -> Arc<dyn Authenticator> {
    match std::env::var(TOKEN_ENV) {
        Ok(token) if !token.is_empty() => Arc::new(BearerTokenAuthenticator::new(token)),
        _ => {
            warn!("未设置 {}，请求将不携带认证信息", TOKEN_ENV);
            Arc::new(NoAuth)
        }
    }
}

fn print_report(report: &BatchReport) {
    println!("{}", report.summary());
    for (job, _) in &report.succeeded {
        println!("  ✓ {} -> {}", job.source, job.destination);
    }
    for (job, err) in &report.failed {
        eprintln!("  ✗ {} -> {}: {}", job.source, job.destination, err);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config, load_error) = load_config(&cli.config).await;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    if let Some(e) = load_error {
        warn!("加载配置文件 {:?} 失败，使用默认配置: {:#}", cli.config, e);
    }
    config.validate().context("配置校验失败")?;

    info!("Storage Transfer v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let executor: Arc<dyn HttpExecutor> = Arc::new(
        ReqwestExecutor::new(
            Duration::from_secs(config.storage.request_timeout_secs),
            build_authenticator(),
        )
        .context("创建 HTTP 客户端失败")?,
    );
    let manager = Arc::new(TransferManager::new(config, executor));

    // Ctrl-C 取消所有传输
    let signal_manager = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消传输...");
            signal_manager.cancel_all();
        }
    });

    match cli.command {
        Command::Upload {
            bucket,
            paths,
            prefix,
        } => {
            let report = manager
                .upload_many(&paths, &bucket, &prefix, UploadOptions::default())
                .await?;
            print_report(&report);
            if !report.is_success() {
                anyhow::bail!("{} 个任务失败", report.failed.len());
            }
        }
        Command::Download {
            bucket,
            object,
            dest,
        } => {
            let object = ObjectRef::new(&bucket, &object);
            let report = manager.download_many(vec![(object, dest)]).await?;
            print_report(&report);
            if !report.is_success() {
                anyhow::bail!("下载失败");
            }
        }
        Command::Multipart {
            bucket,
            object,
            path,
        } => {
            let object = ObjectRef::new(&bucket, &object);
            match manager.upload_file_in_parts(&path, object, None).await? {
                MultipartOutcome::Completed {
                    upload_id, parts, ..
                } => println!("分段上传完成: upload_id={}, 分段数={}", upload_id, parts.len()),
                MultipartOutcome::Aborted { upload_id } => {
                    println!("分段上传已放弃: upload_id={}", upload_id)
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upload() {
        let cli = Cli::try_parse_from([
            "storage-transfer",
            "upload",
            "bucket",
            "a.txt",
            "dir",
            "--prefix",
            "p/",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("config/app.toml"));
        match cli.command {
            Command::Upload {
                bucket,
                paths,
                prefix,
            } => {
                assert_eq!(bucket, "bucket");
                assert_eq!(paths, vec![PathBuf::from("a.txt"), PathBuf::from("dir")]);
                assert_eq!(prefix, "p/");
            }
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn test_parse_download_with_config() {
        let cli = Cli::try_parse_from([
            "storage-transfer",
            "--config",
            "custom.toml",
            "download",
            "bucket",
            "obj",
            "out.bin",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        assert!(matches!(cli.command, Command::Download { ref object, .. } if object == "obj"));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Cli::try_parse_from(["storage-transfer", "upload", "bucket"]).is_err());
        assert!(Cli::try_parse_from(["storage-transfer", "download", "bucket"]).is_err());
        assert!(Cli::try_parse_from(["storage-transfer"]).is_err());
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
