use clap::Parser;
use pump_rs::{
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    downloader::{format_size, DiskSpaceProbe},
    logging, ChannelObserver, DownloadManager, DownloadObserver, DownloadRequest, DownloadSnapshot,
    HttpTransfer, MetadataStore, TaskStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 并发、可断点续传的文件下载器
#[derive(Parser)]
#[command(name = "pump")]
#[command(about = "Concurrent, resumable file downloader")]
#[command(version)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 要下载的地址
    #[arg(required = true)]
    urls: Vec<String>,
}

fn print_progress(snapshot: &DownloadSnapshot) {
    let total = snapshot
        .content_length
        .map(format_size)
        .unwrap_or_else(|| "未知".to_string());
    let progress = snapshot
        .progress
        .map(|p| format!("{}%", p))
        .unwrap_or_else(|| "-".to_string());
    match (&snapshot.status, &snapshot.error_code) {
        (Some(TaskStatus::Failed), Some(code)) => {
            error!("[{}] 下载失败: {} ({})", snapshot.name, code, code.code())
        }
        _ => info!(
            "[{}] {:?} {} {}/{} {}",
            snapshot.name,
            snapshot.status,
            progress,
            format_size(snapshot.completed_size),
            total,
            snapshot.speed
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config).await;

    // 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("Pump v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let (observer, mut snapshots) = ChannelObserver::channel();
    let observer: Arc<dyn DownloadObserver> = Arc::new(observer);
    let transfer = Arc::new(HttpTransfer::new(&config.download, Some(observer.clone()))?);
    let store = Arc::new(MetadataStore::new(&config.download.data_dir));

    let manager = DownloadManager::builder(config.download.clone(), store, transfer)
        .observer(observer)
        .space_probe(Arc::new(DiskSpaceProbe::new()))
        .build();

    let mut pending: HashMap<String, Option<TaskStatus>> = HashMap::new();
    for url in cli.urls {
        let request = DownloadRequest::new(url);
        pending.insert(request.id.clone(), None);
        manager.submit(request);
    }

    loop {
        tokio::select! {
            snapshot = snapshots.recv() => {
                let Some(snapshot) = snapshot else {
                    break;
                };
                print_progress(&snapshot);
                if let Some(status) = pending.get_mut(&snapshot.id) {
                    *status = snapshot.status;
                }
                pending.retain(|_, status| !status.map(|s| s.is_terminal()).unwrap_or(false));
                if pending.is_empty() {
                    info!("全部任务已结束");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("收到 Ctrl+C，停止下载...");
                break;
            }
        }
    }

    manager.shutdown();
    info!("应用已安全退出");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_urls() {
        assert!(Cli::try_parse_from(["pump"]).is_err());
    }

    #[test]
    fn test_cli_parses_config_and_urls() {
        let cli = Cli::try_parse_from(["pump", "https://example.com/a.bin"]).unwrap();
        assert_eq!(cli.config, DEFAULT_CONFIG_PATH);
        assert_eq!(cli.urls, vec!["https://example.com/a.bin".to_string()]);

        let cli = Cli::try_parse_from([
            "pump",
            "--config",
            "/etc/pump.toml",
            "https://example.com/a.bin",
            "https://example.com/b.bin",
        ])
        .unwrap();
        assert_eq!(cli.config, "/etc/pump.toml");
        assert_eq!(cli.urls.len(), 2);
    }
}
