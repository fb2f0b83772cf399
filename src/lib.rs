// Pump 下载引擎核心库
// 并发、可断点续传的 HTTP 文件下载

// 配置管理模块
pub mod config;

// 下载引擎模块
pub mod downloader;

// 进度事件模块
pub mod events;

// 日志系统模块
pub mod logging;

// 下载记录持久化模块
pub mod persistence;

// 导出常用类型
pub use config::{AppConfig, DownloadConfig, LogConfig};
pub use downloader::{
    DownloadManager, DownloadRequest, DownloadSnapshot, DownloadTask, ErrorCode, HttpTransfer,
    TaskStatus,
};
pub use events::{ChannelObserver, DownloadObserver};
pub use persistence::{DownloadStore, MetadataStore};
