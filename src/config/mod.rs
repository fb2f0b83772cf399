// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 单个任务最多分片线程数
pub const MAX_THREAD_NUM: u32 = 32;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
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

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 缓存目录（分片临时目录、未指定路径时的默认保存目录）
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// 数据目录（下载记录）
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 最大同时下载任务数
    #[serde(default = "default_max_running_tasks")]
    pub max_running_tasks: usize,
    /// 单个任务的分片线程数
    #[serde(default = "default_thread_num")]
    pub thread_num: u32,
    /// 最小可用空间（字节），低于此值拒绝下载
    #[serde(default = "default_min_usable_space")]
    pub min_usable_space: u64,
    /// 准入时是否检查可用空间
    #[serde(default = "default_check_usable_space")]
    pub check_usable_space: bool,
    /// 进度推送间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 请求超时（秒）：连接超时以及数据流空闲超时
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_running_tasks() -> usize {
    3
}

fn default_thread_num() -> u32 {
    3
}

fn default_min_usable_space() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_check_usable_space() -> bool {
    true
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            data_dir: default_data_dir(),
            max_running_tasks: default_max_running_tasks(),
            thread_num: default_thread_num(),
            min_usable_space: default_min_usable_space(),
            check_usable_space: default_check_usable_space(),
            progress_interval_ms: default_progress_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl DownloadConfig {
    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.thread_num == 0 || self.thread_num > MAX_THREAD_NUM {
            anyhow::bail!(
                "分片线程数必须在 1-{} 之间，当前: {}",
                MAX_THREAD_NUM,
                self.thread_num
            );
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("请求超时必须大于 0");
        }
        if self.cache_dir.as_os_str().is_empty() || self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("缓存目录和数据目录不能为空");
        }
        Ok(())
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.download.validate().context("配置文件中的下载配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.download.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 首次启动：自动创建缓存和数据目录
                for dir in [&default_config.download.cache_dir, &default_config.download.data_dir] {
                    if !dir.exists() {
                        if let Err(e) = std::fs::create_dir_all(dir) {
                            tracing::error!("无法创建目录 {:?}: {}", dir, e);
                        } else {
                            tracing::info!("✓ 已创建目录: {:?}", dir);
                        }
                    }
                }

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }

                default_config
            }
        }
    }
}
