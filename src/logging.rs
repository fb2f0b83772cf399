//! 日志系统配置
//!
//! 支持控制台输出和文件持久化，日志文件按天滚动，自动清理过期日志

use crate::config::LogConfig;
use chrono::Local;
use std::fs;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "pump";
/// 日志文件扩展名
const LOG_FILE_SUFFIX: &str = "log";

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// # Arguments
/// * `config` - 日志配置
///
/// # Returns
/// * `LogGuard` - 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    // 环境变量 RUST_LOG 优先
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    // 控制台输出层
    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(true);

    if !config.enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    }

    // 文件名格式: pump.YYYY-MM-DD.log
    let appender = match fs::create_dir_all(&config.log_dir)
        .map_err(|e| e.to_string())
        .and_then(|_| build_appender(&config.log_dir).map_err(|e| e.to_string()))
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("创建日志文件失败: {:?}, 错误: {}, 回退到仅控制台输出", config.log_dir, e);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
            return LogGuard { _file_guard: None };
        }
    };

    // 非阻塞写入
    let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);

    // 文件输出层（不带 ANSI 颜色）
    let file_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}",
        config.log_dir, config.retention_days, config.level
    );

    let deleted = cleanup_old_logs(&config.log_dir, config.retention_days);
    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

fn build_appender(log_dir: &Path) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .build(log_dir)
}

/// 清理过期日志文件，返回删除数量
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted_count = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(filename) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(date) = extract_date_from_filename(filename) else {
            continue;
        };

        if today.signed_duration_since(date) > retention {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e);
            } else {
                deleted_count += 1;
                tracing::debug!("已删除过期日志文件: {:?}", path);
            }
        }
    }
    deleted_count
}

/// 从文件名中提取日期：pump.YYYY-MM-DD.log -> YYYY-MM-DD
fn extract_date_from_filename(filename: &str) -> Option<chrono::NaiveDate> {
    let name = filename.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    let name = name.strip_suffix(LOG_FILE_SUFFIX)?.strip_suffix('.')?;
    chrono::NaiveDate::parse_from_str(name, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_extract_date() {
        assert_eq!(
            extract_date_from_filename("pump.2025-01-31.log"),
            chrono::NaiveDate::from_ymd_opt(2025, 1, 31)
        );
        assert!(extract_date_from_filename("pump.log").is_none());
        assert!(extract_date_from_filename("other.2025-01-31.log").is_none());
        assert!(extract_date_from_filename("pump.2025-01-31.txt").is_none());
    }

    #[test]
    fn test_cleanup_old_logs() {
        let temp = TempDir::new().unwrap();
        let today = Local::now().date_naive();
        let old = today - chrono::Duration::days(30);
        let recent_name = format!("pump.{}.log", today.format("%Y-%m-%d"));
        let old_name = format!("pump.{}.log", old.format("%Y-%m-%d"));
        fs::write(temp.path().join(&recent_name), b"recent").unwrap();
        fs::write(temp.path().join(&old_name), b"old").unwrap();
        fs::write(temp.path().join("notes.txt"), b"keep").unwrap();

        assert_eq!(cleanup_old_logs(temp.path(), 7), 1);
        assert!(temp.path().join(&recent_name).exists());
        assert!(!temp.path().join(&old_name).exists());
        assert!(temp.path().join("notes.txt").exists());
    }
}
