//! 持久化记录类型

use crate::downloader::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 下载任务的持久化记录
///
/// 已下载大小不落盘，恢复时从分片目录重新扫描
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub scheme: Option<String>,
    /// 首次创建时间（毫秒时间戳）
    pub create_time: i64,
    /// None 表示长度未知
    #[serde(default)]
    pub content_length: Option<u64>,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub thread_num: u32,
    #[serde(default)]
    pub transfer_encoding: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub error_code: Option<ErrorCode>,
    /// 最后更新时间（毫秒时间戳）
    #[serde(default)]
    pub updated_at: i64,
}

impl DownloadRecord {
    /// 更新时间戳
    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}
