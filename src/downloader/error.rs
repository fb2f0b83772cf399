//! 下载错误码
//!
//! 失败只记录在下载状态上（错误码 + Failed 状态），不会跨线程抛出。
//! 错误码范围：60001 - 60099

use serde::{Deserialize, Serialize};

/// 下载失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// 存储空间不足
    #[error("可用存储空间不足")]
    UsableSpaceNotEnough,
    /// 网络不可用
    #[error("网络不可用")]
    NetworkUnavailable,
    /// 服务器返回错误状态码
    #[error("HTTP错误: {0}")]
    HttpStatus(u16),
    /// 无法获取文件长度
    #[error("无法获取文件长度")]
    ContentLengthNotFound,
    /// 本地文件读写失败
    #[error("文件读写失败")]
    FileIo,
    /// 合并后文件长度与预期不一致
    #[error("文件长度校验失败")]
    LengthMismatch,
    /// MD5 校验失败
    #[error("MD5校验失败")]
    Md5Mismatch,
    /// 未知错误
    #[error("未知错误")]
    Unknown,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::UsableSpaceNotEnough => 60001,
            Self::NetworkUnavailable => 60002,
            Self::HttpStatus(_) => 60003,
            Self::ContentLengthNotFound => 60004,
            Self::FileIo => 60005,
            Self::LengthMismatch => 60006,
            Self::Md5Mismatch => 60007,
            Self::Unknown => 60099,
        }
    }

    /// 提示信息
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// 是否为网络类错误（可以通过重试恢复）
    pub fn is_network(&self) -> bool {
        matches!(self, Self::NetworkUnavailable | Self::HttpStatus(_))
    }
}
