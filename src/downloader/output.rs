use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 下载输出文件
///
/// 持有最终保存路径，以及可选的目标存储 scheme URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    path: PathBuf,
    scheme: Option<String>,
}

impl OutputFile {
    pub fn new(path: impl Into<PathBuf>, scheme: Option<String>) -> Self {
        Self {
            path: path.into(),
            scheme,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    /// 文件名
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// 磁盘上的实际长度，不存在时为 0
    pub fn length(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// 删除文件（不存在时忽略）
    pub fn delete(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("已删除输出文件: {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除输出文件失败: {:?}, 错误: {}", self.path, e),
        }
    }

    /// 重命名为新路径
    pub fn rename_to(&mut self, new_path: impl Into<PathBuf>) -> io::Result<()> {
        let new_path = new_path.into();
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&self.path, &new_path)?;
        self.path = new_path;
        Ok(())
    }

    /// 更换路径，路径确实变化时返回 true
    ///
    /// 调用方负责处理路径变化带来的后果（见 `DownloadState::on_output_path_changed`）
    pub fn set_path(&mut self, new_path: impl Into<PathBuf>) -> bool {
        let new_path = new_path.into();
        if new_path == self.path {
            return false;
        }
        self.path = new_path;
        true
    }
}
