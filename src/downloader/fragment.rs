//! 分片文件布局
//!
//! 每个 url 对应一个临时目录，目录内是编号的分片文件：
//!
//! ```text
//! {cache_dir}/.pump_temp/{md5(url)}/
//! ├── DOWNLOAD_PART-0
//! ├── DOWNLOAD_PART-1
//! └── ...
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 分片文件名前缀
pub const FRAGMENT_PREFIX: &str = "DOWNLOAD_PART-";

/// 临时目录名
pub const TEMP_DIR_NAME: &str = ".pump_temp";

/// url 对应的分片临时目录
pub fn temp_dir_for(cache_dir: &Path, url: &str) -> PathBuf {
    cache_dir
        .join(TEMP_DIR_NAME)
        .join(format!("{:x}", md5::compute(url.as_bytes())))
}

/// 第 index 个分片文件路径
pub fn fragment_path(temp_dir: &Path, index: usize) -> PathBuf {
    temp_dir.join(format!("{}{}", FRAGMENT_PREFIX, index))
}

/// 从分片文件名解析编号，非分片文件返回 None
pub fn fragment_index(name: &str) -> Option<usize> {
    name.strip_prefix(FRAGMENT_PREFIX)?.parse().ok()
}

/// 列出目录下所有分片文件及其长度（按编号排序）
///
/// 目录不存在时返回空列表
pub fn list_fragments(temp_dir: &Path) -> Vec<(PathBuf, u64)> {
    let entries = match fs::read_dir(temp_dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("读取分片目录失败: {:?}, 错误: {}", temp_dir, e);
            }
            return Vec::new();
        }
    };

    let mut fragments: Vec<(usize, PathBuf, u64)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let index = fragment_index(name.to_str()?)?;
            let len = entry.metadata().ok().filter(|m| m.is_file())?.len();
            Some((index, entry.path(), len))
        })
        .collect();
    fragments.sort_by_key(|(index, _, _)| *index);

    fragments.into_iter().map(|(_, path, len)| (path, len)).collect()
}

/// 删除分片目录（不存在时忽略）
pub fn delete_dir(temp_dir: &Path) {
    match fs::remove_dir_all(temp_dir) {
        Ok(()) => debug!("已删除分片目录: {:?}", temp_dir),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除分片目录失败: {:?}, 错误: {}", temp_dir, e),
    }
}
