//! 存储空间探测

use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::debug;

/// 可用空间探测
pub trait SpaceProbe: Send + Sync {
    /// 路径所在存储的可用字节数，无法判断时为 None
    fn usable_space(&self, path: &Path) -> Option<u64>;
}

/// 基于 sysinfo 的磁盘空间探测
///
/// 按挂载点最长前缀匹配路径所在的磁盘
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskSpaceProbe;

impl DiskSpaceProbe {
    pub fn new() -> Self {
        Self
    }
}

impl SpaceProbe for DiskSpaceProbe {
    fn usable_space(&self, path: &Path) -> Option<u64> {
        let path = existing_ancestor(path)?;
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;
        debug!(
            "路径 {:?} 位于 {:?}，可用空间 {} bytes",
            path,
            disk.mount_point(),
            disk.available_space()
        );
        Some(disk.available_space())
    }
}

/// 路径本身可能还未创建，向上找到第一个存在的目录
fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    absolute
        .ancestors()
        .find(|p| p.exists())
        .and_then(|p| p.canonicalize().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_existing_ancestor() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("a/b/c");
        let found = existing_ancestor(&missing).unwrap();
        assert_eq!(found, temp.path().canonicalize().unwrap());
    }

    #[test]
    fn test_probe_does_not_panic() {
        let temp = TempDir::new().unwrap();
        // 容器环境下可能找不到挂载点，只要求不出错
        let _ = DiskSpaceProbe::new().usable_space(temp.path());
    }
}
