//! 元数据文件存储
//!
//! 每个下载任务一个 JSON 文件，文件名为任务ID的 md5，扩展名 `.meta`：
//!
//! ```text
//! {data_dir}/records/
//! ├── {md5(id)}.meta
//! └── ...
//! ```
//!
//! 写入时先写临时文件，再原子重命名，防止写入中断导致文件损坏

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::store::DownloadStore;
use super::types::DownloadRecord;

/// 元数据文件扩展名
const META_EXTENSION: &str = "meta";

/// 记录目录名
pub const RECORDS_DIR_NAME: &str = "records";

/// 基于 JSON 文件的下载记录存储
pub struct MetadataStore {
    dir: PathBuf,
    /// 串行化同一进程内的写操作
    write_lock: Mutex<()>,
}

impl MetadataStore {
    /// 在 `{data_dir}/records` 下创建存储
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self::with_dir(data_dir.as_ref().join(RECORDS_DIR_NAME))
    }

    /// 直接指定记录目录
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 记录文件路径：`{dir}/{md5(id)}.meta`
    pub fn record_path(&self, id: &str) -> PathBuf {
        let digest = md5::compute(id.as_bytes());
        self.dir.join(format!("{:x}.{}", digest, META_EXTENSION))
    }

    fn ensure_dir(&self) -> io::Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
            debug!("已创建目录: {:?}", self.dir);
        }
        Ok(())
    }

    fn load_from_path(path: &Path) -> Result<DownloadRecord> {
        let file = File::open(path).with_context(|| format!("打开记录文件失败: {:?}", path))?;
        let record = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("解析记录文件失败: {:?}", path))?;
        Ok(record)
    }
}

impl DownloadStore for MetadataStore {
    fn get(&self, id: &str) -> Result<Option<DownloadRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let record = Self::load_from_path(&path)?;
        // md5 冲突或文件被替换
        if record.id != id {
            warn!("记录文件 {:?} 的任务ID不匹配: {} != {}", path, record.id, id);
            return Ok(None);
        }
        Ok(Some(record))
    }

    fn upsert(&self, record: &DownloadRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.ensure_dir()
            .with_context(|| format!("创建记录目录失败: {:?}", self.dir))?;

        let path = self.record_path(&record.id);
        let temp_path = path.with_extension("meta.tmp");

        let file = File::create(&temp_path)
            .with_context(|| format!("创建临时文件失败: {:?}", temp_path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, record).context("序列化下载记录失败")?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &path)
            .with_context(|| format!("重命名记录文件失败: {:?}", path))?;

        debug!("已保存下载记录: {:?} (id={})", path, record.id);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("已删除下载记录: {:?} (id={})", path, id);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("删除记录文件失败: {:?}", path)),
        }
    }

    fn list(&self) -> Result<Vec<DownloadRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for entry in fs::read_dir(&self.dir).with_context(|| format!("读取记录目录失败: {:?}", self.dir))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXTENSION) {
                continue;
            }
            match Self::load_from_path(&path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("跳过无效记录文件 {:?}: {:#}", path, e);
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            warn!("扫描下载记录完成，跳过 {} 个无效文件", skipped);
        }
        records.sort_by_key(|r| r.create_time);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::error::ErrorCode;
    use tempfile::TempDir;

    fn record(id: &str, create_time: i64) -> DownloadRecord {
        DownloadRecord {
            id: id.to_string(),
            url: format!("https://example.com/{}", id),
            tag: Some("video".to_string()),
            file_path: Some(PathBuf::from(format!("/tmp/{}", id))),
            scheme: None,
            create_time,
            content_length: Some(1024),
            finished: false,
            thread_num: 3,
            transfer_encoding: None,
            md5: None,
            error_code: None,
            updated_at: 0,
        }
    }

    #[test]
    fn test_record_path_uses_md5() {
        let temp = TempDir::new().unwrap();
        let store = MetadataStore::new(temp.path());
        let path = store.record_path("a");
        assert_eq!(
            path,
            temp.path().join("records/0cc175b9c0f1b6a831c399e269772661.meta")
        );
    }

    #[test]
    fn test_upsert_get_delete() {
        let temp = TempDir::new().unwrap();
        let store = MetadataStore::new(temp.path());
        assert!(store.get("a").unwrap().is_none());

        let mut rec = record("a", 1);
        store.upsert(&rec).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(rec.clone()));

        rec.finished = true;
        rec.error_code = Some(ErrorCode::Md5Mismatch);
        store.upsert(&rec).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(rec));
        // 临时文件不残留
        assert!(!store.record_path("a").with_extension("meta.tmp").exists());

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn test_list_skips_invalid_files() {
        let temp = TempDir::new().unwrap();
        let store = MetadataStore::new(temp.path());
        store.upsert(&record("b", 2)).unwrap();
        store.upsert(&record("a", 1)).unwrap();
        fs::write(store.dir().join("broken.meta"), b"not json").unwrap();
        fs::write(store.dir().join("other.txt"), b"ignored").unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_list_without_dir() {
        let temp = TempDir::new().unwrap();
        let store = MetadataStore::new(temp.path().join("missing"));
        assert!(store.list().unwrap().is_empty());
    }
}
