//! 下载记录存储接口

use super::types::DownloadRecord;
use anyhow::Result;
use dashmap::DashMap;

/// 下载记录存储
///
/// 调度器在准入时读取/创建记录，管理器在任务结束时回写
pub trait DownloadStore: Send + Sync {
    /// 按任务ID读取
    fn get(&self, id: &str) -> Result<Option<DownloadRecord>>;

    /// 新增或覆盖
    fn upsert(&self, record: &DownloadRecord) -> Result<()>;

    /// 删除，记录存在时返回 true
    fn delete(&self, id: &str) -> Result<bool>;

    /// 全部记录，按创建时间排序
    fn list(&self) -> Result<Vec<DownloadRecord>>;
}

/// 内存存储（不落盘，进程退出即丢失）
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, DownloadRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl DownloadStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Option<DownloadRecord>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    fn upsert(&self, record: &DownloadRecord) -> Result<()> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.remove(id).is_some())
    }

    fn list(&self) -> Result<Vec<DownloadRecord>> {
        let mut records: Vec<DownloadRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.create_time);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        let record = DownloadRecord {
            id: "a".to_string(),
            url: "https://example.com/a".to_string(),
            tag: None,
            file_path: None,
            scheme: None,
            create_time: 5,
            content_length: None,
            finished: false,
            thread_num: 0,
            transfer_encoding: None,
            md5: None,
            error_code: None,
            updated_at: 0,
        };
        store.upsert(&record).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap(), Some(record));
        assert_eq!(store.list().unwrap().len(), 1);
        assert!(store.delete("a").unwrap());
        assert!(store.get("a").unwrap().is_none());
    }
}
