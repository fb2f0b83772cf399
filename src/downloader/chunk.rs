use crate::downloader::error::ErrorCode;
use crate::downloader::fragment;
use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// 分片下载结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// 分片已下载完整
    Completed,
    /// 任务离开运行状态，提前退出
    Interrupted,
}

/// 一个分片负责的字节范围
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 分片索引（对应 `DOWNLOAD_PART-{index}`）
    pub index: usize,
    /// 起始偏移
    pub start: u64,
    /// 结束偏移（不含），None 表示读到流结束
    pub end: Option<u64>,
}

impl Chunk {
    /// 分片大小，长度未知时为 None
    pub fn size(&self) -> Option<u64> {
        self.end.map(|end| end - self.start)
    }

    /// 分片文件路径
    pub fn path(&self, temp_dir: &Path) -> PathBuf {
        fragment::fragment_path(temp_dir, self.index)
    }

    /// 已落盘的字节数（超出分片大小的部分不计）
    pub fn existing_len(&self, temp_dir: &Path) -> u64 {
        let len = std::fs::metadata(self.path(temp_dir)).map(|m| m.len()).unwrap_or(0);
        match self.size() {
            Some(size) => len.min(size),
            None => len,
        }
    }

    /// 下载分片（追加写入分片文件，从已有长度处续传）
    ///
    /// # 参数
    /// * `ranged` - 服务器支持 Range 请求
    /// * `on_bytes` - 每写入一块数据回调一次，返回 false 表示任务已不在运行，立即退出
    pub async fn download<F>(
        &self,
        client: &Client,
        url: &str,
        temp_dir: &Path,
        ranged: bool,
        idle_timeout: Duration,
        on_bytes: F,
    ) -> Result<ChunkOutcome>
    where
        F: Fn(u64) -> bool + Send + Sync,
    {
        let path = self.path(temp_dir);
        let mut existing = self.existing_len(temp_dir);

        if !ranged && existing > 0 {
            // 不支持续传，丢弃旧数据从头开始
            debug!("分片 #{} 不支持续传，丢弃已有 {} bytes", self.index, existing);
            tokio::fs::remove_file(&path).await.ok();
            existing = 0;
        }

        if let Some(size) = self.size() {
            if existing >= size {
                debug!("分片 #{} 已完整，跳过", self.index);
                return Ok(ChunkOutcome::Completed);
            }
        }

        let offset = self.start + existing;
        let mut request = client.get(url);
        if ranged {
            let range = match self.end {
                Some(end) => format!("bytes={}-{}", offset, end - 1),
                None => format!("bytes={}-", offset),
            };
            debug!("分片 #{} 请求范围: {}", self.index, range);
            request = request.header(reqwest::header::RANGE, range);
        }

        let resp = request.send().await.context("发送HTTP请求失败")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ErrorCode::HttpStatus(status.as_u16())).context("HTTP错误");
        }
        if ranged && offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            // 服务器忽略了 Range，返回的是整个文件
            return Err(ErrorCode::HttpStatus(status.as_u16())).context("服务器未按范围返回数据");
        }

        tokio::fs::create_dir_all(temp_dir)
            .await
            .with_context(|| format!("创建分片目录失败: {:?}", temp_dir))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("打开分片文件失败: {:?}", path))?;

        let mut remaining = self.size().map(|size| size - existing);
        let mut stream = resp.bytes_stream();
        let mut outcome = ChunkOutcome::Completed;

        loop {
            let next = tokio::time::timeout(idle_timeout, stream.next())
                .await
                .map_err(|_| ErrorCode::NetworkUnavailable)
                .context("读取数据流超时")?;
            let Some(data) = next else { break };
            let mut data = data.context("读取数据流失败")?;

            if let Some(left) = remaining {
                if data.len() as u64 > left {
                    data.truncate(left as usize);
                }
            }
            file.write_all(&data).await.context("写入分片文件失败")?;

            let written = data.len() as u64;
            if let Some(left) = remaining.as_mut() {
                *left -= written;
            }
            if !on_bytes(written) {
                outcome = ChunkOutcome::Interrupted;
                break;
            }
            if remaining == Some(0) {
                break;
            }
        }

        file.flush().await.context("刷新文件缓冲失败")?;

        if outcome == ChunkOutcome::Completed {
            if let Some(left) = remaining {
                if left > 0 {
                    return Err(ErrorCode::NetworkUnavailable)
                        .with_context(|| format!("分片 #{} 数据流提前结束，缺少 {} bytes", self.index, left));
                }
            }
            debug!("分片 #{} 下载完成", self.index);
        }
        Ok(outcome)
    }
}

/// 划分分片
///
/// 长度未知、服务器不支持 Range 或只用一个线程时只有一个分片；
/// 否则平均分成 `thread_num` 份，余数并入最后一片
pub fn plan_chunks(content_length: Option<u64>, thread_num: u32, ranged: bool) -> Vec<Chunk> {
    let single = |end| vec![Chunk { index: 0, start: 0, end }];
    let Some(total) = content_length else {
        return single(None);
    };
    if !ranged || thread_num <= 1 || total < thread_num as u64 {
        return single(Some(total));
    }

    let count = thread_num as u64;
    let size = total / count;
    (0..count)
        .map(|i| {
            let start = i * size;
            let end = if i == count - 1 { total } else { start + size };
            Chunk {
                index: i as usize,
                start,
                end: Some(end),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_single_chunk_cases() {
        assert_eq!(
            plan_chunks(None, 4, true),
            vec![Chunk { index: 0, start: 0, end: None }]
        );
        assert_eq!(
            plan_chunks(Some(100), 4, false),
            vec![Chunk { index: 0, start: 0, end: Some(100) }]
        );
        assert_eq!(
            plan_chunks(Some(100), 1, true),
            vec![Chunk { index: 0, start: 0, end: Some(100) }]
        );
        assert_eq!(plan_chunks(Some(2), 3, true).len(), 1);
    }

    #[test]
    fn test_remainder_goes_to_last_chunk() {
        let chunks = plan_chunks(Some(10), 3, true);
        let ranges: Vec<(u64, Option<u64>)> = chunks.iter().map(|c| (c.start, c.end)).collect();
        assert_eq!(ranges, vec![(0, Some(3)), (3, Some(6)), (6, Some(10))]);
        assert_eq!(chunks[2].size(), Some(4));
    }

    #[test]
    fn test_existing_len_is_capped() {
        let temp = TempDir::new().unwrap();
        let chunk = Chunk { index: 1, start: 10, end: Some(20) };
        assert_eq!(chunk.existing_len(temp.path()), 0);
        std::fs::write(chunk.path(temp.path()), vec![0u8; 15]).unwrap();
        assert_eq!(chunk.existing_len(temp.path()), 10);
    }

    proptest! {
        #[test]
        fn prop_chunks_cover_whole_file(total in 1u64..10_000_000, threads in 1u32..16) {
            let chunks = plan_chunks(Some(total), threads, true);
            prop_assert_eq!(chunks[0].start, 0);
            prop_assert_eq!(chunks.last().unwrap().end, Some(total));
            for pair in chunks.windows(2) {
                prop_assert_eq!(pair[0].end, Some(pair[1].start));
            }
        }
    }
}
