//! 传输层
//!
//! `Transfer` 是执行器工作线程真正执行下载的地方，`HttpTransfer` 是基于 reqwest 的实现：
//!
//! 1. HEAD 探测文件长度、传输编码和是否支持 Range
//! 2. 按线程数划分分片，每个分片追加写入 `DOWNLOAD_PART-{i}`，从已有长度处续传
//! 3. 全部分片完成后合并为输出文件，校验长度和 MD5
//!
//! 任务状态不再是 Running（暂停/停止/删除）时各分片在写完当前数据块后退出

use crate::config::DownloadConfig;
use crate::downloader::chunk::{plan_chunks, Chunk, ChunkOutcome};
use crate::downloader::error::ErrorCode;
use crate::downloader::fragment;
use crate::downloader::state::{DownloadState, TRANSFER_ENCODING_CHUNKED};
use crate::downloader::task::{DownloadTask, TaskStatus};
use crate::events::{DownloadObserver, ProgressThrottler};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, TRANSFER_ENCODING};
use reqwest::Client;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// 传输实现
#[async_trait]
pub trait Transfer: Send + Sync {
    /// 执行一次下载
    ///
    /// 失败记录在任务状态上，不向调用方返回
    async fn transfer(&self, task: &DownloadTask);
}

/// 服务端探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteInfo {
    content_length: Option<u64>,
    transfer_encoding: Option<String>,
    ranged: bool,
}

/// 一次下载的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferOutcome {
    Finished,
    /// 任务被暂停/停止/删除
    Interrupted,
}

/// 基于 HTTP Range 的分片下载
pub struct HttpTransfer {
    client: Client,
    cache_dir: PathBuf,
    thread_num: u32,
    request_timeout: Duration,
    progress_interval_ms: u64,
    observer: Option<Arc<dyn DownloadObserver>>,
}

impl HttpTransfer {
    /// 按配置创建
    pub fn new(config: &DownloadConfig, observer: Option<Arc<dyn DownloadObserver>>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("pump-rs/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("创建HTTP客户端失败")?;
        Ok(Self::with_client(client, config, observer))
    }

    /// 使用调用方提供的 HTTP 客户端
    pub fn with_client(
        client: Client,
        config: &DownloadConfig,
        observer: Option<Arc<dyn DownloadObserver>>,
    ) -> Self {
        Self {
            client,
            cache_dir: config.cache_dir.clone(),
            thread_num: config.thread_num.max(1),
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            progress_interval_ms: config.progress_interval_ms,
            observer,
        }
    }

    fn publish(&self, state: &Arc<DownloadState>) {
        if let Some(observer) = &self.observer {
            observer.on_progress(&state.snapshot());
        }
    }

    /// HEAD 探测
    async fn probe(&self, url: &str) -> Result<RemoteInfo> {
        let resp = self
            .client
            .head(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .context("探测文件信息失败")?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ErrorCode::HttpStatus(status.as_u16())).context("探测文件信息失败");
        }

        let header = |name: reqwest::header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };
        let info = RemoteInfo {
            content_length: header(CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            transfer_encoding: header(TRANSFER_ENCODING),
            ranged: header(ACCEPT_RANGES).map_or(false, |v| v.eq_ignore_ascii_case("bytes")),
        };
        debug!("探测结果: {} -> {:?}", url, info);
        Ok(info)
    }

    /// 未指定保存路径时保存到缓存目录
    fn ensure_file_path(&self, state: &DownloadState) {
        if state.output_path().is_none() {
            let path = self.cache_dir.join(file_name_from_url(state.url()));
            state.set_file_path(path);
        }
    }

    async fn download(&self, state: &Arc<DownloadState>) -> Result<TransferOutcome> {
        let url = state.url().to_string();
        let info = self.probe(&url).await?;

        let chunked = info
            .transfer_encoding
            .as_deref()
            .map_or(false, |e| e.eq_ignore_ascii_case(TRANSFER_ENCODING_CHUNKED));
        let content_length = info.content_length.filter(|len| *len > 0);
        if content_length.is_none() && !chunked {
            return Err(ErrorCode::ContentLengthNotFound).context("服务器未返回文件长度");
        }

        let temp_dir = state.temp_dir();
        let resume = info.ranged && !state.is_disable_breakpoint_resume();
        if !resume {
            state.delete_temp_dir();
        } else if let (Some(old), Some(new)) = (state.content_length(), content_length) {
            if old != new {
                warn!("任务 {} 远端文件长度变化 {} -> {}，丢弃已下载分片", state.id(), old, new);
                state.delete_temp_dir();
            }
        }

        // 已有分片时沿用上次的线程数，否则分片偏移对不上
        let has_fragments = !fragment::list_fragments(&temp_dir).is_empty();
        let thread_num = match state.thread_num() {
            n if n > 0 && has_fragments => n,
            _ => self.thread_num,
        };
        state.set_thread_num(thread_num);
        state.set_transfer_encoding(info.transfer_encoding.clone());
        state.set_content_length(content_length);

        let chunks = plan_chunks(content_length, thread_num, resume);
        let existing: u64 = chunks.iter().map(|c| c.existing_len(&temp_dir)).sum();
        state.set_completed_size(existing);
        info!(
            "任务 {} 开始下载: 长度={:?}, 分片数={}, 已下载={} bytes",
            state.id(),
            content_length,
            chunks.len(),
            existing
        );

        let throttler = ProgressThrottler::with_millis(self.progress_interval_ms);
        let on_bytes = |bytes: u64| {
            state.download(bytes);
            if throttler.should_emit() {
                self.publish(state);
            }
            // 暂停中（Pausing）也要退出
            state.status() == Some(TaskStatus::Running)
        };

        let outcomes = futures::future::try_join_all(chunks.iter().map(|chunk| {
            chunk.download(
                &self.client,
                &url,
                &temp_dir,
                resume,
                self.request_timeout,
                &on_bytes,
            )
        }))
        .await?;

        if outcomes.contains(&ChunkOutcome::Interrupted) || state.status() != Some(TaskStatus::Running) {
            return Ok(TransferOutcome::Interrupted);
        }

        let output = state.output_path().ok_or(ErrorCode::FileIo).context("输出路径未设置")?;
        merge_chunks(&chunks, &temp_dir, &output).await?;
        state.delete_temp_dir();

        let actual = tokio::fs::metadata(&output)
            .await
            .with_context(|| format!("读取输出文件失败: {:?}", output))?
            .len();
        if let Some(expected) = content_length {
            if actual != expected {
                state.delete_output();
                return Err(ErrorCode::LengthMismatch)
                    .with_context(|| format!("文件长度 {} 与预期 {} 不一致", actual, expected));
            }
        }

        if let Some(expected) = state.md5().filter(|m| !m.is_empty()) {
            let digest = file_md5(&output).await?;
            if !digest.eq_ignore_ascii_case(&expected) {
                state.delete_output();
                return Err(ErrorCode::Md5Mismatch)
                    .with_context(|| format!("MD5 {} 与预期 {} 不一致", digest, expected));
            }
        }

        if state.is_deleted() {
            state.delete_output();
            return Ok(TransferOutcome::Interrupted);
        }

        state.set_completed_size(actual);
        state.set_finished(true);
        state.set_status(TaskStatus::Finished);
        Ok(TransferOutcome::Finished)
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn transfer(&self, task: &DownloadTask) {
        let state = task.state();
        if state.status() != Some(TaskStatus::Waiting) {
            debug!("任务 {} 当前状态 {:?}，跳过执行", task.name(), state.status());
            return;
        }
        state.set_status(TaskStatus::Running);
        state.clear_error_code();
        self.ensure_file_path(state);

        if state.is_finished() {
            if !state.force_retry() {
                info!("任务 {} 已下载完成，跳过", task.name());
                state.calculate_download_progress();
                state.set_status(TaskStatus::Finished);
                self.publish(state);
                return;
            }
            info!("任务 {} 强制重新下载", task.name());
            state.delete_output();
            state.delete_temp_dir();
            state.set_finished(false);
            state.set_completed_size(0);
        }

        self.publish(state);

        match self.download(state).await {
            Ok(TransferOutcome::Finished) => {
                info!("✓ 任务 {} 下载完成: {:?}", task.name(), state.output_path());
            }
            Ok(TransferOutcome::Interrupted) => match state.status() {
                Some(TaskStatus::Pausing) => {
                    state.set_status(TaskStatus::Paused);
                    info!("任务 {} 已暂停，已下载 {} bytes", task.name(), state.completed_size());
                }
                Some(TaskStatus::Deleted) => {
                    state.delete_output();
                    state.delete_temp_dir();
                    info!("任务 {} 已删除", task.name());
                }
                status => info!("任务 {} 已中断，当前状态 {:?}", task.name(), status),
            },
            Err(e) => {
                let code = error_code_of(&e);
                error!("任务 {} 下载失败: {:#}", task.name(), e);
                state.set_error_code(code, false);
            }
        }

        self.publish(state);
    }
}

/// 把分片按编号顺序合并为输出文件
async fn merge_chunks(chunks: &[Chunk], temp_dir: &Path, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("创建输出目录失败: {:?}", parent))?;
    }

    if let [chunk] = chunks {
        let path = chunk.path(temp_dir);
        if tokio::fs::rename(&path, output).await.is_ok() {
            return Ok(());
        }
        // 跨文件系统时 rename 失败，走复制
    }

    let mut file = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("创建输出文件失败: {:?}", output))?;
    for chunk in chunks {
        let path = chunk.path(temp_dir);
        let mut part = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("打开分片文件失败: {:?}", path))?;
        tokio::io::copy(&mut part, &mut file)
            .await
            .with_context(|| format!("合并分片失败: {:?}", path))?;
    }
    file.flush().await.context("刷新文件缓冲失败")?;
    debug!("已合并 {} 个分片到 {:?}", chunks.len(), output);
    Ok(())
}

/// 计算文件 MD5（小写十六进制）
async fn file_md5(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path).with_context(|| format!("打开文件失败: {:?}", path))?;
        let mut context = md5::Context::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).context("读取文件失败")?;
            if n == 0 {
                break;
            }
            context.consume(&buf[..n]);
        }
        Ok(format!("{:x}", context.compute()))
    })
    .await
    .context("MD5 计算任务异常")?
}

/// 把传输错误归类为错误码
fn error_code_of(err: &anyhow::Error) -> ErrorCode {
    for cause in err.chain() {
        if let Some(code) = cause.downcast_ref::<ErrorCode>() {
            return *code;
        }
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            return match e.status() {
                Some(status) => ErrorCode::HttpStatus(status.as_u16()),
                None => ErrorCode::NetworkUnavailable,
            };
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return ErrorCode::FileIo;
        }
    }
    ErrorCode::Unknown
}

/// 从 url 推断文件名，推断不出时使用 url 的 md5
pub fn file_name_from_url(url: &str) -> String {
    let without_query = url.split(|c| c == '?' || c == '#').next().unwrap_or(url);
    let path = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest);
    let raw = match path.split_once('/') {
        Some((_, path)) => path.rsplit('/').next().unwrap_or(""),
        None => "",
    };
    let decoded = urlencoding::decode(raw)
        .map(|name| name.into_owned())
        .unwrap_or_else(|_| raw.to_string());
    let name: String = decoded
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();

    if name.is_empty() || name == "." || name == ".." {
        format!("{:x}", md5::compute(url.as_bytes()))
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::request::DownloadRequest;
    use crate::events::ChannelObserver;
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// 极简 HTTP 服务：支持 HEAD 和带 Range 的 GET，记录收到的 Range 头
    struct TestServer {
        url: String,
        ranges: Arc<Mutex<Vec<String>>>,
    }

    async fn serve(body: Vec<u8>, fail_status: Option<u16>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = Arc::new(body);
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let seen = ranges.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = body.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut tmp = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&tmp[..n]),
                        }
                    }
                    let request = String::from_utf8_lossy(&buf).to_string();
                    let is_head = request.starts_with("HEAD");

                    if let Some(status) = fail_status {
                        let resp = format!(
                            "HTTP/1.1 {} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                            status
                        );
                        let _ = socket.write_all(resp.as_bytes()).await;
                        return;
                    }

                    let total = body.len() as u64;
                    let range = request.lines().find_map(|line| {
                        let (key, value) = line.split_once(':')?;
                        key.eq_ignore_ascii_case("range").then(|| value.trim().to_string())
                    });

                    let (head, payload) = if is_head {
                        (
                            format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
                                total
                            ),
                            Vec::new(),
                        )
                    } else if let Some(range) = range {
                        seen.lock().push(range.clone());
                        let bounds = range.trim_start_matches("bytes=");
                        let (start, end) = bounds.split_once('-').unwrap();
                        let start: u64 = start.parse().unwrap();
                        let end: u64 = if end.is_empty() { total - 1 } else { end.parse().unwrap() };
                        let slice = body[start as usize..=end as usize].to_vec();
                        (
                            format!(
                                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                                slice.len(),
                                start,
                                end,
                                total
                            ),
                            slice,
                        )
                    } else {
                        (
                            format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                total
                            ),
                            body.to_vec(),
                        )
                    };

                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&payload).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        TestServer {
            url: format!("http://{}/files/data.bin", addr),
            ranges,
        }
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn config(temp: &TempDir, thread_num: u32) -> DownloadConfig {
        DownloadConfig {
            cache_dir: temp.path().join("cache"),
            data_dir: temp.path().join("data"),
            thread_num,
            progress_interval_ms: 0,
            request_timeout_secs: 5,
            ..DownloadConfig::default()
        }
    }

    fn transfer(config: &DownloadConfig, observer: Option<Arc<dyn DownloadObserver>>) -> Arc<HttpTransfer> {
        let client = Client::builder().no_proxy().build().unwrap();
        Arc::new(HttpTransfer::with_client(client, config, observer))
    }

    fn task(config: &DownloadConfig, request: DownloadRequest, transfer: Arc<HttpTransfer>) -> DownloadTask {
        let state = Arc::new(DownloadState::new(&request, &config.cache_dir));
        state.bind_request(request.clone());
        DownloadTask::new(request, state, transfer)
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(file_name_from_url("https://example.com/a/b/movie.mp4?x=1"), "movie.mp4");
        assert_eq!(file_name_from_url("https://example.com/%E4%B8%AD%E6%96%87.txt"), "中文.txt");
        let fallback = file_name_from_url("https://example.com/");
        assert_eq!(fallback.len(), 32);
        assert_eq!(file_name_from_url("https://example.com").len(), 32);
    }

    #[test]
    fn test_error_code_of() {
        let err = Err::<(), _>(ErrorCode::Md5Mismatch).context("外层上下文").unwrap_err();
        assert_eq!(error_code_of(&err), ErrorCode::Md5Mismatch);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let err = Err::<(), _>(io).context("写入失败").unwrap_err();
        assert_eq!(error_code_of(&err), ErrorCode::FileIo);

        assert_eq!(error_code_of(&anyhow::anyhow!("其他")), ErrorCode::Unknown);
    }

    #[tokio::test]
    async fn test_multi_fragment_download() {
        let temp = TempDir::new().unwrap();
        let data = body(10_000);
        let server = serve(data.clone(), None).await;
        let config = config(&temp, 3);
        let (observer, mut receiver) = ChannelObserver::channel();
        let transfer = transfer(&config, Some(Arc::new(observer)));

        let output = temp.path().join("out/data.bin");
        let request = DownloadRequest::builder(&server.url).id("data").file_path(&output).build();
        let task = task(&config, request, transfer);
        task.run().await;

        let state = task.state();
        assert_eq!(state.status(), Some(TaskStatus::Finished));
        assert_eq!(state.error_code(), None);
        assert!(state.is_finished());
        assert_eq!(state.completed_size(), 10_000);
        assert_eq!(state.progress(), Some(100));
        assert_eq!(state.thread_num(), 3);
        assert_eq!(std::fs::read(&output).unwrap(), data);
        assert!(!state.temp_dir().exists());
        assert_eq!(server.ranges.lock().len(), 3);

        let mut last = None;
        while let Ok(snapshot) = receiver.try_recv() {
            last = Some(snapshot);
        }
        let last = last.unwrap();
        assert_eq!(last.status, Some(TaskStatus::Finished));
        assert_eq!(last.progress, Some(100));
    }

    #[tokio::test]
    async fn test_resume_from_existing_fragment() {
        let temp = TempDir::new().unwrap();
        let data = body(10_000);
        let server = serve(data.clone(), None).await;
        let config = config(&temp, 1);
        let transfer = transfer(&config, None);

        let output = temp.path().join("data.bin");
        let request = DownloadRequest::builder(&server.url).id("data").file_path(&output).build();
        let task = task(&config, request, transfer);

        let temp_dir = task.state().temp_dir();
        std::fs::create_dir_all(&temp_dir).unwrap();
        std::fs::write(fragment::fragment_path(&temp_dir, 0), &data[..4000]).unwrap();

        task.run().await;
        assert_eq!(task.state().status(), Some(TaskStatus::Finished));
        assert_eq!(std::fs::read(&output).unwrap(), data);
        assert_eq!(server.ranges.lock().clone(), vec!["bytes=4000-9999".to_string()]);
    }

    #[tokio::test]
    async fn test_http_error_marks_failed() {
        let temp = TempDir::new().unwrap();
        let server = serve(Vec::new(), Some(404)).await;
        let config = config(&temp, 2);
        let transfer = transfer(&config, None);

        let request = DownloadRequest::builder(&server.url)
            .id("missing")
            .file_path(temp.path().join("missing.bin"))
            .build();
        let task = task(&config, request, transfer);
        task.run().await;

        assert_eq!(task.state().status(), Some(TaskStatus::Failed));
        assert_eq!(task.state().error_code(), Some(ErrorCode::HttpStatus(404)));
    }

    #[tokio::test]
    async fn test_md5_mismatch_deletes_output() {
        let temp = TempDir::new().unwrap();
        let server = serve(body(2048), None).await;
        let config = config(&temp, 2);
        let transfer = transfer(&config, None);

        let output = temp.path().join("data.bin");
        let request = DownloadRequest::builder(&server.url).id("data").file_path(&output).build();
        let task = task(&config, request, transfer);
        task.state().set_md5(Some("00000000000000000000000000000000".to_string()));
        task.run().await;

        assert_eq!(task.state().status(), Some(TaskStatus::Failed));
        assert_eq!(task.state().error_code(), Some(ErrorCode::Md5Mismatch));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_md5_match_and_default_path() {
        let temp = TempDir::new().unwrap();
        let data = body(3000);
        let server = serve(data.clone(), None).await;
        let config = config(&temp, 2);
        let transfer = transfer(&config, None);

        let request = DownloadRequest::builder(&server.url).id("data").build();
        let task = task(&config, request, transfer);
        task.state().set_md5(Some(format!("{:X}", md5::compute(&data))));
        task.run().await;

        assert_eq!(task.state().status(), Some(TaskStatus::Finished));
        assert_eq!(task.state().output_path(), Some(config.cache_dir.join("data.bin")));
    }

    #[tokio::test]
    async fn test_skips_task_not_waiting() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, 1);
        let transfer = transfer(&config, None);
        let request = DownloadRequest::builder("http://127.0.0.1:9/never").id("never").build();
        let task = task(&config, request, transfer);
        task.state().set_status(TaskStatus::Paused);

        task.run().await;
        assert_eq!(task.state().status(), Some(TaskStatus::Paused));
        assert_eq!(task.state().error_code(), None);
    }

    #[tokio::test]
    async fn test_already_finished_is_not_downloaded_again() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, 1);
        let transfer = transfer(&config, None);
        let output = temp.path().join("done.bin");
        std::fs::write(&output, vec![7u8; 64]).unwrap();

        let request = DownloadRequest::builder("http://127.0.0.1:9/done.bin")
            .id("done")
            .file_path(&output)
            .build();
        let task = task(&config, request, transfer);
        task.state().set_content_length(Some(64));
        task.state().set_finished(true);

        task.run().await;
        assert_eq!(task.state().status(), Some(TaskStatus::Finished));
        assert_eq!(task.state().completed_size(), 64);
        assert!(output.exists());
    }
}
