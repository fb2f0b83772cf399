//! 下载状态（断点续传与进度引擎）
//!
//! 每个下载对应一个 `DownloadState`，跨多次续传长期存在：
//! - 调度线程在准入时重置状态
//! - 传输线程更新已下载大小与速度
//! - 调用方线程发起暂停/停止/删除
//!
//! 所有"先读后改"的操作（完成校验、进度计算）都在状态自身的互斥锁内完成

use crate::downloader::error::ErrorCode;
use crate::downloader::fragment;
use crate::downloader::output::OutputFile;
use crate::downloader::progress::SpeedMonitor;
use crate::downloader::request::DownloadRequest;
use crate::downloader::task::TaskStatus;
use crate::downloader::transfer::file_name_from_url;
use crate::persistence::DownloadRecord;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// 分块传输编码标识
pub const TRANSFER_ENCODING_CHUNKED: &str = "chunked";

/// 可变部分，受同一把锁保护
#[derive(Debug)]
struct StateInner {
    file_path: Option<PathBuf>,
    output: Option<OutputFile>,
    completed_size: u64,
    /// None 表示长度未知
    content_length: Option<u64>,
    finished: bool,
    /// None 表示尚未分配状态
    status: Option<TaskStatus>,
    error_code: Option<ErrorCode>,
    thread_num: u32,
    transfer_encoding: Option<String>,
    md5: Option<String>,
    fragments: Vec<PathBuf>,
    fragments_loaded: bool,
    force_retry: bool,
    request: Option<DownloadRequest>,
    speed_monitor: SpeedMonitor,
    speed: String,
}

/// 下载状态
#[derive(Debug)]
pub struct DownloadState {
    url: String,
    id: String,
    tag: Option<String>,
    /// 首次创建时间（毫秒时间戳），之后不再变化
    create_time: i64,
    scheme: Option<String>,
    /// 分片临时目录的根目录
    cache_dir: PathBuf,
    inner: Mutex<StateInner>,
    /// 调用方附加数据，生命周期由调用方负责
    extra_data: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl DownloadState {
    /// 为新请求创建下载状态
    pub fn new(request: &DownloadRequest, cache_dir: impl Into<PathBuf>) -> Self {
        let state = Self::with_parts(
            request.url.clone(),
            request.id.clone(),
            request.tag.clone(),
            chrono::Utc::now().timestamp_millis(),
            request.scheme.clone(),
            cache_dir.into(),
        );
        if let Some(path) = &request.file_path {
            state.set_file_path(path);
        }
        state
    }

    /// 从持久化记录恢复
    pub fn from_record(record: DownloadRecord, cache_dir: impl Into<PathBuf>) -> Self {
        let state = Self::with_parts(
            record.url,
            record.id,
            record.tag,
            record.create_time,
            record.scheme,
            cache_dir.into(),
        );
        {
            let mut inner = state.inner.lock();
            if let Some(path) = record.file_path {
                inner.output = Some(OutputFile::new(&path, state.scheme.clone()));
                inner.file_path = Some(path);
            }
            inner.content_length = record.content_length;
            inner.finished = record.finished;
            inner.thread_num = record.thread_num;
            inner.transfer_encoding = record.transfer_encoding;
            inner.md5 = record.md5;
            inner.error_code = record.error_code;
        }
        state
    }

    fn with_parts(
        url: String,
        id: String,
        tag: Option<String>,
        create_time: i64,
        scheme: Option<String>,
        cache_dir: PathBuf,
    ) -> Self {
        let id = if id.is_empty() { url.clone() } else { id };
        Self {
            url,
            id,
            tag,
            create_time,
            scheme,
            cache_dir,
            inner: Mutex::new(StateInner {
                file_path: None,
                output: None,
                completed_size: 0,
                content_length: None,
                finished: false,
                status: None,
                error_code: None,
                thread_num: 0,
                transfer_encoding: None,
                md5: None,
                fragments: Vec::new(),
                fragments_loaded: false,
                force_retry: false,
                request: None,
                speed_monitor: SpeedMonitor::new(),
                speed: String::new(),
            }),
            extra_data: Mutex::new(None),
        }
    }

    /// 转为持久化记录
    pub fn to_record(&self) -> DownloadRecord {
        let inner = self.inner.lock();
        DownloadRecord {
            id: self.id.clone(),
            url: self.url.clone(),
            tag: self.tag.clone(),
            file_path: inner.file_path.clone(),
            scheme: self.scheme.clone(),
            create_time: self.create_time,
            content_length: inner.content_length,
            finished: inner.finished,
            thread_num: inner.thread_num,
            transfer_encoding: inner.transfer_encoding.clone(),
            md5: inner.md5.clone(),
            error_code: inner.error_code,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    // ------------------------------------------------------------------
    // 只读字段
    // ------------------------------------------------------------------

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn create_time(&self) -> i64 {
        self.create_time
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    /// 当前 url 的分片临时目录
    pub fn temp_dir(&self) -> PathBuf {
        fragment::temp_dir_for(&self.cache_dir, &self.url)
    }

    // ------------------------------------------------------------------
    // 可变字段
    // ------------------------------------------------------------------

    pub fn file_path(&self) -> Option<PathBuf> {
        self.inner.lock().file_path.clone()
    }

    /// 输出文件名，未确定路径时为空
    pub fn name(&self) -> String {
        self.inner
            .lock()
            .output
            .as_ref()
            .map(|o| o.name().to_string())
            .unwrap_or_default()
    }

    pub fn completed_size(&self) -> u64 {
        self.inner.lock().completed_size
    }

    pub fn set_completed_size(&self, completed_size: u64) {
        let mut inner = self.inner.lock();
        inner.completed_size = clamp(completed_size, inner.content_length);
    }

    pub fn content_length(&self) -> Option<u64> {
        self.inner.lock().content_length
    }

    pub fn set_content_length(&self, content_length: Option<u64>) {
        let mut inner = self.inner.lock();
        inner.content_length = content_length;
        inner.completed_size = clamp(inner.completed_size, content_length);
    }

    pub fn finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn set_finished(&self, finished: bool) {
        self.inner.lock().finished = finished;
    }

    pub fn status(&self) -> Option<TaskStatus> {
        self.inner.lock().status
    }

    pub fn set_status(&self, status: TaskStatus) {
        let mut inner = self.inner.lock();
        if inner.status != Some(status) {
            debug!("任务 {} 状态变更: {:?} -> {:?}", self.id, inner.status, status);
            if status == TaskStatus::Running {
                inner.speed_monitor.reset();
            }
            inner.status = Some(status);
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.inner.lock().error_code
    }

    pub fn thread_num(&self) -> u32 {
        self.inner.lock().thread_num
    }

    pub fn set_thread_num(&self, thread_num: u32) {
        self.inner.lock().thread_num = thread_num;
    }

    pub fn transfer_encoding(&self) -> Option<String> {
        self.inner.lock().transfer_encoding.clone()
    }

    pub fn set_transfer_encoding(&self, transfer_encoding: Option<String>) {
        self.inner.lock().transfer_encoding = transfer_encoding;
    }

    /// 是否为分块传输（长度未知，不能按长度判断完成）
    pub fn is_chunked(&self) -> bool {
        is_chunked(&self.inner.lock())
    }

    pub fn md5(&self) -> Option<String> {
        self.inner.lock().md5.clone()
    }

    pub fn set_md5(&self, md5: Option<String>) {
        self.inner.lock().md5 = md5;
    }

    pub fn force_retry(&self) -> bool {
        self.inner.lock().force_retry
    }

    pub fn set_force_retry(&self, force_retry: bool) {
        self.inner.lock().force_retry = force_retry;
    }

    pub fn request(&self) -> Option<DownloadRequest> {
        self.inner.lock().request.clone()
    }

    /// 绑定当前请求
    pub fn bind_request(&self, request: DownloadRequest) {
        let mut inner = self.inner.lock();
        inner.force_retry = request.force_retry;
        inner.request = Some(request);
    }

    /// 是否禁用断点续传（未绑定请求时视为不禁用）
    pub fn is_disable_breakpoint_resume(&self) -> bool {
        self.inner
            .lock()
            .request
            .as_ref()
            .map_or(false, |r| r.disable_breakpoint_resume)
    }

    /// 本次扫描到的分片文件
    pub fn fragment_files(&self) -> Vec<PathBuf> {
        self.inner.lock().fragments.clone()
    }

    // ------------------------------------------------------------------
    // 路径
    // ------------------------------------------------------------------

    /// 设置保存路径
    ///
    /// 以分隔符结尾或已存在的目录路径会拼接当前文件名（没有时从 url 推断）；路径变化时删除旧的输出文件，
    /// 并按路径变化处理分片目录
    pub fn set_file_path(&self, path: impl AsRef<Path>) {
        let mut path = path.as_ref().to_path_buf();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let is_dir_path = path.as_os_str().to_string_lossy().ends_with(MAIN_SEPARATOR) || path.is_dir();
        if is_dir_path {
            // 还没有文件名时按 url 推断
            let name = inner
                .file_path
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|name| name.to_os_string())
                .unwrap_or_else(|| file_name_from_url(&self.url).into());
            path = path.join(name);
        }
        if inner.file_path.as_ref() == Some(&path) {
            return;
        }

        info!("任务 {} 设置保存路径: {:?}", self.id, path);
        match inner.output.as_mut() {
            Some(output) => {
                output.delete();
                output.set_path(&path);
            }
            None => inner.output = Some(OutputFile::new(&path, self.scheme.clone())),
        }
        self.apply_path_change(inner, path);
    }

    /// 输出文件的实际路径发生变化（如调用方在创建后移动了目标位置）
    ///
    /// 旧路径下计算的分片偏移全部失效，删除分片目录
    pub fn on_output_path_changed(&self, new_path: impl AsRef<Path>) {
        let new_path = new_path.as_ref().to_path_buf();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.output.as_mut() {
            Some(output) => {
                output.set_path(&new_path);
            }
            None => inner.output = Some(OutputFile::new(&new_path, self.scheme.clone())),
        }
        self.apply_path_change(inner, new_path);
    }

    fn apply_path_change(&self, inner: &mut StateInner, new_path: PathBuf) {
        if inner.file_path.as_ref() == Some(&new_path) {
            return;
        }
        let had_path = inner.file_path.is_some();
        inner.file_path = Some(new_path);
        if had_path {
            fragment::delete_dir(&self.temp_dir());
            inner.fragments.clear();
            inner.fragments_loaded = false;
            inner.completed_size = 0;
        }
    }

    pub fn output_path(&self) -> Option<PathBuf> {
        self.inner.lock().output.as_ref().map(|o| o.path().to_path_buf())
    }

    /// 删除输出文件
    pub fn delete_output(&self) {
        if let Some(output) = self.inner.lock().output.as_ref() {
            output.delete();
        }
    }

    /// 删除分片临时目录
    pub fn delete_temp_dir(&self) {
        fragment::delete_dir(&self.temp_dir());
        let mut inner = self.inner.lock();
        inner.fragments.clear();
    }

    // ------------------------------------------------------------------
    // 完成校验与进度
    // ------------------------------------------------------------------

    /// 是否已下载完成
    ///
    /// 持久化的完成标记只有在磁盘文件长度与 content_length 一致时才可信；
    /// 不一致说明标记已过期（如崩溃前未刷盘），此时删除残缺文件并重置标记。
    /// 注意：调用本方法可能删除文件
    pub fn is_finished(&self) -> bool {
        let mut inner = self.inner.lock();
        self.check_finished(&mut inner)
    }

    fn check_finished(&self, inner: &mut StateInner) -> bool {
        let Some(output) = inner.output.as_ref() else {
            return false;
        };
        if inner.finished {
            let confirmed = match inner.content_length {
                Some(len) => len > 0 && output.length() == len,
                None => is_chunked(inner) && output.exists(),
            };
            if confirmed {
                return true;
            }
            warn!(
                "任务 {} 完成标记与文件长度不符（文件 {} bytes，预期 {:?}），删除残缺文件",
                self.id,
                output.length(),
                inner.content_length
            );
            output.delete();
        }
        inner.finished = false;
        false
    }

    /// 扫描分片目录，恢复上次中断时已下载的字节数
    fn load_fragments(&self, inner: &mut StateInner) {
        if inner.file_path.is_none() {
            return;
        }
        let temp_dir = self.temp_dir();
        for (path, len) in fragment::list_fragments(&temp_dir) {
            inner.fragments.push(path);
            inner.completed_size = inner.completed_size.saturating_add(len);
        }
        inner.completed_size = clamp(inner.completed_size, inner.content_length);
        inner.fragments_loaded = true;
        if !inner.fragments.is_empty() {
            info!(
                "任务 {} 发现 {} 个分片，已下载 {} bytes",
                self.id,
                inner.fragments.len(),
                inner.completed_size
            );
        }
    }

    /// 计算下载进度
    ///
    /// 已完成时已下载大小对齐文件长度；未完成时首次调用会扫描分片目录。
    /// 返回进度百分比，长度未知时为 None
    pub fn calculate_download_progress(&self) -> Option<u8> {
        let mut inner = self.inner.lock();
        if self.check_finished(&mut inner) {
            inner.completed_size = match inner.content_length {
                Some(len) => len,
                None => inner.output.as_ref().map_or(0, |o| o.length()),
            };
            if inner.status.is_none() {
                inner.status = Some(TaskStatus::Finished);
            }
        } else {
            if !inner.fragments_loaded {
                inner.completed_size = 0;
                self.load_fragments(&mut inner);
            }
            if inner.status.is_none() {
                inner.status = Some(TaskStatus::Stopped);
            }
        }
        progress_of(inner.completed_size, inner.content_length)
    }

    /// 当前进度百分比，长度未知时为 None
    pub fn progress(&self) -> Option<u8> {
        let inner = self.inner.lock();
        progress_of(inner.completed_size, inner.content_length)
    }

    /// 记录传输中新写入的字节
    pub fn download(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.completed_size = clamp(inner.completed_size.saturating_add(bytes), inner.content_length);
        inner.speed_monitor.download(bytes);
    }

    // ------------------------------------------------------------------
    // 状态机
    // ------------------------------------------------------------------

    /// 记录失败
    ///
    /// 只有运行中的任务才会被标记失败，除非 `force` 为 true。
    /// 避免已被用户暂停/停止/删除的任务被过期的异步错误覆盖
    pub fn set_error_code(&self, code: ErrorCode, force: bool) {
        let mut inner = self.inner.lock();
        let running = inner.status.map_or(false, |s| s.is_running());
        if running || force {
            warn!("任务 {} 失败: {} (code={})", self.id, code, code.code());
            inner.error_code = Some(code);
            inner.status = Some(TaskStatus::Failed);
        } else {
            debug!(
                "任务 {} 当前状态 {:?}，忽略错误: {}",
                self.id, inner.status, code
            );
        }
    }

    pub fn clear_error_code(&self) {
        self.inner.lock().error_code = None;
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().status.map_or(false, |s| s.is_running())
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.lock().status == Some(TaskStatus::Deleted)
    }

    // ------------------------------------------------------------------
    // 附加数据
    // ------------------------------------------------------------------

    /// 设置调用方附加数据（只保留弱引用）
    pub fn set_extra_data(&self, data: &Arc<dyn Any + Send + Sync>) {
        *self.extra_data.lock() = Some(Arc::downgrade(data));
    }

    /// 获取附加数据，调用方已释放时为 None
    pub fn extra_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.extra_data.lock().as_ref().and_then(Weak::upgrade)
    }

    // ------------------------------------------------------------------
    // 快照
    // ------------------------------------------------------------------

    /// 生成当前时刻的只读快照
    pub fn snapshot(self: &Arc<Self>) -> DownloadSnapshot {
        let mut inner = self.inner.lock();
        inner.speed = inner.speed_monitor.speed();
        DownloadSnapshot {
            url: self.url.clone(),
            output: inner.output.as_ref().map(|o| o.path().to_path_buf()),
            name: inner.output.as_ref().map(|o| o.name().to_string()).unwrap_or_default(),
            tag: self.tag.clone(),
            id: self.id.clone(),
            create_time: self.create_time,
            speed: inner.speed.clone(),
            completed_size: inner.completed_size,
            content_length: inner.content_length,
            error_code: inner.error_code,
            status: inner.status,
            finished: inner.finished,
            progress: progress_of(inner.completed_size, inner.content_length),
            state: Arc::clone(self),
        }
    }
}

/// 下载状态的只读快照
#[derive(Debug, Clone, Serialize)]
pub struct DownloadSnapshot {
    pub url: String,
    /// 输出文件路径
    pub output: Option<PathBuf>,
    pub name: String,
    pub tag: Option<String>,
    pub id: String,
    pub create_time: i64,
    /// 格式化后的速度
    pub speed: String,
    pub completed_size: u64,
    pub content_length: Option<u64>,
    pub error_code: Option<ErrorCode>,
    pub status: Option<TaskStatus>,
    pub finished: bool,
    /// 0-100，长度未知时为 None
    pub progress: Option<u8>,
    /// 快照来源
    #[serde(skip)]
    pub state: Arc<DownloadState>,
}

fn is_chunked(inner: &StateInner) -> bool {
    inner
        .transfer_encoding
        .as_deref()
        .map_or(false, |e| e.eq_ignore_ascii_case(TRANSFER_ENCODING_CHUNKED))
}

fn clamp(completed: u64, content_length: Option<u64>) -> u64 {
    match content_length {
        Some(len) => completed.min(len),
        None => completed,
    }
}

fn progress_of(completed: u64, content_length: Option<u64>) -> Option<u8> {
    match content_length {
        Some(len) if len > 0 => Some(((completed as u128 * 100) / len as u128).min(100) as u8),
        _ => None,
    }
}
