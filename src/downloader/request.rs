use crate::downloader::executor::TaskExecutor;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// 下载请求
///
/// 提交后不再修改；去重按字段值比较，而不是按对象身份
#[derive(Clone)]
pub struct DownloadRequest {
    /// 下载地址
    pub url: String,
    /// 任务ID（为空时使用 url）
    pub id: String,
    /// 分组标签
    pub tag: Option<String>,
    /// 本地保存路径（为空时由传输层决定）
    pub file_path: Option<PathBuf>,
    /// 目标存储的 scheme URI（如 content://...）
    pub scheme: Option<String>,
    /// 指定执行器（为空时使用调度器默认执行器）
    pub executor: Option<Arc<dyn TaskExecutor>>,
    /// 禁用断点续传
    pub disable_breakpoint_resume: bool,
    /// 已完成时也强制重新下载
    pub force_retry: bool,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self::builder(url).build()
    }

    pub fn builder(url: impl Into<String>) -> DownloadRequestBuilder {
        DownloadRequestBuilder {
            url: url.into(),
            id: None,
            tag: None,
            file_path: None,
            scheme: None,
            executor: None,
            disable_breakpoint_resume: false,
            force_retry: false,
        }
    }

    /// 日志里使用的名称
    pub fn name(&self) -> &str {
        self.file_path
            .as_ref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or(&self.id)
    }

    fn executor_name(&self) -> Option<&str> {
        self.executor.as_ref().map(|e| e.name())
    }
}

impl PartialEq for DownloadRequest {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
            && self.id == other.id
            && self.tag == other.tag
            && self.file_path == other.file_path
            && self.scheme == other.scheme
            && self.executor_name() == other.executor_name()
            && self.disable_breakpoint_resume == other.disable_breakpoint_resume
            && self.force_retry == other.force_retry
    }
}

impl Eq for DownloadRequest {}

impl fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("url", &self.url)
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("file_path", &self.file_path)
            .field("scheme", &self.scheme)
            .field("executor", &self.executor_name())
            .field("disable_breakpoint_resume", &self.disable_breakpoint_resume)
            .field("force_retry", &self.force_retry)
            .finish()
    }
}

/// 下载请求构建器
pub struct DownloadRequestBuilder {
    url: String,
    id: Option<String>,
    tag: Option<String>,
    file_path: Option<PathBuf>,
    scheme: Option<String>,
    executor: Option<Arc<dyn TaskExecutor>>,
    disable_breakpoint_resume: bool,
    force_retry: bool,
}

impl DownloadRequestBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn disable_breakpoint_resume(mut self, disable: bool) -> Self {
        self.disable_breakpoint_resume = disable;
        self
    }

    pub fn force_retry(mut self, force: bool) -> Self {
        self.force_retry = force;
        self
    }

    pub fn build(self) -> DownloadRequest {
        let id = match self.id {
            Some(id) if !id.is_empty() => id,
            _ => self.url.clone(),
        };
        DownloadRequest {
            url: self.url,
            id,
            tag: self.tag,
            file_path: self.file_path,
            scheme: self.scheme,
            executor: self.executor,
            disable_breakpoint_resume: self.disable_breakpoint_resume,
            force_retry: self.force_retry,
        }
    }
}
