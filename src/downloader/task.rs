use crate::downloader::request::DownloadRequest;
use crate::downloader::state::DownloadState;
use crate::downloader::transfer::Transfer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 下载任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 已停止（准入后、执行前的初始状态）
    Stopped,
    /// 排队等待执行
    Waiting,
    /// 下载中
    Running,
    /// 暂停中（等待传输层退出）
    Pausing,
    /// 已暂停
    Paused,
    /// 已完成
    Finished,
    /// 失败
    Failed,
    /// 已删除
    Deleted,
}

impl TaskStatus {
    /// 是否处于活跃状态
    ///
    /// 只有活跃任务会接受非强制的失败标记；Paused 不算活跃
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Waiting | Self::Running | Self::Pausing)
    }

    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Deleted)
    }
}

/// 下载任务
///
/// 把一个请求和它的下载状态绑定在一起，由调度器创建，由执行器的工作线程消费
#[derive(Clone)]
pub struct DownloadTask {
    request: DownloadRequest,
    state: Arc<DownloadState>,
    transfer: Arc<dyn Transfer>,
}

impl DownloadTask {
    /// 创建任务，状态标记为等待中
    pub fn new(request: DownloadRequest, state: Arc<DownloadState>, transfer: Arc<dyn Transfer>) -> Self {
        state.set_status(TaskStatus::Waiting);
        Self {
            request,
            state,
            transfer,
        }
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    /// 日志里使用的名称
    pub fn name(&self) -> String {
        let name = self.state.name();
        if name.is_empty() {
            self.request.id.clone()
        } else {
            name
        }
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn state(&self) -> &Arc<DownloadState> {
        &self.state
    }

    /// 执行传输
    pub async fn run(&self) {
        self.transfer.transfer(self).await;
    }
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.request.id)
            .field("url", &self.request.url)
            .field("status", &self.state.status())
            .finish()
    }
}
