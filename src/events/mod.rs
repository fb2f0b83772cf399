//! 下载事件
//!
//! 下载状态的快照通过 `DownloadObserver` 推送给宿主：
//! - 任务开始/结束时由管理器推送
//! - 传输过程中按节流间隔推送进度
//! - 准入时空间不足，推送一个已失败的快照

pub mod throttle;

pub use throttle::ProgressThrottler;

use crate::downloader::state::DownloadSnapshot;
use tokio::sync::mpsc;
use tracing::debug;

/// 下载进度观察者
pub trait DownloadObserver: Send + Sync {
    /// 收到一份快照；可能在任意线程调用，实现不能阻塞
    fn on_progress(&self, snapshot: &DownloadSnapshot);
}

/// 通过 tokio 通道转发快照
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<DownloadSnapshot>,
}

impl ChannelObserver {
    /// 创建观察者以及对应的接收端
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DownloadSnapshot>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn new(sender: mpsc::UnboundedSender<DownloadSnapshot>) -> Self {
        Self { sender }
    }
}

impl DownloadObserver for ChannelObserver {
    fn on_progress(&self, snapshot: &DownloadSnapshot) {
        if self.sender.send(snapshot.clone()).is_err() {
            debug!("快照接收端已关闭，丢弃任务 {} 的进度", snapshot.id);
        }
    }
}
