//! 下载任务执行器
//!
//! 限制同时执行的下载数量：
//! - 超出上限的任务排队等待，不会被拒绝或丢弃
//! - 任务开始/结束时通知生命周期回调，并记录耗时
//! - 关闭后丢弃尚未开始的任务
//!
//! 工作线程按 `{执行器名}-thread-{n}` 命名，便于日志追踪

use crate::downloader::task::DownloadTask;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 默认最大同时下载数
pub const DEFAULT_THREAD_COUNT: usize = 3;

/// 下载生命周期回调
pub trait DownloadLifecycle: Send + Sync {
    /// 任务即将开始执行
    fn on_download_start(&self, task: &DownloadTask);
    /// 任务执行结束（正常完成、失败或被取消）
    fn on_download_end(&self, task: &DownloadTask);
}

/// 下载任务执行器
pub trait TaskExecutor: Send + Sync {
    /// 执行器名称（调度器按名称区分执行器）
    fn name(&self) -> &str;

    /// 最大同时执行任务数
    fn max_running_tasks(&self) -> usize;

    /// 初始化，首次提交任务前调用且只调用一次
    fn init(&self, lifecycle: Arc<dyn DownloadLifecycle>);

    /// 提交任务；超出并发上限时排队，关闭后静默丢弃
    fn execute(&self, task: DownloadTask);

    /// 强制关闭，返回被丢弃的未开始任务
    fn shutdown(&self) -> Vec<DownloadTask>;

    fn is_shutdown(&self) -> bool;
}

/// 执行器内部共享状态（工作线程持有）
struct PoolShared {
    /// 待执行队列（无界，保证不丢任务）
    queue: Mutex<VecDeque<DownloadTask>>,
    /// 新任务通知
    task_available: Notify,
    /// 正在执行的任务数
    active: AtomicUsize,
    /// 关闭信号
    shutdown: CancellationToken,
    /// 任务开始时间 task_id -> Instant
    start_times: DashMap<String, Instant>,
    /// 生命周期回调（init 时绑定）
    lifecycle: OnceLock<Arc<dyn DownloadLifecycle>>,
}

impl PoolShared {
    /// 取下一个任务；关闭后返回 None
    async fn next_task(&self) -> Option<DownloadTask> {
        loop {
            let notified = self.task_available.notified();
            {
                let mut queue = self.queue.lock();
                if self.shutdown.is_cancelled() {
                    return None;
                }
                if let Some(task) = queue.pop_front() {
                    return Some(task);
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    fn before_execute(&self, worker: &str, task: &DownloadTask) {
        if let Some(lifecycle) = self.lifecycle.get() {
            lifecycle.on_download_start(task);
        }
        debug!("[{}] 开始执行任务 {}", worker, task.name());
        self.start_times.insert(task.id().to_string(), Instant::now());
    }

    fn after_execute(&self, worker: &str, task: &DownloadTask) {
        if let Some(lifecycle) = self.lifecycle.get() {
            lifecycle.on_download_end(task);
        }
        if let Some((_, started)) = self.start_times.remove(task.id()) {
            info!(
                "[{}] 任务 {} 已结束，耗时 {}ms",
                worker,
                task.name(),
                started.elapsed().as_millis()
            );
        }
    }
}

/// 固定工作线程数的执行器
pub struct WorkerPoolExecutor {
    name: String,
    max_running_tasks: usize,
    shared: Arc<PoolShared>,
}

impl WorkerPoolExecutor {
    /// 创建执行器
    ///
    /// `max_running_tasks` 为 0 时使用默认值 3
    pub fn new(name: impl Into<String>, max_running_tasks: usize) -> Self {
        let max_running_tasks = if max_running_tasks == 0 {
            DEFAULT_THREAD_COUNT
        } else {
            max_running_tasks
        };
        Self {
            name: name.into(),
            max_running_tasks,
            shared: Arc::new(PoolShared {
                queue: Mutex::new(VecDeque::new()),
                task_available: Notify::new(),
                active: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
                start_times: DashMap::new(),
                lifecycle: OnceLock::new(),
            }),
        }
    }

    /// 排队中（尚未开始）的任务数
    pub fn queued_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// 正在执行的任务数
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    async fn worker_loop(shared: Arc<PoolShared>, worker: String) {
        debug!("[{}] 工作线程已启动", worker);
        while let Some(task) = shared.next_task().await {
            shared.active.fetch_add(1, Ordering::SeqCst);
            shared.before_execute(&worker, &task);

            if AssertUnwindSafe(task.run()).catch_unwind().await.is_err() {
                error!("[{}] 任务 {} 执行时发生 panic", worker, task.name());
            }

            shared.after_execute(&worker, &task);
            shared.active.fetch_sub(1, Ordering::SeqCst);
        }
        debug!("[{}] 工作线程已退出", worker);
    }
}

impl TaskExecutor for WorkerPoolExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_running_tasks(&self) -> usize {
        self.max_running_tasks
    }

    fn init(&self, lifecycle: Arc<dyn DownloadLifecycle>) {
        if self.shared.lifecycle.set(lifecycle).is_err() {
            warn!("执行器 {} 已初始化，忽略重复调用", self.name);
            return;
        }

        for index in 1..=self.max_running_tasks {
            let worker = format!("{}-thread-{}", self.name, index);
            tokio::spawn(Self::worker_loop(self.shared.clone(), worker));
        }

        info!(
            "执行器 {} 初始化完成，工作线程数: {}",
            self.name, self.max_running_tasks
        );
    }

    fn execute(&self, task: DownloadTask) {
        let queued = {
            let mut queue = self.shared.queue.lock();
            if self.shared.shutdown.is_cancelled() {
                debug!("执行器 {} 已关闭，丢弃任务 {}", self.name, task.name());
                return;
            }
            queue.push_back(task.clone());
            queue.len()
        };
        self.shared.task_available.notify_one();
        debug!("任务 {} 已就绪", task.name());

        let active = self.active_count();
        if queued + active > self.max_running_tasks {
            warn!(
                "{} 最多同时运行 {} 个任务，当前已有 {} 个在运行，任务 {} 进入等待",
                self.name,
                self.max_running_tasks,
                active,
                task.name()
            );
        }
    }

    fn shutdown(&self) -> Vec<DownloadTask> {
        let discarded: Vec<DownloadTask> = {
            let mut queue = self.shared.queue.lock();
            if self.shared.shutdown.is_cancelled() {
                return Vec::new();
            }
            self.shared.shutdown.cancel();
            queue.drain(..).collect()
        };
        info!(
            "执行器 {} 已关闭，丢弃 {} 个未开始的任务",
            self.name,
            discarded.len()
        );
        discarded
    }

    fn is_shutdown(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

impl Drop for WorkerPoolExecutor {
    fn drop(&mut self) {
        // 工作线程持有共享状态，必须显式通知退出
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::test_support::{make_task, wait_until, RecordingLifecycle, RecordingTransfer};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_default_thread_count() {
        let executor = WorkerPoolExecutor::new("pool", 0);
        assert_eq!(executor.max_running_tasks(), DEFAULT_THREAD_COUNT);
        assert_eq!(executor.name(), "pool");
        assert!(!executor.is_shutdown());
    }

    #[tokio::test]
    async fn test_backpressure_never_drops() {
        let temp = TempDir::new().unwrap();
        let transfer = RecordingTransfer::new();
        let lifecycle = RecordingLifecycle::new();
        let executor = WorkerPoolExecutor::new("pool", 2);
        executor.init(lifecycle.clone());

        for i in 0..8 {
            executor.execute(make_task(temp.path(), &format!("task{}", i), transfer.clone()));
        }

        transfer.wait_ended(8).await;
        wait_until(|| lifecycle.ends().len() == 8).await;
        assert_eq!(lifecycle.starts().len(), 8);
        assert_eq!(executor.queued_count(), 0);
        wait_until(|| executor.active_count() == 0).await;
        assert!(executor.shared.start_times.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let temp = TempDir::new().unwrap();
        let transfer = RecordingTransfer::gated();
        let executor = WorkerPoolExecutor::new("pool", 2);
        executor.init(RecordingLifecycle::new());

        for id in ["a", "b", "c"] {
            executor.execute(make_task(temp.path(), id, transfer.clone()));
        }

        transfer.wait_started(2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transfer.started(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(executor.queued_count(), 1);

        transfer.release("b");
        transfer.wait_started(3).await;
        assert_eq!(transfer.started()[2], "c");

        transfer.release("a");
        transfer.release("c");
        transfer.wait_ended(3).await;
    }

    #[tokio::test]
    async fn test_shutdown_discards_queued_tasks() {
        let temp = TempDir::new().unwrap();
        let transfer = RecordingTransfer::gated();
        let lifecycle = RecordingLifecycle::new();
        let executor = WorkerPoolExecutor::new("pool", 1);
        executor.init(lifecycle.clone());

        executor.execute(make_task(temp.path(), "a", transfer.clone()));
        executor.execute(make_task(temp.path(), "b", transfer.clone()));
        transfer.wait_started(1).await;

        let discarded = executor.shutdown();
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].id(), "b");
        assert!(executor.is_shutdown());
        // 重复关闭无副作用
        assert!(executor.shutdown().is_empty());

        // 关闭后提交的任务被静默丢弃
        executor.execute(make_task(temp.path(), "c", transfer.clone()));
        assert_eq!(executor.queued_count(), 0);

        // 正在运行的任务自行结束
        transfer.release("a");
        wait_until(|| lifecycle.ends() == vec!["a".to_string()]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lifecycle.starts(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_init_only_once() {
        let temp = TempDir::new().unwrap();
        let transfer = RecordingTransfer::new();
        let first = RecordingLifecycle::new();
        let second = RecordingLifecycle::new();
        let executor = WorkerPoolExecutor::new("pool", 1);
        executor.init(first.clone());
        executor.init(second.clone());

        executor.execute(make_task(temp.path(), "a", transfer.clone()));
        wait_until(|| first.ends().len() == 1).await;
        assert!(second.starts().is_empty());
    }
}
