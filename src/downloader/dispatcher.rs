//! 下载请求调度器
//!
//! 把调用方提交的请求串行地转换为执行器中的任务：
//! - 等待队列去重（相同请求只保留一个）
//! - 正在下载的任务ID去重
//! - 可选的存储空间检查
//! - 从存储中恢复或新建下载状态
//! - 按请求选择执行器，首次使用时初始化
//!
//! 准入在独立的调度任务中按 FIFO 顺序进行，`enqueue` 本身不会阻塞

use crate::config::DownloadConfig;
use crate::downloader::error::ErrorCode;
use crate::downloader::executor::{DownloadLifecycle, TaskExecutor, WorkerPoolExecutor};
use crate::downloader::request::DownloadRequest;
use crate::downloader::space::SpaceProbe;
use crate::downloader::state::DownloadState;
use crate::downloader::task::{DownloadTask, TaskStatus};
use crate::downloader::transfer::Transfer;
use crate::events::DownloadObserver;
use crate::persistence::DownloadStore;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 默认执行器名称
pub const DEFAULT_EXECUTOR_NAME: &str = "pump-download";

/// 调度器共享状态（调度任务与调用方共用）
struct DispatcherShared {
    config: DownloadConfig,
    store: Arc<dyn DownloadStore>,
    transfer: Arc<dyn Transfer>,
    observer: Option<Arc<dyn DownloadObserver>>,
    space_probe: Option<Arc<dyn SpaceProbe>>,
    /// 宿主生命周期回调（管理器持有调度器，这里只保留弱引用）
    host: Option<Weak<dyn DownloadLifecycle>>,

    /// 等待准入的请求
    pending: Mutex<VecDeque<DownloadRequest>>,
    wakeup: Notify,
    running: AtomicBool,
    cancel_token: Mutex<CancellationToken>,

    /// 已初始化的执行器（按名称）
    executors: Mutex<HashMap<String, Arc<dyn TaskExecutor>>>,
    default_executor: Mutex<Option<Arc<dyn TaskExecutor>>>,

    /// 已准入、尚未结束的任务
    live: DashMap<String, Arc<DownloadState>>,
    /// 所有已知的下载状态
    states: DashMap<String, Arc<DownloadState>>,
}

impl DispatcherShared {
    fn is_task_running(&self, id: &str) -> bool {
        self.live.contains_key(id)
    }

    fn publish(&self, state: &Arc<DownloadState>) {
        if let Some(observer) = &self.observer {
            observer.on_progress(&state.snapshot());
        }
    }

    fn push_pending(&self, request: DownloadRequest) {
        {
            let mut pending = self.pending.lock();
            if pending.contains(&request) {
                warn!("任务 {} 已在等待队列中，忽略重复请求", request.name());
                return;
            }
            pending.push_back(request);
        }
        self.wakeup.notify_one();
    }

    fn pop_pending(&self) -> Option<DownloadRequest> {
        self.pending.lock().pop_front()
    }

    /// 准入一个请求
    fn admit(self: &Arc<Self>, mut request: DownloadRequest, token: &CancellationToken) {
        if self.is_task_running(&request.id) {
            warn!("任务 {} 正在下载，忽略重复请求", request.name());
            return;
        }

        if self.config.check_usable_space && !self.has_usable_space(&request) {
            return;
        }

        let state = self.hydrate(&request);

        // 请求未指定路径时沿用上次的路径，指定了不同路径时迁移
        match &request.file_path {
            None => request.file_path = state.file_path(),
            Some(path) => {
                if state.file_path().as_ref() != Some(path) {
                    state.set_file_path(path);
                }
            }
        }
        state.bind_request(request.clone());
        state.set_status(TaskStatus::Stopped);

        if token.is_cancelled() {
            debug!("调度器已停止，丢弃任务 {}", request.name());
            return;
        }

        // 持有执行器锁直到任务入队，cancel 会等待并把它当作未开始的任务丢弃
        let mut executors = self.executors.lock();
        if token.is_cancelled() {
            debug!("调度器已停止，丢弃任务 {}", request.name());
            return;
        }
        let Some(executor) = self.executor_for(&mut executors, &request) else {
            debug!("调度器已停止，丢弃任务 {}", request.name());
            return;
        };
        if executor.is_shutdown() {
            warn!("执行器 {} 已关闭，任务 {} 未能提交", executor.name(), request.name());
            return;
        }

        let id = request.id.clone();
        let task = DownloadTask::new(request, state.clone(), self.transfer.clone());
        self.live.insert(id, state);
        executor.execute(task);
    }

    /// 空间不足时推送一个失败快照，返回 false
    fn has_usable_space(&self, request: &DownloadRequest) -> bool {
        let Some(probe) = &self.space_probe else {
            return true;
        };

        let dest_dir = request
            .file_path
            .as_deref()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.cache_dir.clone());

        for dir in [dest_dir, self.config.data_dir.clone()] {
            match probe.usable_space(&dir) {
                Some(space) if space <= self.config.min_usable_space => {
                    warn!(
                        "目录 {:?} 可用空间 {} bytes 不足（至少需要 {} bytes），拒绝任务 {}",
                        dir,
                        space,
                        self.config.min_usable_space,
                        request.name()
                    );
                    let state = Arc::new(DownloadState::new(request, &self.config.cache_dir));
                    state.set_error_code(ErrorCode::UsableSpaceNotEnough, true);
                    self.publish(&state);
                    return false;
                }
                Some(_) => {}
                None => debug!("无法获取目录 {:?} 的可用空间，跳过检查", dir),
            }
        }
        true
    }

    /// 取出或创建请求对应的下载状态
    fn hydrate(&self, request: &DownloadRequest) -> Arc<DownloadState> {
        if let Some(state) = self.states.get(&request.id) {
            if state.url() == request.url {
                return state.clone();
            }
        }

        let record = match self.store.get(&request.id) {
            Ok(record) => record.filter(|r| {
                let same = r.url == request.url;
                if !same {
                    warn!("任务 {} 的下载地址已变化，重新开始下载", request.id);
                }
                same
            }),
            Err(e) => {
                warn!("读取任务 {} 的下载记录失败: {:#}", request.id, e);
                None
            }
        };

        let state = match record {
            Some(record) => {
                debug!("从下载记录恢复任务 {}", request.id);
                let state = Arc::new(DownloadState::from_record(record, &self.config.cache_dir));
                state.calculate_download_progress();
                state
            }
            None => {
                let state = Arc::new(DownloadState::new(request, &self.config.cache_dir));
                if let Err(e) = self.store.upsert(&state.to_record()) {
                    warn!("保存任务 {} 的下载记录失败: {:#}", request.id, e);
                }
                state
            }
        };
        self.states.insert(request.id.clone(), state.clone());
        state
    }

    /// 请求指定的执行器，或默认执行器；首次使用时初始化
    ///
    /// 调度器已停止时返回 None
    fn executor_for(
        self: &Arc<Self>,
        executors: &mut HashMap<String, Arc<dyn TaskExecutor>>,
        request: &DownloadRequest,
    ) -> Option<Arc<dyn TaskExecutor>> {
        let candidate = match &request.executor {
            Some(executor) => executor.clone(),
            None => self.default_executor()?,
        };

        if let Some(existing) = executors.get(candidate.name()) {
            return Some(existing.clone());
        }
        candidate.init(Arc::new(TrackedLifecycle {
            dispatcher: Arc::downgrade(self),
        }));
        executors.insert(candidate.name().to_string(), candidate.clone());
        Some(candidate)
    }

    /// 默认执行器，关闭后在下次启动时重建
    fn default_executor(&self) -> Option<Arc<dyn TaskExecutor>> {
        let mut default = self.default_executor.lock();
        match default.as_ref() {
            Some(executor) if !executor.is_shutdown() => Some(executor.clone()),
            _ if !self.running.load(Ordering::SeqCst) => None,
            _ => {
                let executor: Arc<dyn TaskExecutor> = Arc::new(WorkerPoolExecutor::new(
                    DEFAULT_EXECUTOR_NAME,
                    self.config.max_running_tasks,
                ));
                *default = Some(executor.clone());
                Some(executor)
            }
        }
    }

    fn host(&self) -> Option<Arc<dyn DownloadLifecycle>> {
        self.host.as_ref().and_then(Weak::upgrade)
    }
}

/// 包装宿主回调，维护正在下载的任务集合
struct TrackedLifecycle {
    dispatcher: Weak<DispatcherShared>,
}

impl DownloadLifecycle for TrackedLifecycle {
    fn on_download_start(&self, task: &DownloadTask) {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return;
        };
        if let Some(host) = dispatcher.host() {
            host.on_download_start(task);
        }
    }

    fn on_download_end(&self, task: &DownloadTask) {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return;
        };
        dispatcher
            .live
            .remove_if(task.id(), |_, state| Arc::ptr_eq(state, task.state()));

        if let Some(host) = dispatcher.host() {
            host.on_download_end(task);
        }

        // 结束前被重新恢复的任务再排一次队
        if task.state().status() == Some(TaskStatus::Waiting) && dispatcher.running.load(Ordering::SeqCst) {
            debug!("任务 {} 在结束前被恢复，重新排队", task.name());
            let request = task.state().request().unwrap_or_else(|| task.request().clone());
            dispatcher.push_pending(request);
        }
    }
}

async fn admission_loop(shared: Arc<DispatcherShared>, token: CancellationToken) {
    info!("下载调度任务已启动");
    loop {
        let notified = shared.wakeup.notified();
        if token.is_cancelled() {
            break;
        }
        if let Some(request) = shared.pop_pending() {
            shared.admit(request, &token);
            continue;
        }
        tokio::select! {
            _ = notified => {}
            _ = token.cancelled() => break,
        }
    }
    info!("下载调度任务已退出");
}

/// 下载请求调度器
pub struct DownloadDispatcher {
    shared: Arc<DispatcherShared>,
}

impl DownloadDispatcher {
    pub fn new(config: DownloadConfig, store: Arc<dyn DownloadStore>, transfer: Arc<dyn Transfer>) -> Self {
        Self::with_options(config, store, transfer, None, None, None)
    }

    /// 完整构造
    ///
    /// * `host` - 任务开始/结束回调（弱引用，通常是持有调度器的管理器）
    /// * `observer` - 空间不足时推送失败快照
    /// * `space_probe` - 为 None 时不检查可用空间
    pub fn with_options(
        config: DownloadConfig,
        store: Arc<dyn DownloadStore>,
        transfer: Arc<dyn Transfer>,
        host: Option<Weak<dyn DownloadLifecycle>>,
        observer: Option<Arc<dyn DownloadObserver>>,
        space_probe: Option<Arc<dyn SpaceProbe>>,
    ) -> Self {
        Self {
            shared: Arc::new(DispatcherShared {
                config,
                store,
                transfer,
                observer,
                space_probe,
                host,
                pending: Mutex::new(VecDeque::new()),
                wakeup: Notify::new(),
                running: AtomicBool::new(false),
                cancel_token: Mutex::new(CancellationToken::new()),
                executors: Mutex::new(HashMap::new()),
                default_executor: Mutex::new(None),
                live: DashMap::new(),
                states: DashMap::new(),
            }),
        }
    }

    /// 启动调度任务（重复调用无副作用）
    ///
    /// 必须在 tokio 运行时内调用
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let token = CancellationToken::new();
        *self.shared.cancel_token.lock() = token.clone();
        self.shared.default_executor();
        tokio::spawn(admission_loop(self.shared.clone(), token));
        info!("下载调度器已启动");
    }

    /// 提交请求，立即返回
    pub fn enqueue(&self, request: DownloadRequest) {
        self.start();
        debug!("收到下载请求: {}", request.name());
        self.shared.push_pending(request);
    }

    /// 停止调度并关闭所有执行器
    ///
    /// 已开始的任务自行结束；尚未开始的任务被丢弃并回到 Stopped
    pub fn cancel(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.cancel_token.lock().cancel();
        self.shared.wakeup.notify_waiters();

        let mut executors: Vec<Arc<dyn TaskExecutor>> =
            self.shared.executors.lock().drain().map(|(_, e)| e).collect();
        if let Some(default) = self.shared.default_executor.lock().take() {
            if !executors.iter().any(|e| e.name() == default.name()) {
                executors.push(default);
            }
        }

        for executor in executors {
            for task in executor.shutdown() {
                self.shared.live.remove(task.id());
                task.state().set_status(TaskStatus::Stopped);
            }
        }
        info!("下载调度器已停止");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// 任务是否已准入且尚未结束
    pub fn is_task_running(&self, id: &str) -> bool {
        self.shared.is_task_running(id)
    }

    /// 正在下载的任务状态
    pub fn live_state(&self, id: &str) -> Option<Arc<DownloadState>> {
        self.shared.live.get(id).map(|s| s.clone())
    }

    /// 已知的下载状态（包括已结束的）
    pub fn state(&self, id: &str) -> Option<Arc<DownloadState>> {
        self.shared.states.get(id).map(|s| s.clone())
    }

    /// 全部已知下载状态
    pub fn states(&self) -> Vec<Arc<DownloadState>> {
        self.shared.states.iter().map(|s| s.value().clone()).collect()
    }

    /// 登记一个已有的下载状态（启动时从存储恢复）
    pub fn register_state(&self, state: Arc<DownloadState>) {
        self.shared.states.insert(state.id().to_string(), state);
    }

    /// 移除下载状态
    pub fn remove_state(&self, id: &str) -> Option<Arc<DownloadState>> {
        self.shared.states.remove(id).map(|(_, s)| s)
    }

    /// 等待准入的请求数
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// 缓存目录
    pub fn cache_dir(&self) -> PathBuf {
        self.shared.config.cache_dir.clone()
    }
}

impl Drop for DownloadDispatcher {
    fn drop(&mut self) {
        self.shared.cancel_token.lock().cancel();
    }
}
