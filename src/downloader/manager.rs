//! 下载管理器
//!
//! 宿主使用的入口：提交、暂停、停止、恢复、删除下载，查询下载列表和缓存。
//! 任务开始/结束时回写下载记录并推送快照

use crate::config::DownloadConfig;
use crate::downloader::dispatcher::DownloadDispatcher;
use crate::downloader::executor::DownloadLifecycle;
use crate::downloader::request::DownloadRequest;
use crate::downloader::space::SpaceProbe;
use crate::downloader::state::{DownloadSnapshot, DownloadState};
use crate::downloader::task::{DownloadTask, TaskStatus};
use crate::downloader::transfer::Transfer;
use crate::events::DownloadObserver;
use crate::persistence::DownloadStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// 下载管理器构建器
pub struct DownloadManagerBuilder {
    config: DownloadConfig,
    store: Arc<dyn DownloadStore>,
    transfer: Arc<dyn Transfer>,
    observer: Option<Arc<dyn DownloadObserver>>,
    space_probe: Option<Arc<dyn SpaceProbe>>,
}

impl DownloadManagerBuilder {
    pub fn observer(mut self, observer: Arc<dyn DownloadObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space_probe = Some(probe);
        self
    }

    /// 构建管理器，并从存储恢复已有的下载记录
    pub fn build(self) -> Arc<DownloadManager> {
        let manager = Arc::new_cyclic(|weak: &Weak<DownloadManager>| {
            let host: Weak<dyn DownloadLifecycle> = weak.clone();
            let dispatcher = DownloadDispatcher::with_options(
                self.config.clone(),
                self.store.clone(),
                self.transfer,
                Some(host),
                self.observer.clone(),
                self.space_probe,
            );
            DownloadManager {
                config: self.config,
                dispatcher,
                store: self.store,
                observer: self.observer,
                shutdown: AtomicBool::new(false),
            }
        });
        manager.restore();
        manager
    }
}

/// 下载管理器
pub struct DownloadManager {
    config: DownloadConfig,
    dispatcher: DownloadDispatcher,
    store: Arc<dyn DownloadStore>,
    observer: Option<Arc<dyn DownloadObserver>>,
    shutdown: AtomicBool,
}

impl DownloadManager {
    pub fn builder(
        config: DownloadConfig,
        store: Arc<dyn DownloadStore>,
        transfer: Arc<dyn Transfer>,
    ) -> DownloadManagerBuilder {
        DownloadManagerBuilder {
            config,
            store,
            transfer,
            observer: None,
            space_probe: None,
        }
    }

    /// 从存储加载历史记录
    fn restore(&self) {
        let records = match self.store.list() {
            Ok(records) => records,
            Err(e) => {
                warn!("加载下载记录失败: {:#}", e);
                return;
            }
        };

        let count = records.len();
        for record in records {
            let state = Arc::new(DownloadState::from_record(record, &self.config.cache_dir));
            state.calculate_download_progress();
            let status = if state.is_finished() {
                TaskStatus::Finished
            } else {
                TaskStatus::Stopped
            };
            state.set_status(status);
            self.dispatcher.register_state(state);
        }
        if count > 0 {
            info!("已恢复 {} 条下载记录", count);
        }
    }

    fn publish(&self, state: &Arc<DownloadState>) {
        if let Some(observer) = &self.observer {
            observer.on_progress(&state.snapshot());
        }
    }

    fn save(&self, state: &DownloadState) {
        if let Err(e) = self.store.upsert(&state.to_record()) {
            warn!("保存任务 {} 的下载记录失败: {:#}", state.id(), e);
        }
    }

    /// 提交下载请求
    pub fn submit(&self, request: DownloadRequest) {
        if self.is_shutdown() {
            warn!("下载管理器已关闭，忽略请求: {}", request.name());
            return;
        }
        self.dispatcher.enqueue(request);
    }

    /// 暂停：等待中直接暂停，下载中先进入暂停中，由传输层退出后转为已暂停
    pub fn pause(&self, id: &str) -> bool {
        let Some(state) = self.dispatcher.state(id) else {
            return false;
        };
        let next = match state.status() {
            Some(TaskStatus::Waiting) => TaskStatus::Paused,
            Some(TaskStatus::Running) => TaskStatus::Pausing,
            status => {
                debug!("任务 {} 当前状态 {:?}，无法暂停", id, status);
                return false;
            }
        };
        state.set_status(next);
        info!("任务 {} 暂停: {:?}", id, next);
        self.publish(&state);
        true
    }

    /// 停止
    pub fn stop(&self, id: &str) -> bool {
        let Some(state) = self.dispatcher.state(id) else {
            return false;
        };
        match state.status() {
            Some(TaskStatus::Waiting | TaskStatus::Running | TaskStatus::Pausing | TaskStatus::Paused) => {
                state.set_status(TaskStatus::Stopped);
                info!("任务 {} 已停止", id);
                self.publish(&state);
                true
            }
            status => {
                debug!("任务 {} 当前状态 {:?}，无需停止", id, status);
                false
            }
        }
    }

    /// 恢复下载
    ///
    /// 已准入但尚未结束的任务直接改回等待中，由执行器继续；否则重新提交
    pub fn resume(&self, id: &str) -> bool {
        if self.is_shutdown() {
            return false;
        }

        if let Some(state) = self.dispatcher.live_state(id) {
            return match state.status() {
                Some(TaskStatus::Paused | TaskStatus::Pausing | TaskStatus::Stopped) => {
                    state.set_status(TaskStatus::Waiting);
                    info!("任务 {} 已恢复", id);
                    self.publish(&state);
                    true
                }
                status => {
                    debug!("任务 {} 当前状态 {:?}，无需恢复", id, status);
                    false
                }
            };
        }

        let request = match self.dispatcher.state(id) {
            Some(state) => {
                if state.is_deleted() {
                    return false;
                }
                state.request().unwrap_or_else(|| request_from_state(&state))
            }
            None => match self.store.get(id) {
                Ok(Some(record)) => {
                    let state = DownloadState::from_record(record, &self.config.cache_dir);
                    request_from_state(&state)
                }
                Ok(None) => return false,
                Err(e) => {
                    warn!("读取任务 {} 的下载记录失败: {:#}", id, e);
                    return false;
                }
            },
        };

        info!("重新提交任务 {}", id);
        self.dispatcher.enqueue(request);
        true
    }

    /// 删除下载，同时删除输出文件、分片和下载记录
    pub fn delete(&self, id: &str) -> bool {
        // 先标记删除，正在结束的任务不再回写记录
        let state = self.dispatcher.state(id);
        if let Some(state) = &state {
            state.set_status(TaskStatus::Deleted);
        }
        self.dispatcher.remove_state(id);
        let existed = match self.store.delete(id) {
            Ok(existed) => existed,
            Err(e) => {
                warn!("删除任务 {} 的下载记录失败: {:#}", id, e);
                false
            }
        };

        let Some(state) = state else {
            return existed;
        };
        state.delete_output();
        state.delete_temp_dir();
        info!("任务 {} 已删除", id);
        self.publish(&state);
        true
    }

    /// 删除某个标签下的全部下载，返回删除数量
    pub fn delete_by_tag(&self, tag: &str) -> usize {
        let ids: Vec<String> = self
            .dispatcher
            .states()
            .into_iter()
            .filter(|s| s.tag() == Some(tag))
            .map(|s| s.id().to_string())
            .collect();
        ids.iter().filter(|id| self.delete(id)).count()
    }

    pub fn get(&self, id: &str) -> Option<DownloadSnapshot> {
        self.dispatcher.state(id).map(|s| s.snapshot())
    }

    /// 全部下载（按创建时间排序）
    pub fn get_all_list(&self) -> Vec<DownloadSnapshot> {
        self.list_where(|_| true)
    }

    /// 未完成的下载
    pub fn get_downloading_list(&self) -> Vec<DownloadSnapshot> {
        self.list_where(|s| !matches!(s.status(), Some(TaskStatus::Finished | TaskStatus::Deleted)))
    }

    /// 已完成的下载
    pub fn get_downloaded_list(&self) -> Vec<DownloadSnapshot> {
        self.list_where(|s| s.status() == Some(TaskStatus::Finished))
    }

    fn list_where<F: Fn(&DownloadState) -> bool>(&self, filter: F) -> Vec<DownloadSnapshot> {
        let mut list: Vec<DownloadSnapshot> = self
            .dispatcher
            .states()
            .iter()
            .filter(|s| filter(s))
            .map(|s| s.snapshot())
            .collect();
        list.sort_by_key(|s| s.create_time);
        list
    }

    /// url 是否已下载完成且文件完整
    pub fn has_cached(&self, url: &str) -> bool {
        self.file_from_cache(url).is_some()
    }

    /// 已下载完成的文件路径
    pub fn file_from_cache(&self, url: &str) -> Option<PathBuf> {
        self.dispatcher
            .states()
            .into_iter()
            .filter(|s| s.url() == url)
            .find(|s| s.is_finished())
            .and_then(|s| s.output_path())
    }

    /// 关闭：停止调度，未开始的任务被丢弃，下载中的任务停止
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatcher.cancel();
        for state in self.dispatcher.states() {
            if state.is_running() {
                state.set_status(TaskStatus::Stopped);
            }
            if !state.is_deleted() {
                self.save(&state);
            }
        }
        info!("下载管理器已关闭");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn dispatcher(&self) -> &DownloadDispatcher {
        &self.dispatcher
    }
}

impl DownloadLifecycle for DownloadManager {
    fn on_download_start(&self, task: &DownloadTask) {
        debug!("任务 {} 开始执行", task.name());
        self.publish(task.state());
    }

    fn on_download_end(&self, task: &DownloadTask) {
        let state = task.state();
        if !state.is_deleted() {
            self.save(state);
        }
        self.publish(state);
    }
}

/// 没有绑定请求时按状态重建
fn request_from_state(state: &DownloadState) -> DownloadRequest {
    let mut builder = DownloadRequest::builder(state.url()).id(state.id());
    if let Some(tag) = state.tag() {
        builder = builder.tag(tag);
    }
    if let Some(path) = state.file_path() {
        builder = builder.file_path(path);
    }
    if let Some(scheme) = state.scheme() {
        builder = builder.scheme(scheme);
    }
    builder.build()
}
