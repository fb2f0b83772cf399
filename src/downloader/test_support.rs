//! 测试用传输层：记录执行顺序，可按任务ID卡住直到测试放行

use crate::downloader::executor::DownloadLifecycle;
use crate::downloader::request::DownloadRequest;
use crate::downloader::state::DownloadState;
use crate::downloader::task::{DownloadTask, TaskStatus};
use crate::downloader::transfer::Transfer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// 模拟文件大小
pub(crate) const FAKE_SIZE: u64 = 1024;

pub(crate) struct RecordingTransfer {
    gated: bool,
    started: Mutex<Vec<String>>,
    ended: Mutex<Vec<String>>,
    skipped: Mutex<Vec<String>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl RecordingTransfer {
    /// 立即完成的传输
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::with_gate(false))
    }

    /// 每个任务都要等 `release(id)` 才能完成
    pub(crate) fn gated() -> Arc<Self> {
        Arc::new(Self::with_gate(true))
    }

    fn with_gate(gated: bool) -> Self {
        Self {
            gated,
            started: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
            skipped: Mutex::new(Vec::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, id: &str) -> Arc<Semaphore> {
        self.gates
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    pub(crate) fn release(&self, id: &str) {
        self.gate(id).add_permits(1);
    }

    pub(crate) fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub(crate) fn ended(&self) -> Vec<String> {
        self.ended.lock().clone()
    }

    pub(crate) fn skipped(&self) -> Vec<String> {
        self.skipped.lock().clone()
    }

    pub(crate) async fn wait_started(&self, count: usize) {
        wait_until(|| self.started.lock().len() >= count).await;
    }

    pub(crate) async fn wait_ended(&self, count: usize) {
        wait_until(|| self.ended.lock().len() >= count).await;
    }
}

#[async_trait]
impl Transfer for RecordingTransfer {
    async fn transfer(&self, task: &DownloadTask) {
        let state = task.state();
        if state.status() != Some(TaskStatus::Waiting) {
            self.skipped.lock().push(task.id().to_string());
            return;
        }
        state.set_status(TaskStatus::Running);
        self.started.lock().push(task.id().to_string());

        if self.gated {
            let gate = self.gate(task.id());
            let _ = gate.acquire().await.map(|permit| permit.forget());
        }

        state.set_content_length(Some(FAKE_SIZE));
        state.download(FAKE_SIZE);
        state.set_finished(true);
        state.set_status(TaskStatus::Finished);
        self.ended.lock().push(task.id().to_string());
    }
}

/// 轮询等待条件成立，5秒超时视为测试失败
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "等待条件超时");
}

/// 记录生命周期回调的测试实现
#[derive(Default)]
pub(crate) struct RecordingLifecycle {
    starts: Mutex<Vec<String>>,
    ends: Mutex<Vec<String>>,
}

impl RecordingLifecycle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn starts(&self) -> Vec<String> {
        self.starts.lock().clone()
    }

    pub(crate) fn ends(&self) -> Vec<String> {
        self.ends.lock().clone()
    }
}

impl DownloadLifecycle for RecordingLifecycle {
    fn on_download_start(&self, task: &DownloadTask) {
        self.starts.lock().push(task.id().to_string());
    }

    fn on_download_end(&self, task: &DownloadTask) {
        self.ends.lock().push(task.id().to_string());
    }
}

/// 构造一个绑定到测试传输层的任务
pub(crate) fn make_task(cache_dir: &Path, id: &str, transfer: Arc<dyn Transfer>) -> DownloadTask {
    let request = DownloadRequest::builder(format!("https://example.com/{}.bin", id))
        .id(id)
        .file_path(cache_dir.join(format!("{}.bin", id)))
        .build();
    let state = Arc::new(DownloadState::new(&request, cache_dir));
    DownloadTask::new(request, state, transfer)
}
