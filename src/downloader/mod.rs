//! 下载引擎模块
//!
//! 调度器把请求准入到执行器，执行器的工作线程通过传输层下载，
//! 每个下载的进度和断点信息由 `DownloadState` 维护，`DownloadManager` 是宿主入口

pub mod chunk;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod fragment;
pub mod manager;
pub mod output;
pub mod progress;
pub mod request;
pub mod space;
pub mod state;
pub mod task;
pub mod transfer;

#[cfg(test)]
mod test_support;

pub use chunk::{plan_chunks, Chunk, ChunkOutcome};
pub use dispatcher::{DownloadDispatcher, DEFAULT_EXECUTOR_NAME};
pub use error::ErrorCode;
pub use executor::{DownloadLifecycle, TaskExecutor, WorkerPoolExecutor, DEFAULT_THREAD_COUNT};
pub use manager::{DownloadManager, DownloadManagerBuilder};
pub use output::OutputFile;
pub use progress::{format_size, SpeedMonitor};
pub use request::{DownloadRequest, DownloadRequestBuilder};
pub use space::{DiskSpaceProbe, SpaceProbe};
pub use state::{DownloadSnapshot, DownloadState};
pub use task::{DownloadTask, TaskStatus};
pub use transfer::{file_name_from_url, HttpTransfer, Transfer};
