//! 下载记录持久化模块
//!
//! 保存断点续传所需的任务信息（地址、保存路径、文件长度、完成标记等），
//! 程序重启后由调度器按任务ID读回。已下载的字节数不落盘，
//! 由下载状态扫描分片目录重建。
//!
//! ## 文件结构
//!
//! ```text
//! {data_dir}/records/
//! └── {md5(id)}.meta    # 下载记录（JSON 格式）
//! ```

pub mod metadata;
pub mod store;
pub mod types;

pub use metadata::MetadataStore;
pub use store::{DownloadStore, MemoryStore};
pub use types::DownloadRecord;
