//! 进度事件节流器
//!
//! 控制进度快照的发布频率，避免事件风暴

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 500;

/// 进度事件节流器
///
/// 每次写入数据后调用 `should_emit()`，返回 true 时才发布快照
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次发布的时间（纳秒，相对进程内固定起点）
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距离上次发布超过间隔时返回 true 并更新时间戳
    pub fn should_emit(&self) -> bool {
        let now = Self::current_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }
        // 被其他线程抢先更新时本次不发布
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（完成、暂停等最后一次更新）
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos.store(Self::current_nanos(), Ordering::Relaxed);
        true
    }

    pub fn reset(&self) {
        self.last_emit_nanos.store(0, Ordering::Relaxed);
    }

    /// 单调时钟，起点为首次调用时刻（+1 保证非 0）
    fn current_nanos() -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_nanos() as u64 + 1
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
