use std::time::{Duration, Instant};

/// 速度采样最小间隔
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// 速度监测器
///
/// 累加每个采样区间内写入的字节数，区间结束时换算为字节/秒。
/// 每个下载状态各持有一个，不共享
#[derive(Debug)]
pub struct SpeedMonitor {
    /// 本区间内累计字节数
    interval_bytes: u64,
    /// 区间开始时间
    interval_start: Instant,
    /// 上次计算出的速度 (bytes/s)
    bytes_per_sec: u64,
}

impl SpeedMonitor {
    pub fn new() -> Self {
        Self {
            interval_bytes: 0,
            interval_start: Instant::now(),
            bytes_per_sec: 0,
        }
    }

    /// 记录新写入的字节数
    pub fn download(&mut self, bytes: u64) {
        self.interval_bytes = self.interval_bytes.saturating_add(bytes);
    }

    /// 当前速度 (bytes/s)
    ///
    /// 距离上次采样不足1秒时返回上次的结果
    pub fn bytes_per_sec(&mut self) -> u64 {
        let elapsed = self.interval_start.elapsed();
        if elapsed >= SAMPLE_INTERVAL {
            self.bytes_per_sec = (self.interval_bytes as f64 / elapsed.as_secs_f64()) as u64;
            self.interval_bytes = 0;
            self.interval_start = Instant::now();
        }
        self.bytes_per_sec
    }

    /// 格式化后的速度，如 "1.5 MB/s"
    pub fn speed(&mut self) -> String {
        format!("{}/s", format_size(self.bytes_per_sec()))
    }

    /// 重新开始计速（暂停后恢复时使用）
    pub fn reset(&mut self) {
        self.interval_bytes = 0;
        self.interval_start = Instant::now();
        self.bytes_per_sec = 0;
    }
}

impl Default for SpeedMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// 字节数格式化
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
