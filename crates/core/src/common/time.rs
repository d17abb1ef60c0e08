use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// # Summary
/// 时钟接口，向图表面板提供当前毫秒时间戳。
/// 时间模式下面板依赖它在无成交时推进空 Bar。
pub trait Clock: Send + Sync {
    /// 获取当前 Unix 毫秒时间戳
    fn now_ms(&self) -> i64;
}

/// # Summary
/// 系统真实时钟。
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// # Summary
/// 可手动拨动的时钟，用于回放与测试。
///
/// # Invariants
/// - 基于原子变量，跨线程读写无需加锁。
pub struct ManualClock {
    current: AtomicI64,
}

impl ManualClock {
    pub fn new(initial_ms: i64) -> Self {
        Self {
            current: AtomicI64::new(initial_ms),
        }
    }

    /// 将时钟设置到指定时间
    pub fn set(&self, ms: i64) {
        self.current.store(ms, Ordering::SeqCst);
    }

    /// 将时钟向前拨动 `delta_ms`
    pub fn advance(&self, delta_ms: i64) {
        self.current.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }
}

/// # Summary
/// 将时间戳向下取整到周期网格。
///
/// # Arguments
/// * `timestamp`: 毫秒时间戳。
/// * `timeframe`: 周期长度 (毫秒)，非正数时原样返回。
/// * `offset`: 网格偏移量 (毫秒)。
///
/// # Returns
/// 不大于 `timestamp` 的最近网格点。
pub fn floor_to_grid(timestamp: i64, timeframe: i64, offset: i64) -> i64 {
    if timeframe <= 0 {
        return timestamp;
    }
    (timestamp - offset).div_euclid(timeframe) * timeframe + offset
}
