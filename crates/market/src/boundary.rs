use tickchart_core::chart::entity::Renderer;
use tickchart_core::common::time::floor_to_grid;
use tickchart_core::market::entity::Trade;

/// bps 模式的放大系数 (1 基点 = 1/10000)
pub const BPS_SCALE: f64 = 10_000.0;

/// # Summary
/// 边界决策结果。
///
/// # Invariants
/// - `timestamp >= renderer.timestamp`，严格大于时表示需要开启新 Bar。
/// - 只有 bps 模式会给出 `close`，调用方需在切换 Bar 之前将其写入复合 Bar。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Boundary {
    pub timestamp: i64,
    pub close: Option<f64>,
}

impl Boundary {
    fn stay(renderer: &Renderer) -> Self {
        Self {
            timestamp: renderer.timestamp,
            close: None,
        }
    }

    /// # Summary
    /// 强制开启新 Bar。
    ///
    /// # Logic
    /// 新时间取 `max(当前时间 + 1, 成交时间)`，保证同一毫秒内的多次切换仍严格递增。
    fn forced(renderer: &Renderer, trade: &Trade) -> Self {
        Self {
            timestamp: (renderer.timestamp + 1).max(trade.timestamp),
            close: None,
        }
    }

    pub fn crosses(&self, renderer: &Renderer) -> bool {
        self.timestamp > renderer.timestamp
    }
}

/// # Summary
/// 时间模式：将成交时间向下取整到网格。
///
/// # Arguments
/// * `duration`: 周期毫秒数。
/// * `offset`: 网格偏移 (奇偶错位)。
///
/// # Returns
/// 不早于当前 Bar 的边界；迟到的成交留在当前 Bar 内。
pub fn time_boundary(renderer: &Renderer, duration: i64, offset: i64, trade: &Trade) -> Boundary {
    let floored = floor_to_grid(trade.timestamp, duration, offset);
    Boundary {
        timestamp: floored.max(renderer.timestamp),
        close: None,
    }
}

/// tick 模式：当前 Bar 的成交笔数达到阈值后切换
pub fn tick_boundary(renderer: &Renderer, size: f64, trade: &Trade) -> Boundary {
    if renderer.bar.counters.count() >= size {
        Boundary::forced(renderer, trade)
    } else {
        Boundary::stay(renderer)
    }
}

/// vol 模式：当前 Bar 的成交量达到阈值后切换
pub fn vol_boundary(renderer: &Renderer, size: f64, trade: &Trade) -> Boundary {
    if renderer.bar.counters.volume() >= size {
        Boundary::forced(renderer, trade)
    } else {
        Boundary::stay(renderer)
    }
}

/// # Summary
/// bps 模式：活跃市场的平均收盘价相对当前 Bar 收盘价的偏离超过阈值时切换。
///
/// # Logic
/// 1. 对启用的来源收盘价取平均，没有任何报价时保持不变。
/// 2. 偏离按基点计算：`|avg / close - 1| * 10000`，尚无收盘价时以开盘价为准。
/// 3. 无论是否切换，均在结果中给出新的平均价，由调用方写入复合 Bar 的 `close`。
///
/// # Arguments
/// * `enabled`: 判断来源是否参与复合计算。
pub fn bps_boundary(
    renderer: &Renderer,
    size: f64,
    trade: &Trade,
    enabled: impl Fn(&str) -> bool,
) -> Boundary {
    let Some(average) = average_close(renderer, enabled) else {
        return Boundary::stay(renderer);
    };

    let reference = renderer.bar.close.or(renderer.bar.open);
    let crossed = reference
        .filter(|r| *r != 0.0)
        .is_some_and(|r| ((average / r) - 1.0).abs() * BPS_SCALE > size);

    let base = if crossed {
        Boundary::forced(renderer, trade)
    } else {
        Boundary::stay(renderer)
    };
    Boundary {
        close: Some(average),
        ..base
    }
}

/// 启用来源的平均收盘价
pub fn average_close(renderer: &Renderer, enabled: impl Fn(&str) -> bool) -> Option<f64> {
    let (sum, n) = renderer
        .sources
        .iter()
        .filter(|(key, _)| enabled(key))
        .filter_map(|(_, bar)| bar.close)
        .fold((0.0, 0u32), |(sum, n), close| (sum + close, n + 1));
    (n > 0).then(|| sum / f64::from(n))
}
