use crate::boundary::{
    Boundary, average_close, bps_boundary, tick_boundary, time_boundary, vol_boundary,
};
use std::collections::{HashMap, HashSet};
use tickchart_core::chart::entity::Renderer;
use tickchart_core::common::time::floor_to_grid;
use tickchart_core::common::{AggregationMode, MarketKey};
use tickchart_core::config::ChartConfig;
use tickchart_core::market::entity::{Bar, Counters, Trade};
use tickchart_core::market::error::MarketError;
use tracing::trace;

/// # Summary
/// 成交聚合器：决定 Bar 边界并把成交累加进 Renderer。
///
/// # Invariants
/// - 不持有 Renderer，所有修改都作用于调用方传入的实例。
/// - 只接受已跟踪市场的成交；`markets` 为空时跟踪全部市场。
/// - 被过滤掉的市场仍维护自己的来源 Bar，只是不计入复合 Bar。
#[derive(Debug, Clone)]
pub struct Aggregator {
    mode: AggregationMode,
    // 周期大小，含义随模式变化
    size: f64,
    // 时间模式下的周期毫秒数
    duration: i64,
    // 时间网格偏移
    offset: i64,
    markets: HashSet<String>,
    filters: HashMap<String, bool>,
}

impl Aggregator {
    pub fn new(config: &ChartConfig) -> Self {
        Self {
            mode: config.mode,
            size: config.timeframe,
            duration: config.bar_duration(),
            offset: config.grid_offset(),
            markets: config.markets.iter().cloned().collect(),
            filters: config.filters.clone(),
        }
    }

    pub fn mode(&self) -> AggregationMode {
        self.mode
    }

    pub fn bar_duration(&self) -> i64 {
        self.duration
    }

    pub fn track(&mut self, market: &MarketKey) {
        self.markets.insert(market.id());
    }

    pub fn tracks(&self, market: &str) -> bool {
        self.markets.is_empty() || self.markets.contains(market)
    }

    pub fn set_filter(&mut self, market: &str, enabled: bool) {
        self.filters.insert(market.to_string(), enabled);
    }

    pub fn is_enabled(&self, market: &str) -> bool {
        self.filters.get(market).copied().unwrap_or(true)
    }

    /// 首根 Bar 的起始时间：时间模式对齐网格，其余模式直接使用给定时间
    pub fn start_timestamp(&self, now: i64) -> i64 {
        match self.mode {
            AggregationMode::Time => floor_to_grid(now, self.duration, self.offset),
            _ => now,
        }
    }

    /// # Summary
    /// 判断一笔成交是否需要开启新 Bar。
    ///
    /// # Logic
    /// 1. 校验成交并确认市场已被跟踪。
    /// 2. 按模式计算边界。
    /// 3. bps 模式给出的平均价在此处写入当前复合 Bar 的 `close`，早于任何切换。
    ///
    /// # Returns
    /// 需要切换时返回新 Bar 的时间戳，否则返回 `None`。
    pub fn decide(
        &self,
        renderer: &mut Renderer,
        trade: &Trade,
    ) -> Result<Option<i64>, MarketError> {
        trade.validate()?;
        let key = trade.market().id();
        if !self.tracks(&key) {
            trace!("Skipping trade for untracked market {}", key);
            return Err(MarketError::UnknownMarket(key));
        }

        let boundary = self.boundary(renderer, trade);
        if let Some(close) = boundary.close {
            set_close(&mut renderer.bar, close);
        }
        Ok(boundary.crosses(renderer).then_some(boundary.timestamp))
    }

    fn boundary(&self, renderer: &Renderer, trade: &Trade) -> Boundary {
        match self.mode {
            AggregationMode::Time => time_boundary(renderer, self.duration, self.offset, trade),
            AggregationMode::Tick => tick_boundary(renderer, self.size, trade),
            AggregationMode::Vol => vol_boundary(renderer, self.size, trade),
            AggregationMode::Bps => {
                bps_boundary(renderer, self.size, trade, |key| self.is_enabled(key))
            }
        }
    }

    /// 将成交累加进对应来源 Bar 并刷新复合 Bar
    pub fn accumulate(&self, renderer: &mut Renderer, trade: &Trade) {
        renderer.source_mut(&trade.market()).apply_trade(trade);
        self.refresh_composite(renderer);
    }

    /// # Summary
    /// 单笔成交的完整处理：决策、必要时切换、累加。
    ///
    /// # Returns
    /// 本次切换封存的来源 Bar；未切换时为空。
    pub fn push(&self, renderer: &mut Renderer, trade: &Trade) -> Result<Vec<Bar>, MarketError> {
        let sealed = match self.decide(renderer, trade)? {
            Some(timestamp) => roll(renderer, timestamp),
            None => Vec::new(),
        };
        self.accumulate(renderer, trade);
        Ok(sealed)
    }

    /// 时间模式下根据时钟推进空 Bar
    pub fn on_clock(&self, renderer: &Renderer, now: i64) -> Option<i64> {
        if self.mode != AggregationMode::Time {
            return None;
        }
        let next = floor_to_grid(now, self.duration, self.offset);
        (next > renderer.timestamp).then_some(next)
    }

    /// # Summary
    /// 由来源 Bar 重新计算复合 Bar。
    ///
    /// # Logic
    /// 1. 计数器为启用来源之和。
    /// 2. 价格取启用来源收盘价的平均；bps 模式下 `close` 由边界决策维护，此处只更新高低点。
    pub fn refresh_composite(&self, renderer: &mut Renderer) {
        let mut counters = Counters::default();
        let mut empty = true;
        for (key, bar) in &renderer.sources {
            if self.is_enabled(key) {
                counters.add(&bar.counters);
                empty &= bar.empty;
            }
        }
        let average = average_close(renderer, |key| self.is_enabled(key));

        let bar = &mut renderer.bar;
        bar.counters = counters;
        bar.empty = empty;
        if let Some(price) = average {
            if self.mode == AggregationMode::Bps {
                extend_range(bar, price);
            } else {
                bar.apply_price(price);
            }
        }
    }

    /// # Summary
    /// 历史回放：把同一时间的一组缓存 Bar 装入 Renderer。
    ///
    /// # Logic
    /// 1. 定位时间并覆盖对应来源。
    /// 2. 复合 Bar 的各价格字段取启用来源的平均，计数器求和。
    pub fn load_frame(&self, renderer: &mut Renderer, bars: &[Bar]) {
        let Some(first) = bars.first() else {
            return;
        };
        renderer.set_timestamp(first.time);
        for bar in bars {
            renderer.sources.insert(bar.market().id(), bar.clone());
        }

        let enabled: Vec<&Bar> = renderer
            .sources
            .iter()
            .filter(|(key, bar)| self.is_enabled(key) && bar.time == first.time)
            .map(|(_, bar)| bar)
            .collect();
        let mean = |field: fn(&Bar) -> Option<f64>| {
            let values: Vec<f64> = enabled.iter().filter_map(|b| field(b)).collect();
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / len_f64(values.len()))
        };
        let (open, high, low, close) = (
            mean(|b| b.open),
            mean(|b| b.high),
            mean(|b| b.low),
            mean(|b| b.close),
        );
        let mut counters = Counters::default();
        let mut empty = true;
        for bar in &enabled {
            counters.add(&bar.counters);
            empty &= bar.empty;
        }

        let bar = &mut renderer.bar;
        bar.open = open.or(bar.open);
        bar.high = high.or(bar.high);
        bar.low = low.or(bar.low);
        bar.close = close.or(bar.close);
        bar.counters = counters;
        bar.empty = empty;
    }
}

/// # Summary
/// 整体替换 Renderer 并返回封存的来源 Bar。
pub fn roll(renderer: &mut Renderer, timestamp: i64) -> Vec<Bar> {
    let current = std::mem::take(renderer);
    let (next, sealed) = current.advance(timestamp);
    *renderer = next;
    sealed
}

/// 按时间把有序 Bar 列表切分为回放帧
pub fn frames(bars: &[Bar]) -> impl Iterator<Item = &[Bar]> {
    bars.chunk_by(|a, b| a.time == b.time)
}

fn set_close(bar: &mut Bar, close: f64) {
    extend_range(bar, close);
    bar.close = Some(close);
}

fn extend_range(bar: &mut Bar, price: f64) {
    if bar.open.is_none() {
        bar.open = Some(price);
    }
    if bar.close.is_none() {
        bar.close = Some(price);
    }
    bar.high = Some(bar.high.map_or(price, |h| h.max(price)));
    bar.low = Some(bar.low.map_or(price, |l| l.min(price)));
}

#[allow(clippy::cast_precision_loss)]
fn len_f64(n: usize) -> f64 {
    n as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickchart_core::common::Side;

    fn trade(exchange: &str, timestamp: i64, price: f64, size: f64, side: Side) -> Trade {
        Trade {
            exchange: exchange.into(),
            pair: "btcusdt".into(),
            timestamp,
            price,
            size,
            side,
            liquidation: false,
        }
    }

    fn config(mode: AggregationMode, timeframe: f64) -> ChartConfig {
        ChartConfig {
            mode,
            timeframe,
            ..ChartConfig::default()
        }
    }

    #[test]
    fn test_volume_sums_match_routed_trades() {
        let agg = Aggregator::new(&config(AggregationMode::Time, 60_000.0));
        let mut renderer = Renderer::new(0, 0, 60_000);
        let mut liquidation = trade("BINANCE", 10, 100.0, 3.0, Side::Sell);
        liquidation.liquidation = true;
        for t in [
            trade("BINANCE", 1, 100.0, 1.5, Side::Buy),
            trade("BINANCE", 2, 101.0, 2.0, Side::Sell),
            trade("COINBASE", 3, 102.0, 0.5, Side::Buy),
            liquidation,
        ] {
            assert!(agg.push(&mut renderer, &t).unwrap().is_empty());
        }
        assert_eq!(renderer.bar.counters.volume(), 4.0);
        assert_eq!(renderer.bar.counters.lsell, 3.0);
        assert_eq!(renderer.bar.counters.count(), 4.0);
        assert_eq!(renderer.sources.len(), 2);
        assert!(!renderer.bar.empty);
    }

    #[test]
    fn test_time_boundary_seals_and_resets() {
        let agg = Aggregator::new(&config(AggregationMode::Time, 60_000.0));
        let mut renderer = Renderer::new(0, 0, 60_000);
        agg.push(&mut renderer, &trade("BINANCE", 1_000, 100.0, 1.0, Side::Buy))
            .unwrap();
        agg.push(&mut renderer, &trade("BINANCE", 2_000, 105.0, 1.0, Side::Buy))
            .unwrap();

        let sealed = agg
            .push(&mut renderer, &trade("BINANCE", 61_000, 90.0, 2.0, Side::Sell))
            .unwrap();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].time, 0);
        assert_eq!(sealed[0].close, Some(105.0));
        assert_eq!(sealed[0].counters.vbuy, 2.0);

        assert_eq!(renderer.timestamp, 60_000);
        let source = &renderer.sources["BINANCE:btcusdt"];
        assert_eq!(source.open, Some(105.0));
        assert_eq!(source.close, Some(90.0));
        assert_eq!(source.counters.vsell, 2.0);
        assert_eq!(source.counters.vbuy, 0.0);
    }

    #[test]
    fn test_vol_mode_forces_strictly_increasing_timestamps() {
        let agg = Aggregator::new(&config(AggregationMode::Vol, 1000.0));
        let mut renderer = Renderer::new(5_000, 0, 0);
        agg.push(&mut renderer, &trade("BINANCE", 5_000, 1.0, 600.0, Side::Buy))
            .unwrap();
        agg.push(&mut renderer, &trade("BINANCE", 5_000, 1.0, 500.0, Side::Buy))
            .unwrap();
        assert_eq!(renderer.timestamp, 5_000);

        let sealed = agg
            .push(&mut renderer, &trade("BINANCE", 5_000, 1.0, 1.0, Side::Buy))
            .unwrap();
        assert_eq!(sealed[0].counters.volume(), 1100.0);
        assert_eq!(renderer.timestamp, 5_001);
    }

    #[test]
    fn test_filtered_market_excluded_from_composite() {
        let mut agg = Aggregator::new(&config(AggregationMode::Time, 60_000.0));
        agg.set_filter("COINBASE:btcusdt", false);
        let mut renderer = Renderer::new(0, 0, 60_000);
        agg.push(&mut renderer, &trade("BINANCE", 1, 100.0, 1.0, Side::Buy))
            .unwrap();
        agg.push(&mut renderer, &trade("COINBASE", 2, 200.0, 5.0, Side::Buy))
            .unwrap();
        assert_eq!(renderer.bar.counters.vbuy, 1.0);
        assert_eq!(renderer.bar.close, Some(100.0));
        assert_eq!(renderer.sources["COINBASE:btcusdt"].counters.vbuy, 5.0);
    }

    #[test]
    fn test_untracked_and_invalid_trades_are_rejected() {
        let mut cfg = config(AggregationMode::Time, 60_000.0);
        cfg.markets = vec!["BINANCE:btcusdt".into()];
        let agg = Aggregator::new(&cfg);
        let mut renderer = Renderer::new(0, 0, 60_000);
        assert!(matches!(
            agg.push(&mut renderer, &trade("KRAKEN", 1, 1.0, 1.0, Side::Buy)),
            Err(MarketError::UnknownMarket(_))
        ));
        assert!(matches!(
            agg.push(&mut renderer, &trade("BINANCE", 1, 1.0, -1.0, Side::Buy)),
            Err(MarketError::InvalidTrade(_))
        ));
        assert!(renderer.sources.is_empty());
    }

    #[test]
    fn test_bps_mode_writes_close_before_switch() {
        let agg = Aggregator::new(&config(AggregationMode::Bps, 50.0));
        let mut renderer = Renderer::new(0, 0, 0);
        agg.push(&mut renderer, &trade("BINANCE", 1, 100.0, 1.0, Side::Buy))
            .unwrap();
        assert_eq!(renderer.bar.close, Some(100.0));

        agg.push(&mut renderer, &trade("BINANCE", 2, 100.3, 1.0, Side::Buy))
            .unwrap();
        // 收盘价由边界决策维护，累加只扩展高低点
        assert_eq!(renderer.bar.close, Some(100.0));
        assert_eq!(renderer.bar.high, Some(100.3));

        // 每步约 30 基点，相对开盘已超过 50 基点，但相对上一收盘价未超过
        agg.push(&mut renderer, &trade("BINANCE", 3, 100.6, 1.0, Side::Buy))
            .unwrap();
        agg.push(&mut renderer, &trade("BINANCE", 4, 100.9, 1.0, Side::Buy))
            .unwrap();
        assert_eq!(renderer.timestamp, 0);
        assert_eq!(renderer.bar.open, Some(100.0));
        assert_eq!(renderer.bar.close, Some(100.6));

        agg.push(&mut renderer, &trade("BINANCE", 5, 102.0, 1.0, Side::Buy))
            .unwrap();
        assert_eq!(renderer.timestamp, 0);
        let sealed = agg
            .push(&mut renderer, &trade("BINANCE", 6, 102.0, 1.0, Side::Buy))
            .unwrap();
        assert_eq!(sealed.len(), 1);
        assert_eq!(renderer.timestamp, 6);
        assert_eq!(renderer.bar.open, Some(102.0));
    }

    #[test]
    fn test_clock_advances_time_mode_only() {
        let agg = Aggregator::new(&config(AggregationMode::Time, 60_000.0));
        let renderer = Renderer::new(0, 0, 60_000);
        assert_eq!(agg.on_clock(&renderer, 59_999), None);
        assert_eq!(agg.on_clock(&renderer, 130_000), Some(120_000));

        let agg = Aggregator::new(&config(AggregationMode::Tick, 10.0));
        assert_eq!(agg.on_clock(&renderer, 130_000), None);
    }

    #[test]
    fn test_load_frame_builds_composite() {
        let agg = Aggregator::new(&config(AggregationMode::Time, 60_000.0));
        let mut a = Bar::new(&MarketKey::new("A", "x"), 60_000);
        a.apply_trade(&trade("A", 60_000, 100.0, 1.0, Side::Buy));
        let mut b = Bar::new(&MarketKey::new("B", "x"), 60_000);
        b.apply_trade(&trade("B", 60_000, 102.0, 2.0, Side::Sell));
        let bars = vec![a, b];

        let mut renderer = Renderer::new(0, 0, 60_000);
        let frame: Vec<&[Bar]> = frames(&bars).collect();
        assert_eq!(frame.len(), 1);
        agg.load_frame(&mut renderer, frame[0]);
        assert_eq!(renderer.timestamp, 60_000);
        assert_eq!(renderer.bar.close, Some(101.0));
        assert_eq!(renderer.bar.counters.volume(), 3.0);
    }
}
