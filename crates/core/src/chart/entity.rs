use crate::chart::state::IndicatorState;
use crate::common::MarketKey;
use crate::market::entity::{Bar, Counters};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// 扁平的键值配置表，用于指标选项与绘图样式
pub type OptionMap = serde_json::Map<String, serde_json::Value>;

/// # Summary
/// 指标向渲染端输出的单个序列点。
///
/// # Invariants
/// - 序列化时不带标签，字段名与渲染端约定一致 (`lowerValue` / `higherValue`)。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SeriesPoint {
    #[serde(rename_all = "camelCase")]
    Range {
        time: i64,
        lower_value: Option<f64>,
        higher_value: Option<f64>,
    },
    Ohlc {
        time: i64,
        open: Option<f64>,
        high: Option<f64>,
        low: Option<f64>,
        close: Option<f64>,
    },
    Value {
        time: i64,
        value: Option<f64>,
    },
}

impl SeriesPoint {
    pub fn time(&self) -> i64 {
        match self {
            SeriesPoint::Value { time, .. }
            | SeriesPoint::Ohlc { time, .. }
            | SeriesPoint::Range { time, .. } => *time,
        }
    }
}

/// 绘图函数期望的输入形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlotShape {
    Number,
    Ohlc,
    Range,
}

/// # Summary
/// 绘图类型，决定输入形态、默认样式与输出过滤规则。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlotType {
    Line,
    Area,
    Baseline,
    Histogram,
    Candlestick,
    #[serde(rename = "plotbar")]
    Bar,
    CloudArea,
    BrokenArea,
}

impl PlotType {
    /// # Summary
    /// 按函数名解析绘图类型。
    ///
    /// # Logic
    /// 1. 先匹配完整名称 (`plotbar` 为独立类型)。
    /// 2. 再去掉 `plot` 前缀重试，支持 `plotline` 等别名。
    pub fn from_name(name: &str) -> Option<Self> {
        let exact = match name {
            "line" => Some(PlotType::Line),
            "area" => Some(PlotType::Area),
            "baseline" => Some(PlotType::Baseline),
            "histogram" => Some(PlotType::Histogram),
            "candlestick" => Some(PlotType::Candlestick),
            "plotbar" => Some(PlotType::Bar),
            "cloudarea" => Some(PlotType::CloudArea),
            "brokenarea" => Some(PlotType::BrokenArea),
            _ => None,
        };
        exact.or_else(|| {
            name.strip_prefix("plot")
                .filter(|rest| *rest != "bar")
                .and_then(PlotType::from_name)
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            PlotType::Line => "line",
            PlotType::Area => "area",
            PlotType::Baseline => "baseline",
            PlotType::Histogram => "histogram",
            PlotType::Candlestick => "candlestick",
            PlotType::Bar => "plotbar",
            PlotType::CloudArea => "cloudarea",
            PlotType::BrokenArea => "brokenarea",
        }
    }

    pub fn shape(&self) -> PlotShape {
        match self {
            PlotType::Line | PlotType::Area | PlotType::Baseline | PlotType::Histogram => {
                PlotShape::Number
            }
            PlotType::Candlestick | PlotType::Bar => PlotShape::Ohlc,
            PlotType::CloudArea | PlotType::BrokenArea => PlotShape::Range,
        }
    }

    /// 绘图类型自带的默认样式
    pub fn default_options(&self) -> OptionMap {
        let value = match self {
            PlotType::Line => serde_json::json!({ "lineWidth": 1 }),
            PlotType::Area => serde_json::json!({ "lineWidth": 1, "topColor": "rgba(38,166,154,0.4)" }),
            PlotType::Baseline => serde_json::json!({ "baseValue": 0 }),
            PlotType::Histogram => serde_json::json!({ "base": 0 }),
            PlotType::Candlestick | PlotType::Bar => serde_json::json!({
                "upColor": "#26a69a",
                "downColor": "#ef5350"
            }),
            PlotType::CloudArea | PlotType::BrokenArea => {
                serde_json::json!({ "positiveColor": "rgba(38,166,154,0.3)" })
            }
        };
        match value {
            serde_json::Value::Object(map) => map,
            _ => OptionMap::new(),
        }
    }

    /// # Summary
    /// 输出过滤规则：决定一个点是否送往渲染端。
    ///
    /// # Logic
    /// - 柱状图：值为真 (非空、非零、非 NaN)。
    /// - 线类：值非空且非 NaN。
    /// - K 线类：四个价格均非空。
    /// - 区间类：`lowerValue` 非空。
    pub fn accepts(&self, point: &SeriesPoint) -> bool {
        match (self.shape(), point) {
            (PlotShape::Number, SeriesPoint::Value { value, .. }) => match self {
                PlotType::Histogram => value.is_some_and(|v| v != 0.0 && !v.is_nan()),
                _ => value.is_some_and(|v| !v.is_nan()),
            },
            (
                PlotShape::Ohlc,
                SeriesPoint::Ohlc {
                    open,
                    high,
                    low,
                    close,
                    ..
                },
            ) => open.is_some() && high.is_some() && low.is_some() && close.is_some(),
            (PlotShape::Range, SeriesPoint::Range { lower_value, .. }) => lower_value.is_some(),
            _ => false,
        }
    }
}

/// # Summary
/// 缓存中一段已封存的历史 Bar。
///
/// # Invariants
/// - `from <= to`，`bars` 按时间升序。
/// - 推入缓存后不可变 (活动块除外)。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub from: i64,
    pub to: i64,
    pub bars: Vec<Bar>,
}

impl Chunk {
    pub fn new(from: i64, to: i64, bars: Vec<Bar>) -> Self {
        Self { from, to, bars }
    }
}

/// 复合 Bar 使用的占位市场标识
pub const COMPOSITE_EXCHANGE: &str = "*";

/// # Summary
/// 一个周期上下文内的实时计算环境。
///
/// # Invariants
/// - 由单个面板独占，每个边界整体替换，不存在并发修改。
/// - `flushed` 记录每个来源已经写入缓存的计数器，合并缓存时只追加差值。
#[derive(Debug, Clone, PartialEq)]
pub struct Renderer {
    // 当前 Bar 起始时间 (Unix 毫秒)
    pub timestamp: i64,
    // 叠加时区偏移后的本地时间
    pub local_timestamp: i64,
    // 时间模式下单根 Bar 的毫秒跨度，其余模式为 0
    pub bar_duration: i64,
    // 跨市场复合 Bar
    pub bar: Bar,
    // 以 `EXCHANGE:PAIR` 为键的各市场 Bar
    pub sources: BTreeMap<String, Bar>,
    // 指标 id -> 持久状态
    pub indicators: HashMap<String, IndicatorState>,
    // 绘图 id -> 最近一次输出
    pub series: HashMap<String, SeriesPoint>,
    // 来源键 -> 已写入缓存的计数器
    pub flushed: HashMap<String, Counters>,
    timezone_offset: i64,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(0, 0, 0)
    }
}

impl Renderer {
    pub fn new(timestamp: i64, timezone_offset: i64, bar_duration: i64) -> Self {
        Self {
            timestamp,
            local_timestamp: timestamp + timezone_offset,
            bar_duration,
            bar: Bar::new(&MarketKey::new(COMPOSITE_EXCHANGE, COMPOSITE_EXCHANGE), timestamp),
            sources: BTreeMap::new(),
            indicators: HashMap::new(),
            series: HashMap::new(),
            flushed: HashMap::new(),
            timezone_offset,
        }
    }

    pub fn timezone_offset(&self) -> i64 {
        self.timezone_offset
    }

    /// 获取或创建某个市场的来源 Bar
    pub fn source_mut(&mut self, market: &MarketKey) -> &mut Bar {
        let timestamp = self.timestamp;
        self.sources
            .entry(market.id())
            .or_insert_with(|| Bar::new(market, timestamp))
    }

    /// # Summary
    /// 跨越边界，生成下一根 Bar 的 Renderer。
    ///
    /// # Logic
    /// 1. 收集非空来源 Bar，计数器只保留尚未写入缓存的部分。
    /// 2. 提交全部指标状态 (函数历史追加、变量历史位移)。
    /// 3. 复合 Bar 与来源 Bar 一并重置，开高低继承收盘价。
    ///
    /// # Returns
    /// `(下一个 Renderer, 本根封存的 Bar 列表)`。
    pub fn advance(mut self, timestamp: i64) -> (Renderer, Vec<Bar>) {
        let mut sealed = Vec::new();
        for (key, bar) in &self.sources {
            if bar.empty {
                continue;
            }
            let mut out = bar.clone();
            if let Some(flushed) = self.flushed.get(key) {
                out.counters = bar.counters.since(flushed);
            }
            sealed.push(out);
        }

        self.commit_indicators();

        for bar in self.sources.values_mut() {
            bar.reset(timestamp);
        }
        self.bar.reset(timestamp);
        self.flushed.clear();
        self.timestamp = timestamp;
        self.local_timestamp = timestamp + self.timezone_offset;

        (self, sealed)
    }

    /// 提交所有指标状态，供历史回放在每根 Bar 结束时调用
    pub fn commit_indicators(&mut self) {
        for state in self.indicators.values_mut() {
            state.commit();
        }
    }

    /// 将 Renderer 定位到指定时间，不改变 Bar 与状态
    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
        self.local_timestamp = timestamp + self.timezone_offset;
        self.bar.time = timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Side;
    use crate::market::entity::Trade;

    #[test]
    fn test_plot_type_aliases() {
        assert_eq!(PlotType::from_name("plotline"), Some(PlotType::Line));
        assert_eq!(PlotType::from_name("plotbar"), Some(PlotType::Bar));
        assert_eq!(
            PlotType::from_name("plotcandlestick"),
            Some(PlotType::Candlestick)
        );
        assert_eq!(PlotType::from_name("sma"), None);
    }

    #[test]
    fn test_histogram_rejects_zero() {
        let zero = SeriesPoint::Value {
            time: 0,
            value: Some(0.0),
        };
        assert!(!PlotType::Histogram.accepts(&zero));
        assert!(PlotType::Line.accepts(&zero));
        let null = SeriesPoint::Value {
            time: 0,
            value: None,
        };
        assert!(!PlotType::Line.accepts(&null));
    }

    #[test]
    fn test_range_requires_lower() {
        let point = SeriesPoint::Range {
            time: 0,
            lower_value: None,
            higher_value: Some(1.0),
        };
        assert!(!PlotType::CloudArea.accepts(&point));
        let json = serde_json::to_value(SeriesPoint::Range {
            time: 1,
            lower_value: Some(1.0),
            higher_value: Some(2.0),
        })
        .unwrap();
        assert_eq!(json["lowerValue"], 1.0);
    }

    #[test]
    fn test_advance_seals_unflushed_delta() {
        let key = MarketKey::new("BINANCE", "btcusdt");
        let mut renderer = Renderer::new(0, 3_600_000, 60_000);
        renderer.source_mut(&key).apply_trade(&Trade {
            exchange: "BINANCE".into(),
            pair: "btcusdt".into(),
            timestamp: 10,
            price: 100.0,
            size: 5.0,
            side: Side::Buy,
            liquidation: false,
        });
        renderer.flushed.insert(
            key.id(),
            Counters {
                vbuy: 2.0,
                cbuy: 1.0,
                ..Default::default()
            },
        );

        let (next, sealed) = renderer.advance(60_000);
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].counters.vbuy, 3.0);
        assert_eq!(sealed[0].counters.cbuy, 0.0);
        assert_eq!(next.local_timestamp, 3_660_000);
        assert!(next.flushed.is_empty());
        assert!(next.sources[&key.id()].empty);
        assert_eq!(next.sources[&key.id()].open, Some(100.0));
    }
}
