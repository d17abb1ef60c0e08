pub mod time;

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// # Summary
/// 市场标识，代表某交易所下的一个交易对。
///
/// # Invariants
/// - `exchange` 为大写交易所代码 (例如: BINANCE)。
/// - 文本形式固定为 `EXCHANGE:PAIR`，作为 Renderer `sources` 的键。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarketKey {
    // 交易所代码
    pub exchange: String,
    // 交易对 (例如: btcusdt)
    pub pair: String,
}

impl MarketKey {
    pub fn new(exchange: impl Into<String>, pair: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            pair: pair.into(),
        }
    }

    /// 返回 `EXCHANGE:PAIR` 形式的文本键。
    pub fn id(&self) -> String {
        format!("{}:{}", self.exchange, self.pair)
    }
}

impl FromStr for MarketKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((exchange, pair)) if !exchange.is_empty() && !pair.is_empty() => {
                Ok(MarketKey::new(exchange, pair))
            }
            _ => Err(format!("Invalid market: {}", s)),
        }
    }
}

impl std::fmt::Display for MarketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.pair)
    }
}

/// # Summary
/// 成交方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    // 主动买入
    Buy,
    // 主动卖出
    Sell,
}

/// # Summary
/// K 线切分模式，决定何时开启新的一根 Bar。
///
/// # Invariants
/// - `Time` 模式下 timeframe 单位为毫秒，其余模式为对应计数单位。
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    // 按时间网格切分
    #[default]
    Time,
    // 按成交笔数切分
    Tick,
    // 按成交量切分
    Vol,
    // 按价格偏离 (基点) 切分
    Bps,
}

impl FromStr for AggregationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "time" => Ok(AggregationMode::Time),
            "tick" => Ok(AggregationMode::Tick),
            "vol" | "volume" => Ok(AggregationMode::Vol),
            "bps" => Ok(AggregationMode::Bps),
            _ => Err(format!("Unknown AggregationMode: {}", s)),
        }
    }
}

impl std::fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationMode::Time => write!(f, "time"),
            AggregationMode::Tick => write!(f, "tick"),
            AggregationMode::Vol => write!(f, "vol"),
            AggregationMode::Bps => write!(f, "bps"),
        }
    }
}

/// # Summary
/// 时间网格错位方式，用于多个重叠面板的奇偶交错。
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Stagger {
    // 网格对齐到 0
    #[default]
    None,
    // 网格对齐到 0 (与 None 相同，显式声明偶数面板)
    Even,
    // 网格偏移半个周期
    Odd,
}
