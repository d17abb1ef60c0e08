use crate::chart::entity::OptionMap;
use crate::common::{AggregationMode, MarketKey, Stagger};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 指标定义：脚本文本与用户选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub id: String,
    pub script: String,
    #[serde(default)]
    pub options: OptionMap,
}

/// # Summary
/// 单个图表面板的配置。
///
/// # Invariants
/// - `timeframe` 在时间模式下为毫秒，tick 模式为笔数，vol 模式为成交量，bps 模式为基点。
/// - `filters` 中缺失的市场视为启用。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartConfig {
    // 面板标识，用作块存储的命名空间
    pub pane: String,
    pub mode: AggregationMode,
    pub timeframe: f64,
    pub stagger: Stagger,
    // 本地时间相对 UTC 的偏移 (毫秒)
    pub timezone_offset_ms: i64,
    // 每个封存块包含的 Bar 数
    pub chunk_size: usize,
    // 裁剪后保留的块数
    pub retain_chunks: usize,
    // 时间模式下无成交时推进空 Bar 的检查间隔 (毫秒)
    pub tick_interval_ms: u64,
    // 跟踪的市场 (`EXCHANGE:PAIR`)
    pub markets: Vec<String>,
    // 市场 -> 是否参与复合 Bar
    pub filters: HashMap<String, bool>,
    pub indicators: Vec<IndicatorConfig>,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            pane: "main".to_string(),
            mode: AggregationMode::Time,
            timeframe: 60_000.0,
            stagger: Stagger::None,
            timezone_offset_ms: 0,
            chunk_size: 200,
            retain_chunks: 10,
            tick_interval_ms: 1_000,
            markets: Vec::new(),
            filters: HashMap::new(),
            indicators: Vec::new(),
        }
    }
}

impl ChartConfig {
    /// 时间模式下的周期毫秒数，其余模式返回 0
    #[allow(clippy::cast_possible_truncation)]
    pub fn bar_duration(&self) -> i64 {
        match self.mode {
            AggregationMode::Time => self.timeframe.round() as i64,
            _ => 0,
        }
    }

    /// 时间网格偏移量，奇数面板偏移半个周期
    pub fn grid_offset(&self) -> i64 {
        match self.stagger {
            Stagger::Odd => self.bar_duration() / 2,
            Stagger::None | Stagger::Even => 0,
        }
    }

    pub fn is_enabled(&self, market: &str) -> bool {
        self.filters.get(market).copied().unwrap_or(true)
    }

    /// 解析跟踪的市场列表，非法项被跳过
    pub fn market_keys(&self) -> Vec<MarketKey> {
        self.markets
            .iter()
            .filter_map(|m| m.parse::<MarketKey>().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChartConfig::default();
        assert_eq!(config.mode, AggregationMode::Time);
        assert_eq!(config.bar_duration(), 60_000);
        assert_eq!(config.grid_offset(), 0);
        assert!(config.is_enabled("BINANCE:btcusdt"));
    }

    #[test]
    fn test_partial_deserialize() {
        let config: ChartConfig = serde_json::from_str(
            r#"{"mode":"vol","timeframe":1000,"stagger":"odd","filters":{"BITMEX:XBTUSD":false}}"#,
        )
        .unwrap();
        assert_eq!(config.mode, AggregationMode::Vol);
        assert_eq!(config.bar_duration(), 0);
        assert_eq!(config.chunk_size, 200);
        assert!(!config.is_enabled("BITMEX:XBTUSD"));
    }
}
