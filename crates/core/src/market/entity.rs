use crate::common::{MarketKey, Side};
use crate::market::error::MarketError;
use serde::{Deserialize, Serialize};

/// # Summary
/// 单笔成交记录，由外部 worker 解码、去重后送入聚合引擎。
///
/// # Invariants
/// - 同一 `(exchange, pair)` 流内 `timestamp` 单调不减。
/// - `price` 与 `size` 为有限非负数，由 [`Trade::validate`] 校验。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    // 交易所代码
    pub exchange: String,
    // 交易对
    pub pair: String,
    // 成交时间 (Unix 毫秒)
    pub timestamp: i64,
    // 成交价
    pub price: f64,
    // 成交数量
    pub size: f64,
    // 主动方向
    pub side: Side,
    // 是否为强平单
    #[serde(default)]
    pub liquidation: bool,
}

impl Trade {
    pub fn market(&self) -> MarketKey {
        MarketKey::new(self.exchange.clone(), self.pair.clone())
    }

    /// 拒绝非有限或负数的价格与数量
    pub fn validate(&self) -> Result<(), MarketError> {
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(MarketError::InvalidTrade(format!(
                "{}:{} price {}",
                self.exchange, self.pair, self.price
            )));
        }
        if !self.size.is_finite() || self.size < 0.0 {
            return Err(MarketError::InvalidTrade(format!(
                "{}:{} size {}",
                self.exchange, self.pair, self.size
            )));
        }
        Ok(())
    }
}

/// # Summary
/// Bar 内的买卖量、笔数与强平量计数器。
///
/// # Invariants
/// - 所有字段非负，只增不减，直到 Bar 在边界处被重置。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    // 主动买入量
    pub vbuy: f64,
    // 主动卖出量
    pub vsell: f64,
    // 买入笔数
    pub cbuy: f64,
    // 卖出笔数
    pub csell: f64,
    // 空头强平量 (买入方向)
    pub lbuy: f64,
    // 多头强平量 (卖出方向)
    pub lsell: f64,
}

impl Counters {
    pub fn volume(&self) -> f64 {
        self.vbuy + self.vsell
    }

    pub fn count(&self) -> f64 {
        self.cbuy + self.csell
    }

    pub fn add(&mut self, other: &Counters) {
        self.vbuy += other.vbuy;
        self.vsell += other.vsell;
        self.cbuy += other.cbuy;
        self.csell += other.csell;
        self.lbuy += other.lbuy;
        self.lsell += other.lsell;
    }

    /// 返回 `self - flushed`，即尚未写入缓存的增量部分
    pub fn since(&self, flushed: &Counters) -> Counters {
        Counters {
            vbuy: self.vbuy - flushed.vbuy,
            vsell: self.vsell - flushed.vsell,
            cbuy: self.cbuy - flushed.cbuy,
            csell: self.csell - flushed.csell,
            lbuy: self.lbuy - flushed.lbuy,
            lsell: self.lsell - flushed.lsell,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Counters::default()
    }
}

/// # Summary
/// 单个市场在一个周期桶内的聚合 K 线。
///
/// # Invariants
/// - 首笔成交到达前 `empty == true` 且 OHLC 为 `None` (新市场) 或继承自上一根的收盘价。
/// - 计数器扁平序列化，与 `open/high/low/close` 同级。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    // 桶起始时间 (Unix 毫秒)
    pub time: i64,
    pub exchange: String,
    pub pair: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    #[serde(flatten)]
    pub counters: Counters,
    // 本桶尚无成交
    pub empty: bool,
}

impl Bar {
    pub fn new(market: &MarketKey, time: i64) -> Self {
        Self {
            time,
            exchange: market.exchange.clone(),
            pair: market.pair.clone(),
            open: None,
            high: None,
            low: None,
            close: None,
            counters: Counters::default(),
            empty: true,
        }
    }

    pub fn market(&self) -> MarketKey {
        MarketKey::new(self.exchange.clone(), self.pair.clone())
    }

    /// # Summary
    /// 将一笔成交累加进当前 Bar。
    ///
    /// # Logic
    /// 1. 笔数按方向累加。
    /// 2. 强平单只累加 `lbuy`/`lsell`，不影响价格。
    /// 3. 普通成交累加 `vbuy`/`vsell` 并更新 OHLC，首笔成交时开盘价取成交价。
    pub fn apply_trade(&mut self, trade: &Trade) {
        match trade.side {
            Side::Buy => self.counters.cbuy += 1.0,
            Side::Sell => self.counters.csell += 1.0,
        }

        if trade.liquidation {
            match trade.side {
                Side::Buy => self.counters.lbuy += trade.size,
                Side::Sell => self.counters.lsell += trade.size,
            }
        } else {
            match trade.side {
                Side::Buy => self.counters.vbuy += trade.size,
                Side::Sell => self.counters.vsell += trade.size,
            }
            self.apply_price(trade.price);
        }

        self.empty = false;
    }

    /// 按一个新价格更新 OHLC
    pub fn apply_price(&mut self, price: f64) {
        if self.open.is_none() {
            self.open = Some(price);
        }
        self.high = Some(self.high.map_or(price, |h| h.max(price)));
        self.low = Some(self.low.map_or(price, |l| l.min(price)));
        self.close = Some(price);
    }

    /// # Summary
    /// 边界处重置：开高低继承上一根收盘价，计数器清零。
    pub fn reset(&mut self, time: i64) {
        self.time = time;
        self.open = self.close;
        self.high = self.close;
        self.low = self.close;
        self.counters = Counters::default();
        self.empty = true;
    }

    /// 合并另一根同市场 Bar 的增量计数器并以其 OHLC 覆盖当前价格
    pub fn absorb(&mut self, live: &Bar, delta: &Counters) {
        self.counters.add(delta);
        self.open = live.open.or(self.open);
        self.high = live.high.or(self.high);
        self.low = live.low.or(self.low);
        self.close = live.close.or(self.close);
        self.empty = self.empty && live.empty;
    }

    /// # Summary
    /// 按字段名读取数值，供脚本成员访问使用。
    ///
    /// # Returns
    /// 未知字段或价格尚未确定时返回 `None`。
    pub fn field(&self, name: &str) -> Option<f64> {
        match name {
            "open" => self.open,
            "high" => self.high,
            "low" => self.low,
            "close" => self.close,
            "vbuy" => Some(self.counters.vbuy),
            "vsell" => Some(self.counters.vsell),
            "cbuy" => Some(self.counters.cbuy),
            "csell" => Some(self.counters.csell),
            "lbuy" => Some(self.counters.lbuy),
            "lsell" => Some(self.counters.lsell),
            "volume" => Some(self.counters.volume()),
            "count" => Some(self.counters.count()),
            _ => None,
        }
    }
}

/// 脚本可访问的 Bar 字段
pub const BAR_FIELDS: [&str; 12] = [
    "open", "high", "low", "close", "vbuy", "vsell", "cbuy", "csell", "lbuy", "lsell", "volume",
    "count",
];
