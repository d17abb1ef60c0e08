use thiserror::Error;

/// # Summary
/// 聚合域错误枚举，处理成交校验与市场路由失败。
///
/// # Invariants
/// - 聚合引擎对合法成交从不返回错误。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarketError {
    // 成交数据不合法 (负数、NaN 等)
    #[error("Invalid trade: {0}")]
    InvalidTrade(String),
    // 成交所属市场未被当前面板跟踪
    #[error("Unknown market: {0}")]
    UnknownMarket(String),
}
