//! 成交聚合：Bar 边界决策与计数器累加。

pub mod aggregator;
pub mod boundary;

pub use aggregator::{Aggregator, frames, roll};
pub use boundary::Boundary;
