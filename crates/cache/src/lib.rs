//! 历史 Bar 缓存与块存储实现。

pub mod chart;
pub mod mem;

pub use chart::{CacheRange, ChartCache, Placement};
pub use mem::MemChunkStore;
