//! 与外部成交 worker 之间的消息边界。

pub mod bridge;

pub use bridge::{WorkerBridge, WorkerEndpoint};
