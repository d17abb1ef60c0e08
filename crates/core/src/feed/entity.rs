use crate::market::entity::Trade;
use serde::{Deserialize, Serialize};

/// # Summary
/// 发往外部 worker 的指令。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerCommand {
    // 订阅市场成交
    Connect { markets: Vec<String> },
    // 取消订阅
    Disconnect { markets: Vec<String> },
    // 拉取市场元数据 (精度、计价币等)
    FetchProduct { market: String },
    // 心跳
    Ping,
}

/// # Summary
/// 带追踪号的指令信封。
///
/// # Invariants
/// - `tracking_id` 为空表示无需应答 (fire-and-forget)。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub tracking_id: Option<String>,
    pub command: WorkerCommand,
}

/// # Summary
/// worker 发回的消息。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    // 已解码的成交批次
    Trades { trades: Vec<Trade> },
    // 对某个请求的应答
    Reply {
        tracking_id: String,
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default)]
        error: Option<String>,
    },
}
