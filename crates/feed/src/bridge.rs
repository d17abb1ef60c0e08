use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tickchart_core::common::Side;
use tickchart_core::feed::entity::{WorkerCommand, WorkerEvent, WorkerRequest};
use tickchart_core::feed::error::FeedError;
use tickchart_core::market::entity::Trade;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// 请求默认超时
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type Reply = Result<Value, FeedError>;
type Pending = Arc<DashMap<String, oneshot::Sender<Reply>>>;

/// # Summary
/// 核心一侧的 worker 通信端。
///
/// # Invariants
/// - 必须在 tokio 运行时内创建，构造时启动一个路由任务分发 worker 消息。
/// - 每个挂起请求以 UUID 追踪号登记，应答、超时或 worker 断开时移除。
/// - 送出的成交批次在批内去重，且不为空。
pub struct WorkerBridge {
    commands: mpsc::Sender<WorkerRequest>,
    batches: Mutex<mpsc::Receiver<Vec<Trade>>>,
    pending: Pending,
    timeout: Duration,
}

/// # Summary
/// worker 一侧的通信端：接收指令，回送成交与应答。
pub struct WorkerEndpoint {
    requests: mpsc::Receiver<WorkerRequest>,
    events: mpsc::Sender<WorkerEvent>,
}

impl WorkerBridge {
    /// # Summary
    /// 创建一对相连的通信端。
    ///
    /// # Arguments
    /// * `capacity`: 指令与事件通道的容量。
    ///
    /// # Returns
    /// `(核心端, worker 端)`。
    pub fn new(capacity: usize) -> (Self, WorkerEndpoint) {
        let capacity = capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (batch_tx, batch_rx) = mpsc::channel(capacity);
        let pending: Pending = Arc::new(DashMap::new());

        tokio::spawn(route(event_rx, batch_tx, pending.clone()));

        let bridge = Self {
            commands: command_tx,
            batches: Mutex::new(batch_rx),
            pending,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        };
        let endpoint = WorkerEndpoint {
            requests: command_rx,
            events: event_tx,
        };
        (bridge, endpoint)
    }

    /// 设置请求超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 尚未得到应答的请求数
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// 发送无需应答的指令
    pub async fn dispatch(&self, command: WorkerCommand) -> Result<(), FeedError> {
        trace!("Dispatching {:?}", command);
        self.commands
            .send(WorkerRequest {
                tracking_id: None,
                command,
            })
            .await
            .map_err(|_| FeedError::Closed)
    }

    /// # Summary
    /// 发送指令并等待应答。
    ///
    /// # Logic
    /// 1. 生成追踪号并登记应答通道。
    /// 2. 发送指令，通道关闭时撤销登记。
    /// 3. 在超时内等待应答；超时后撤销登记，迟到的应答被丢弃。
    ///
    /// # Returns
    /// worker 返回的载荷，或 `Timeout` / `Closed` / `Worker` 错误。
    pub async fn request(&self, command: WorkerCommand) -> Result<Value, FeedError> {
        let tracking_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(tracking_id.clone(), tx);
        debug!("Worker request {} {:?}", tracking_id, command);

        let sent = self
            .commands
            .send(WorkerRequest {
                tracking_id: Some(tracking_id.clone()),
                command,
            })
            .await;
        if sent.is_err() {
            self.pending.remove(&tracking_id);
            return Err(FeedError::Closed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(FeedError::Closed),
            Err(_) => {
                self.pending.remove(&tracking_id);
                let millis = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                warn!("Worker request {} timed out after {} ms", tracking_id, millis);
                Err(FeedError::Timeout(millis))
            }
        }
    }

    /// 等待下一批已去重的成交，worker 断开后返回 `Closed`
    pub async fn next_batch(&self) -> Result<Vec<Trade>, FeedError> {
        self.batches
            .lock()
            .await
            .recv()
            .await
            .ok_or(FeedError::Closed)
    }
}

impl WorkerEndpoint {
    /// 接收下一条指令，核心端全部释放后返回 `None`
    pub async fn recv(&mut self) -> Option<WorkerRequest> {
        self.requests.recv().await
    }

    pub async fn send(&self, event: WorkerEvent) -> Result<(), FeedError> {
        self.events.send(event).await.map_err(|_| FeedError::Closed)
    }

    pub async fn send_trades(&self, trades: Vec<Trade>) -> Result<(), FeedError> {
        self.send(WorkerEvent::Trades { trades }).await
    }

    /// 回送成功应答
    pub async fn reply(&self, tracking_id: &str, payload: Value) -> Result<(), FeedError> {
        self.send(WorkerEvent::Reply {
            tracking_id: tracking_id.to_string(),
            payload,
            error: None,
        })
        .await
    }

    /// 回送失败应答
    pub async fn reply_error(&self, tracking_id: &str, message: &str) -> Result<(), FeedError> {
        self.send(WorkerEvent::Reply {
            tracking_id: tracking_id.to_string(),
            payload: Value::Null,
            error: Some(message.to_string()),
        })
        .await
    }
}

/// # Summary
/// 路由任务：成交批次去重后转发，应答按追踪号交还请求方。
///
/// # Logic
/// worker 断开后，全部挂起请求以 `Closed` 结束。
async fn route(
    mut events: mpsc::Receiver<WorkerEvent>,
    batches: mpsc::Sender<Vec<Trade>>,
    pending: Pending,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Trades { trades } => {
                let total = trades.len();
                let trades = dedupe(trades);
                if trades.len() < total {
                    trace!("Dropped {} duplicate trades", total - trades.len());
                }
                if trades.is_empty() {
                    continue;
                }
                if batches.send(trades).await.is_err() {
                    debug!("Trade consumer gone, stopping router");
                    break;
                }
            }
            WorkerEvent::Reply {
                tracking_id,
                payload,
                error,
            } => {
                let Some((_, tx)) = pending.remove(&tracking_id) else {
                    warn!("Reply for unknown request {}", tracking_id);
                    continue;
                };
                let reply = match error {
                    Some(message) => Err(FeedError::Worker(message)),
                    None => Ok(payload),
                };
                if tx.send(reply).is_err() {
                    debug!("Requester of {} is gone", tracking_id);
                }
            }
        }
    }

    let orphans: Vec<String> = pending.iter().map(|e| e.key().clone()).collect();
    for tracking_id in orphans {
        if let Some((_, tx)) = pending.remove(&tracking_id)
            && tx.send(Err(FeedError::Closed)).is_err()
        {
            debug!("Requester of {} is gone", tracking_id);
        }
    }
    info!("Worker disconnected");
}

/// 批内去重，保留首次出现的顺序
fn dedupe(trades: Vec<Trade>) -> Vec<Trade> {
    let mut seen: HashSet<(String, String, i64, u64, u64, Side)> = HashSet::new();
    trades
        .into_iter()
        .filter(|t| {
            seen.insert((
                t.exchange.clone(),
                t.pair.clone(),
                t.timestamp,
                t.price.to_bits(),
                t.size.to_bits(),
                t.side,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(timestamp: i64, price: f64, side: Side) -> Trade {
        Trade {
            exchange: "BINANCE".into(),
            pair: "btcusdt".into(),
            timestamp,
            price,
            size: 1.0,
            side,
            liquidation: false,
        }
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        let trades = vec![
            trade(1, 10.0, Side::Buy),
            trade(1, 10.0, Side::Sell),
            trade(1, 10.0, Side::Buy),
            trade(2, 10.0, Side::Buy),
        ];
        let out = dedupe(trades);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].side, Side::Sell);
        assert_eq!(out[2].timestamp, 2);
    }
}
