mod settings;
mod surface;

use std::sync::Arc;
use std::time::Duration;
use surface::LogSurface;
use tickchart_cache::MemChunkStore;
use tickchart_core::common::time::{Clock, ManualClock};
use tickchart_core::feed::error::FeedError;
use tickchart_core::market::entity::Trade;
use tickchart_feed::{WorkerBridge, WorkerEndpoint};
use tickchart_manager::ChartPane;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// # Summary
/// 应用启动入口：装配一个图表面板，回放标准输入中的成交。
///
/// # Logic
/// 1. 初始化日志并加载配置。
/// 2. 装配面板 (日志渲染端、回放时钟) 与内存块存储，恢复已有历史。
/// 3. 启动 stdin worker，经消息边界送入去重后的成交批次。
/// 4. 按配置间隔执行 tick，直至输入结束或收到退出信号。
/// 5. 封存活动块并同步存储。
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args().nth(1);
    let config = settings::load(path.as_deref())?;
    info!(
        "Pane {} starting: mode {:?}, timeframe {}, {} indicators",
        config.pane,
        config.mode,
        config.timeframe,
        config.indicators.len()
    );

    // 2. 装配面板
    let tick_interval = Duration::from_millis(config.tick_interval_ms.max(1));
    let clock = Arc::new(ManualClock::new(0));
    let store = MemChunkStore::new();
    let mut pane = ChartPane::new(config, Box::new(LogSurface), clock.clone());
    pane.restore(&store).await?;
    for e in pane.load_indicators() {
        warn!("{}", e);
    }

    // 3. 启动 stdin worker
    let (bridge, endpoint) = WorkerBridge::new(256);
    let worker = tokio::spawn(read_stdin(endpoint));

    // 4. 主循环
    let mut ticker = tokio::time::interval(tick_interval);
    loop {
        tokio::select! {
            batch = bridge.next_batch() => match batch {
                Ok(trades) => {
                    if let Some(last) = trades.iter().map(|t| t.timestamp).max() {
                        clock.set(last.max(clock.now_ms()));
                    }
                    let accepted = pane.on_trades(&trades);
                    debug!("{} of {} trades accepted", accepted, trades.len());
                }
                Err(FeedError::Closed) => {
                    info!("Input exhausted");
                    break;
                }
                Err(e) => {
                    error!("Feed error: {}", e);
                    break;
                }
            },
            _ = ticker.tick() => {
                for (id, e) in pane.on_tick() {
                    warn!("Indicator {} stopped: {}", id, e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // 5. 收尾：实时 Bar 一并封存写入
    pane.close();
    pane.sync(&store).await?;
    info!(
        "Pane {} stopped: {} chunks cached, {} chunks stored",
        pane.config().pane,
        pane.cache().chunks().len(),
        store.len()
    );
    worker.abort();
    Ok(())
}

/// # Summary
/// 标准输入 worker：每行一个 JSON 成交或成交数组。
///
/// # Logic
/// 无法解析的行记录日志后跳过；输入结束时断开端点。
async fn read_stdin(endpoint: WorkerEndpoint) -> Result<(), FeedError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut number = 0usize;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        };
        number += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(trades) => endpoint.send_trades(trades).await?,
            Err(e) => warn!("Line {} skipped: {}", number, e),
        }
    }
    debug!("Read {} lines from stdin", number);
    Ok(())
}

fn parse_line(line: &str) -> Result<Vec<Trade>, serde_json::Error> {
    if line.starts_with('[') {
        serde_json::from_str(line)
    } else {
        serde_json::from_str::<Trade>(line).map(|t| vec![t])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_accepts_object_and_array() {
        let one = r#"{"exchange":"BINANCE","pair":"btcusdt","timestamp":1,"price":10.0,"size":0.5,"side":"buy"}"#;
        assert_eq!(parse_line(one).unwrap().len(), 1);
        let many = format!("[{},{}]", one, one);
        assert_eq!(parse_line(&many).unwrap().len(), 2);
        assert!(parse_line("{").is_err());
    }
}
