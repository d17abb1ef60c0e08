use std::time::Duration;
use tickchart_core::common::Side;
use tickchart_core::feed::entity::{WorkerCommand, WorkerEvent};
use tickchart_core::feed::error::FeedError;
use tickchart_core::market::entity::Trade;
use tickchart_feed::WorkerBridge;

fn trade(timestamp: i64, price: f64) -> Trade {
    Trade {
        exchange: "BITMEX".into(),
        pair: "XBTUSD".into(),
        timestamp,
        price,
        size: 100.0,
        side: Side::Buy,
        liquidation: false,
    }
}

#[tokio::test]
async fn test_dispatch_has_no_tracking_id() -> anyhow::Result<()> {
    let (bridge, mut endpoint) = WorkerBridge::new(8);
    bridge
        .dispatch(WorkerCommand::Connect {
            markets: vec!["BITMEX:XBTUSD".to_string()],
        })
        .await?;

    let request = endpoint.recv().await.ok_or_else(|| anyhow::anyhow!("no request"))?;
    assert_eq!(request.tracking_id, None);
    assert!(matches!(request.command, WorkerCommand::Connect { .. }));
    Ok(())
}

#[tokio::test]
async fn test_request_is_answered_by_tracking_id() -> anyhow::Result<()> {
    let (bridge, mut endpoint) = WorkerBridge::new(8);

    // 模拟 worker：按追踪号回送交易对精度
    let worker = tokio::spawn(async move {
        while let Some(request) = endpoint.recv().await {
            let Some(id) = request.tracking_id else {
                continue;
            };
            match request.command {
                WorkerCommand::FetchProduct { market } if market == "BITMEX:XBTUSD" => {
                    endpoint.reply(&id, serde_json::json!({ "tickSize": 0.5 })).await?;
                }
                _ => endpoint.reply_error(&id, "unknown product").await?,
            }
        }
        Ok::<(), FeedError>(())
    });

    let payload = bridge
        .request(WorkerCommand::FetchProduct {
            market: "BITMEX:XBTUSD".to_string(),
        })
        .await?;
    assert_eq!(payload["tickSize"], 0.5);

    let failed = bridge
        .request(WorkerCommand::FetchProduct {
            market: "KRAKEN:XBTUSD".to_string(),
        })
        .await;
    assert_eq!(failed, Err(FeedError::Worker("unknown product".to_string())));
    assert_eq!(bridge.in_flight(), 0);

    drop(bridge);
    worker.await??;
    Ok(())
}

#[tokio::test]
async fn test_request_times_out() {
    let (bridge, _endpoint) = WorkerBridge::new(8);
    let bridge = bridge.with_timeout(Duration::from_millis(50));

    let result = bridge.request(WorkerCommand::Ping).await;
    assert_eq!(result, Err(FeedError::Timeout(50)));
    assert_eq!(bridge.in_flight(), 0);
}

#[tokio::test]
async fn test_batches_are_deduplicated() -> anyhow::Result<()> {
    let (bridge, endpoint) = WorkerBridge::new(8);
    endpoint
        .send_trades(vec![trade(1, 10.0), trade(1, 10.0), trade(2, 10.5)])
        .await?;
    // 全部重复后为空的批次不会送出
    endpoint.send_trades(Vec::new()).await?;
    endpoint.send_trades(vec![trade(3, 11.0)]).await?;

    let first = bridge.next_batch().await?;
    assert_eq!(first.len(), 2);
    let second = bridge.next_batch().await?;
    assert_eq!(second[0].timestamp, 3);
    Ok(())
}

#[tokio::test]
async fn test_worker_disconnect_closes_everything() {
    let (bridge, endpoint) = WorkerBridge::new(8);
    let bridge = bridge.with_timeout(Duration::from_secs(5));

    let pending = bridge.request(WorkerCommand::Ping);
    let disconnect = async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(endpoint);
    };
    let (result, ()) = tokio::join!(pending, disconnect);

    assert_eq!(result, Err(FeedError::Closed));
    assert_eq!(bridge.next_batch().await, Err(FeedError::Closed));
    assert!(matches!(
        bridge.dispatch(WorkerCommand::Ping).await,
        Err(FeedError::Closed)
    ));
}

#[tokio::test]
async fn test_reply_event_round_trips_through_json() -> anyhow::Result<()> {
    let (bridge, mut endpoint) = WorkerBridge::new(8);
    let worker = tokio::spawn(async move {
        if let Some(request) = endpoint.recv().await {
            let raw = format!(
                r#"{{"type":"reply","tracking_id":"{}","payload":"pong"}}"#,
                request.tracking_id.unwrap_or_default()
            );
            let event: WorkerEvent = serde_json::from_str(&raw)?;
            endpoint.send(event).await?;
        }
        Ok::<(), anyhow::Error>(())
    });

    assert_eq!(bridge.request(WorkerCommand::Ping).await?, "pong");
    worker.await??;
    Ok(())
}
