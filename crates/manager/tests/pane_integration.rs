
use async_trait::async_trait;
use mock_surface::RecordingSurface;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tickchart_cache::MemChunkStore;
use tickchart_core::cache::error::CacheError;
use tickchart_core::cache::port::ChunkStore;
use tickchart_core::chart::entity::SeriesPoint;
use tickchart_core::common::Side;
use tickchart_core::common::time::ManualClock;
use tickchart_core::config::{ChartConfig, IndicatorConfig};
use tickchart_core::market::entity::Trade;
use tickchart_manager::{ChartPane, IndicatorStatus};

fn trade(exchange: &str, timestamp: i64, price: f64) -> Trade {
    Trade {
        exchange: exchange.into(),
        pair: "btcusdt".into(),
        timestamp,
        price,
        size: 1.0,
        side: Side::Sell,
        liquidation: false,
    }
}

fn config(chunk_size: usize, retain_chunks: usize) -> ChartConfig {
    ChartConfig {
        chunk_size,
        retain_chunks,
        indicators: vec![IndicatorConfig {
            id: "c".to_string(),
            script: "line(close)".to_string(),
            options: Default::default(),
        }],
        ..ChartConfig::default()
    }
}

fn open_pane(config: ChartConfig, clock: Arc<ManualClock>) -> (ChartPane, RecordingSurface) {
    let surface = RecordingSurface::new();
    let mut pane = ChartPane::new(config, Box::new(surface.clone()), clock);
    assert!(pane.load_indicators().is_empty());
    (pane, surface)
}

fn values(points: &[SeriesPoint]) -> Vec<(i64, Option<f64>)> {
    points
        .iter()
        .map(|p| match p {
            SeriesPoint::Value { time, value } => (*time, *value),
            other => (other.time(), None),
        })
        .collect()
}

#[test]
fn test_first_trade_starts_renderer() {
    let clock = Arc::new(ManualClock::new(1_500));
    let (mut pane, surface) = open_pane(config(200, 10), clock);
    assert_eq!(pane.manager().status("c"), Some(&IndicatorStatus::Built));
    assert!(pane.renderer().is_none());

    assert_eq!(pane.on_trades(&[trade("BINANCE", 1_000, 10.0)]), 1);
    assert_eq!(pane.renderer().map(|r| r.timestamp), Some(0));
    assert_eq!(pane.manager().status("c"), Some(&IndicatorStatus::Bound));

    assert!(pane.on_tick().is_empty());
    let recorded = surface.recorded.lock().unwrap();
    assert_eq!(values(&recorded.updates_for("c")), vec![(0, Some(10.0))]);
}

#[test]
fn test_boundary_runs_indicators_before_roll() {
    let clock = Arc::new(ManualClock::new(0));
    let (mut pane, surface) = open_pane(config(200, 10), clock);

    pane.on_trades(&[
        trade("BINANCE", 1_000, 10.0),
        trade("BINANCE", 2_000, 11.0),
        trade("BINANCE", 61_000, 20.0),
    ]);

    // 切换前对即将封存的 Bar 执行了一次
    let recorded = surface.recorded.lock().unwrap();
    assert_eq!(values(&recorded.updates_for("c")), vec![(0, Some(11.0))]);
    drop(recorded);
    assert_eq!(pane.renderer().map(|r| r.timestamp), Some(60_000));
    assert_eq!(pane.cache().bars().len(), 1);
}

#[test]
fn test_clock_advances_empty_bars() {
    let clock = Arc::new(ManualClock::new(0));
    let (mut pane, _surface) = open_pane(config(200, 10), clock.clone());
    pane.on_trades(&[trade("BINANCE", 1_000, 10.0)]);

    clock.set(30_000);
    pane.on_tick();
    assert_eq!(pane.renderer().map(|r| r.timestamp), Some(0));

    clock.set(125_000);
    pane.on_tick();
    assert_eq!(pane.renderer().map(|r| r.timestamp), Some(120_000));
    assert_eq!(pane.cache().bars().len(), 1);
}

#[test]
fn test_untracked_market_is_skipped() {
    let clock = Arc::new(ManualClock::new(0));
    let mut cfg = config(200, 10);
    cfg.markets = vec!["BINANCE:btcusdt".to_string()];
    let (mut pane, _surface) = open_pane(cfg, clock);

    let accepted = pane.on_trades(&[
        trade("BINANCE", 1_000, 10.0),
        trade("KRAKEN", 1_500, 99.0),
    ]);
    assert_eq!(accepted, 1);
    let renderer = pane.renderer().unwrap();
    assert!(!renderer.sources.contains_key("KRAKEN:btcusdt"));
    assert_eq!(renderer.bar.close, Some(10.0));
}

#[test]
fn test_edit_script_rebuilds_from_cache() {
    let clock = Arc::new(ManualClock::new(0));
    let (mut pane, surface) = open_pane(config(200, 10), clock);
    pane.on_trades(&[
        trade("BINANCE", 1_000, 10.0),
        trade("BINANCE", 61_000, 20.0),
        trade("BINANCE", 121_000, 30.0),
    ]);

    pane.edit_script("c", "line(close * 2)").unwrap();

    assert_eq!(
        pane.manager().definition("c").map(|d| d.script.as_str()),
        Some("line(close * 2)")
    );
    {
        let recorded = surface.recorded.lock().unwrap();
        assert_eq!(
            values(&recorded.data["c"]),
            vec![(0, Some(20.0)), (60_000, Some(40.0))]
        );
    }

    // 相同脚本不触发重建
    surface.recorded.lock().unwrap().data.clear();
    pane.edit_script("c", "line(close * 2)").unwrap();
    assert!(surface.recorded.lock().unwrap().data.is_empty());

    pane.on_tick();
    let recorded = surface.recorded.lock().unwrap();
    let last = recorded.updates_for("c").pop();
    assert_eq!(last.map(|p| values(&[p])), Some(vec![(120_000, Some(60.0))]));
}

#[test]
fn test_remove_indicator_stops_updates() {
    let clock = Arc::new(ManualClock::new(0));
    let (mut pane, surface) = open_pane(config(200, 10), clock);
    pane.on_trades(&[trade("BINANCE", 1_000, 10.0)]);

    pane.remove_indicator("c").unwrap();
    pane.on_tick();

    let recorded = surface.recorded.lock().unwrap();
    assert_eq!(recorded.removed, vec!["c".to_string()]);
    assert!(recorded.updates_for("c").is_empty());
}

#[tokio::test]
async fn test_sync_and_restore() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::new(0));
    let store = MemChunkStore::new();
    let (mut pane, _surface) = open_pane(config(1, 2), clock.clone());

    pane.on_trades(&[
        trade("BINANCE", 1_000, 10.0),
        trade("BINANCE", 61_000, 20.0),
        trade("BINANCE", 121_000, 30.0),
        trade("BINANCE", 181_000, 40.0),
    ]);
    assert_eq!(pane.cache().chunks().len(), 2);

    // 三个块写入，最旧的一个随即被删除
    pane.sync(&store).await?;
    assert_eq!(store.len(), 2);

    let (mut restored, _surface) = open_pane(config(1, 2), clock);
    assert_eq!(restored.restore(&store).await?, 2);
    let times: Vec<i64> = restored.cache().bars().iter().map(|b| b.time).collect();
    assert_eq!(times, vec![60_000, 120_000]);
    Ok(())
}

/// 只允许有限次写入的存储，用完后写入失败
struct FlakyStore {
    inner: MemChunkStore,
    writes_left: AtomicUsize,
}

#[async_trait]
impl ChunkStore for FlakyStore {
    async fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let left = self.writes_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(CacheError::Storage("store unavailable".to_string()));
        }
        self.writes_left.store(left - 1, Ordering::SeqCst);
        self.inner.put_raw(key, value).await
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.inner.get_raw(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.delete(key).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.inner.keys(prefix).await
    }
}

#[test]
fn test_flush_keeps_live_bar_open() {
    let clock = Arc::new(ManualClock::new(0));
    let (mut pane, _surface) = open_pane(config(200, 10), clock);
    pane.on_trades(&[trade("BINANCE", 1_000, 10.0)]);
    pane.redraw("c").unwrap();
    pane.flush();
    assert!(pane.cache().chunks().is_empty());

    pane.on_trades(&[trade("BINANCE", 2_000, 11.0), trade("BINANCE", 61_000, 20.0)]);
    pane.flush();

    assert_eq!(pane.cache().chunks().len(), 1);
    let bars: Vec<_> = pane
        .cache()
        .bars()
        .into_iter()
        .filter(|b| b.time == 0)
        .collect();
    // 先前合并的实时部分与边界封存的剩余增量落在同一条目里
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].counters.csell, 2.0);
    assert_eq!(bars[0].counters.vsell, 2.0);
    assert_eq!(bars[0].close, Some(11.0));
}

#[tokio::test]
async fn test_failed_sync_keeps_unwritten_chunks() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::new(0));
    let store = FlakyStore {
        inner: MemChunkStore::new(),
        writes_left: AtomicUsize::new(1),
    };
    let (mut pane, _surface) = open_pane(config(1, 10), clock);
    pane.on_trades(&[
        trade("BINANCE", 1_000, 10.0),
        trade("BINANCE", 61_000, 20.0),
        trade("BINANCE", 121_000, 30.0),
    ]);
    assert_eq!(pane.pending_chunks(), 2);

    assert!(pane.sync(&store).await.is_err());
    assert_eq!(store.inner.len(), 1);
    assert_eq!(pane.pending_chunks(), 1);

    store.writes_left.store(10, Ordering::SeqCst);
    pane.sync(&store).await?;
    assert_eq!(store.inner.len(), 2);
    assert_eq!(pane.pending_chunks(), 0);
    Ok(())
}

#[tokio::test]
async fn test_close_persists_live_bar() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::new(0));
    let store = MemChunkStore::new();
    let (mut pane, surface) = open_pane(config(200, 10), clock.clone());
    pane.on_trades(&[trade("BINANCE", 1_000, 10.0), trade("BINANCE", 2_000, 12.0)]);

    pane.close();
    assert!(pane.renderer().is_none());
    pane.sync(&store).await?;
    assert_eq!(store.len(), 1);
    {
        let recorded = surface.recorded.lock().unwrap();
        assert_eq!(values(&recorded.updates_for("c")), vec![(0, Some(12.0))]);
    }

    let (mut restored, _surface) = open_pane(config(200, 10), clock);
    restored.restore(&store).await?;
    let bars = restored.cache().bars();
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].time, 0);
    assert_eq!(bars[0].counters.csell, 2.0);
    assert_eq!(bars[0].close, Some(12.0));
    Ok(())
}
