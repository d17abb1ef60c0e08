
use mock_surface::RecordingSurface;
use tickchart_core::chart::entity::{PlotType, Renderer, SeriesPoint};
use tickchart_core::common::{MarketKey, Side};
use tickchart_core::config::{ChartConfig, IndicatorConfig};
use tickchart_core::market::entity::{Bar, Trade};
use tickchart_manager::{IndicatorManager, IndicatorStatus, ManagerError};
use tickchart_market::Aggregator;

fn indicator(id: &str, script: &str) -> IndicatorConfig {
    IndicatorConfig {
        id: id.to_string(),
        script: script.to_string(),
        options: Default::default(),
    }
}

fn trade(timestamp: i64, price: f64) -> Trade {
    Trade {
        exchange: "BINANCE".into(),
        pair: "btcusdt".into(),
        timestamp,
        price,
        size: 1.0,
        side: Side::Buy,
        liquidation: false,
    }
}

fn history(closes: &[f64]) -> Vec<Bar> {
    let market = MarketKey::new("BINANCE", "btcusdt");
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| {
            let mut bar = Bar::new(&market, i as i64 * 60_000);
            bar.apply_price(*close);
            bar.empty = false;
            bar
        })
        .collect()
}

fn value(point: &SeriesPoint) -> Option<f64> {
    match point {
        SeriesPoint::Value { value, .. } => *value,
        _ => None,
    }
}

#[test]
fn test_reference_adds_dependency_first() {
    let mut manager = IndicatorManager::new();
    let mut surface = RecordingSurface::new();
    manager.define(indicator("price", "candlestick(bar)"));
    manager.define(indicator("spread", "line($price.close)"));

    manager.add("spread", None, &mut surface).unwrap();

    assert_eq!(manager.ids(), ["price".to_string(), "spread".to_string()]);
    assert_eq!(manager.status("price"), Some(&IndicatorStatus::Built));
    assert_eq!(manager.status("spread"), Some(&IndicatorStatus::Built));
    let recorded = surface.recorded.lock().unwrap();
    assert_eq!(recorded.series["price"].0, PlotType::Candlestick);
    assert_eq!(recorded.series["spread"].0, PlotType::Line);
    assert_eq!(recorded.series["spread"].1["visible"], serde_json::json!(true));
}

#[test]
fn test_circular_reference_rejected() {
    let mut manager = IndicatorManager::new();
    let mut surface = RecordingSurface::new();
    manager.define(indicator("a", "line($b)"));
    manager.define(indicator("b", "line($a)"));

    let result = manager.add("a", None, &mut surface);
    match result {
        Err(ManagerError::CircularReference(cycle)) => {
            assert_eq!(cycle, vec!["a", "b", "a"]);
        }
        other => panic!("expected circular reference, got {:?}", other),
    }
    assert!(matches!(manager.status("a"), Some(IndicatorStatus::Errored(_))));
}

#[test]
fn test_missing_dependency() {
    let mut manager = IndicatorManager::new();
    let mut surface = RecordingSurface::new();
    manager.define(indicator("spread", "line($ghost)"));

    let result = manager.add("spread", None, &mut surface);
    assert!(matches!(
        result,
        Err(ManagerError::MissingDependency { ref reference, .. }) if reference == "ghost"
    ));
    assert!(manager.ids().is_empty());
}

#[test]
fn test_errors_are_isolated_per_indicator() {
    let config = ChartConfig::default();
    let aggregator = Aggregator::new(&config);
    let mut renderer = Renderer::new(0, 0, config.bar_duration());
    let mut manager = IndicatorManager::new();
    let mut surface = RecordingSurface::new();

    manager.define(indicator("broken", "line("));
    manager.define(indicator("runaway", "for (i = 0; i >= 0; i++) { x = i }\nline(x)"));
    manager.define(indicator("close", "line(close)"));

    assert!(matches!(
        manager.add("broken", Some(&mut renderer), &mut surface),
        Err(ManagerError::Script(_))
    ));
    manager.add("runaway", Some(&mut renderer), &mut surface).unwrap();
    manager.add("close", Some(&mut renderer), &mut surface).unwrap();

    aggregator.push(&mut renderer, &trade(1_000, 42.0)).unwrap();
    let failures = manager.tick(&mut renderer, &mut surface);

    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "runaway");
    assert!(matches!(manager.status("runaway"), Some(IndicatorStatus::Errored(_))));
    assert!(!renderer.indicators.contains_key("runaway"));
    assert_eq!(manager.status("close"), Some(&IndicatorStatus::Bound));

    let recorded = surface.recorded.lock().unwrap();
    let updates = recorded.updates_for("close");
    assert_eq!(updates.len(), 1);
    assert_eq!(value(&updates[0]), Some(42.0));
    assert!(recorded.updates_for("runaway").is_empty());
}

#[test]
fn test_redraw_replays_history_once() {
    let config = ChartConfig::default();
    let aggregator = Aggregator::new(&config);
    let mut renderer = Renderer::new(180_000, 0, config.bar_duration());
    let mut manager = IndicatorManager::new();
    let mut surface = RecordingSurface::new();
    manager.define(indicator("count", "line(cum(1))"));
    manager.add("count", Some(&mut renderer), &mut surface).unwrap();

    let bars = history(&[1.0, 2.0, 3.0]);
    manager
        .redraw("count", &bars, &aggregator, &mut renderer, &mut surface)
        .unwrap();

    {
        let recorded = surface.recorded.lock().unwrap();
        assert_eq!(recorded.cleared, vec!["count".to_string()]);
        let data = &recorded.data["count"];
        let values: Vec<_> = data.iter().map(value).collect();
        assert_eq!(values, vec![Some(1.0), Some(2.0), Some(3.0)]);
        let times: Vec<_> = data.iter().map(SeriesPoint::time).collect();
        assert_eq!(times, vec![0, 60_000, 120_000]);
        // 回放期间不产生实时更新
        assert!(recorded.updates.is_empty());
    }

    aggregator.push(&mut renderer, &trade(181_000, 4.0)).unwrap();
    manager.tick(&mut renderer, &mut surface);
    let recorded = surface.recorded.lock().unwrap();
    let updates = recorded.updates_for("count");
    assert_eq!(value(&updates[0]), Some(4.0));
    assert_eq!(updates[0].time(), 180_000);
}

#[test]
fn test_redraw_ignores_live_bar() {
    let config = ChartConfig::default();
    let aggregator = Aggregator::new(&config);
    let mut renderer = Renderer::new(120_000, 0, config.bar_duration());
    let mut manager = IndicatorManager::new();
    let mut surface = RecordingSurface::new();
    manager.define(indicator("c", "line(close)"));
    manager.add("c", Some(&mut renderer), &mut surface).unwrap();

    manager
        .redraw("c", &history(&[1.0, 2.0, 3.0]), &aggregator, &mut renderer, &mut surface)
        .unwrap();

    let recorded = surface.recorded.lock().unwrap();
    assert_eq!(recorded.data["c"].len(), 2);
}

#[test]
fn test_required_props_and_markets() {
    let mut manager = IndicatorManager::new();
    let mut surface = RecordingSurface::new();
    manager.define(indicator("cvd", "histogram(vbuy - vsell)"));
    manager.define(indicator("spot", "line(BITSTAMP:btcusd.close)"));
    manager.add("cvd", None, &mut surface).unwrap();
    manager.add("spot", None, &mut surface).unwrap();

    let props = manager.required_props();
    assert!(props.contains("vbuy"));
    assert!(props.contains("vsell"));
    assert!(manager.required_markets().contains("BITSTAMP:btcusd"));
}

#[test]
fn test_remove_destroys_series() {
    let mut renderer = Renderer::new(0, 0, 60_000);
    let mut manager = IndicatorManager::new();
    let mut surface = RecordingSurface::new();
    manager.define(indicator("c", "line(close)\nline(open)"));
    manager.add("c", Some(&mut renderer), &mut surface).unwrap();
    assert!(renderer.indicators.contains_key("c"));

    manager.remove("c", Some(&mut renderer), &mut surface).unwrap();

    assert!(manager.ids().is_empty());
    assert!(manager.status("c").is_none());
    assert!(!renderer.indicators.contains_key("c"));
    let recorded = surface.recorded.lock().unwrap();
    assert_eq!(recorded.removed, vec!["c".to_string(), "c-2".to_string()]);
    assert!(recorded.series.is_empty());

    drop(recorded);
    assert!(matches!(
        manager.remove("c", None, &mut surface),
        Err(ManagerError::NotFound(_))
    ));
}

#[test]
fn test_rebuilt_dependency_runs_before_readers() {
    let config = ChartConfig::default();
    let aggregator = Aggregator::new(&config);
    let mut renderer = Renderer::new(0, 0, config.bar_duration());
    let mut manager = IndicatorManager::new();
    let mut surface = RecordingSurface::new();
    manager.define(indicator("price", "line(close)"));
    manager.define(indicator("spread", "line($price.value)"));
    manager.add("spread", Some(&mut renderer), &mut surface).unwrap();

    aggregator.push(&mut renderer, &trade(1_000, 10.0)).unwrap();
    assert!(manager.tick(&mut renderer, &mut surface).is_empty());

    manager.define(indicator("price", "line(close * 2)"));
    manager
        .rebuild("price", &[], &aggregator, Some(&mut renderer), &mut surface)
        .unwrap();
    assert_eq!(manager.ids(), ["price".to_string(), "spread".to_string()]);

    aggregator.push(&mut renderer, &trade(2_000, 11.0)).unwrap();
    assert!(manager.tick(&mut renderer, &mut surface).is_empty());

    let recorded = surface.recorded.lock().unwrap();
    let price = recorded.updates_for("price");
    let spread = recorded.updates_for("spread");
    assert_eq!(price.last().and_then(value), Some(22.0));
    // 同一 tick 内读到的是重建后的最新值
    assert_eq!(spread.last().and_then(value), Some(22.0));
}

#[test]
fn test_edit_closing_a_cycle_is_rejected() {
    let aggregator = Aggregator::new(&ChartConfig::default());
    let mut manager = IndicatorManager::new();
    let mut surface = RecordingSurface::new();
    manager.define(indicator("a", "line($b.value + 1)"));
    manager.define(indicator("b", "line(close)"));
    manager.add("a", None, &mut surface).unwrap();

    manager.define(indicator("b", "line($a.value + 1)"));
    let result = manager.rebuild("b", &[], &aggregator, None, &mut surface);

    match result {
        Err(ManagerError::CircularReference(cycle)) => {
            assert_eq!(cycle, vec!["b", "a", "b"]);
        }
        other => panic!("expected circular reference, got {:?}", other),
    }
    assert!(matches!(manager.status("b"), Some(IndicatorStatus::Errored(_))));
    assert!(manager.model("b").is_none());
    assert_eq!(manager.status("a"), Some(&IndicatorStatus::Built));
}

#[test]
fn test_suffixed_indicator_id_is_referenced_exactly() {
    let mut manager = IndicatorManager::new();
    let mut surface = RecordingSurface::new();
    manager.define(indicator("ma-200", "line(sma(close, 200))"));
    manager.define(indicator("trend", "line(close - $ma-200.value)"));

    manager.add("trend", None, &mut surface).unwrap();

    assert_eq!(manager.ids(), ["ma-200".to_string(), "trend".to_string()]);
    let references = manager.model("trend").map(|m| m.references.clone());
    assert_eq!(references, Some(vec!["ma-200".to_string()]));
}

#[test]
fn test_suffixed_reference_falls_back_to_owner() {
    let mut manager = IndicatorManager::new();
    let mut surface = RecordingSurface::new();
    manager.define(indicator("band", "line(high)\nline(low)"));
    manager.define(indicator("width", "line($band.value - $band-2.value)"));

    manager.add("width", None, &mut surface).unwrap();

    let references = manager.model("width").map(|m| m.references.clone());
    assert_eq!(references, Some(vec!["band".to_string()]));
}
