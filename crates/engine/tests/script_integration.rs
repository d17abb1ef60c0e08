use tickchart_core::chart::entity::{OptionMap, Renderer, SeriesPoint};
use tickchart_core::chart::state::IndicatorState;
use tickchart_core::render::port::SeriesSink;
use tickchart_engine::{Adapter, Builtins, CompiledModel, compile, get_adapter};

/// # Summary
/// 记录全部输出点的测试通道。
#[derive(Default)]
struct RecordingSink {
    points: Vec<(usize, SeriesPoint)>,
}

impl SeriesSink for RecordingSink {
    fn emit(&mut self, plot_index: usize, point: SeriesPoint) {
        self.points.push((plot_index, point));
    }
}

/// # Summary
/// 逐根推进的最小驱动：每根 Bar 只有一个收盘价。
struct Harness {
    model: CompiledModel,
    adapter: Adapter,
    state: IndicatorState,
    renderer: Renderer,
}

impl Harness {
    fn new(script: &str) -> anyhow::Result<Self> {
        let model = compile(script, "test", &[])?;
        let adapter = get_adapter(&model.output)?;
        let state = model.seed_state();
        Ok(Self {
            model,
            adapter,
            state,
            renderer: Renderer::new(0, 0, 60_000),
        })
    }

    fn bar(&mut self, close: f64, sink: &mut RecordingSink) -> anyhow::Result<()> {
        self.renderer.bar.apply_price(close);
        self.adapter.run(
            &mut self.renderer,
            &mut self.state,
            &OptionMap::new(),
            sink,
            Builtins::standard(),
        )?;
        self.state.commit();
        let next = self.renderer.timestamp + 60_000;
        let renderer = std::mem::replace(&mut self.renderer, Renderer::new(0, 0, 0));
        self.renderer = renderer.advance(next).0;
        Ok(())
    }
}

fn values(sink: &RecordingSink, plot: usize) -> Vec<Option<f64>> {
    sink.points
        .iter()
        .filter(|(i, _)| *i == plot)
        .map(|(_, p)| match p {
            SeriesPoint::Value { value, .. } => *value,
            _ => None,
        })
        .collect()
}

#[test]
fn test_sma_over_bars() -> anyhow::Result<()> {
    let mut harness = Harness::new("line(sma(close, 3))")?;
    let mut sink = RecordingSink::default();
    for close in [1.0, 2.0, 3.0, 4.0] {
        harness.bar(close, &mut sink)?;
    }
    assert_eq!(
        values(&sink, 0),
        vec![Some(1.0), Some(1.5), Some(2.0), Some(3.0)]
    );
    assert_eq!(harness.model.min_length, 3);
    Ok(())
}

#[test]
fn test_rerun_within_bar_does_not_commit() -> anyhow::Result<()> {
    let mut harness = Harness::new("line(cum(close))")?;
    let mut sink = RecordingSink::default();
    harness.renderer.bar.apply_price(2.0);
    for _ in 0..3 {
        harness.adapter.run(
            &mut harness.renderer,
            &mut harness.state,
            &OptionMap::new(),
            &mut sink,
            Builtins::standard(),
        )?;
    }
    assert_eq!(values(&sink, 0), vec![Some(2.0), Some(2.0), Some(2.0)]);
    Ok(())
}

#[test]
fn test_history_reads_previous_bars() -> anyhow::Result<()> {
    let mut harness = Harness::new("x = close\nline(x - x[2])")?;
    let mut sink = RecordingSink::default();
    for close in [10.0, 11.0, 15.0, 20.0] {
        harness.bar(close, &mut sink)?;
    }
    // 前两根没有足够历史，差值为 Null 被过滤
    assert_eq!(values(&sink, 0), vec![Some(5.0), Some(9.0)]);
    Ok(())
}

#[test]
fn test_histogram_zero_is_filtered_while_state_advances() -> anyhow::Result<()> {
    let mut harness = Harness::new("c = close\nd = c - c[1]\nhistogram(d)\nline(cum(1))")?;
    let mut sink = RecordingSink::default();
    for close in [5.0, 5.0, 7.0] {
        harness.bar(close, &mut sink)?;
    }
    assert_eq!(values(&sink, 0), vec![Some(2.0)]);
    assert_eq!(values(&sink, 1), vec![Some(1.0), Some(2.0), Some(3.0)]);
    Ok(())
}

#[test]
fn test_silent_program_records_series_without_output() -> anyhow::Result<()> {
    let model = compile("line(close)", "quiet", &[])?;
    let adapter = get_adapter(&model.silent_output)?;
    let mut state = model.seed_state();
    let mut renderer = Renderer::new(0, 0, 60_000);
    renderer.bar.apply_price(3.0);
    let mut sink = RecordingSink::default();
    adapter.run(
        &mut renderer,
        &mut state,
        &OptionMap::new(),
        &mut sink,
        Builtins::standard(),
    )?;
    assert!(sink.points.is_empty());
    assert_eq!(
        renderer.series.get("quiet"),
        Some(&SeriesPoint::Value {
            time: 0,
            value: Some(3.0)
        })
    );
    Ok(())
}

#[test]
fn test_reference_reads_sibling_series() -> anyhow::Result<()> {
    let base = compile("line(close * 2)", "base", &[])?;
    let spread = compile("line($base - close)", "spread", &base.plot_ids())?;
    let base_adapter = get_adapter(&base.output)?;
    let spread_adapter = get_adapter(&spread.output)?;
    let mut base_state = base.seed_state();
    let mut spread_state = spread.seed_state();

    let mut renderer = Renderer::new(0, 0, 60_000);
    renderer.bar.apply_price(4.0);
    let mut sink = RecordingSink::default();
    base_adapter.run(&mut renderer, &mut base_state, &OptionMap::new(), &mut sink, Builtins::standard())?;
    let mut spread_sink = RecordingSink::default();
    spread_adapter.run(
        &mut renderer,
        &mut spread_state,
        &OptionMap::new(),
        &mut spread_sink,
        Builtins::standard(),
    )?;
    assert_eq!(values(&spread_sink, 0), vec![Some(4.0)]);
    Ok(())
}
