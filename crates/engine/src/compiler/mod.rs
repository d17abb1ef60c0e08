//! 指标脚本编译器。
//!
//! 流程：词法 → 语法树 → 变量 → 市场 → 引用 → 函数降级 → 排版。

pub mod format;
pub mod functions;
pub mod markets;
pub mod options;
pub mod references;
pub mod variables;

use crate::builtins::Builtins;
use crate::parser::parse;
use crate::program::{CompiledModel, Program};
use functions::Lowerer;
use std::sync::Arc;
use tickchart_core::engine::error::ScriptError;
use tracing::debug;

/// # Summary
/// 将脚本文本编译为可复用的指标模型。
///
/// # Logic
/// 1. 解析为语法树，括号嵌套错误在词法阶段即被拒绝。
/// 2. 依次收集变量、市场与引用，得到稳定的槽位布局。
/// 3. 降级全部语句：有状态函数分配槽位，绘图调用展开并登记。
/// 4. 排版并生成去掉输出指令的静默版本。
///
/// # Arguments
/// * `script`: 脚本文本。
/// * `indicator_id`: 指标 id，用于推导绘图 id。
/// * `sibling_plot_ids`: 其他指标已占用的绘图 id。
///
/// # Returns
/// 编译模型，或首个编译错误。
pub fn compile(
    script: &str,
    indicator_id: &str,
    sibling_plot_ids: &[String],
) -> Result<CompiledModel, ScriptError> {
    let stmts = parse(script)?;

    let variables = variables::collect(&stmts)?;
    let markets = markets::collect(&stmts);
    let references = references::collect(&stmts);

    let mut lowerer = Lowerer {
        indicator_id,
        siblings: sibling_plot_ids,
        variables: &variables,
        markets: &markets,
        references: &references,
        builtins: Builtins::standard(),
        functions: Vec::new(),
        plots: Vec::new(),
        props: Default::default(),
    };
    let mut groups = Vec::with_capacity(stmts.len());
    for stmt in &stmts {
        groups.push(lowerer.statement(stmt)?);
    }
    let Lowerer {
        functions,
        plots,
        props,
        ..
    } = lowerer;

    let instrs = format::layout(groups);
    let silent = format::silence(&instrs);

    let min_length = variables
        .specs
        .iter()
        .map(|v| v.length)
        .chain(functions.iter().filter_map(|f| f.length))
        .max()
        .unwrap_or(1)
        .max(1);

    let program = |instrs| Program {
        instrs,
        variable_count: variables.specs.len(),
        function_count: functions.len(),
        transient: variables
            .specs
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.persistent)
            .map(|(i, _)| i)
            .collect(),
        markets: markets.keys().cloned().collect(),
        series: references.series.clone(),
        plot_ids: plots.iter().map(|p| p.id.clone()).collect(),
        plot_types: plots.iter().map(|p| p.plot_type).collect(),
        plot_offsets: plots.iter().map(|p| p.offset).collect(),
    };
    let output = Arc::new(program(instrs));
    let silent_output = Arc::new(program(silent));

    debug!(
        "Compiled indicator {}: {} variables, {} functions, {} plots",
        indicator_id,
        variables.specs.len(),
        functions.len(),
        plots.len()
    );

    Ok(CompiledModel {
        output,
        silent_output,
        variables: variables.specs,
        functions,
        plots,
        markets,
        references: references.indicators,
        props,
        min_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Instr, PlotOption};
    use tickchart_core::chart::entity::PlotType;

    #[test]
    fn test_reference_compiles() {
        let model = compile("line($price.close)", "spread", &[]).unwrap();
        assert_eq!(model.references, vec!["price".to_string()]);
        assert_eq!(model.plots.len(), 1);
        assert_eq!(model.plots[0].id, "spread");
    }

    #[test]
    fn test_compile_is_deterministic() {
        let script = "fast = ema(close, 9)\nslow = sma(close, 21)\nline(fast)\nline(slow, color='red')\nhistogram(fast - slow)";
        let a = compile(script, "macd", &[]).unwrap();
        let b = compile(script, "macd", &[]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.plots.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["macd", "macd-2", "macd-3"]);
        assert_eq!(a.min_length, 21);
    }

    #[test]
    fn test_plot_ids_avoid_siblings() {
        let model = compile("line(close)", "price", &["price".to_string()]).unwrap();
        assert_eq!(model.plots[0].id, "price-2");
        let model = compile("line(close, id='custom')", "price", &[]).unwrap();
        assert_eq!(model.plots[0].id, "custom");
    }

    #[test]
    fn test_history_forces_length() {
        let model = compile("x = close\nline(x - x(5))", "mom", &[]).unwrap();
        assert!(model.variables[0].length >= 6);
        assert_eq!(model.min_length, 6);
    }

    #[test]
    fn test_compile_errors() {
        assert!(matches!(
            compile("line(foo(close))", "x", &[]),
            Err(ScriptError::UnknownFunction { name, .. }) if name == "foo"
        ));
        assert!(matches!(
            compile("cloudarea(close)", "x", &[]),
            Err(ScriptError::PlotArity { got: 1, .. })
        ));
        assert!(matches!(
            compile("line((close)", "x", &[]),
            Err(ScriptError::Bracket { .. })
        ));
    }

    #[test]
    fn test_props_and_markets() {
        let model = compile(
            "delta = vbuy - vsell\nhistogram(delta)\nline(BINANCE:btcusdt.close)",
            "cvd",
            &[],
        )
        .unwrap();
        assert!(model.props.contains("vbuy"));
        assert!(model.props.contains("vsell"));
        assert!(model.markets.contains_key("BINANCE:btcusdt"));
        assert!(matches!(model.output.instrs[3], Instr::Guard { market: 0, .. }));
        assert_eq!(model.plots[0].plot_type, PlotType::Histogram);
    }

    #[test]
    fn test_silent_output_has_no_emit() {
        let model = compile("line(close)\ncandlestick(bar)", "p", &[]).unwrap();
        let emits = |p: &Program| {
            p.instrs
                .iter()
                .filter(|i| matches!(i, Instr::Emit { .. }))
                .count()
        };
        assert_eq!(emits(&model.output), 2);
        assert_eq!(emits(&model.silent_output), 0);
    }

    #[test]
    fn test_plot_options() {
        let model = compile(
            "line(close, color='#fff', lineWidth=2, title=options.name, offset=-1)",
            "p",
            &[],
        )
        .unwrap();
        let plot = &model.plots[0];
        assert_eq!(plot.offset, -1);
        assert_eq!(plot.options["color"], PlotOption::Json(serde_json::json!("#fff")));
        assert_eq!(plot.options["lineWidth"], PlotOption::Json(serde_json::json!(2)));
        assert_eq!(plot.options["title"], PlotOption::Expr("options.name".into()));
    }
}
