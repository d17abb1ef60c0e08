use crate::ast::{BinaryOp, UnaryOp};
use crate::builtins::Builtins;
use crate::program::{Instr, Node, Program};
use std::sync::Arc;
use tickchart_core::chart::entity::{OptionMap, PlotShape, Renderer, SeriesPoint};
use tickchart_core::chart::state::{IndicatorState, Value};
use tickchart_core::engine::error::ScriptError;
use tickchart_core::market::entity::Bar;
use tickchart_core::render::port::SeriesSink;

/// 单个 `for` 语句允许的最大迭代次数
pub const MAX_LOOP_ITERATIONS: usize = 10_000;

/// # Summary
/// 编译产物的执行入口，每个 tick 针对一个指标调用一次。
///
/// # Invariants
/// - 构建时已校验全部槽位下标不越界。
/// - 执行期间只读 Renderer 的 Bar 数据，只写 `series` 与指标状态。
#[derive(Debug, Clone)]
pub struct Adapter {
    program: Arc<Program>,
}

/// # Summary
/// 为编译产物构建执行入口。
///
/// # Logic
/// 1. 遍历所有指令，校验变量、函数、市场、引用与绘图下标均在布局范围内。
///
/// # Returns
/// 可重复执行的 `Adapter`；下标越界时返回 `ScriptError::Adapter`。
pub fn get_adapter(program: &Arc<Program>) -> Result<Adapter, ScriptError> {
    let mut problem = None;
    let mut check = |what: &str, index: usize, bound: usize| {
        if index >= bound && problem.is_none() {
            problem = Some(format!("{} slot {} out of range ({})", what, index, bound));
        }
    };

    let plots = program.plot_ids.len();
    if program.plot_types.len() != plots || program.plot_offsets.len() != plots {
        return Err(ScriptError::Adapter("plot layout mismatch".to_string()));
    }
    for slot in &program.transient {
        check("variable", *slot, program.variable_count);
    }

    let mut stack: Vec<&Instr> = program.instrs.iter().collect();
    while let Some(instr) = stack.pop() {
        match instr {
            Instr::Assign { slot, .. } => check("variable", *slot, program.variable_count),
            Instr::BuildPoint { plot, .. } | Instr::Emit { plot } => check("plot", *plot, plots),
            Instr::Guard { market, body } => {
                check("market", *market, program.markets.len());
                stack.extend(body);
            }
            Instr::If {
                then, otherwise, ..
            } => stack.extend(then.iter().chain(otherwise)),
            Instr::For {
                init, step, body, ..
            } => stack.extend(init.iter().chain(step).chain(body)),
            Instr::Eval(_) => {}
        }
        instr.walk_nodes(&mut |node| match node {
            Node::Var(slot) | Node::History { slot, .. } => {
                check("variable", *slot, program.variable_count)
            }
            Node::Builtin { slot, .. } => check("function", *slot, program.function_count),
            Node::Source { market, .. } => check("market", *market, program.markets.len()),
            Node::Series { reference, .. } => check("reference", *reference, program.series.len()),
            _ => {}
        });
    }

    match problem {
        Some(message) => Err(ScriptError::Adapter(message)),
        None => Ok(Adapter {
            program: program.clone(),
        }),
    }
}

impl Adapter {
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// # Summary
    /// 针对当前 Renderer 执行一次指标。
    ///
    /// # Logic
    /// 1. 校验状态布局与程序一致，并重置 `var` 临时变量。
    /// 2. 顺序执行指令；绘图点写入 `renderer.series`，通过过滤规则的点交给输出通道。
    ///
    /// # Arguments
    /// * `renderer`: 当前计算环境。
    /// * `state`: 本指标在该 Renderer 上的持久状态。
    /// * `options`: 指标选项。
    /// * `sink`: 输出通道。
    /// * `builtins`: 内置函数注册表。
    pub fn run(
        &self,
        renderer: &mut Renderer,
        state: &mut IndicatorState,
        options: &OptionMap,
        sink: &mut dyn SeriesSink,
        builtins: &Builtins,
    ) -> Result<(), ScriptError> {
        let program = self.program.as_ref();
        if state.variables.len() != program.variable_count
            || state.functions.len() != program.function_count
        {
            return Err(ScriptError::Adapter(format!(
                "state layout ({} variables, {} functions) does not match program ({}, {})",
                state.variables.len(),
                state.functions.len(),
                program.variable_count,
                program.function_count
            )));
        }

        for slot in &program.transient {
            if let Some(var) = state.variables.get_mut(*slot) {
                var.set(Value::Null);
            }
        }

        let mut frame = Frame {
            program,
            renderer,
            state,
            options,
            sink,
            builtins,
            points: vec![None; program.plot_ids.len()],
        };
        frame.exec(&program.instrs)
    }
}

struct Frame<'a> {
    program: &'a Program,
    renderer: &'a mut Renderer,
    state: &'a mut IndicatorState,
    options: &'a OptionMap,
    sink: &'a mut dyn SeriesSink,
    builtins: &'a Builtins,
    points: Vec<Option<SeriesPoint>>,
}

impl Frame<'_> {
    fn exec(&mut self, instrs: &[Instr]) -> Result<(), ScriptError> {
        for instr in instrs {
            match instr {
                Instr::Assign { slot, value } => {
                    let value = self.eval(value)?;
                    if let Some(var) = self.state.variables.get_mut(*slot) {
                        var.set(value);
                    }
                }
                Instr::Eval(node) => {
                    self.eval(node)?;
                }
                Instr::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    if self.eval(cond)?.truthy() {
                        self.exec(then)?;
                    } else {
                        self.exec(otherwise)?;
                    }
                }
                Instr::For {
                    init,
                    cond,
                    step,
                    body,
                } => {
                    self.exec(init)?;
                    let mut iterations = 0;
                    loop {
                        if let Some(cond) = cond
                            && !self.eval(cond)?.truthy()
                        {
                            break;
                        }
                        iterations += 1;
                        if iterations > MAX_LOOP_ITERATIONS {
                            return Err(ScriptError::Runtime(format!(
                                "loop exceeded {} iterations",
                                MAX_LOOP_ITERATIONS
                            )));
                        }
                        self.exec(body)?;
                        self.exec(step)?;
                    }
                }
                Instr::BuildPoint { plot, args } => self.build_point(*plot, args)?,
                Instr::Emit { plot } => {
                    let plot_type = self.program.plot_types.get(*plot);
                    let point = self.points.get(*plot).and_then(Option::as_ref);
                    if let (Some(plot_type), Some(point)) = (plot_type, point)
                        && plot_type.accepts(point)
                    {
                        self.sink.emit(*plot, point.clone());
                    }
                }
                Instr::Guard { market, body } => {
                    let present = self
                        .program
                        .markets
                        .get(*market)
                        .is_some_and(|id| self.renderer.sources.contains_key(id));
                    if present {
                        self.exec(body)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn build_point(&mut self, plot: usize, args: &[Node]) -> Result<(), ScriptError> {
        let (Some(plot_type), Some(offset), Some(id)) = (
            self.program.plot_types.get(plot),
            self.program.plot_offsets.get(plot),
            self.program.plot_ids.get(plot),
        ) else {
            return Err(ScriptError::Adapter(format!("plot {} out of range", plot)));
        };

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }

        let time = offset
            .checked_mul(self.renderer.bar_duration)
            .and_then(|shift| self.renderer.local_timestamp.checked_add(shift))
            .ok_or_else(|| {
                ScriptError::Runtime(format!("plot offset {} is out of the time range", offset))
            })?;
        let point = match plot_type.shape() {
            PlotShape::Number => SeriesPoint::Value {
                time,
                value: values.first().and_then(scalar),
            },
            PlotShape::Ohlc => match values.as_slice() {
                [Value::Ohlc {
                    open,
                    high,
                    low,
                    close,
                }] => SeriesPoint::Ohlc {
                    time,
                    open: *open,
                    high: *high,
                    low: *low,
                    close: *close,
                },
                [single] => {
                    let v = scalar(single);
                    SeriesPoint::Ohlc {
                        time,
                        open: v,
                        high: v,
                        low: v,
                        close: v,
                    }
                }
                [open, high, low, close] => SeriesPoint::Ohlc {
                    time,
                    open: scalar(open),
                    high: scalar(high),
                    low: scalar(low),
                    close: scalar(close),
                },
                _ => return Err(ScriptError::Adapter(format!("plot {} arity", id))),
            },
            PlotShape::Range => SeriesPoint::Range {
                time,
                lower_value: values.first().and_then(scalar),
                higher_value: values.get(1).and_then(scalar),
            },
        };

        self.renderer.series.insert(id.clone(), point.clone());
        if let Some(slot) = self.points.get_mut(plot) {
            *slot = Some(point);
        }
        Ok(())
    }

    fn eval(&mut self, node: &Node) -> Result<Value, ScriptError> {
        let value = match node {
            Node::Const(v) => v.clone(),
            Node::Var(slot) => self
                .state
                .variables
                .get(*slot)
                .map(|v| v.current())
                .unwrap_or_default(),
            Node::History { slot, index } => {
                let index = self.eval(index)?;
                match (history_index(&index), self.state.variables.get_mut(*slot)) {
                    (Some(i), Some(var)) => var.at(i),
                    _ => Value::Null,
                }
            }
            Node::BarField(field) => Value::from_option(self.renderer.bar.field(field)),
            Node::Bar => ohlc(&self.renderer.bar),
            #[allow(clippy::cast_precision_loss)]
            Node::Time => Value::Number(self.renderer.local_timestamp as f64),
            Node::Source { market, field } => {
                let bar = self
                    .program
                    .markets
                    .get(*market)
                    .and_then(|id| self.renderer.sources.get(id));
                match (bar, field) {
                    (Some(bar), Some(field)) => Value::from_option(bar.field(field)),
                    (Some(bar), None) => ohlc(bar),
                    (None, _) => Value::Null,
                }
            }
            Node::Series { reference, field } => {
                let point = self
                    .program
                    .series
                    .get(*reference)
                    .and_then(|id| self.renderer.series.get(id));
                let value = point.map(point_value).unwrap_or_default();
                match field {
                    Some(field) => value.member(field),
                    None => value,
                }
            }
            Node::Option(name) => self.options.get(name).map(json_value).unwrap_or_default(),
            Node::Unary { op, expr } => {
                let v = self.eval(expr)?;
                match op {
                    UnaryOp::Neg => v.as_number().map_or(Value::Null, |n| Value::Number(-n)),
                    UnaryOp::Not => Value::Bool(!v.truthy()),
                }
            }
            Node::Binary { op, lhs, rhs } => {
                let l = self.eval(lhs)?;
                match op {
                    BinaryOp::And if !l.truthy() => l,
                    BinaryOp::Or if l.truthy() => l,
                    BinaryOp::And | BinaryOp::Or => self.eval(rhs)?,
                    _ => {
                        let r = self.eval(rhs)?;
                        binary(*op, &l, &r)
                    }
                }
            }
            Node::Ternary {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)?
                } else {
                    self.eval(otherwise)?
                }
            }
            Node::Member { object, field } => self.eval(object)?.member(field),
            Node::Native { func, args } => {
                let args = self.eval_all(args)?;
                func.eval(&args)
            }
            Node::Utility { func, args } => {
                let args = self.eval_all(args)?;
                func.eval(&args)
            }
            Node::Builtin { kind, slot, args } => {
                let args = self.eval_all(args)?;
                let state = self.state.functions.get_mut(*slot).ok_or_else(|| {
                    ScriptError::Adapter(format!("function slot {} out of range", slot))
                })?;
                self.builtins.call(*kind, state, &args)?
            }
        };
        Ok(value)
    }

    fn eval_all(&mut self, nodes: &[Node]) -> Result<Vec<Value>, ScriptError> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            out.push(self.eval(node)?);
        }
        Ok(out)
    }
}

fn ohlc(bar: &Bar) -> Value {
    Value::Ohlc {
        open: bar.open,
        high: bar.high,
        low: bar.low,
        close: bar.close,
    }
}

/// 绘图输入的数值视图：K 线取收盘价，区间取下沿
fn scalar(value: &Value) -> Option<f64> {
    match value {
        Value::Ohlc { close, .. } => *close,
        Value::Range { lower, .. } => *lower,
        other => other.as_number(),
    }
}

fn point_value(point: &SeriesPoint) -> Value {
    match point {
        SeriesPoint::Value { value, .. } => Value::from_option(*value),
        SeriesPoint::Ohlc {
            open,
            high,
            low,
            close,
            ..
        } => Value::Ohlc {
            open: *open,
            high: *high,
            low: *low,
            close: *close,
        },
        SeriesPoint::Range {
            lower_value,
            higher_value,
            ..
        } => Value::Range {
            lower: *lower_value,
            higher: *higher_value,
        },
    }
}

fn json_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Number(n) => Value::from_option(n.as_f64()),
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::String(s) => Value::Text(s.clone()),
        _ => Value::Null,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn history_index(value: &Value) -> Option<usize> {
    let n = value.as_number()?;
    if n.is_finite() && n >= 0.0 {
        Some(n.floor() as usize)
    } else {
        None
    }
}

/// # Summary
/// 二元运算。
///
/// # Logic
/// - 任一侧为 `Null` 时，算术结果为 `Null`，大小比较为假。
/// - `+` 任一侧为文本时做字符串拼接。
/// - `==` / `!=` 按值结构比较。
fn binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    match op {
        BinaryOp::Eq => return Value::Bool(loose_eq(l, r)),
        BinaryOp::Ne => return Value::Bool(!loose_eq(l, r)),
        _ => {}
    }

    if op == BinaryOp::Add
        && let (Value::Text(_), _) | (_, Value::Text(_)) = (l, r)
    {
        return Value::Text(format!("{}{}", text(l), text(r)));
    }

    let (Some(a), Some(b)) = (l.as_number(), r.as_number()) else {
        return match op {
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => Value::Bool(false),
            _ => Value::Null,
        };
    };

    match op {
        BinaryOp::Add => Value::Number(a + b),
        BinaryOp::Sub => Value::Number(a - b),
        BinaryOp::Mul => Value::Number(a * b),
        BinaryOp::Div => Value::Number(a / b),
        BinaryOp::Rem => Value::Number(a % b),
        BinaryOp::Lt => Value::Bool(a < b),
        BinaryOp::Le => Value::Bool(a <= b),
        BinaryOp::Gt => Value::Bool(a > b),
        BinaryOp::Ge => Value::Bool(a >= b),
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::And | BinaryOp::Or => Value::Null,
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l.as_number(), r.as_number()) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Ohlc { .. } | Value::Range { .. } => String::new(),
    }
}
