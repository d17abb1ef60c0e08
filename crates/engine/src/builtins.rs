use std::collections::HashMap;
use std::sync::LazyLock;
use tickchart_core::chart::state::{
    CumulativeState, FunctionState, HeikinAshiState, RsiState, SmoothedState, Value, WindowState,
};
use tickchart_core::engine::error::ScriptError;

/// 有状态内置函数种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinKind {
    Sma,
    Ema,
    Rma,
    Wma,
    Cum,
    Highest,
    Lowest,
    Rsi,
    Stdev,
    HeikinAshi,
}

/// 无状态数值函数，`Math.xxx` 与同名裸函数等价
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeFn {
    Abs,
    Min,
    Max,
    Pow,
    Sqrt,
    Log,
    Exp,
    Floor,
    Ceil,
    Round,
    Sign,
    Sin,
    Cos,
    Tan,
    Atan,
}

/// 无状态 Bar 工具函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UtilityFn {
    AvgOhlc,
    AvgHl,
}

/// # Summary
/// 单个有状态内置函数的注册信息。
///
/// # Invariants
/// - `prototype` 只作为模板，绑定时深拷贝到各指标实例。
#[derive(Debug, Clone)]
pub struct BuiltinDef {
    pub kind: BuiltinKind,
    pub name: &'static str,
    pub prototype: FunctionState,
    // 参数个数范围 (含)
    pub arity: (usize, usize),
    // 长度参数的位置，用于推导预热长度
    pub length_arg: Option<usize>,
}

/// # Summary
/// 内置函数注册表，同时作为解释器执行内置函数的入口。
pub struct Builtins {
    stateful: HashMap<&'static str, BuiltinDef>,
}

static STANDARD: LazyLock<Builtins> = LazyLock::new(Builtins::new);

const DEFAULT_LENGTH: usize = 14;

impl Builtins {
    /// 标准注册表
    pub fn standard() -> &'static Builtins {
        &STANDARD
    }

    fn new() -> Self {
        let window = || {
            FunctionState::Window(WindowState {
                length: DEFAULT_LENGTH,
                ..Default::default()
            })
        };
        let smoothed = || FunctionState::Smoothed(SmoothedState::default());
        let defs = [
            (BuiltinKind::Sma, "sma", window(), (1, 2), Some(1)),
            (BuiltinKind::Wma, "wma", window(), (1, 2), Some(1)),
            (BuiltinKind::Highest, "highest", window(), (1, 2), Some(1)),
            (BuiltinKind::Lowest, "lowest", window(), (1, 2), Some(1)),
            (BuiltinKind::Stdev, "stdev", window(), (1, 2), Some(1)),
            (BuiltinKind::Ema, "ema", smoothed(), (1, 2), Some(1)),
            (BuiltinKind::Rma, "rma", smoothed(), (1, 2), Some(1)),
            (
                BuiltinKind::Cum,
                "cum",
                FunctionState::Cumulative(CumulativeState::default()),
                (1, 1),
                None,
            ),
            (
                BuiltinKind::Rsi,
                "rsi",
                FunctionState::Rsi(RsiState::default()),
                (1, 2),
                Some(1),
            ),
            (
                BuiltinKind::HeikinAshi,
                "heikinashi",
                FunctionState::HeikinAshi(HeikinAshiState::default()),
                (1, 1),
                None,
            ),
        ];

        let stateful = defs
            .into_iter()
            .map(|(kind, name, prototype, arity, length_arg)| {
                (
                    name,
                    BuiltinDef {
                        kind,
                        name,
                        prototype,
                        arity,
                        length_arg,
                    },
                )
            })
            .collect();
        Self { stateful }
    }

    pub fn stateful(&self, name: &str) -> Option<&BuiltinDef> {
        self.stateful.get(name)
    }

    pub fn native(&self, name: &str) -> Option<NativeFn> {
        let name = name.strip_prefix("Math.").unwrap_or(name);
        let func = match name {
            "abs" => NativeFn::Abs,
            "min" => NativeFn::Min,
            "max" => NativeFn::Max,
            "pow" => NativeFn::Pow,
            "sqrt" => NativeFn::Sqrt,
            "log" => NativeFn::Log,
            "exp" => NativeFn::Exp,
            "floor" => NativeFn::Floor,
            "ceil" => NativeFn::Ceil,
            "round" => NativeFn::Round,
            "sign" => NativeFn::Sign,
            "sin" => NativeFn::Sin,
            "cos" => NativeFn::Cos,
            "tan" => NativeFn::Tan,
            "atan" => NativeFn::Atan,
            _ => return None,
        };
        Some(func)
    }

    pub fn utility(&self, name: &str) -> Option<UtilityFn> {
        match name {
            "avg_ohlc" => Some(UtilityFn::AvgOhlc),
            "avg_hl" => Some(UtilityFn::AvgHl),
            _ => None,
        }
    }

    /// # Summary
    /// 执行一次有状态内置函数。
    ///
    /// # Logic
    /// 1. 当前输入写入状态的 `pending`，已提交的历史保持不变。
    /// 2. 结果同时包含历史与当前输入，同一根 Bar 内多次调用互相覆盖。
    ///
    /// # Returns
    /// 计算结果；状态类型与函数不匹配时返回 `ScriptError::Adapter`。
    pub fn call(
        &self,
        kind: BuiltinKind,
        state: &mut FunctionState,
        args: &[Value],
    ) -> Result<Value, ScriptError> {
        let input = args.first().and_then(Value::as_number);
        let length = args.get(1).and_then(to_length).unwrap_or(DEFAULT_LENGTH);

        let value = match (kind, state) {
            (BuiltinKind::Sma, FunctionState::Window(s)) => {
                window(s, input, length).map(|v| mean(&v))
            }
            (BuiltinKind::Wma, FunctionState::Window(s)) => window(s, input, length).map(|v| {
                let (sum, weight) = v
                    .iter()
                    .enumerate()
                    .fold((0.0, 0.0), |(sum, weight), (i, x)| {
                        let w = usize_to_f64(i + 1);
                        (sum + x * w, weight + w)
                    });
                sum / weight
            }),
            (BuiltinKind::Highest, FunctionState::Window(s)) => {
                window(s, input, length).map(|v| v.iter().copied().fold(f64::MIN, f64::max))
            }
            (BuiltinKind::Lowest, FunctionState::Window(s)) => {
                window(s, input, length).map(|v| v.iter().copied().fold(f64::MAX, f64::min))
            }
            (BuiltinKind::Stdev, FunctionState::Window(s)) => window(s, input, length).map(|v| {
                let m = mean(&v);
                (v.iter().map(|x| (x - m).powi(2)).sum::<f64>() / usize_to_f64(v.len())).sqrt()
            }),
            (BuiltinKind::Ema, FunctionState::Smoothed(s)) => {
                smooth(s, input, 2.0 / (usize_to_f64(length) + 1.0))
            }
            (BuiltinKind::Rma, FunctionState::Smoothed(s)) => {
                smooth(s, input, 1.0 / usize_to_f64(length))
            }
            (BuiltinKind::Cum, FunctionState::Cumulative(s)) => {
                s.pending = input.unwrap_or(0.0);
                Some(s.total + s.pending)
            }
            (BuiltinKind::Rsi, FunctionState::Rsi(s)) => rsi(s, input, length),
            (BuiltinKind::HeikinAshi, FunctionState::HeikinAshi(s)) => {
                return Ok(heikin_ashi(s, args.first()));
            }
            (kind, state) => {
                return Err(ScriptError::Adapter(format!(
                    "function state {:?} does not match builtin {:?}",
                    state, kind
                )));
            }
        };

        Ok(Value::from_option(value))
    }
}

fn window(s: &mut WindowState, input: Option<f64>, length: usize) -> Option<Vec<f64>> {
    s.length = length;
    s.pending = input;
    let x = input?;
    let keep = length.saturating_sub(1);
    let skip = s.points.len().saturating_sub(keep);
    let mut values: Vec<f64> = s.points.iter().skip(skip).copied().collect();
    values.push(x);
    Some(values)
}

fn smooth(s: &mut SmoothedState, input: Option<f64>, alpha: f64) -> Option<f64> {
    let Some(x) = input else {
        s.pending = None;
        return s.prev;
    };
    let value = s.prev.map_or(x, |p| p + alpha * (x - p));
    s.pending = Some(value);
    Some(value)
}

fn rsi(s: &mut RsiState, input: Option<f64>, length: usize) -> Option<f64> {
    let Some(x) = input else {
        s.pending = None;
        return None;
    };
    let Some(prev) = s.prev_input else {
        s.pending = Some((x, None, None));
        return None;
    };

    let n = usize_to_f64(length);
    let gain = (x - prev).max(0.0);
    let loss = (prev - x).max(0.0);
    let avg_gain = s.avg_gain.map_or(gain, |a| a + (gain - a) / n);
    let avg_loss = s.avg_loss.map_or(loss, |a| a + (loss - a) / n);
    s.pending = Some((x, Some(avg_gain), Some(avg_loss)));

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    Some(100.0 - 100.0 / (1.0 + avg_gain / avg_loss))
}

fn heikin_ashi(s: &mut HeikinAshiState, input: Option<&Value>) -> Value {
    let Some(Value::Ohlc {
        open: Some(open),
        high: Some(high),
        low: Some(low),
        close: Some(close),
    }) = input
    else {
        s.pending = None;
        return Value::Null;
    };

    let ha_close = (open + high + low + close) / 4.0;
    let ha_open = match (s.prev_open, s.prev_close) {
        (Some(po), Some(pc)) => (po + pc) / 2.0,
        _ => (open + close) / 2.0,
    };
    s.pending = Some((ha_open, ha_close));

    Value::Ohlc {
        open: Some(ha_open),
        high: Some(high.max(ha_open).max(ha_close)),
        low: Some(low.min(ha_open).min(ha_close)),
        close: Some(ha_close),
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / usize_to_f64(values.len())
}

#[allow(clippy::cast_precision_loss)]
fn usize_to_f64(n: usize) -> f64 {
    n as f64
}

/// 将数值参数转换为长度，最小为 1
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn to_length(value: &Value) -> Option<usize> {
    let n = value.as_number()?;
    if !n.is_finite() {
        return None;
    }
    Some(n.round().max(1.0) as usize)
}

impl NativeFn {
    pub fn eval(&self, args: &[Value]) -> Value {
        let nums: Option<Vec<f64>> = args.iter().map(Value::as_number).collect();
        let Some(nums) = nums else {
            return Value::Null;
        };
        let first = nums.first().copied();
        let unary = |f: fn(f64) -> f64| Value::from_option(first.map(f));

        match self {
            NativeFn::Abs => unary(f64::abs),
            NativeFn::Sqrt => unary(f64::sqrt),
            NativeFn::Log => unary(f64::ln),
            NativeFn::Exp => unary(f64::exp),
            NativeFn::Floor => unary(f64::floor),
            NativeFn::Ceil => unary(f64::ceil),
            NativeFn::Round => unary(f64::round),
            NativeFn::Sin => unary(f64::sin),
            NativeFn::Cos => unary(f64::cos),
            NativeFn::Tan => unary(f64::tan),
            NativeFn::Atan => unary(f64::atan),
            NativeFn::Sign => unary(|x| if x == 0.0 { 0.0 } else { x.signum() }),
            NativeFn::Pow => match (first, nums.get(1)) {
                (Some(base), Some(exp)) => Value::Number(base.powf(*exp)),
                _ => Value::Null,
            },
            NativeFn::Min => Value::from_option(nums.iter().copied().reduce(f64::min)),
            NativeFn::Max => Value::from_option(nums.iter().copied().reduce(f64::max)),
        }
    }
}

impl UtilityFn {
    pub fn eval(&self, args: &[Value]) -> Value {
        let Some(Value::Ohlc {
            open,
            high,
            low,
            close,
        }) = args.first()
        else {
            return Value::Null;
        };
        match (self, open, high, low, close) {
            (UtilityFn::AvgOhlc, Some(o), Some(h), Some(l), Some(c)) => {
                Value::Number((o + h + l + c) / 4.0)
            }
            (UtilityFn::AvgHl, _, Some(h), Some(l), _) => Value::Number((h + l) / 2.0),
            _ => Value::Null,
        }
    }
}
