use std::collections::VecDeque;

/// # Summary
/// 脚本运行时的动态值。
///
/// # Invariants
/// - `Null` 在算术运算中向外传播，与任何值比较均为假。
/// - `Ohlc` 与 `Range` 只作为绘图输入或引用结果出现。
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Number(f64),
    Bool(bool),
    Text(String),
    Ohlc {
        open: Option<f64>,
        high: Option<f64>,
        low: Option<f64>,
        close: Option<f64>,
    },
    Range {
        lower: Option<f64>,
        higher: Option<f64>,
    },
}

impl Value {
    pub fn from_option(v: Option<f64>) -> Self {
        v.map_or(Value::Null, Value::Number)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// 数值视图：布尔按 1/0 处理，其余非数值返回 `None`
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// 真值判定：`Null`、0、NaN、空串与 `false` 为假
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Bool(b) => *b,
            Value::Text(s) => !s.is_empty(),
            Value::Ohlc { .. } | Value::Range { .. } => true,
        }
    }

    /// # Summary
    /// 成员访问，例如 `$price.close` 或 `$band.lowerValue`。
    ///
    /// # Returns
    /// 字段不存在时返回 `Null`。
    pub fn member(&self, field: &str) -> Value {
        match (self, field) {
            (Value::Ohlc { open, .. }, "open") => Value::from_option(*open),
            (Value::Ohlc { high, .. }, "high") => Value::from_option(*high),
            (Value::Ohlc { low, .. }, "low") => Value::from_option(*low),
            (Value::Ohlc { close, .. }, "close" | "value") => Value::from_option(*close),
            (Value::Range { lower, .. }, "lowerValue" | "lower" | "value") => {
                Value::from_option(*lower)
            }
            (Value::Range { higher, .. }, "higherValue" | "higher") => Value::from_option(*higher),
            (Value::Number(n), "value" | "close") => Value::Number(*n),
            _ => Value::Null,
        }
    }
}

/// # Summary
/// 滑动窗口类函数状态 (sma / wma / highest / lowest / stdev)。
///
/// # Invariants
/// - `points` 仅保存已提交的历史值，最多 `length` 个。
/// - `pending` 为当前未收盘 Bar 的输入，每个 tick 覆盖写入。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowState {
    pub length: usize,
    pub points: VecDeque<f64>,
    pub pending: Option<f64>,
}

/// 指数平滑类函数状态 (ema / rma)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmoothedState {
    // 上一根已提交的平滑值
    pub prev: Option<f64>,
    pub pending: Option<f64>,
}

/// 累加函数状态 (cum)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CumulativeState {
    pub total: f64,
    pub pending: f64,
}

/// RSI 状态，保存上一收盘价与平均涨跌幅
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RsiState {
    pub prev_input: Option<f64>,
    pub avg_gain: Option<f64>,
    pub avg_loss: Option<f64>,
    // (输入, 平均涨幅, 平均跌幅)
    pub pending: Option<(f64, Option<f64>, Option<f64>)>,
}

/// 平均 K 线 (Heikin-Ashi) 状态
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeikinAshiState {
    pub prev_open: Option<f64>,
    pub prev_close: Option<f64>,
    pub pending: Option<(f64, f64)>,
}

/// # Summary
/// 有状态内置函数的单个实例状态。
///
/// # Invariants
/// - 每个调用点独占一个实例，绑定时从原型深拷贝。
/// - 当前 Bar 的计算结果暂存于 `pending`，仅在 [`FunctionState::commit`] 时写入历史。
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionState {
    Window(WindowState),
    Smoothed(SmoothedState),
    Cumulative(CumulativeState),
    Rsi(RsiState),
    HeikinAshi(HeikinAshiState),
}

impl FunctionState {
    /// 在 Bar 边界提交当前值
    pub fn commit(&mut self) {
        match self {
            FunctionState::Window(s) => {
                if let Some(v) = s.pending.take() {
                    s.points.push_back(v);
                    while s.points.len() > s.length.max(1) {
                        s.points.pop_front();
                    }
                }
            }
            FunctionState::Smoothed(s) => {
                if let Some(v) = s.pending.take() {
                    s.prev = Some(v);
                }
            }
            FunctionState::Cumulative(s) => {
                s.total += s.pending;
                s.pending = 0.0;
            }
            FunctionState::Rsi(s) => {
                if let Some((input, gain, loss)) = s.pending.take() {
                    s.prev_input = Some(input);
                    s.avg_gain = gain;
                    s.avg_loss = loss;
                }
            }
            FunctionState::HeikinAshi(s) => {
                if let Some((open, close)) = s.pending.take() {
                    s.prev_open = Some(open);
                    s.prev_close = Some(close);
                }
            }
        }
    }
}

/// # Summary
/// 脚本变量的持久化状态。
///
/// # Invariants
/// - `History::values[0]` 为当前 Bar 的值，`values[n]` 为 n 根之前的值。
/// - 新建时以一个 0 作为种子，更深的历史在首次访问时按需扩展为 `Null`。
#[derive(Debug, Clone, PartialEq)]
pub enum VariableState {
    Scalar(Value),
    History { length: usize, values: VecDeque<Value> },
}

impl VariableState {
    /// 按保留长度构造初始状态
    pub fn seeded(length: usize) -> Self {
        if length <= 1 {
            VariableState::Scalar(Value::Number(0.0))
        } else {
            VariableState::History {
                length,
                values: VecDeque::from([Value::Number(0.0)]),
            }
        }
    }

    pub fn current(&self) -> Value {
        match self {
            VariableState::Scalar(v) => v.clone(),
            VariableState::History { values, .. } => values.front().cloned().unwrap_or_default(),
        }
    }

    pub fn set(&mut self, value: Value) {
        match self {
            VariableState::Scalar(v) => *v = value,
            VariableState::History { values, .. } => match values.front_mut() {
                Some(front) => *front = value,
                None => values.push_front(value),
            },
        }
    }

    /// # Summary
    /// 读取 `index` 根之前的值。
    ///
    /// # Logic
    /// 1. 标量变量只有当前值，其余下标返回 `Null`。
    /// 2. 历史变量在保留长度内按需扩展缓冲区。
    pub fn at(&mut self, index: usize) -> Value {
        match self {
            VariableState::Scalar(v) => {
                if index == 0 {
                    v.clone()
                } else {
                    Value::Null
                }
            }
            VariableState::History { length, values } => {
                if index < *length && index >= values.len() {
                    values.resize(index + 1, Value::Null);
                }
                values.get(index).cloned().unwrap_or_default()
            }
        }
    }

    /// 在 Bar 边界将当前值推入历史
    pub fn commit(&mut self) {
        if let VariableState::History { length, values } = self {
            let current = values.front().cloned().unwrap_or_default();
            values.push_front(current);
            values.truncate(*length);
        }
    }

    pub fn len(&self) -> usize {
        match self {
            VariableState::Scalar(_) => 1,
            VariableState::History { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// # Summary
/// 单个指标实例在某个 Renderer 上的全部持久状态。
///
/// # Invariants
/// - 按指标 id 存放于 `Renderer::indicators`，从不在实例之间共享。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorState {
    pub functions: Vec<FunctionState>,
    pub variables: Vec<VariableState>,
}

impl IndicatorState {
    pub fn commit(&mut self) {
        for f in &mut self.functions {
            f.commit();
        }
        for v in &mut self.variables {
            v.commit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Number(0.0).truthy());
        assert!(!Value::Number(f64::NAN).truthy());
        assert!(Value::Number(-1.0).truthy());
        assert!(!Value::Text(String::new()).truthy());
    }

    #[test]
    fn test_history_variable_shift() {
        let mut var = VariableState::seeded(3);
        assert_eq!(var.current(), Value::Number(0.0));

        var.set(Value::Number(1.0));
        var.commit();
        var.set(Value::Number(2.0));

        assert_eq!(var.at(0), Value::Number(2.0));
        assert_eq!(var.at(1), Value::Number(1.0));
        assert_eq!(var.at(2), Value::Null);
        // 超出保留长度
        assert_eq!(var.at(5), Value::Null);

        var.commit();
        var.commit();
        assert_eq!(var.len(), 3);
    }

    #[test]
    fn test_history_lazy_extend() {
        let mut var = VariableState::seeded(4);
        assert_eq!(var.len(), 1);
        assert_eq!(var.at(3), Value::Null);
        assert_eq!(var.len(), 4);
    }

    #[test]
    fn test_window_commit_caps_length() {
        let mut state = FunctionState::Window(WindowState {
            length: 2,
            ..Default::default()
        });
        for v in [1.0, 2.0, 3.0] {
            if let FunctionState::Window(s) = &mut state {
                s.pending = Some(v);
            }
            state.commit();
        }
        match state {
            FunctionState::Window(s) => assert_eq!(s.points, VecDeque::from([2.0, 3.0])),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_member_access() {
        let ohlc = Value::Ohlc {
            open: Some(1.0),
            high: Some(2.0),
            low: Some(0.5),
            close: Some(1.5),
        };
        assert_eq!(ohlc.member("close"), Value::Number(1.5));
        let range = Value::Range {
            lower: Some(1.0),
            higher: None,
        };
        assert_eq!(range.member("lowerValue"), Value::Number(1.0));
        assert_eq!(range.member("higherValue"), Value::Null);
    }
}
