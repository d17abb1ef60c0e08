//! 编译产物：已完成名称解析的中间表示与指标元数据。

use crate::ast::{BinaryOp, UnaryOp};
use crate::builtins::{BuiltinKind, NativeFn, UtilityFn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tickchart_core::chart::entity::PlotType;
use tickchart_core::chart::state::{FunctionState, IndicatorState, Value, VariableState};

/// # Summary
/// 已解析的表达式节点，所有名称均已替换为槽位下标。
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Const(Value),
    // 变量当前值
    Var(usize),
    // 变量的第 N 根历史值
    History {
        slot: usize,
        index: Box<Node>,
    },
    // 复合 Bar 的字段
    BarField(String),
    // 复合 Bar 整体 (OHLC)
    Bar,
    // 本地时间戳
    Time,
    // 外部市场字段，`market` 为 `Program::markets` 下标
    Source {
        market: usize,
        field: Option<String>,
    },
    // 其他指标的输出，`reference` 为 `Program::series` 下标
    Series {
        reference: usize,
        field: Option<String>,
    },
    // `options.xxx`
    Option(String),
    Unary {
        op: UnaryOp,
        expr: Box<Node>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Ternary {
        cond: Box<Node>,
        then: Box<Node>,
        otherwise: Box<Node>,
    },
    Member {
        object: Box<Node>,
        field: String,
    },
    Native {
        func: NativeFn,
        args: Vec<Node>,
    },
    Utility {
        func: UtilityFn,
        args: Vec<Node>,
    },
    // 有状态内置函数，`slot` 为函数状态下标
    Builtin {
        kind: BuiltinKind,
        slot: usize,
        args: Vec<Node>,
    },
}

/// # Summary
/// 已解析的指令。
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Assign {
        slot: usize,
        value: Node,
    },
    Eval(Node),
    If {
        cond: Node,
        then: Vec<Instr>,
        otherwise: Vec<Instr>,
    },
    For {
        init: Vec<Instr>,
        cond: Option<Node>,
        step: Vec<Instr>,
        body: Vec<Instr>,
    },
    // 构造绘图点并写入 `Renderer::series`
    BuildPoint {
        plot: usize,
        args: Vec<Node>,
    },
    // 按输出过滤规则把已构造的点送往输出通道
    Emit {
        plot: usize,
    },
    // 仅当市场存在于 Renderer 时执行
    Guard {
        market: usize,
        body: Vec<Instr>,
    },
}

impl Node {
    pub fn walk(&self, f: &mut dyn FnMut(&Node)) {
        f(self);
        match self {
            Node::History { index, .. } => index.walk(f),
            Node::Unary { expr, .. } => expr.walk(f),
            Node::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            Node::Ternary {
                cond,
                then,
                otherwise,
            } => {
                cond.walk(f);
                then.walk(f);
                otherwise.walk(f);
            }
            Node::Member { object, .. } => object.walk(f),
            Node::Native { args, .. } | Node::Utility { args, .. } | Node::Builtin { args, .. } => {
                for arg in args {
                    arg.walk(f);
                }
            }
            Node::Const(_)
            | Node::Var(_)
            | Node::BarField(_)
            | Node::Bar
            | Node::Time
            | Node::Source { .. }
            | Node::Series { .. }
            | Node::Option(_) => {}
        }
    }
}

impl Instr {
    /// 遍历指令 (含嵌套指令) 中的所有表达式节点
    pub fn walk_nodes(&self, f: &mut dyn FnMut(&Node)) {
        match self {
            Instr::Assign { value, .. } => value.walk(f),
            Instr::Eval(node) => node.walk(f),
            Instr::If {
                cond,
                then,
                otherwise,
            } => {
                cond.walk(f);
                for i in then.iter().chain(otherwise) {
                    i.walk_nodes(f);
                }
            }
            Instr::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(cond) = cond {
                    cond.walk(f);
                }
                for i in init.iter().chain(step).chain(body) {
                    i.walk_nodes(f);
                }
            }
            Instr::BuildPoint { args, .. } => {
                for arg in args {
                    arg.walk(f);
                }
            }
            Instr::Emit { .. } => {}
            Instr::Guard { body, .. } => {
                for i in body {
                    i.walk_nodes(f);
                }
            }
        }
    }
}

/// # Summary
/// 可重复执行的指令序列及其运行所需的槽位布局。
///
/// # Invariants
/// - 所有 `Var` / `History` 槽位 < `variable_count`，`Builtin` 槽位 < `function_count`。
/// - `plot_ids`、`plot_types`、`plot_offsets` 长度一致。
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub instrs: Vec<Instr>,
    pub variable_count: usize,
    pub function_count: usize,
    // 每次执行前重置为 Null 的临时变量槽位
    pub transient: Vec<usize>,
    pub markets: Vec<String>,
    // 被引用的绘图 id
    pub series: Vec<String>,
    pub plot_ids: Vec<String>,
    pub plot_types: Vec<PlotType>,
    pub plot_offsets: Vec<i64>,
}

/// 变量元数据
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSpec {
    pub name: String,
    // 需要保留的历史长度 (含当前值)
    pub length: usize,
    pub persistent: bool,
}

/// 有状态函数调用点元数据
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub prototype: FunctionState,
    // 字面量长度参数
    pub length: Option<usize>,
}

/// 绘图选项的编译结果
#[derive(Debug, Clone, PartialEq)]
pub enum PlotOption {
    // 可直接解析为 JSON 的值 (字符串字面量也落在此处)
    Json(serde_json::Value),
    // 需要在绑定时结合指标选项求值的表达式文本
    Expr(String),
}

/// 绘图元数据
#[derive(Debug, Clone, PartialEq)]
pub struct PlotSpec {
    pub id: String,
    pub plot_type: PlotType,
    pub options: BTreeMap<String, PlotOption>,
    // 以 Bar 为单位的时间偏移
    pub offset: i64,
}

/// # Summary
/// 一段脚本文本的完整编译结果。
///
/// # Invariants
/// - 相同脚本文本两次编译得到的元数据结构相同 (集合均为有序容器)。
/// - `silent_output` 与 `output` 相同，只是去掉了全部 `Emit` 指令。
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledModel {
    pub output: Arc<Program>,
    pub silent_output: Arc<Program>,
    pub variables: Vec<VariableSpec>,
    pub functions: Vec<FunctionSpec>,
    pub plots: Vec<PlotSpec>,
    // 市场 -> 所需字段
    pub markets: BTreeMap<String, BTreeSet<String>>,
    // 依赖的其他指标 id
    pub references: Vec<String>,
    // 读取的复合 Bar 字段
    pub props: BTreeSet<String>,
    pub min_length: usize,
}

impl CompiledModel {
    /// 按编译布局构造一份全新的指标状态
    pub fn seed_state(&self) -> IndicatorState {
        IndicatorState {
            functions: self.functions.iter().map(|f| f.prototype.clone()).collect(),
            variables: self
                .variables
                .iter()
                .map(|v| VariableState::seeded(v.length))
                .collect(),
        }
    }

    pub fn plot_ids(&self) -> Vec<String> {
        self.plots.iter().map(|p| p.id.clone()).collect()
    }
}
