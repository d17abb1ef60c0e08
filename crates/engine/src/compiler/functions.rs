use crate::ast::{Arg, Expr, Stmt};
use crate::builtins::{Builtins, to_length};
use crate::compiler::options::parse_option;
use crate::compiler::references::References;
use crate::compiler::variables::VariableTable;
use crate::program::{FunctionSpec, Instr, Node, PlotSpec};
use std::collections::{BTreeMap, BTreeSet};
use tickchart_core::chart::entity::{PlotShape, PlotType};
use tickchart_core::chart::state::Value;
use tickchart_core::engine::error::ScriptError;
use tickchart_core::market::entity::BAR_FIELDS;

/// # Summary
/// 函数解析与降级阶段：把语法树转换为已解析的指令。
///
/// # Invariants
/// - 每个有状态内置函数调用点独占一个函数槽位。
/// - 绘图调用展开为 `BuildPoint` + `Emit` 两条指令。
pub struct Lowerer<'a> {
    pub indicator_id: &'a str,
    pub siblings: &'a [String],
    pub variables: &'a VariableTable,
    pub markets: &'a BTreeMap<String, BTreeSet<String>>,
    pub references: &'a References,
    pub builtins: &'a Builtins,
    pub functions: Vec<FunctionSpec>,
    pub plots: Vec<PlotSpec>,
    pub props: BTreeSet<String>,
}

impl<'a> Lowerer<'a> {
    /// 降级一条顶层语句，返回其展开后的指令组
    pub fn statement(&mut self, stmt: &Stmt) -> Result<Vec<Instr>, ScriptError> {
        match stmt {
            Stmt::Assign {
                name,
                op,
                value,
                line,
                ..
            } => {
                let slot = self.variables.slot(name).ok_or_else(|| ScriptError::Syntax {
                    line: *line,
                    message: format!("unknown variable `{}`", name),
                })?;
                let mut value = self.expr(value, *line)?;
                if let Some(op) = op {
                    value = Node::Binary {
                        op: *op,
                        lhs: Box::new(Node::Var(slot)),
                        rhs: Box::new(value),
                    };
                }
                Ok(vec![Instr::Assign { slot, value }])
            }
            Stmt::Expr {
                expr: Expr::Call { callee, args, line },
                ..
            } if PlotType::from_name(callee).is_some() => self.plot(callee, args, *line),
            Stmt::Expr { expr, line } => Ok(vec![Instr::Eval(self.expr(expr, *line)?)]),
            Stmt::If {
                cond,
                then,
                otherwise,
                line,
            } => Ok(vec![Instr::If {
                cond: self.expr(cond, *line)?,
                then: self.block(then)?,
                otherwise: self.block(otherwise)?,
            }]),
            Stmt::For {
                init,
                cond,
                step,
                body,
                line,
            } => {
                let cond = match cond {
                    Some(cond) => Some(self.expr(cond, *line)?),
                    None => None,
                };
                Ok(vec![Instr::For {
                    init: self.block(init)?,
                    cond,
                    step: self.block(step)?,
                    body: self.block(body)?,
                }])
            }
        }
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<Vec<Instr>, ScriptError> {
        let mut out = Vec::new();
        for stmt in stmts {
            out.extend(self.statement(stmt)?);
        }
        Ok(out)
    }

    /// # Summary
    /// 展开绘图调用。
    ///
    /// # Logic
    /// 1. 按绘图形态校验位置参数个数 (数值 1 个、K 线 1 或 4 个、区间 2 个)。
    /// 2. `id=` 与 `offset=` 为保留选项，其余命名参数作为样式选项。
    /// 3. 分配绘图 id：显式 id 或由指标 id 推导，并与兄弟绘图去重。
    fn plot(&mut self, callee: &str, args: &[Arg], line: usize) -> Result<Vec<Instr>, ScriptError> {
        let plot_type = PlotType::from_name(callee).ok_or_else(|| ScriptError::UnknownFunction {
            line,
            name: callee.to_string(),
        })?;

        let positional: Vec<&Arg> = args.iter().filter(|a| a.name.is_none()).collect();
        let (allowed, expected): (&[usize], &str) = match plot_type.shape() {
            PlotShape::Number => (&[1], "1"),
            PlotShape::Ohlc => (&[1, 4], "1 or 4"),
            PlotShape::Range => (&[2], "2"),
        };
        if !allowed.contains(&positional.len()) {
            return Err(ScriptError::PlotArity {
                line,
                name: callee.to_string(),
                expected: expected.to_string(),
                got: positional.len(),
            });
        }

        let mut explicit_id = None;
        let mut offset = 0;
        let mut options = BTreeMap::new();
        for arg in args {
            let Some(name) = &arg.name else { continue };
            match name.as_str() {
                "id" => {
                    explicit_id = Some(match &arg.value {
                        Expr::Str(s) => s.clone(),
                        _ => arg.raw.clone(),
                    });
                }
                "offset" => {
                    offset = literal_offset(&arg.value).ok_or_else(|| ScriptError::Syntax {
                        line,
                        message: format!("offset must be an integer literal, got `{}`", arg.raw),
                    })?;
                }
                _ => {
                    options.insert(name.clone(), parse_option(arg));
                }
            }
        }

        let id = self.allocate_plot_id(explicit_id);
        let index = self.plots.len();
        self.plots.push(PlotSpec {
            id,
            plot_type,
            options,
            offset,
        });

        let mut lowered = Vec::with_capacity(positional.len());
        for arg in positional {
            lowered.push(self.expr(&arg.value, line)?);
        }

        Ok(vec![
            Instr::BuildPoint {
                plot: index,
                args: lowered,
            },
            Instr::Emit { plot: index },
        ])
    }

    fn allocate_plot_id(&self, explicit: Option<String>) -> String {
        let taken = |candidate: &str| {
            self.siblings.iter().any(|s| s == candidate)
                || self.plots.iter().any(|p| p.id == candidate)
        };
        let base = explicit.unwrap_or_else(|| self.indicator_id.to_string());
        if !taken(&base) {
            return base;
        }
        let mut n = self.plots.len().max(1) + 1;
        loop {
            let candidate = format!("{}-{}", base, n);
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn args(&mut self, args: &[Arg], line: usize) -> Result<Vec<Node>, ScriptError> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            if let Some(name) = &arg.name {
                return Err(ScriptError::Syntax {
                    line,
                    message: format!("named argument `{}` is only allowed in plot calls", name),
                });
            }
            out.push(self.expr(&arg.value, line)?);
        }
        Ok(out)
    }

    fn bar_field(&mut self, field: &str, line: usize) -> Result<Node, ScriptError> {
        if !BAR_FIELDS.contains(&field) {
            return Err(ScriptError::Syntax {
                line,
                message: format!("unknown bar field `{}`", field),
            });
        }
        self.props.insert(field.to_string());
        Ok(Node::BarField(field.to_string()))
    }

    /// 降级表达式
    pub fn expr(&mut self, expr: &Expr, line: usize) -> Result<Node, ScriptError> {
        let node = match expr {
            Expr::Number(n) => Node::Const(Value::Number(*n)),
            Expr::Str(s) => Node::Const(Value::Text(s.clone())),
            Expr::Ident(name) => {
                if let Some(slot) = self.variables.slot(name) {
                    return Ok(Node::Var(slot));
                }
                match name.as_str() {
                    "true" => Node::Const(Value::Bool(true)),
                    "false" => Node::Const(Value::Bool(false)),
                    "null" => Node::Const(Value::Null),
                    "NaN" => Node::Const(Value::Number(f64::NAN)),
                    "time" => Node::Time,
                    "bar" => {
                        self.props
                            .extend(BAR_FIELDS[..4].iter().map(|f| f.to_string()));
                        Node::Bar
                    }
                    field if BAR_FIELDS.contains(&field) => self.bar_field(field, line)?,
                    _ => {
                        return Err(ScriptError::Syntax {
                            line,
                            message: format!("unknown identifier `{}`", name),
                        });
                    }
                }
            }
            Expr::Market { market, field } => {
                let index = self
                    .markets
                    .keys()
                    .position(|m| m == market)
                    .ok_or_else(|| ScriptError::Syntax {
                        line,
                        message: format!("unregistered market `{}`", market),
                    })?;
                Node::Source {
                    market: index,
                    field: field.clone(),
                }
            }
            Expr::Reference { id, field } => {
                let reference = self.references.index(id).ok_or_else(|| ScriptError::Syntax {
                    line,
                    message: format!("unregistered reference `${}`", id),
                })?;
                Node::Series {
                    reference,
                    field: field.clone(),
                }
            }
            Expr::Member { object, field } => match object.as_ref() {
                Expr::Ident(name) if name == "bar" => self.bar_field(field, line)?,
                Expr::Ident(name) if name == "options" => Node::Option(field.clone()),
                Expr::Ident(name) if name == "Math" => match field.as_str() {
                    "PI" => Node::Const(Value::Number(std::f64::consts::PI)),
                    "E" => Node::Const(Value::Number(std::f64::consts::E)),
                    _ => {
                        return Err(ScriptError::Syntax {
                            line,
                            message: format!("unknown constant `Math.{}`", field),
                        });
                    }
                },
                object => Node::Member {
                    object: Box::new(self.expr(object, line)?),
                    field: field.clone(),
                },
            },
            Expr::Index { target, index } => match history_slot(self.variables, target) {
                Some(slot) => Node::History {
                    slot,
                    index: Box::new(self.expr(index, line)?),
                },
                None => {
                    return Err(ScriptError::Syntax {
                        line,
                        message: "only variables support history access".to_string(),
                    });
                }
            },
            Expr::Call { callee, args, line } => self.call(callee, args, *line)?,
            Expr::Unary { op, expr } => Node::Unary {
                op: *op,
                expr: Box::new(self.expr(expr, line)?),
            },
            Expr::Binary { op, lhs, rhs } => Node::Binary {
                op: *op,
                lhs: Box::new(self.expr(lhs, line)?),
                rhs: Box::new(self.expr(rhs, line)?),
            },
            Expr::Ternary {
                cond,
                then,
                otherwise,
            } => Node::Ternary {
                cond: Box::new(self.expr(cond, line)?),
                then: Box::new(self.expr(then, line)?),
                otherwise: Box::new(self.expr(otherwise, line)?),
            },
        };
        Ok(node)
    }

    /// # Summary
    /// 调用分类。
    ///
    /// # Logic
    /// 1. 持久变量加单个参数：历史访问 `name(N)`。
    /// 2. 绘图函数只能作为独立语句出现。
    /// 3. 原生数值函数与 Bar 工具函数直接调用。
    /// 4. 有状态内置函数分配函数槽位，并记录原型与字面量长度。
    /// 5. 其余名称报告未知函数。
    fn call(&mut self, callee: &str, args: &[Arg], line: usize) -> Result<Node, ScriptError> {
        if let Some(slot) = self.variables.slot(callee)
            && args.len() == 1
            && self.variables.is_persistent(callee)
        {
            return Ok(Node::History {
                slot,
                index: Box::new(self.expr(&args[0].value, line)?),
            });
        }

        if PlotType::from_name(callee).is_some() {
            return Err(ScriptError::Syntax {
                line,
                message: format!("plot `{}` must be used as a statement", callee),
            });
        }

        if let Some(func) = self.builtins.native(callee) {
            return Ok(Node::Native {
                func,
                args: self.args(args, line)?,
            });
        }

        if let Some(func) = self.builtins.utility(callee) {
            return Ok(Node::Utility {
                func,
                args: self.args(args, line)?,
            });
        }

        if let Some(def) = self.builtins.stateful(callee) {
            let (min, max) = def.arity;
            if args.len() < min || args.len() > max {
                return Err(ScriptError::Syntax {
                    line,
                    message: format!(
                        "`{}` expects {} to {} argument(s), got {}",
                        callee,
                        min,
                        max,
                        args.len()
                    ),
                });
            }
            let length = def
                .length_arg
                .and_then(|i| args.get(i))
                .and_then(|a| match &a.value {
                    Expr::Number(n) => to_length(&Value::Number(*n)),
                    _ => None,
                });
            let slot = self.functions.len();
            self.functions.push(FunctionSpec {
                name: def.name.to_string(),
                prototype: def.prototype.clone(),
                length,
            });
            return Ok(Node::Builtin {
                kind: def.kind,
                slot,
                args: self.args(args, line)?,
            });
        }

        Err(ScriptError::UnknownFunction {
            line,
            name: callee.to_string(),
        })
    }
}

fn history_slot(variables: &VariableTable, target: &Expr) -> Option<usize> {
    match target {
        Expr::Ident(name) => variables.slot(name),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn literal_offset(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
        Expr::Unary {
            op: crate::ast::UnaryOp::Neg,
            expr,
        } => literal_offset(expr).map(|n| -n),
        _ => None,
    }
}
