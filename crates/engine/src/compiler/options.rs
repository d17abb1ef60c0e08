use crate::ast::{Arg, BinaryOp, Expr, Stmt, UnaryOp};
use crate::parser::parse;
use crate::program::{PlotOption, PlotSpec};
use serde_json::Value as Json;
use tickchart_core::chart::entity::OptionMap;

/// # Summary
/// 解析绘图调用中的 `key=value` 选项。
///
/// # Logic
/// 1. 原始文本可解析为 JSON 时直接使用。
/// 2. 字符串字面量 (含单引号) 取其内容。
/// 3. 其余保留原始表达式文本，绑定时再求值。
pub fn parse_option(arg: &Arg) -> PlotOption {
    if let Ok(json) = serde_json::from_str::<Json>(&arg.raw) {
        return PlotOption::Json(json);
    }
    if let Expr::Str(text) = &arg.value {
        return PlotOption::Json(Json::String(text.clone()));
    }
    PlotOption::Expr(arg.raw.clone())
}

/// # Summary
/// 结合指标选项求出绘图的最终样式。
///
/// # Logic
/// 1. JSON 选项原样输出。
/// 2. 表达式选项只允许读取 `options.xxx`、常量与四则运算，求值失败时退回原始文本。
pub fn resolve_plot_options(plot: &PlotSpec, options: &OptionMap) -> OptionMap {
    plot.options
        .iter()
        .map(|(key, value)| {
            let resolved = match value {
                PlotOption::Json(json) => json.clone(),
                PlotOption::Expr(raw) => {
                    evaluate(raw, options).unwrap_or_else(|| Json::String(raw.clone()))
                }
            };
            (key.clone(), resolved)
        })
        .collect()
}

fn evaluate(raw: &str, options: &OptionMap) -> Option<Json> {
    let stmts = parse(raw).ok()?;
    match stmts.as_slice() {
        [Stmt::Expr { expr, .. }] => eval(expr, options),
        _ => None,
    }
}

fn eval(expr: &Expr, options: &OptionMap) -> Option<Json> {
    match expr {
        Expr::Number(n) => serde_json::Number::from_f64(*n).map(Json::Number),
        Expr::Str(s) => Some(Json::String(s.clone())),
        Expr::Ident(name) => match name.as_str() {
            "true" => Some(Json::Bool(true)),
            "false" => Some(Json::Bool(false)),
            "null" => Some(Json::Null),
            _ => None,
        },
        Expr::Member { object, field } => match object.as_ref() {
            Expr::Ident(name) if name == "options" => options.get(field).cloned(),
            _ => None,
        },
        Expr::Unary {
            op: UnaryOp::Neg,
            expr,
        } => number(eval(expr, options)?).and_then(|n| to_json(-n)),
        Expr::Unary {
            op: UnaryOp::Not,
            expr,
        } => Some(Json::Bool(!truthy(&eval(expr, options)?))),
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            if truthy(&eval(cond, options)?) {
                eval(then, options)
            } else {
                eval(otherwise, options)
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = eval(lhs, options)?;
            let r = eval(rhs, options)?;
            if let (BinaryOp::Add, Json::String(a)) = (op, &l) {
                return Some(Json::String(format!("{}{}", a, display(&r))));
            }
            let (a, b) = (number(l)?, number(r)?);
            match op {
                BinaryOp::Add => to_json(a + b),
                BinaryOp::Sub => to_json(a - b),
                BinaryOp::Mul => to_json(a * b),
                BinaryOp::Div => to_json(a / b),
                BinaryOp::Rem => to_json(a % b),
                BinaryOp::Lt => Some(Json::Bool(a < b)),
                BinaryOp::Le => Some(Json::Bool(a <= b)),
                BinaryOp::Gt => Some(Json::Bool(a > b)),
                BinaryOp::Ge => Some(Json::Bool(a >= b)),
                BinaryOp::Eq => Some(Json::Bool(a == b)),
                BinaryOp::Ne => Some(Json::Bool(a != b)),
                BinaryOp::And | BinaryOp::Or => None,
            }
        }
        _ => None,
    }
}

fn number(json: Json) -> Option<f64> {
    match json {
        Json::Number(n) => n.as_f64(),
        Json::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
        Json::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_json(n: f64) -> Option<Json> {
    serde_json::Number::from_f64(n).map(Json::Number)
}

fn truthy(json: &Json) -> bool {
    match json {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Json::String(s) => !s.is_empty(),
        Json::Array(_) | Json::Object(_) => true,
    }
}

fn display(json: &Json) -> String {
    match json {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}
