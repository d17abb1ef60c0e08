use crate::ast::{Expr, Stmt};

/// 引用收集结果
#[derive(Debug, Default)]
pub struct References {
    // 被读取的绘图 id，顺序即运行时下标
    pub series: Vec<String>,
    // 依赖的指标 id
    pub indicators: Vec<String>,
}

impl References {
    pub fn index(&self, id: &str) -> Option<usize> {
        self.series.iter().position(|s| s == id)
    }
}

/// # Summary
/// 引用收集阶段：登记 `$id` 依赖。
///
/// # Logic
/// 1. `$band-2` 读取绘图 `band-2`，依赖的指标为 `band`。
/// 2. 两个列表均按首次出现顺序去重。
pub fn collect(stmts: &[Stmt]) -> References {
    let mut refs = References::default();
    for stmt in stmts {
        stmt.walk_exprs(&mut |e| {
            if let Expr::Reference { id, .. } = e {
                if !refs.series.contains(id) {
                    refs.series.push(id.clone());
                }
                let indicator = owner_of(id);
                if !refs.indicators.iter().any(|i| i == indicator) {
                    refs.indicators.push(indicator.to_string());
                }
            }
        });
    }
    refs
}

/// 从绘图 id 推导所属指标 id
pub fn owner_of(plot_id: &str) -> &str {
    match plot_id.rsplit_once('-') {
        Some((base, suffix))
            if !base.is_empty() && !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) =>
        {
            base
        }
        _ => plot_id,
    }
}
