use crate::ast::{Expr, Stmt};
use std::collections::{BTreeMap, BTreeSet};
use tickchart_core::market::entity::BAR_FIELDS;

/// # Summary
/// 市场收集阶段：登记 `EXCHANGE:PAIR[.field]` 依赖及其所需字段。
///
/// # Logic
/// 1. 带字段的引用登记该字段。
/// 2. 不带字段的引用作为整根 OHLC 使用，登记四个价格字段。
///
/// # Returns
/// 按市场 id 排序的依赖表，其键序即运行时的市场下标。
pub fn collect(stmts: &[Stmt]) -> BTreeMap<String, BTreeSet<String>> {
    let mut markets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for stmt in stmts {
        stmt.walk_exprs(&mut |e| {
            if let Expr::Market { market, field } = e {
                let fields = markets.entry(market.clone()).or_default();
                match field {
                    Some(field) => {
                        fields.insert(field.clone());
                    }
                    None => {
                        fields.extend(BAR_FIELDS[..4].iter().map(|f| f.to_string()));
                    }
                }
            }
        });
    }
    markets
}
