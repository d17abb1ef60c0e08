use crate::program::{Instr, Node};
use std::collections::BTreeSet;

/// # Summary
/// 排版阶段：把每条顶层语句的指令组拼接为最终序列。
///
/// # Logic
/// 1. 统计语句读取的外部市场，恰好一个时整组包进 `Guard`，市场缺失时跳过该语句。
/// 2. 其余语句原样展开。
pub fn layout(groups: Vec<Vec<Instr>>) -> Vec<Instr> {
    let mut out = Vec::new();
    for group in groups {
        let mut markets = BTreeSet::new();
        for instr in &group {
            instr.walk_nodes(&mut |node| {
                if let Node::Source { market, .. } = node {
                    markets.insert(*market);
                }
            });
        }
        match (markets.len(), markets.first()) {
            (1, Some(market)) => out.push(Instr::Guard {
                market: *market,
                body: group,
            }),
            _ => out.extend(group),
        }
    }
    out
}

/// 生成静默版本：递归移除全部 `Emit` 指令
pub fn silence(instrs: &[Instr]) -> Vec<Instr> {
    instrs
        .iter()
        .filter(|i| !matches!(i, Instr::Emit { .. }))
        .map(|instr| match instr {
            Instr::If {
                cond,
                then,
                otherwise,
            } => Instr::If {
                cond: cond.clone(),
                then: silence(then),
                otherwise: silence(otherwise),
            },
            Instr::For {
                init,
                cond,
                step,
                body,
            } => Instr::For {
                init: silence(init),
                cond: cond.clone(),
                step: silence(step),
                body: silence(body),
            },
            Instr::Guard { market, body } => Instr::Guard {
                market: *market,
                body: silence(body),
            },
            other => other.clone(),
        })
        .collect()
}
