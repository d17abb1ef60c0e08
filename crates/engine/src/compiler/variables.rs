use crate::ast::{Expr, Stmt};
use crate::program::VariableSpec;
use std::collections::HashMap;
use tickchart_core::engine::error::ScriptError;

/// 脚本中不可赋值的保留名
pub const RESERVED: [&str; 7] = ["bar", "time", "options", "Math", "true", "false", "null"];

/// # Summary
/// 变量槽位表。
///
/// # Invariants
/// - 槽位按首次赋值出现的顺序分配，保证同一脚本编译结果稳定。
#[derive(Debug, Default)]
pub struct VariableTable {
    pub specs: Vec<VariableSpec>,
    slots: HashMap<String, usize>,
}

impl VariableTable {
    pub fn slot(&self, name: &str) -> Option<usize> {
        self.slots.get(name).copied()
    }

    pub fn is_persistent(&self, name: &str) -> bool {
        self.slot(name)
            .and_then(|slot| self.specs.get(slot))
            .is_some_and(|spec| spec.persistent)
    }

    fn declare(&mut self, name: &str, transient: bool, line: usize) -> Result<(), ScriptError> {
        if RESERVED.contains(&name) {
            return Err(ScriptError::Syntax {
                line,
                message: format!("cannot assign to reserved name `{}`", name),
            });
        }
        if !self.slots.contains_key(name) {
            self.slots.insert(name.to_string(), self.specs.len());
            self.specs.push(VariableSpec {
                name: name.to_string(),
                length: 1,
                persistent: !transient,
            });
        }
        Ok(())
    }

    fn require_history(&mut self, name: &str, index: f64) {
        let Some(spec) = self.slot(name).and_then(|slot| self.specs.get_mut(slot)) else {
            return;
        };
        if let Some(depth) = literal_index(index) {
            spec.length = spec.length.max(depth + 1);
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn literal_index(index: f64) -> Option<usize> {
    if index.is_finite() && index >= 0.0 && index.fract() == 0.0 {
        Some(index as usize)
    } else {
        None
    }
}

/// # Summary
/// 变量收集阶段。
///
/// # Logic
/// 1. 遍历所有赋值语句，区分持久变量与 `var` 临时变量并分配槽位。
/// 2. 扫描 `name(N)` 与 `name[N]` 的字面量下标，把保留长度提升到 `max(当前, N+1)`。
pub fn collect(stmts: &[Stmt]) -> Result<VariableTable, ScriptError> {
    let mut table = VariableTable::default();

    let mut declared = Vec::new();
    for stmt in stmts {
        stmt.walk_stmts(&mut |s| {
            if let Stmt::Assign {
                name,
                transient,
                line,
                ..
            } = s
            {
                declared.push((name.clone(), *transient, *line));
            }
        });
    }
    for (name, transient, line) in declared {
        table.declare(&name, transient, line)?;
    }

    let mut history = Vec::new();
    for stmt in stmts {
        stmt.walk_exprs(&mut |e| match e {
            Expr::Call { callee, args, .. } if args.len() == 1 => {
                if let Expr::Number(n) = args[0].value {
                    history.push((callee.clone(), n));
                }
            }
            Expr::Index { target, index } => {
                if let (Expr::Ident(name), Expr::Number(n)) = (target.as_ref(), index.as_ref()) {
                    history.push((name.clone(), *n));
                }
            }
            _ => {}
        });
    }
    for (name, index) in history {
        table.require_history(&name, index);
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn test_history_length() {
        let stmts = parse("x = close\ny = x(3) + x[1]\nvar t = 1").unwrap();
        let table = collect(&stmts).unwrap();
        assert_eq!(table.specs.len(), 3);
        assert_eq!(table.specs[0].name, "x");
        assert_eq!(table.specs[0].length, 4);
        assert_eq!(table.specs[1].length, 1);
        assert!(!table.specs[2].persistent);
    }

    #[test]
    fn test_reserved_name() {
        let stmts = parse("bar = 1").unwrap();
        assert!(matches!(collect(&stmts), Err(ScriptError::Syntax { line: 1, .. })));
    }
}
