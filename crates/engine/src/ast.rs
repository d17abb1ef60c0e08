//! 脚本语法树。

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// 调用参数，`key=value` 形式带名称，`raw` 保留原始文本
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: Option<String>,
    pub value: Expr,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Ident(String),
    Market {
        market: String,
        field: Option<String>,
    },
    Reference {
        id: String,
        field: Option<String>,
    },
    Member {
        object: Box<Expr>,
        field: String,
    },
    // `name[N]`
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: String,
        args: Vec<Arg>,
        line: usize,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign {
        name: String,
        // 复合赋值的运算符，`=` 时为空
        op: Option<BinaryOp>,
        value: Expr,
        // `var` 声明的临时变量
        transient: bool,
        line: usize,
    },
    Expr {
        expr: Expr,
        line: usize,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
        line: usize,
    },
    For {
        init: Vec<Stmt>,
        cond: Option<Expr>,
        step: Vec<Stmt>,
        body: Vec<Stmt>,
        line: usize,
    },
}

impl Expr {
    /// 深度优先遍历表达式树
    pub fn walk(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Member { object, .. } => object.walk(f),
            Expr::Index { target, index } => {
                target.walk(f);
                index.walk(f);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.value.walk(f);
                }
            }
            Expr::Unary { expr, .. } => expr.walk(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.walk(f);
                rhs.walk(f);
            }
            Expr::Ternary {
                cond,
                then,
                otherwise,
            } => {
                cond.walk(f);
                then.walk(f);
                otherwise.walk(f);
            }
            Expr::Number(_)
            | Expr::Str(_)
            | Expr::Ident(_)
            | Expr::Market { .. }
            | Expr::Reference { .. } => {}
        }
    }
}

impl Stmt {
    /// 遍历语句内 (含嵌套语句) 的全部表达式
    pub fn walk_exprs(&self, f: &mut dyn FnMut(&Expr)) {
        match self {
            Stmt::Assign { value, .. } => value.walk(f),
            Stmt::Expr { expr, .. } => expr.walk(f),
            Stmt::If {
                cond,
                then,
                otherwise,
                ..
            } => {
                cond.walk(f);
                for s in then.iter().chain(otherwise) {
                    s.walk_exprs(f);
                }
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
                ..
            } => {
                if let Some(cond) = cond {
                    cond.walk(f);
                }
                for s in init.iter().chain(step).chain(body) {
                    s.walk_exprs(f);
                }
            }
        }
    }

    /// 遍历语句及其嵌套语句
    pub fn walk_stmts(&self, f: &mut dyn FnMut(&Stmt)) {
        f(self);
        match self {
            Stmt::If {
                then, otherwise, ..
            } => {
                for s in then.iter().chain(otherwise) {
                    s.walk_stmts(f);
                }
            }
            Stmt::For {
                init, step, body, ..
            } => {
                for s in init.iter().chain(step).chain(body) {
                    s.walk_stmts(f);
                }
            }
            Stmt::Assign { .. } | Stmt::Expr { .. } => {}
        }
    }
}
