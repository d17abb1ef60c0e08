use thiserror::Error;

/// # Summary
/// 指标脚本域错误枚举，覆盖编译、适配器构建与运行阶段。
///
/// # Invariants
/// - 任何变体只会让出错的单个指标进入错误状态，不影响聚合引擎与其他指标。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    // 词法或语法错误
    #[error("Syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },
    // 括号无法配对
    #[error("Unbalanced bracket at line {line}: {message}")]
    Bracket { line: usize, message: String },
    // 调用了未注册的函数
    #[error("Unknown function `{name}` at line {line}")]
    UnknownFunction { line: usize, name: String },
    // 绘图函数参数个数不符
    #[error("Plot `{name}` at line {line} expects {expected} argument(s), got {got}")]
    PlotArity {
        line: usize,
        name: String,
        expected: String,
        got: usize,
    },
    // 编译产物与运行时状态不匹配
    #[error("Adapter error: {0}")]
    Adapter(String),
    // 执行期错误 (例如循环次数超限)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl ScriptError {
    /// 是否属于编译期错误
    pub fn is_compile(&self) -> bool {
        !matches!(self, ScriptError::Adapter(_) | ScriptError::Runtime(_))
    }
}
