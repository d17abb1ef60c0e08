//! 指标脚本引擎：编译脚本文本并在每个 Renderer 上逐 tick 执行。

pub mod adapter;
pub mod ast;
pub mod builtins;
pub mod compiler;
pub mod lexer;
pub mod parser;
pub mod program;

pub use adapter::{Adapter, get_adapter};
pub use builtins::Builtins;
pub use compiler::compile;
pub use compiler::options::resolve_plot_options;
pub use program::CompiledModel;
