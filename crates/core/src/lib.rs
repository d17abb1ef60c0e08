//! 图表核心领域模型：实体、端口 (Trait) 与错误定义。
//!
//! 各领域按 `entity` / `port` / `error` 分层，具体实现位于其他 crate。

pub mod common;
pub mod config;

pub mod market {
    pub mod entity;
    pub mod error;
}

pub mod chart {
    pub mod entity;
    pub mod state;
}

pub mod engine {
    pub mod error;
}

pub mod cache {
    pub mod error;
    pub mod port;
}

pub mod render {
    pub mod port;
}

pub mod feed {
    pub mod entity;
    pub mod error;
}
