use thiserror::Error;

/// # Summary
/// worker 通信错误枚举。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    // 通道已关闭
    #[error("Worker channel closed")]
    Closed,
    // 等待应答超时
    #[error("Worker request timed out after {0} ms")]
    Timeout(u64),
    // worker 返回的业务错误
    #[error("Worker error: {0}")]
    Worker(String),
}
