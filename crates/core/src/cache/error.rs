use thiserror::Error;

/// # Summary
/// 缓存域错误枚举，处理块序列化与外部存储故障。
///
/// # Invariants
/// - 必须通过 `thiserror` 派生 `Error` trait。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    // 数据序列化失败
    #[error("Serialize error: {0}")]
    Serialize(String),
    // 数据反序列化失败
    #[error("Deserialize error: {0}")]
    Deserialize(String),
    // 外部存储故障
    #[error("Storage error: {0}")]
    Storage(String),
    // 块与已缓存区间重叠
    #[error("Chunk [{from}, {to}] overlaps cached range")]
    Overlap { from: i64, to: i64 },
}
