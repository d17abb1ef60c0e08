use crate::cache::error::CacheError;
use crate::chart::entity::Chunk;
use async_trait::async_trait;

/// # Summary
/// 外部块存储接口 (Port)，按面板命名空间保存原始字节。
///
/// # Invariants
/// - 处理原始字节，确保 Trait 是对象安全的 (Object Safe)。
/// - 块的排序、合并与裁剪由上游 `ChartCache` 负责。
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// # Summary
    /// 写入原始字节。
    ///
    /// # Arguments
    /// * `key`: 唯一键。
    /// * `value`: 原始字节数组。
    ///
    /// # Returns
    /// 成功返回 Ok，失败返回 `CacheError`。
    async fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;

    /// 读取原始字节，不存在时返回 `None`
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// 删除指定键
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// 列出带有指定前缀的全部键
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError>;
}

/// # Summary
/// 块存储的强类型扩展，负责 `Chunk` 的 JSON 编解码与键命名。
///
/// # Invariants
/// - 自动为所有实现 `ChunkStore` 的类型提供支持。
/// - 键格式为 `{pane}/{from}`，同一面板内 `from` 唯一。
#[async_trait]
pub trait ChunkStoreExt: ChunkStore {
    /// # Summary
    /// 保存一个块。
    ///
    /// # Logic
    /// 1. 使用 JSON 序列化块。
    /// 2. 调用底层 `put_raw` 写入。
    async fn save_chunk(&self, pane: &str, chunk: &Chunk) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(chunk).map_err(|e| CacheError::Serialize(e.to_string()))?;
        self.put_raw(&chunk_key(pane, chunk.from), bytes).await
    }

    /// # Summary
    /// 读取面板下的全部块。
    ///
    /// # Returns
    /// 按 `from` 升序排列的块列表。
    async fn load_chunks(&self, pane: &str) -> Result<Vec<Chunk>, CacheError> {
        let mut chunks = Vec::new();
        for key in self.keys(&format!("{}/", pane)).await? {
            if let Some(bytes) = self.get_raw(&key).await? {
                let chunk: Chunk = serde_json::from_slice(&bytes)
                    .map_err(|e| CacheError::Deserialize(e.to_string()))?;
                chunks.push(chunk);
            }
        }
        chunks.sort_by_key(|c| c.from);
        Ok(chunks)
    }

    /// 删除面板下的单个块
    async fn delete_chunk(&self, pane: &str, from: i64) -> Result<(), CacheError> {
        self.delete(&chunk_key(pane, from)).await
    }
}

impl<T: ChunkStore + ?Sized> ChunkStoreExt for T {}

fn chunk_key(pane: &str, from: i64) -> String {
    format!("{}/{}", pane, from)
}
