use async_trait::async_trait;
use dashmap::DashMap;
use tickchart_core::cache::error::CacheError;
use tickchart_core::cache::port::ChunkStore;

/// # Summary
/// 基于 DashMap 的内存块存储。
///
/// # Invariants
/// - 所有操作均通过并发哈希表执行，可在多个面板之间共享。
/// - 不做容量限制，块的淘汰由 `ChartCache::trim` 驱动。
#[derive(Default)]
pub struct MemChunkStore {
    // 键 -> 序列化后的块
    storage: DashMap<String, Vec<u8>>,
}

impl MemChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

#[async_trait]
impl ChunkStore for MemChunkStore {
    /// 写入原始字节，同名键直接覆盖
    async fn put_raw(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.storage.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.storage.get(key).map(|v| v.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.storage.remove(key);
        Ok(())
    }

    /// # Summary
    /// 列出带前缀的键。
    ///
    /// # Returns
    /// 字典序排列的键列表，顺序与插入无关。
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut keys: Vec<String> = self
            .storage
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
