use std::collections::HashMap;
use tickchart_core::cache::error::CacheError;
use tickchart_core::cache::port::{ChunkStore, ChunkStoreExt};
use tickchart_core::chart::entity::{Chunk, Renderer};
use tickchart_core::market::entity::Bar;
use tracing::{debug, info, warn};

/// 已封存块覆盖的时间区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRange {
    pub from: i64,
    pub to: i64,
}

/// 块在缓存中的落点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Appended(usize),
    Prepended,
    // 与已缓存区间重叠，未写入
    Rejected,
}

/// # Summary
/// 单个面板的历史 Bar 缓存。
///
/// # Invariants
/// - `chunks` 按时间升序排列，互不重叠，裁剪后保持连续。
/// - 封存后的块不再修改，只有 `active` 块继续接收 Bar。
/// - `active` 中的 Bar 时间总是晚于全部已封存块。
#[derive(Debug, Clone)]
pub struct ChartCache {
    chunks: Vec<Chunk>,
    // 正在收集的未封存块
    active: Option<Chunk>,
    range: Option<CacheRange>,
    // 每块 Bar 数
    chunk_size: usize,
}

impl ChartCache {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunks: Vec::new(),
            active: None,
            range: None,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn range(&self) -> Option<CacheRange> {
        self.range
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.active.as_ref().is_none_or(|c| c.bars.is_empty())
    }

    /// # Summary
    /// 保存一个已封存的块。
    ///
    /// # Logic
    /// 1. 缓存为空或块起点不早于区间终点时追加到末尾，更新区间终点。
    /// 2. 块终点不晚于区间起点时插入到开头，更新区间起点。
    /// 3. 其余情况视为重叠，不做修改。
    ///
    /// # Returns
    /// 写入后的块；重叠时返回现有的第一个块。
    pub fn save_chunk(&mut self, chunk: Chunk) -> &Chunk {
        match self.insert(chunk) {
            Placement::Appended(index) => &self.chunks[index],
            Placement::Prepended | Placement::Rejected => &self.chunks[0],
        }
    }

    fn insert(&mut self, chunk: Chunk) -> Placement {
        let placement = match self.range {
            None => {
                self.range = Some(CacheRange {
                    from: chunk.from,
                    to: chunk.to,
                });
                self.chunks.push(chunk);
                Placement::Appended(0)
            }
            Some(ref mut range) if chunk.from >= range.to => {
                range.to = chunk.to;
                self.chunks.push(chunk);
                Placement::Appended(self.chunks.len() - 1)
            }
            Some(ref mut range) if chunk.to <= range.from => {
                range.from = chunk.from;
                self.chunks.insert(0, chunk);
                Placement::Prepended
            }
            Some(range) => {
                warn!(
                    "Chunk [{}, {}] overlaps cached range [{}, {}], ignored",
                    chunk.from, chunk.to, range.from, range.to
                );
                Placement::Rejected
            }
        };
        debug!("Chunk placement {:?}, {} chunks cached", placement, self.chunks.len());
        placement
    }

    /// # Summary
    /// 写入一次边界切换封存的 Bar。
    ///
    /// # Logic
    /// 1. 活动块中已有同时间同市场的 Bar (先前由实时合并写入) 时，累加增量计数器并覆盖价格。
    /// 2. 否则追加为新条目。
    /// 3. 活动块达到 `chunk_size` 时封存。
    ///
    /// # Returns
    /// 本次封存的块 (若有)，供调用方持久化。
    pub fn push_bars(&mut self, bars: Vec<Bar>) -> Option<Chunk> {
        if bars.is_empty() {
            return None;
        }
        let chunk_size = self.chunk_size;
        let active = self.active_for(bars[0].time);
        for bar in bars {
            match find_live(&mut active.bars, &bar) {
                Some(cached) => cached.absorb(&bar, &bar.counters),
                None => active.bars.push(bar),
            }
        }
        if let Some(last) = active.bars.last() {
            active.to = last.time;
        }

        if active.bars.len() >= chunk_size {
            return self.seal();
        }
        None
    }

    /// 封存活动块
    pub fn seal(&mut self) -> Option<Chunk> {
        let chunk = self.active.take()?;
        self.seal_chunk(chunk)
    }

    /// # Summary
    /// 只封存早于实时 Bar 的部分。
    ///
    /// # Logic
    /// 时间不早于 `live` 的条目 (实时合并写入的 Bar) 留在新的活动块中，
    /// 后续的边界封存与实时合并仍能找到并累加它们。
    ///
    /// # Arguments
    /// * `live`: 实时 Renderer 当前 Bar 的时间。
    pub fn seal_before(&mut self, live: i64) -> Option<Chunk> {
        let active = self.active.take()?;
        let to = active.to;
        let (closed, open): (Vec<Bar>, Vec<Bar>) =
            active.bars.into_iter().partition(|b| b.time < live);
        if let Some(first) = open.first() {
            let from = first.time;
            self.active = Some(Chunk::new(from, to.max(from), open));
        }
        let last = closed.last().map(|b| b.time)?;
        self.seal_chunk(Chunk::new(active.from, last, closed))
    }

    fn seal_chunk(&mut self, chunk: Chunk) -> Option<Chunk> {
        if chunk.bars.is_empty() {
            return None;
        }
        match self.insert(chunk.clone()) {
            Placement::Rejected => None,
            _ => {
                info!(
                    "Sealed chunk [{}, {}] with {} bars",
                    chunk.from,
                    chunk.to,
                    chunk.bars.len()
                );
                Some(chunk)
            }
        }
    }

    /// # Summary
    /// 裁剪超出保留窗口的最旧块。
    ///
    /// # Returns
    /// 被丢弃块的起点，供调用方同步删除外部存储。
    pub fn trim(&mut self, keep: usize) -> Vec<i64> {
        if self.chunks.len() <= keep {
            return Vec::new();
        }
        let dropped: Vec<i64> = self
            .chunks
            .drain(..self.chunks.len() - keep)
            .map(|c| c.from)
            .collect();
        self.range = match (self.chunks.first(), self.chunks.last()) {
            (Some(first), Some(last)) => Some(CacheRange {
                from: first.from,
                to: last.to,
            }),
            _ => None,
        };
        info!("Trimmed {} chunks, {} retained", dropped.len(), self.chunks.len());
        dropped
    }

    /// 按时间顺序拼接全部缓存 Bar，用于重绘回放
    pub fn bars(&self) -> Vec<Bar> {
        self.chunks
            .iter()
            .chain(self.active.as_ref())
            .flat_map(|c| c.bars.iter().cloned())
            .collect()
    }

    /// # Summary
    /// 将实时 Renderer 的来源 Bar 合并进缓存。
    ///
    /// # Logic
    /// 1. Renderer 时间早于最后一根缓存 Bar 时不做任何事。
    /// 2. 同时间同市场的缓存 Bar 只累加自上次合并以来的增量，并以实时价格覆盖。
    /// 3. 其余非空来源追加为新条目。
    /// 4. 记录每个来源已写入的计数器，切换边界时只封存剩余增量。
    pub fn merge_live(&mut self, renderer: &mut Renderer) {
        let last_time = self.last_time();
        if last_time.is_some_and(|t| renderer.timestamp < t) {
            return;
        }

        let active = self.active_for(renderer.timestamp);
        let mut flushed = HashMap::new();
        for (key, bar) in &renderer.sources {
            if bar.empty {
                continue;
            }
            let delta = match renderer.flushed.get(key) {
                Some(done) => bar.counters.since(done),
                None => bar.counters,
            };
            match find_live(&mut active.bars, bar) {
                Some(cached) => cached.absorb(bar, &delta),
                None => {
                    let mut entry = bar.clone();
                    entry.counters = delta;
                    active.bars.push(entry);
                }
            }
            flushed.insert(key.clone(), bar.counters);
        }
        active.to = active.to.max(renderer.timestamp);
        renderer.flushed.extend(flushed);
    }

    fn last_time(&self) -> Option<i64> {
        self.active
            .as_ref()
            .and_then(|c| c.bars.last())
            .or_else(|| self.chunks.last().and_then(|c| c.bars.last()))
            .map(|b| b.time)
    }

    fn active_for(&mut self, time: i64) -> &mut Chunk {
        self.active
            .get_or_insert_with(|| Chunk::new(time, time, Vec::new()))
    }

    /// # Summary
    /// 将全部已封存块写入外部存储。
    pub async fn persist(&self, store: &dyn ChunkStore, pane: &str) -> Result<(), CacheError> {
        for chunk in &self.chunks {
            store.save_chunk(pane, chunk).await?;
        }
        debug!("Persisted {} chunks for pane {}", self.chunks.len(), pane);
        Ok(())
    }

    /// # Summary
    /// 从外部存储恢复面板的块。
    ///
    /// # Logic
    /// 按起点顺序逐个写入，遇到重叠的块立即返回 `CacheError::Overlap`。
    pub async fn restore(&mut self, store: &dyn ChunkStore, pane: &str) -> Result<usize, CacheError> {
        let chunks = store.load_chunks(pane).await?;
        let count = chunks.len();
        for chunk in chunks {
            let (from, to) = (chunk.from, chunk.to);
            if self.insert(chunk) == Placement::Rejected {
                return Err(CacheError::Overlap { from, to });
            }
        }
        info!("Restored {} chunks for pane {}", count, pane);
        Ok(count)
    }
}

/// 在活动块末尾查找同时间同市场的 Bar
fn find_live<'a>(bars: &'a mut [Bar], bar: &Bar) -> Option<&'a mut Bar> {
    bars.iter_mut()
        .rev()
        .take_while(|b| b.time == bar.time)
        .find(|b| b.exchange == bar.exchange && b.pair == bar.pair)
}
