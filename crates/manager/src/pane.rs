use crate::indicator::{IndicatorManager, ManagerError};
use std::sync::Arc;
use tickchart_cache::ChartCache;
use tickchart_core::cache::port::{ChunkStore, ChunkStoreExt};
use tickchart_core::chart::entity::{Chunk, Renderer};
use tickchart_core::common::time::Clock;
use tickchart_core::config::{ChartConfig, IndicatorConfig};
use tickchart_core::engine::error::ScriptError;
use tickchart_core::market::entity::Trade;
use tickchart_core::render::port::RenderSurface;
use tickchart_market::{Aggregator, roll};
use tracing::{debug, info, trace, warn};

/// # Summary
/// 单个图表面板的控制器，串联聚合器、指标绑定层、缓存与渲染端。
///
/// # Invariants
/// - 独占自己的 Renderer，所有修改在同一调用链内顺序发生。
/// - 首笔成交到达前没有 Renderer，指标只编译不绑定。
/// - 每次边界切换前先对即将封存的 Bar 执行一次指标。
pub struct ChartPane {
    config: ChartConfig,
    aggregator: Aggregator,
    manager: IndicatorManager,
    cache: ChartCache,
    renderer: Option<Renderer>,
    surface: Box<dyn RenderSurface>,
    clock: Arc<dyn Clock>,
    // 待写入外部存储的块
    pending: Vec<Chunk>,
    // 待从外部存储删除的块起点
    dropped: Vec<i64>,
}

impl ChartPane {
    pub fn new(config: ChartConfig, surface: Box<dyn RenderSurface>, clock: Arc<dyn Clock>) -> Self {
        Self {
            aggregator: Aggregator::new(&config),
            cache: ChartCache::new(config.chunk_size),
            manager: IndicatorManager::new(),
            renderer: None,
            surface,
            clock,
            pending: Vec::new(),
            dropped: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &ChartConfig {
        &self.config
    }

    pub fn renderer(&self) -> Option<&Renderer> {
        self.renderer.as_ref()
    }

    pub fn manager(&self) -> &IndicatorManager {
        &self.manager
    }

    pub fn cache(&self) -> &ChartCache {
        &self.cache
    }

    pub fn aggregator_mut(&mut self) -> &mut Aggregator {
        &mut self.aggregator
    }

    /// # Summary
    /// 登记并添加配置中的全部指标。
    ///
    /// # Returns
    /// 各指标的失败；失败的指标进入错误状态，其余照常运行。
    pub fn load_indicators(&mut self) -> Vec<ManagerError> {
        let indicators = self.config.indicators.clone();
        for indicator in &indicators {
            self.manager.define(indicator.clone());
        }
        let mut errors = Vec::new();
        for indicator in &indicators {
            if let Err(e) = self.add_tracked(&indicator.id) {
                warn!("Indicator {} not loaded: {}", indicator.id, e);
                errors.push(e);
            }
        }
        errors
    }

    /// 登记并添加一个新指标，已有历史时立即重绘
    pub fn add_indicator(&mut self, indicator: IndicatorConfig) -> Result<(), ManagerError> {
        let id = indicator.id.clone();
        self.manager.define(indicator);
        self.add_tracked(&id)
    }

    fn add_tracked(&mut self, id: &str) -> Result<(), ManagerError> {
        self.manager
            .add(id, self.renderer.as_mut(), self.surface.as_mut())?;
        if self.renderer.is_some() {
            self.redraw(id)?;
        }
        Ok(())
    }

    /// # Summary
    /// 修改指标脚本，文本变化时重建。
    pub fn edit_script(&mut self, id: &str, script: &str) -> Result<(), ManagerError> {
        let mut definition = self
            .manager
            .definition(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        definition.script = script.to_string();
        if !self.manager.define(definition) {
            return Ok(());
        }
        if let Some(renderer) = self.renderer.as_mut() {
            self.cache.merge_live(renderer);
        }
        let bars = self.cache.bars();
        self.manager.rebuild(
            id,
            &bars,
            &self.aggregator,
            self.renderer.as_mut(),
            self.surface.as_mut(),
        )
    }

    pub fn remove_indicator(&mut self, id: &str) -> Result<(), ManagerError> {
        self.manager
            .remove(id, self.renderer.as_mut(), self.surface.as_mut())
    }

    /// # Summary
    /// 用缓存历史重绘指标。
    ///
    /// # Logic
    /// 1. 先把实时 Bar 合并进缓存，保证缓存与 Renderer 一致。
    /// 2. 交由绑定层回放。
    pub fn redraw(&mut self, id: &str) -> Result<(), ManagerError> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };
        self.cache.merge_live(renderer);
        let bars = self.cache.bars();
        self.manager.redraw(
            id,
            &bars,
            &self.aggregator,
            renderer,
            self.surface.as_mut(),
        )
    }

    /// # Summary
    /// 处理一批已解码的成交。
    ///
    /// # Logic
    /// 1. 首笔成交时创建 Renderer，绑定并重绘全部指标。
    /// 2. 逐笔决策边界，跨越边界时先执行指标再切换 Bar。
    /// 3. 累加成交；被拒绝的成交只记录日志。
    ///
    /// # Returns
    /// 实际被累加的成交数。
    pub fn on_trades(&mut self, trades: &[Trade]) -> usize {
        let mut accepted = 0;
        for trade in trades {
            if self.renderer.is_none() {
                self.start(trade.timestamp);
            }
            let Some(renderer) = self.renderer.as_mut() else {
                continue;
            };
            match self.aggregator.decide(renderer, trade) {
                Ok(Some(next)) => self.roll_to(next),
                Ok(None) => {}
                Err(e) => {
                    trace!("Trade rejected: {}", e);
                    continue;
                }
            }
            if let Some(renderer) = self.renderer.as_mut() {
                self.aggregator.accumulate(renderer, trade);
                accepted += 1;
            }
        }
        accepted
    }

    /// # Summary
    /// 周期性刷新：时间模式下按时钟推进空 Bar，然后执行全部指标。
    ///
    /// # Returns
    /// 本次运行失败的指标。
    pub fn on_tick(&mut self) -> Vec<(String, ScriptError)> {
        let now = self.clock.now_ms();
        let next = self
            .renderer
            .as_ref()
            .and_then(|r| self.aggregator.on_clock(r, now));
        if let Some(next) = next {
            self.roll_to(next);
        }
        match self.renderer.as_mut() {
            Some(renderer) => self.manager.tick(renderer, self.surface.as_mut()),
            None => Vec::new(),
        }
    }

    fn start(&mut self, timestamp: i64) {
        let start = self.aggregator.start_timestamp(timestamp);
        let mut renderer = Renderer::new(
            start,
            self.config.timezone_offset_ms,
            self.aggregator.bar_duration(),
        );
        for e in self.manager.bind_all(&mut renderer, self.surface.as_mut()) {
            warn!("{}", e);
        }
        self.renderer = Some(renderer);
        info!("Pane {} started at {}", self.config.pane, start);

        for id in self.manager.ids().to_vec() {
            if let Err(e) = self.redraw(&id) {
                warn!("Redraw of {} failed: {}", id, e);
            }
        }
    }

    fn roll_to(&mut self, next: i64) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        for (id, e) in self.manager.tick(renderer, self.surface.as_mut()) {
            warn!("Indicator {} stopped: {}", id, e);
        }
        let previous = renderer.timestamp;
        let sealed = roll(renderer, next);
        debug!("Bar {} -> {}, {} bars sealed", previous, next, sealed.len());

        if let Some(chunk) = self.cache.push_bars(sealed) {
            self.pending.push(chunk);
            self.dropped.extend(self.cache.trim(self.config.retain_chunks));
        }
    }

    /// # Summary
    /// 与外部存储同步：写入新封存的块，删除被裁剪的块。
    ///
    /// # Logic
    /// 每个条目在存储操作成功后才出队；失败时剩余条目保留到下次同步。
    pub async fn sync(&mut self, store: &dyn ChunkStore) -> Result<(), ManagerError> {
        let (mut saved, mut deleted) = (0, 0);
        while let Some(chunk) = self.pending.first() {
            store.save_chunk(&self.config.pane, chunk).await?;
            self.pending.remove(0);
            saved += 1;
        }
        while let Some(from) = self.dropped.first() {
            store.delete_chunk(&self.config.pane, *from).await?;
            self.dropped.remove(0);
            deleted += 1;
        }
        debug!(
            "Pane {} synced: {} saved, {} deleted",
            self.config.pane, saved, deleted
        );
        Ok(())
    }

    /// 等待写入外部存储的块数
    pub fn pending_chunks(&self) -> usize {
        self.pending.len()
    }

    /// 从外部存储恢复历史块
    pub async fn restore(&mut self, store: &dyn ChunkStore) -> Result<usize, ManagerError> {
        Ok(self.cache.restore(store, &self.config.pane).await?)
    }

    /// # Summary
    /// 封存活动块中已收盘的部分并等待下次同步。
    ///
    /// # Logic
    /// 实时 Bar 仍留在活动块中，边界切换时与剩余增量合并后再封存。
    pub fn flush(&mut self) {
        let sealed = match self.renderer.as_ref() {
            Some(renderer) => self.cache.seal_before(renderer.timestamp),
            None => self.cache.seal(),
        };
        if let Some(chunk) = sealed {
            self.pending.push(chunk);
        }
    }

    /// # Summary
    /// 停止面板：最后执行一次指标，把实时 Bar 合并进缓存并封存全部活动块。
    ///
    /// # Logic
    /// 关闭后 Renderer 被释放，下一笔成交会重新开始一根 Bar。
    pub fn close(&mut self) {
        for (id, e) in self.on_tick() {
            warn!("Indicator {} stopped: {}", id, e);
        }
        if let Some(mut renderer) = self.renderer.take() {
            self.cache.merge_live(&mut renderer);
        }
        if let Some(chunk) = self.cache.seal() {
            self.pending.push(chunk);
        }
        info!("Pane {} closed, {} chunks pending", self.config.pane, self.pending.len());
    }
}
