use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tickchart_core::cache::error::CacheError;
use tickchart_core::chart::entity::{OptionMap, Renderer, SeriesPoint};
use tickchart_core::config::IndicatorConfig;
use tickchart_core::engine::error::ScriptError;
use tickchart_core::market::entity::Bar;
use tickchart_core::render::port::{RenderSurface, SeriesSink};
use tickchart_engine::compiler::references::owner_of;
use tickchart_engine::program::PlotSpec;
use tickchart_engine::{Adapter, Builtins, CompiledModel, compile, get_adapter, resolve_plot_options};
use tickchart_market::{Aggregator, frames, roll};
use tracing::{debug, error, info, warn};

/// # Summary
/// Manager 层的统一错误类型。
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
    #[error("Indicator not found: {0}")]
    NotFound(String),
    #[error("Indicator {indicator} references unknown indicator {reference}")]
    MissingDependency { indicator: String, reference: String },
    #[error("Circular indicator reference: {}", .0.join(" -> "))]
    CircularReference(Vec<String>),
    #[error("Failed to bind indicator {id}: {source}")]
    Bind { id: String, source: ScriptError },
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// 指标生命周期状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndicatorStatus {
    // 已跟踪但尚未编译
    Unbuilt,
    // 已编译，未绑定到 Renderer
    Built,
    // 已绑定，随 tick 执行
    Bound,
    // 编译、绑定或运行失败，只影响该指标
    Errored(String),
}

struct Adapters {
    output: Adapter,
    silent: Adapter,
}

struct Tracked {
    model: Option<Arc<CompiledModel>>,
    adapters: Option<Adapters>,
    status: IndicatorStatus,
}

/// 把编译产物的输出转发到渲染端
struct SurfaceSink<'a> {
    surface: &'a mut dyn RenderSurface,
    plots: &'a [PlotSpec],
}

impl SeriesSink for SurfaceSink<'_> {
    fn emit(&mut self, plot_index: usize, point: SeriesPoint) {
        if let Some(plot) = self.plots.get(plot_index) {
            self.surface.update(&plot.id, &point);
        }
    }
}

/// 历史回放时丢弃全部输出
struct NullSink;

impl SeriesSink for NullSink {
    fn emit(&mut self, _: usize, _: SeriesPoint) {}
}

/// # Summary
/// 指标绑定层，负责指标的编译、绑定、执行、重绘与移除。
///
/// # Invariants
/// - `order` 中被引用的指标总是排在引用者之前，tick 按此顺序执行。
/// - 每个指标在 Renderer 中的状态独立播种，从不与其他指标或面板共享。
/// - 任一指标出错只会让它自己进入 `Errored`，其余指标照常运行。
#[derive(Default)]
pub struct IndicatorManager {
    // 指标 id -> 定义 (脚本与选项)
    library: HashMap<String, IndicatorConfig>,
    tracked: HashMap<String, Tracked>,
    order: Vec<String>,
}

impl IndicatorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Summary
    /// 登记或更新指标定义。
    ///
    /// # Returns
    /// 脚本文本是否发生变化 (变化时调用方应执行 `rebuild`)。
    pub fn define(&mut self, config: IndicatorConfig) -> bool {
        let changed = self
            .library
            .get(&config.id)
            .is_none_or(|old| old.script != config.script);
        self.library.insert(config.id.clone(), config);
        changed
    }

    pub fn definition(&self, id: &str) -> Option<&IndicatorConfig> {
        self.library.get(id)
    }

    pub fn status(&self, id: &str) -> Option<&IndicatorStatus> {
        self.tracked.get(id).map(|t| &t.status)
    }

    pub fn model(&self, id: &str) -> Option<&Arc<CompiledModel>> {
        self.tracked.get(id).and_then(|t| t.model.as_ref())
    }

    /// 按执行顺序返回已跟踪的指标 id
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// # Summary
    /// 添加指标。
    ///
    /// # Logic
    /// 1. 已编译的指标直接返回。
    /// 2. 编译脚本，失败时标记错误状态；按指标库解析 `$id` 的所属指标。
    /// 3. 沿已跟踪指标检查新引用是否闭合成环，再递归添加全部被引用的指标。
    /// 4. 为每个绘图创建序列，重排执行顺序，若有 Renderer 则立即绑定。
    ///
    /// # Arguments
    /// * `id`: 指标 id，必须先通过 `define` 登记。
    /// * `renderer`: 当前面板的 Renderer，尚未收到成交时为 `None`。
    /// * `surface`: 渲染端。
    pub fn add(
        &mut self,
        id: &str,
        renderer: Option<&mut Renderer>,
        surface: &mut dyn RenderSurface,
    ) -> Result<(), ManagerError> {
        let mut visiting = Vec::new();
        self.add_inner(id, renderer, surface, &mut visiting)
    }

    fn add_inner(
        &mut self,
        id: &str,
        mut renderer: Option<&mut Renderer>,
        surface: &mut dyn RenderSurface,
        visiting: &mut Vec<String>,
    ) -> Result<(), ManagerError> {
        if self.tracked.get(id).is_some_and(|t| t.model.is_some()) {
            return Ok(());
        }
        if visiting.iter().any(|v| v == id) {
            let mut cycle = visiting.clone();
            cycle.push(id.to_string());
            error!("Circular reference detected: {}", cycle.join(" -> "));
            return Err(ManagerError::CircularReference(cycle));
        }
        let definition = self
            .library
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

        self.tracked.entry(id.to_string()).or_insert(Tracked {
            model: None,
            adapters: None,
            status: IndicatorStatus::Unbuilt,
        });

        let siblings = self.plot_ids_except(id);
        let model = match compile(&definition.script, id, &siblings) {
            Ok(mut model) => {
                model.references = self.resolve_references(&model.output.series);
                Arc::new(model)
            }
            Err(e) => {
                error!("Failed to compile indicator {}: {}", id, e);
                self.mark_errored(id, e.to_string());
                return Err(e.into());
            }
        };

        if let Some(cycle) = self.find_cycle(id, &model.references) {
            error!("Circular reference detected: {}", cycle.join(" -> "));
            self.mark_errored(id, format!("circular reference {}", cycle.join(" -> ")));
            return Err(ManagerError::CircularReference(cycle));
        }

        visiting.push(id.to_string());
        let resolved = self.add_references(id, &model, renderer.as_deref_mut(), surface, visiting);
        visiting.pop();
        if let Err(e) = resolved {
            self.mark_errored(id, e.to_string());
            return Err(e);
        }

        for plot in &model.plots {
            surface.create_series(
                &plot.id,
                plot.plot_type,
                &merged_options(plot, &definition.options),
            );
        }
        self.tracked.insert(
            id.to_string(),
            Tracked {
                model: Some(model),
                adapters: None,
                status: IndicatorStatus::Built,
            },
        );
        if !self.order.iter().any(|o| o == id) {
            self.order.push(id.to_string());
        }
        self.reorder();
        info!("Indicator {} added", id);

        if let Some(renderer) = renderer {
            self.bind(id, renderer, surface)?;
        }
        Ok(())
    }

    fn add_references(
        &mut self,
        id: &str,
        model: &CompiledModel,
        mut renderer: Option<&mut Renderer>,
        surface: &mut dyn RenderSurface,
        visiting: &mut Vec<String>,
    ) -> Result<(), ManagerError> {
        for reference in &model.references {
            if !self.library.contains_key(reference) {
                return Err(ManagerError::MissingDependency {
                    indicator: id.to_string(),
                    reference: reference.clone(),
                });
            }
            debug!("Indicator {} requires {}", id, reference);
            self.add_inner(reference, renderer.as_deref_mut(), surface, visiting)?;
        }
        Ok(())
    }

    /// # Summary
    /// 将指标绑定到 Renderer。
    ///
    /// # Logic
    /// 1. 已绑定或没有编译产物时不做任何事。
    /// 2. 应用解析后的绘图样式。
    /// 3. 构建 `output` 与 `silent_output` 两个执行入口，失败时立即解绑并返回错误。
    /// 4. 按编译布局播种全新的状态。
    pub fn bind(
        &mut self,
        id: &str,
        renderer: &mut Renderer,
        surface: &mut dyn RenderSurface,
    ) -> Result<(), ManagerError> {
        if renderer.indicators.contains_key(id) {
            return Ok(());
        }
        let Some(tracked) = self.tracked.get_mut(id) else {
            return Ok(());
        };
        let Some(model) = tracked.model.clone() else {
            return Ok(());
        };

        let empty = OptionMap::new();
        let options = self.library.get(id).map_or(&empty, |d| &d.options);
        for plot in &model.plots {
            surface.apply_options(&plot.id, &merged_options(plot, options));
        }

        let adapters = get_adapter(&model.output).and_then(|output| {
            Ok(Adapters {
                output,
                silent: get_adapter(&model.silent_output)?,
            })
        });
        match adapters {
            Ok(adapters) => {
                tracked.adapters = Some(adapters);
                tracked.status = IndicatorStatus::Bound;
                renderer.indicators.insert(id.to_string(), model.seed_state());
                info!("Indicator {} bound", id);
                Ok(())
            }
            Err(source) => {
                error!("Failed to bind indicator {}: {}", id, source);
                tracked.adapters = None;
                tracked.status = IndicatorStatus::Errored(source.to_string());
                unbind_state(renderer, &model, id);
                Err(ManagerError::Bind {
                    id: id.to_string(),
                    source,
                })
            }
        }
    }

    /// 绑定全部已编译的指标，返回各自的失败
    pub fn bind_all(
        &mut self,
        renderer: &mut Renderer,
        surface: &mut dyn RenderSurface,
    ) -> Vec<ManagerError> {
        let ids = self.order.clone();
        ids.iter()
            .filter_map(|id| self.bind(id, renderer, surface).err())
            .collect()
    }

    /// 解除绑定：移除状态与最近输出
    pub fn unbind(&mut self, id: &str, renderer: &mut Renderer) {
        if let Some(tracked) = self.tracked.get_mut(id) {
            if let Some(model) = &tracked.model {
                unbind_state(renderer, model, id);
            }
            tracked.adapters = None;
            if tracked.status == IndicatorStatus::Bound {
                tracked.status = IndicatorStatus::Built;
            }
            info!("Indicator {} unbound", id);
        }
    }

    /// # Summary
    /// 对当前 Renderer 执行全部已绑定的指标。
    ///
    /// # Logic
    /// 1. 按依赖顺序逐个执行，状态在执行期间从 Renderer 中取出。
    /// 2. 运行失败的指标不放回状态 (即解绑) 并标记错误。
    ///
    /// # Returns
    /// 本次失败的指标及其错误。
    pub fn tick(
        &mut self,
        renderer: &mut Renderer,
        surface: &mut dyn RenderSurface,
    ) -> Vec<(String, ScriptError)> {
        let empty = OptionMap::new();
        let mut failures = Vec::new();
        for id in &self.order {
            let Some(tracked) = self.tracked.get(id) else {
                continue;
            };
            let (Some(model), Some(adapters)) = (&tracked.model, &tracked.adapters) else {
                continue;
            };
            let Some(mut state) = renderer.indicators.remove(id) else {
                continue;
            };
            let options = self.library.get(id).map_or(&empty, |d| &d.options);
            let mut sink = SurfaceSink {
                surface: &mut *surface,
                plots: &model.plots,
            };
            match adapters
                .output
                .run(renderer, &mut state, options, &mut sink, Builtins::standard())
            {
                Ok(()) => {
                    renderer.indicators.insert(id.clone(), state);
                }
                Err(e) => failures.push((id.clone(), e)),
            }
        }

        for (id, e) in &failures {
            error!("Indicator {} failed: {}", id, e);
            self.unbind(id, renderer);
            self.mark_errored(id, e.to_string());
        }
        failures
    }

    /// # Summary
    /// 用缓存历史重绘指标。
    ///
    /// # Logic
    /// 1. 确保指标及其传递依赖均已绑定，并清空指标现有的序列数据。
    /// 2. 在临时 Renderer 上逐帧回放早于当前 Bar 的历史，使用静默入口执行依赖链。
    /// 3. 每帧结束后按输出过滤规则收集目标指标的点，最后每个绘图一次性 `set_data`。
    /// 4. 把回放得到的状态移植到实时 Renderer。
    ///
    /// # Arguments
    /// * `bars`: 缓存中的历史 Bar (按时间升序)。
    /// * `aggregator`: 用于把历史 Bar 装入 Renderer。
    pub fn redraw(
        &mut self,
        id: &str,
        bars: &[Bar],
        aggregator: &Aggregator,
        renderer: &mut Renderer,
        surface: &mut dyn RenderSurface,
    ) -> Result<(), ManagerError> {
        let chain = self.dependency_chain(id)?;
        for dep in &chain {
            self.bind(dep, renderer, surface)?;
        }

        let mut runners = Vec::with_capacity(chain.len());
        for dep in &chain {
            let tracked = self
                .tracked
                .get(dep)
                .ok_or_else(|| ManagerError::NotFound(dep.clone()))?;
            let (Some(model), Some(adapters)) = (&tracked.model, &tracked.adapters) else {
                return Err(ManagerError::NotFound(dep.clone()));
            };
            let options = self
                .library
                .get(dep)
                .map(|d| d.options.clone())
                .unwrap_or_default();
            runners.push((dep.clone(), model.clone(), adapters.silent.clone(), options));
        }
        let Some((_, target, _, _)) = runners.last() else {
            return Err(ManagerError::NotFound(id.to_string()));
        };
        let target = target.clone();

        for plot in &target.plots {
            surface.clear(&plot.id);
        }

        let history: Vec<Bar> = bars
            .iter()
            .filter(|b| b.time < renderer.timestamp)
            .cloned()
            .collect();
        let frames: Vec<&[Bar]> = frames(&history).collect();
        let start = frames.first().map_or(renderer.timestamp, |f| f[0].time);
        let mut scratch = Renderer::new(start, renderer.timezone_offset(), renderer.bar_duration);
        for (dep, model, _, _) in &runners {
            scratch.indicators.insert(dep.clone(), model.seed_state());
        }

        let mut points: Vec<Vec<SeriesPoint>> = vec![Vec::new(); target.plots.len()];
        for (i, frame) in frames.iter().enumerate() {
            aggregator.load_frame(&mut scratch, frame);
            for plot in &target.plots {
                scratch.series.remove(&plot.id);
            }
            for (dep, _, adapter, options) in &runners {
                let Some(mut state) = scratch.indicators.remove(dep) else {
                    continue;
                };
                if let Err(e) =
                    adapter.run(&mut scratch, &mut state, options, &mut NullSink, Builtins::standard())
                {
                    error!("Indicator {} failed during redraw: {}", dep, e);
                    self.unbind(dep, renderer);
                    self.mark_errored(dep, e.to_string());
                    return Err(e.into());
                }
                scratch.indicators.insert(dep.clone(), state);
            }
            for (index, plot) in target.plots.iter().enumerate() {
                if let Some(point) = scratch.series.get(&plot.id)
                    && plot.plot_type.accepts(point)
                {
                    points[index].push(point.clone());
                }
            }
            let next = frames.get(i + 1).map_or(renderer.timestamp, |f| f[0].time);
            roll(&mut scratch, next);
        }

        for (plot, data) in target.plots.iter().zip(points) {
            surface.set_data(&plot.id, data);
        }
        if let Some(state) = scratch.indicators.remove(id) {
            renderer.indicators.insert(id.to_string(), state);
        }
        info!("Indicator {} redrawn over {} bars", id, frames.len());
        Ok(())
    }

    /// # Summary
    /// 脚本变更后重建：移除、重新编译、重新绑定并重绘。
    pub fn rebuild(
        &mut self,
        id: &str,
        bars: &[Bar],
        aggregator: &Aggregator,
        mut renderer: Option<&mut Renderer>,
        surface: &mut dyn RenderSurface,
    ) -> Result<(), ManagerError> {
        info!("Rebuilding indicator {}", id);
        if self.tracked.contains_key(id) {
            self.remove(id, renderer.as_deref_mut(), surface)?;
        }
        self.add(id, renderer.as_deref_mut(), surface)?;
        if let Some(renderer) = renderer {
            self.redraw(id, bars, aggregator, renderer, surface)?;
        }
        Ok(())
    }

    /// # Summary
    /// 移除指标：销毁序列、解绑并停止跟踪。
    pub fn remove(
        &mut self,
        id: &str,
        renderer: Option<&mut Renderer>,
        surface: &mut dyn RenderSurface,
    ) -> Result<(), ManagerError> {
        if let Some(renderer) = renderer {
            self.unbind(id, renderer);
        }
        let tracked = self
            .tracked
            .remove(id)
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        if let Some(model) = &tracked.model {
            for plot in &model.plots {
                surface.remove_series(&plot.id);
            }
        }
        self.order.retain(|o| o != id);
        if self.order.iter().any(|o| {
            self.model(o)
                .is_some_and(|m| m.references.iter().any(|r| r == id))
        }) {
            warn!("Indicator {} removed while still referenced", id);
        }
        info!("Indicator {} removed", id);
        Ok(())
    }

    /// 全部已编译指标读取的复合 Bar 字段
    pub fn required_props(&self) -> HashSet<String> {
        self.tracked
            .values()
            .filter_map(|t| t.model.as_ref())
            .flat_map(|m| m.props.iter().cloned())
            .collect()
    }

    /// 全部已编译指标引用的外部市场
    pub fn required_markets(&self) -> HashSet<String> {
        self.tracked
            .values()
            .filter_map(|t| t.model.as_ref())
            .flat_map(|m| m.markets.keys().cloned())
            .collect()
    }

    /// 目标指标的传递依赖，被引用者在前，目标在最后
    fn dependency_chain(&self, id: &str) -> Result<Vec<String>, ManagerError> {
        fn visit(
            manager: &IndicatorManager,
            id: &str,
            seen: &mut HashSet<String>,
            out: &mut Vec<String>,
        ) -> Result<(), ManagerError> {
            if !seen.insert(id.to_string()) {
                return Ok(());
            }
            let model = manager
                .model(id)
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            for reference in &model.references {
                visit(manager, reference, seen, out)?;
            }
            out.push(id.to_string());
            Ok(())
        }

        let mut out = Vec::new();
        visit(self, id, &mut HashSet::new(), &mut out)?;
        Ok(out)
    }

    /// # Summary
    /// 把读取的绘图 id 解析为所属指标 id。
    ///
    /// # Logic
    /// 指标库中存在同名指标时按原样引用 (例如 `ma-200`)，否则去掉 `-N` 后缀。
    fn resolve_references(&self, series: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for plot_id in series {
            let owner = if self.library.contains_key(plot_id) {
                plot_id.as_str()
            } else {
                owner_of(plot_id)
            };
            if !out.iter().any(|o| o == owner) {
                out.push(owner.to_string());
            }
        }
        out
    }

    /// 沿已编译指标的引用查找回到 `id` 的路径，找到时返回完整环
    fn find_cycle(&self, id: &str, references: &[String]) -> Option<Vec<String>> {
        fn walk(
            manager: &IndicatorManager,
            target: &str,
            current: &str,
            path: &mut Vec<String>,
            seen: &mut HashSet<String>,
        ) -> bool {
            path.push(current.to_string());
            if current == target {
                return true;
            }
            if seen.insert(current.to_string())
                && let Some(model) = manager.model(current)
            {
                for next in &model.references {
                    if walk(manager, target, next, path, seen) {
                        return true;
                    }
                }
            }
            path.pop();
            false
        }

        let mut seen = HashSet::new();
        for reference in references {
            let mut path = vec![id.to_string()];
            if walk(self, id, reference, &mut path, &mut seen) {
                return Some(path);
            }
        }
        None
    }

    /// 按引用关系重排执行顺序，被引用者在前，其余保持原有先后
    fn reorder(&mut self) {
        fn visit(
            manager: &IndicatorManager,
            id: &str,
            seen: &mut HashSet<String>,
            out: &mut Vec<String>,
        ) {
            if !manager.tracked.contains_key(id) || !seen.insert(id.to_string()) {
                return;
            }
            if let Some(model) = manager.model(id) {
                for reference in &model.references {
                    visit(manager, reference, seen, out);
                }
            }
            out.push(id.to_string());
        }

        let mut seen = HashSet::new();
        let mut sorted = Vec::with_capacity(self.order.len());
        for id in &self.order {
            visit(self, id, &mut seen, &mut sorted);
        }
        self.order = sorted;
    }

    fn plot_ids_except(&self, id: &str) -> Vec<String> {
        self.tracked
            .iter()
            .filter(|(other, _)| other.as_str() != id)
            .filter_map(|(_, t)| t.model.as_ref())
            .flat_map(|m| m.plot_ids())
            .collect()
    }

    fn mark_errored(&mut self, id: &str, message: String) {
        if let Some(tracked) = self.tracked.get_mut(id) {
            tracked.adapters = None;
            tracked.status = IndicatorStatus::Errored(message);
        }
    }
}

fn unbind_state(renderer: &mut Renderer, model: &CompiledModel, id: &str) {
    renderer.indicators.remove(id);
    for plot in &model.plots {
        renderer.series.remove(&plot.id);
    }
}

/// 通用默认样式
fn builtin_defaults() -> OptionMap {
    let mut options = OptionMap::new();
    options.insert("visible".to_string(), serde_json::Value::Bool(true));
    options.insert("priceLineVisible".to_string(), serde_json::Value::Bool(false));
    options.insert("lastValueVisible".to_string(), serde_json::Value::Bool(true));
    options
}

/// # Summary
/// 合并绘图样式。
///
/// # Logic
/// 优先级从低到高：通用默认 < 绘图类型默认 < 指标选项 < 脚本中的绘图选项。
pub fn merged_options(plot: &PlotSpec, options: &OptionMap) -> OptionMap {
    let mut merged = builtin_defaults();
    merged.extend(plot.plot_type.default_options());
    merged.extend(options.clone());
    merged.extend(resolve_plot_options(plot, options));
    merged
}
