use crate::chart::entity::{OptionMap, PlotType, SeriesPoint};

/// # Summary
/// 外部像素渲染端接口 (Port)，每个绘图 id 对应一条序列。
///
/// # Invariants
/// - 由单个面板在同一线程内顺序调用，无需内部加锁。
/// - 对未知绘图 id 的调用应被静默忽略。
pub trait RenderSurface: Send {
    /// # Summary
    /// 为绘图创建一条序列。
    ///
    /// # Arguments
    /// * `plot_id`: 绘图唯一标识。
    /// * `plot_type`: 绘图类型。
    /// * `options`: 合并后的样式选项。
    fn create_series(&mut self, plot_id: &str, plot_type: PlotType, options: &OptionMap);

    /// 更新序列的样式选项
    fn apply_options(&mut self, plot_id: &str, options: &OptionMap);

    /// 追加或替换最后一个点
    fn update(&mut self, plot_id: &str, point: &SeriesPoint);

    /// 整体替换序列数据
    fn set_data(&mut self, plot_id: &str, points: Vec<SeriesPoint>);

    /// 清空序列数据但保留序列
    fn clear(&mut self, plot_id: &str);

    /// 销毁序列
    fn remove_series(&mut self, plot_id: &str);
}

/// # Summary
/// 编译产物的输出通道，接收按绘图下标发出的点。
///
/// # Invariants
/// - `plot_index` 为编译模型中 `plots` 的下标。
pub trait SeriesSink {
    /// # Summary
    /// 发出一个点。
    ///
    /// # Arguments
    /// * `plot_index`: 绘图下标。
    /// * `point`: 已通过输出过滤规则的点。
    fn emit(&mut self, plot_index: usize, point: SeriesPoint);
}
