//! 指标绑定层与图表面板控制器。

pub mod indicator;
pub mod pane;

pub use indicator::{IndicatorManager, IndicatorStatus, ManagerError};
pub use pane::ChartPane;
