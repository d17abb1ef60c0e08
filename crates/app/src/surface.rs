use tickchart_core::chart::entity::{OptionMap, PlotType, SeriesPoint};
use tickchart_core::render::port::RenderSurface;
use tracing::{debug, info};

/// # Summary
/// 把渲染调用写入日志的渲染端，用于无界面的回放。
#[derive(Default)]
pub struct LogSurface;

impl RenderSurface for LogSurface {
    fn create_series(&mut self, plot_id: &str, plot_type: PlotType, options: &OptionMap) {
        info!(
            "Series {} created as {} ({} options)",
            plot_id,
            plot_type.name(),
            options.len()
        );
    }

    fn apply_options(&mut self, plot_id: &str, options: &OptionMap) {
        debug!("Series {} options {}", plot_id, serde_json::Value::Object(options.clone()));
    }

    fn update(&mut self, plot_id: &str, point: &SeriesPoint) {
        match serde_json::to_string(point) {
            Ok(json) => info!("{} {}", plot_id, json),
            Err(e) => debug!("Unprintable point for {}: {}", plot_id, e),
        }
    }

    fn set_data(&mut self, plot_id: &str, points: Vec<SeriesPoint>) {
        info!("Series {} redrawn with {} points", plot_id, points.len());
    }

    fn clear(&mut self, plot_id: &str) {
        debug!("Series {} cleared", plot_id);
    }

    fn remove_series(&mut self, plot_id: &str) {
        info!("Series {} removed", plot_id);
    }
}
