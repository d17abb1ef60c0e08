use config::{Config, ConfigError, Environment, File};
use tickchart_core::config::ChartConfig;

/// # Summary
/// 加载面板配置。
///
/// # Logic
/// 1. 读取可选的 `config/default.toml`。
/// 2. 叠加命令行给出的配置文件 (若有)。
/// 3. 叠加 `TICKCHART_*` 环境变量，例如 `TICKCHART_MODE=tick`。
/// 4. 缺失的字段取 `ChartConfig::default()`。
pub fn load(path: Option<&str>) -> Result<ChartConfig, ConfigError> {
    let mut builder = Config::builder()
        .add_source(File::with_name("config/default").required(false));
    if let Some(path) = path {
        builder = builder.add_source(File::with_name(path));
    }
    builder
        .add_source(
            Environment::with_prefix("TICKCHART")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
