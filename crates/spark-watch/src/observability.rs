//! # 日志安装与字段约定
//!
//! ## 意图（Why）
//! - 复用器的生命周期事件（启动、加入、重启、拆除）以 `debug` 记录，传输失败以 `warn` 记录，
//!   自身触发的取消永远不会以告警级别出现；
//! - 宿主若没有自己的 Subscriber，可调用 [`init_tracing`] 获得 `fmt + EnvFilter` 的最小组合。

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// 安装全局 `tracing` Subscriber。
///
/// # 教案式说明
/// - **逻辑 (How)**：`RUST_LOG` 存在时优先生效，否则使用 `config.filter`，两者都不可解析时回落到 `info`；
/// - **契约 (What)**：已存在全局 Subscriber 时返回错误而非覆盖。
pub fn init_tracing(config: &LoggingConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(build_env_filter(config))
        .with(fmt::layer().with_ansi(config.ansi))
        .try_init()
}

fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
