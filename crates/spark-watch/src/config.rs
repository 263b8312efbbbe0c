//! # 配置
//!
//! ## 角色定位（Why）
//! - 宿主通常以 TOML 描述初始命名空间选择与日志过滤器；本模块负责解析并为每个字段提供默认值，
//!   使空文件也能得到可用配置。
//!
//! ## 示例
//! ```toml
//! [selection]
//! namespaces = ["default", "kube-system"]
//! all_selected = false
//!
//! [logging]
//! filter = "spark_watch=debug"
//! ansi = false
//! ```

use std::{string::String, vec::Vec};

use serde::Deserialize;
use thiserror::Error;

/// 复用器的顶层配置。
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// 初始命名空间选择。
    pub selection: SelectionConfig,
    /// 日志输出。
    pub logging: LoggingConfig,
}

/// 进程内命名空间选择的初始值。
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SelectionConfig {
    pub namespaces: Vec<String>,
    pub all_selected: bool,
}

/// `tracing-subscriber` 安装参数。
///
/// - `filter`：`EnvFilter` 指令，`RUST_LOG` 存在时以环境变量为准；
/// - `ansi`：是否输出终端颜色。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub filter: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: String::from("info"),
            ansi: true,
        }
    }
}

/// 配置解析失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 语法或字段类型错误。
    #[error("invalid watch configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

impl WatchConfig {
    /// 从 TOML 文本解析配置。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }
}
