#![deny(unsafe_code)]

//! # spark-watch
//!
//! ## 定位与职责（Why）
//! - 把大量相互独立、可能重叠的“保持资源 X 的列表最新”请求，收敛为针对远端资源 watch 接口的最少实时流；
//! - 负责引用计数、层级取消，以及命名空间选择变化时的重订阅；区分“调用方主动取消”与“远端失败”，
//!   保证主动取消永远不会以用户可见错误出现。
//!
//! ## 架构嵌入（Where）
//! - `ref_count`、`cancellation` 是无 I/O 的簿记原语；
//! - `namespace` 与 `observer` 负责读取外部命名空间选择并判定变化是否重要；
//! - `coordinator` 编排上述组件，通过 `executor` 把“加载快照 → 打开流”交给宿主运行时；
//! - `resource` 描述与资源存储之间的边界，`error` 集中定义错误语义；
//! - `config` 与 `observability` 提供 TOML 配置与 `tracing` 安装入口。
//!
//! ## Feature 策略（Trade-offs）
//! - 默认启用 `runtime-tokio`，提供基于 Tokio 句柄的执行器；关闭后核心契约保持运行时中立。

/// 层级取消作用域。
pub mod cancellation;

/// TOML 配置解析。
pub mod config;

/// 订阅复用器本体。
///
/// - **意图说明 (Why)**：唯一持有共享计数与注册表的组件，对外只暴露 `subscribe` 与清理句柄；
/// - **契约定位 (What)**：默认作用域共享、显式作用域独占，失败按资源粒度隔离。
pub mod coordinator;

/// 错误类型与诊断信息集中声明处。
///
/// - **意图说明 (Why)**：统一描述取消、传输失败与不变量破坏；
/// - **风险提示 (Trade-offs)**：取消必须按类别识别并吞掉，避免误报为用户可见错误。
pub mod error;

/// 宿主执行器契约。
pub mod executor;

/// 命名空间选择快照、变化分类与进程内实现。
pub mod namespace;

/// `tracing` Subscriber 安装入口。
pub mod observability;

/// 命名空间变化观察者。
pub mod observer;

/// 共享 watch 的引用计数。
pub mod ref_count;

/// 可订阅资源契约。
pub mod resource;

pub use cancellation::{CancellationScope, Cancelled};
pub use config::{ConfigError, LoggingConfig, SelectionConfig, WatchConfig};
pub use coordinator::{
    FailureCallback, ResourceFailure, SubscribeOptions, Subscription, SubscriptionCoordinator,
    WatchStats,
};
pub use error::WatchError;
#[cfg(feature = "runtime-tokio")]
pub use executor::TokioExecutor;
pub use executor::WatchExecutor;
pub use namespace::{
    NamespaceScopeSnapshot, NamespaceSelection, NamespaceSelectionState, ScopeChange,
    SelectionListener, SelectionSubscription, classify_change,
};
pub use observer::ScopeChangeObserver;
pub use ref_count::RefCounter;
pub use resource::{ResourceId, StreamDisposer, SubscribableResource};

/// 重新导出 `async_trait`，实现 [`SubscribableResource`] 时无需额外声明依赖。
pub use async_trait::async_trait;
