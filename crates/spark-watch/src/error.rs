//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 复用器需要在错误处理层区分三类语义截然不同的失败：自身发起的取消、远端接口失败、
//!   调用方生命周期管理错误；
//! - 集中定义这些类别，保证“取消永远不会被当作故障上报”这一约束只在一处实现。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，并保持 `Clone`，以便同一失败可以扇出到回调与通道；
//! - 取消必须能够按类别识别（[`WatchError::is_cancellation`]），而非依赖错误文本匹配。

use std::{string::String, sync::Arc};

use thiserror::Error;

/// 订阅复用器的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“取消”“传输失败”“不变量破坏”三类失败收敛到同一枚举，
///   使协调器在一个 `match` 中即可决定吞掉、转发还是大声失败；
/// - **契约 (What)**：
///   - `Cancelled` 只由本子系统触发（清理或命名空间变化引起的重启），永远不会转发给 `on_load_failure`；
///   - `Transport` 表示资源接口本身失败，按资源粒度上报，不影响同批次的其他资源；
///   - `InvariantViolation` 属于编程错误，调用方不应尝试恢复；
/// - **设计权衡 (Trade-offs)**：`Transport` 只保留可读描述而不保存底层错误对象，
///   换取 `Clone + Eq`，便于测试与多路投递。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum WatchError {
    /// 进行中的快照加载或流打开被所属取消作用域中断。
    #[error("watch attempt was cancelled")]
    Cancelled,

    /// 资源 list/watch 接口返回的远端或传输层失败。
    ///
    /// - **契约 (What)**：`resource` 为资源的可读名称，`detail` 为底层失败描述。
    #[error("transport failure while watching `{resource}`: {detail}")]
    Transport { resource: Arc<str>, detail: String },

    /// 引用计数或作用域生命周期的不变量被破坏。
    ///
    /// - **意图 (Why)**：这类错误意味着调用方的生命周期管理存在缺陷，静默钳制只会掩盖问题；
    /// - **风险 (Trade-offs)**：出现时应结合调用栈排查重复释放或缺失订阅的路径。
    #[error("watch invariant violated: {detail}")]
    InvariantViolation { detail: String },
}

impl WatchError {
    /// 构造传输失败，资源名称按 `Arc<str>` 共享。
    pub fn transport(resource: impl Into<Arc<str>>, detail: impl Into<String>) -> Self {
        WatchError::Transport {
            resource: resource.into(),
            detail: detail.into(),
        }
    }

    /// 构造不变量破坏错误。
    pub fn invariant(detail: impl Into<String>) -> Self {
        WatchError::InvariantViolation {
            detail: detail.into(),
        }
    }

    /// 是否为本子系统自身触发的取消。
    pub fn is_cancellation(&self) -> bool {
        matches!(self, WatchError::Cancelled)
    }

    /// 是否为编程错误类失败。
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, WatchError::InvariantViolation { .. })
    }
}
