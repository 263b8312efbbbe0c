//! # 可订阅资源契约
//!
//! ## 定位（Why）
//! - 资源仓库（Pods、Services 等某一资源类型的存储）由宿主创建与持有，复用器只引用它们；
//! - 复用器需要的能力只有两项：加载某一时刻的快照、打开增量流，本模块以 trait 描述这一边界。
//!
//! ## 身份语义（What）
//! - 作为映射键的是对象身份而非结构：[`ResourceId`] 由 `Arc` 的指针地址构成，两个字段完全相同
//!   但分别创建的资源被视为不同资源。

use std::{fmt, string::String, sync::Arc};

use async_trait::async_trait;

use crate::{cancellation::CancellationScope, error::WatchError};

/// 一个资源类型的存储，可被 watch 订阅。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `load_snapshot`：以给定命名空间填充存储的当前内容；必须响应 `signal` 的取消，
///     被中断时返回 [`WatchError::Cancelled`]，远端失败返回 [`WatchError::Transport`]；
///   - `open_stream`：开始投递增量更新，返回的 [`StreamDisposer`] 被调用后停止投递；
///     实现可在 `signal` 上登记额外的清理，但不得阻塞；
///   - 两个方法都只在快照完成后按顺序调用，不会并发调用同一尝试的 `open_stream`。
/// - **前置条件**：实现必须是 `Send + Sync + 'static`，以便跨执行器任务共享。
#[async_trait]
pub trait SubscribableResource: Send + Sync + 'static {
    /// 资源的可读名称，用于日志与失败报告。
    fn name(&self) -> &str;

    /// 资源是否按命名空间划分。
    fn is_namespaced(&self) -> bool;

    /// 加载当前快照。
    async fn load_snapshot(
        &self,
        namespaces: &[String],
        signal: &CancellationScope,
    ) -> Result<(), WatchError>;

    /// 打开增量流。
    fn open_stream(&self, signal: &CancellationScope) -> StreamDisposer;
}

/// 以对象身份区分资源的键。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(usize);

impl ResourceId {
    /// 取资源 `Arc` 的地址作为身份。
    ///
    /// - **风险 (Trade-offs)**：地址只在资源存活期间唯一；协调器在注册表中持有 `Arc` 克隆，
    ///   保证共享 watch 存活期间地址不会被复用。
    pub fn of(resource: &Arc<dyn SubscribableResource>) -> Self {
        ResourceId(Arc::as_ptr(resource) as *const () as usize)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource#{:x}", self.0)
    }
}

/// 停止增量投递的句柄。
///
/// - **契约 (What)**：`dispose` 幂等；句柄被丢弃时同样会停止投递。
#[must_use = "dropping the disposer stops the stream immediately"]
pub struct StreamDisposer {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamDisposer {
    /// 以停止闭包构造。
    pub fn new<F>(dispose: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// 不持有任何资源的空句柄。
    pub fn noop() -> Self {
        Self { dispose: None }
    }

    /// 停止投递；重复调用无副作用。
    pub fn dispose(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }

    /// 是否尚未停止。
    pub fn is_active(&self) -> bool {
        self.dispose.is_some()
    }
}

impl Drop for StreamDisposer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for StreamDisposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDisposer")
            .field("active", &self.is_active())
            .finish()
    }
}
