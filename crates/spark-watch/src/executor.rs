//! # WatchExecutor：任务派发契约
//!
//! ## 契约声明
//! * 复用器本身不绑定任何异步运行时，“加载快照 → 打开流”序列通过本 trait 交给宿主执行器；
//! * 默认启用的 `runtime-tokio` 特性提供 [`TokioExecutor`]，关闭该特性后宿主需自行实现。
//!
//! ## 并发语义
//! * 提交的任务必须最终被轮询至完成或被丢弃；执行器不得在当前调用栈内同步运行任务，
//!   否则 `subscribe` 的返回会被快照加载阻塞。

use futures::future::BoxFuture;

/// 宿主执行器的最小派发接口。
///
/// # 契约说明（What）
/// - `spawn` 接收已装箱的 `'static` 任务，返回后任务即进入调度；
/// - 任务内部已经处理取消与错误，执行器无需关心返回值。
pub trait WatchExecutor: Send + Sync + 'static {
    /// 提交一个后台任务。
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

#[cfg(feature = "runtime-tokio")]
pub use self::tokio_impl::TokioExecutor;

#[cfg(feature = "runtime-tokio")]
mod tokio_impl {
    use futures::future::BoxFuture;
    use tokio::runtime::Handle;

    use super::WatchExecutor;

    /// 基于 Tokio 运行时句柄的执行器。
    ///
    /// # 教案式说明
    /// - **意图 (Why)**：捕获 [`Handle`] 而非依赖线程局部的“当前运行时”，使命名空间变化回调
    ///   即便在运行时之外的线程上触发也能派发重启任务；
    /// - **风险 (Trade-offs)**：运行时关闭后提交的任务会被 Tokio 静默丢弃，对应的 watch 不会启动。
    #[derive(Clone, Debug)]
    pub struct TokioExecutor {
        handle: Handle,
    }

    impl TokioExecutor {
        /// 捕获当前运行时句柄；必须在 Tokio 运行时上下文内调用。
        pub fn current() -> Self {
            Self {
                handle: Handle::current(),
            }
        }

        /// 使用显式句柄构造。
        pub fn from_handle(handle: Handle) -> Self {
            Self { handle }
        }
    }

    impl WatchExecutor for TokioExecutor {
        fn spawn(&self, task: BoxFuture<'static, ()>) {
            drop(self.handle.spawn(task));
        }
    }
}
