//! # CancellationScope：层级取消作用域
//!
//! ## 核心意图（Why）
//! - 每一次 watch 尝试都绑定在一个作用域上；清理或命名空间变化需要一次调用即可中断
//!   该尝试及其派生出的全部子操作；
//! - 与工作区早期的 `Cancellation`（共享同一原子位）不同，这里的子作用域拥有独立标记：
//!   取消子作用域不会影响父作用域，而取消父作用域会级联到所有存活的子作用域。
//!
//! ## 行为契约（What）
//! - 取消标记单调（`false → true`），已取消的作用域不可恢复；
//! - `cancel` 在返回前同步完成：标记自身与全部后代、执行 `on_cancel` 回调、唤醒等待者；
//! - 从已取消的作用域派生的子作用域在创建时即处于取消状态；
//! - 等待取消的 Future 在下一个挂起点观察到取消，而不是依赖轮询。
//!
//! ## 风险提示（Trade-offs）
//! - 父作用域仅以 `Weak` 引用持有子作用域，已被丢弃的子作用域在下一次派生时顺带清理；
//! - `on_cancel` 回调在取消调用者的线程上执行，回调内禁止阻塞。

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, Waker},
    vec::Vec,
};

use futures::future::{Either, select};
use parking_lot::Mutex;

use crate::error::WatchError;

type CancelCallback = Box<dyn FnOnce() + Send>;

/// 层级取消作用域。
///
/// # 教案式说明
/// - **意图 (Why)**：为“加载快照 → 打开流”序列提供统一的中断信号，并允许协调器在
///   命名空间变化时只重建某一个尝试，而不影响同一父作用域下的其他工作；
/// - **逻辑 (How)**：
///   - 取消标记使用 [`AtomicBool`]，`cancel` 通过 `compare_exchange` 保证只有一次调用真正生效；
///   - 子作用域、回调与等待者登记在同一把锁保护的状态中，派生与取消互斥，
///     因而不会出现“父作用域已取消但新子作用域漏网”的竞态；
/// - **契约 (What)**：`Clone` 得到的是同一作用域的另一句柄，而非子作用域；需要派生时调用
///   [`CancellationScope::child`]。
#[derive(Clone)]
pub struct CancellationScope {
    node: Arc<ScopeNode>,
}

struct ScopeNode {
    cancelled: AtomicBool,
    state: Mutex<ScopeState>,
}

#[derive(Default)]
struct ScopeState {
    children: Vec<Weak<ScopeNode>>,
    callbacks: Vec<CancelCallback>,
    wakers: Vec<Waker>,
}

impl CancellationScope {
    /// 创建处于“未取消”状态的根作用域。
    pub fn new() -> Self {
        Self {
            node: Arc::new(ScopeNode {
                cancelled: AtomicBool::new(false),
                state: Mutex::new(ScopeState::default()),
            }),
        }
    }

    /// 派生子作用域：父作用域的取消蕴含子作用域的取消。
    ///
    /// - **契约 (What)**：若父作用域已取消，返回的子作用域同样已取消。
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut state = self.node.state.lock();
        if self.is_cancelled() {
            drop(state);
            child.node.cancelled.store(true, Ordering::Release);
            return child;
        }
        state.children.retain(|weak| weak.strong_count() > 0);
        state.children.push(Arc::downgrade(&child.node));
        child
    }

    /// 查询当前是否已被取消。
    pub fn is_cancelled(&self) -> bool {
        self.node.cancelled.load(Ordering::Acquire)
    }

    /// 取消当前作用域及全部存活的后代。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - 返回 `true` 表示本次调用首次触发取消；重复调用返回 `false` 且不产生副作用；
    ///   - **后置条件**：返回时所有后代均已标记取消，其回调已执行、等待者已被唤醒。
    /// - **执行 (How)**：先翻转标记，再在锁内取走子作用域、回调与等待者，释放锁后逐一处理，
    ///   避免回调中再次派生或取消时发生重入死锁。
    pub fn cancel(&self) -> bool {
        ScopeNode::cancel(&self.node)
    }

    /// 登记取消回调；若作用域已取消则立即在当前线程执行。
    ///
    /// 回调最多执行一次。
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.node.state.lock();
        if self.is_cancelled() {
            drop(state);
            callback();
            return;
        }
        state.callbacks.push(Box::new(callback));
    }

    /// 返回在作用域被取消时完成的 Future。
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            scope: self.clone(),
        }
    }

    /// 让 `fut` 与取消信号竞争。
    ///
    /// - **契约 (What)**：作用域先于 `fut` 完成时返回 [`WatchError::Cancelled`]，`fut` 随之被丢弃；
    ///   两者同时就绪时取消优先。
    pub async fn run_until_cancelled<F>(&self, fut: F) -> Result<F::Output, WatchError>
    where
        F: Future,
    {
        let fut = std::pin::pin!(fut);
        match select(self.cancelled(), fut).await {
            Either::Left(((), _)) => Err(WatchError::Cancelled),
            Either::Right((output, _)) => Ok(output),
        }
    }

    /// 存活的直接子作用域数量，主要用于诊断与测试。
    pub fn live_children(&self) -> usize {
        self.node
            .state
            .lock()
            .children
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl ScopeNode {
    fn cancel(node: &Arc<ScopeNode>) -> bool {
        if node
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let ScopeState {
            children,
            callbacks,
            wakers,
        } = std::mem::take(&mut *node.state.lock());

        for child in children.iter().filter_map(Weak::upgrade) {
            ScopeNode::cancel(&child);
        }
        for callback in callbacks {
            callback();
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl Default for CancellationScope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationScope")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// [`CancellationScope::cancelled`] 返回的 Future。
#[must_use = "futures do nothing unless polled"]
pub struct Cancelled {
    scope: CancellationScope,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.scope.is_cancelled() {
            return Poll::Ready(());
        }
        let mut state = self.scope.node.state.lock();
        // 持锁复查：`cancel` 在锁内取走等待者，漏检会导致永久挂起。
        if self.scope.is_cancelled() {
            return Poll::Ready(());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use futures::executor::block_on;

    use super::CancellationScope;

    #[test]
    fn cancel_is_idempotent() {
        let scope = CancellationScope::new();
        assert!(scope.cancel(), "首次取消应返回 true");
        assert!(!scope.cancel(), "重复取消应返回 false");
        assert!(scope.is_cancelled());
    }

    #[test]
    fn parent_cancel_reaches_every_descendant_before_returning() {
        let root = CancellationScope::new();
        let child = root.child();
        let grandchild = child.child();
        let sibling = root.child();

        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn child_cancel_does_not_touch_parent() {
        let root = CancellationScope::new();
        let first = root.child();
        let second = root.child();

        first.cancel();
        assert!(!root.is_cancelled());
        assert!(!second.is_cancelled(), "兄弟作用域互不影响");
    }

    #[test]
    fn child_of_cancelled_scope_is_born_cancelled() {
        let root = CancellationScope::new();
        root.cancel();
        let child = root.child();
        assert!(child.is_cancelled());
        assert!(!child.cancel(), "出生即取消的子作用域不应再次触发");
    }

    #[test]
    fn callbacks_run_once_including_late_registration() {
        let root = CancellationScope::new();
        let child = root.child();
        let hits = Arc::new(AtomicUsize::new(0));

        let early = Arc::clone(&hits);
        child.on_cancel(move || {
            early.fetch_add(1, Ordering::SeqCst);
        });
        root.cancel();
        child.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let late = Arc::clone(&hits);
        child.on_cancel(move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2, "已取消作用域上登记的回调立即执行");
    }

    #[test]
    fn dropped_children_are_pruned() {
        let root = CancellationScope::new();
        {
            let _a = root.child();
            let _b = root.child();
            assert_eq!(root.live_children(), 2);
        }
        assert_eq!(root.live_children(), 0);
        let _c = root.child();
        assert_eq!(root.live_children(), 1);
    }

    #[test]
    fn run_until_cancelled_prefers_cancellation() {
        let scope = CancellationScope::new();
        scope.cancel();
        let outcome = block_on(scope.run_until_cancelled(async { 42 }));
        assert!(outcome.expect_err("取消优先").is_cancellation());

        let live = CancellationScope::new();
        assert_eq!(block_on(live.run_until_cancelled(async { 42 })), Ok(42));
    }

    #[test]
    fn pending_future_observes_cancellation_from_another_thread() {
        let scope = CancellationScope::new();
        let remote = scope.clone();
        let canceller = std::thread::spawn(move || {
            remote.cancel();
        });

        let outcome = block_on(scope.run_until_cancelled(futures::future::pending::<()>()));
        canceller.join().expect("取消线程不应 panic");
        assert!(outcome.expect_err("挂起的 Future 必须被取消打断").is_cancellation());
    }
}
