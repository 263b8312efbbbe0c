//! # ScopeChangeObserver：命名空间变化观察者
//!
//! ## 核心意图（Why）
//! - 每个默认作用域的共享 watch 都需要在用户切换命名空间时以新列表重启；
//! - 观察者把“订阅外部选择状态 + 与上一次快照比较 + 只对重要变化作出反应”三件事封装在一起，
//!   协调器只需提供重启回调。
//!
//! ## 行为契约（What）
//! - 只有两种状态：观察中 / 已停止；停止后不再调用回调，且不可恢复；
//! - 无论变化是否重要，“上一次快照”都会前移到最新值，分类规则见 [`classify_change`]；
//! - 回调在选择状态发布变化的线程上同步执行。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::trace;

use crate::namespace::{
    NamespaceScopeSnapshot, NamespaceSelectionState, SelectionSubscription, classify_change,
};

/// 命名空间变化观察者。
///
/// # 教案式说明
/// - **意图 (Why)**：以显式回调登记替代框架级响应式原语，并在其上叠加“全选 → 全选不重启”的比较器；
/// - **逻辑 (How)**：构造时记录当前快照并向选择状态登记监听器；监听器在锁内完成
///   “比较 + 前移”，释放锁后再调用重启回调，保证回调内可以安全地读取选择或停止观察者；
/// - **风险 (Trade-offs)**：回调同步执行，耗时工作应交给执行器派发。
pub struct ScopeChangeObserver {
    inner: Arc<ObserverInner>,
}

struct ObserverInner {
    previous: Mutex<NamespaceScopeSnapshot>,
    stopped: AtomicBool,
    registration: Mutex<Option<SelectionSubscription>>,
}

impl ScopeChangeObserver {
    /// 开始观察 `selection`，在重要变化时以新快照调用 `on_significant`。
    pub fn observe<S, F>(selection: &S, on_significant: F) -> Self
    where
        S: NamespaceSelectionState + ?Sized,
        F: Fn(&NamespaceScopeSnapshot) + Send + Sync + 'static,
    {
        let inner = Arc::new(ObserverInner {
            previous: Mutex::new(selection.current()),
            stopped: AtomicBool::new(false),
            registration: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let registration = selection.subscribe(Arc::new(move |next: &NamespaceScopeSnapshot| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.stopped.load(Ordering::Acquire) {
                return;
            }
            let change = {
                let mut previous = inner.previous.lock();
                let change = classify_change(&previous, next);
                *previous = next.clone();
                change
            };
            trace!(
                ?change,
                all_selected = next.all_selected,
                namespaces = next.namespaces.len(),
                "namespace selection changed"
            );
            if change.requires_restart() && !inner.stopped.load(Ordering::Acquire) {
                on_significant(next);
            }
        }));
        *inner.registration.lock() = Some(registration);

        Self { inner }
    }

    /// 停止观察并注销监听器；重复调用无副作用。
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let registration = self.inner.registration.lock().take();
        drop(registration);
    }

    /// 是否已停止。
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// 最近一次观察到的快照。
    pub fn last_seen(&self) -> NamespaceScopeSnapshot {
        self.inner.previous.lock().clone()
    }
}

impl Drop for ScopeChangeObserver {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ScopeChangeObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeChangeObserver")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
