//! 场景测试共享的资源替身与调度辅助。
//!
//! # 教案级导览
//! - **Why**：复用器的正确性体现在“发起了几次加载、打开/停止了几条流、哪些加载被中断”，
//!   因此替身资源只负责如实计数，并按脚本决定加载结果；
//! - **How**：`#[tokio::test]` 使用单线程运行时，`settle` 通过多次让出执行权推进已派发的任务；
//! - **What**：所有计数器都是原子类型，断言时直接读取。
#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use spark_watch::{
    CancellationScope, NamespaceScopeSnapshot, NamespaceSelection, StreamDisposer,
    SubscribableResource, SubscriptionCoordinator, TokioExecutor, WatchError, async_trait,
};
use tokio::sync::Notify;

/// 加载行为脚本。
#[derive(Clone, Copy, Debug)]
pub enum LoadScript {
    /// 立即成功。
    Succeed,
    /// 以传输错误失败。
    Fail(&'static str),
    /// 资源自行报告取消。
    ReportCancelled,
    /// 永久挂起，只能被取消打断。
    Hold,
    /// 挂起直到 [`FakeResource::release_loads`]，随后成功。
    HoldUntilReleased,
}

/// 按脚本执行的资源替身。
pub struct FakeResource {
    name: &'static str,
    namespaced: bool,
    script: Mutex<LoadScript>,
    gate: Notify,
    pub loads_started: AtomicUsize,
    pub loads_completed: AtomicUsize,
    pub loads_aborted: AtomicUsize,
    pub streams_opened: AtomicUsize,
    pub streams_disposed: Arc<AtomicUsize>,
    namespaces_seen: Mutex<Vec<Vec<String>>>,
}

impl FakeResource {
    pub fn namespaced(name: &'static str) -> Arc<Self> {
        Self::build(name, true)
    }

    pub fn cluster_scoped(name: &'static str) -> Arc<Self> {
        Self::build(name, false)
    }

    fn build(name: &'static str, namespaced: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            namespaced,
            script: Mutex::new(LoadScript::Succeed),
            gate: Notify::new(),
            loads_started: AtomicUsize::new(0),
            loads_completed: AtomicUsize::new(0),
            loads_aborted: AtomicUsize::new(0),
            streams_opened: AtomicUsize::new(0),
            streams_disposed: Arc::new(AtomicUsize::new(0)),
            namespaces_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn with_script(self: Arc<Self>, script: LoadScript) -> Arc<Self> {
        self.set_script(script);
        self
    }

    pub fn set_script(&self, script: LoadScript) {
        *self.script.lock() = script;
    }

    /// 放行所有处于 `HoldUntilReleased` 的加载。
    pub fn release_loads(&self) {
        self.gate.notify_waiters();
    }

    pub fn as_dyn(self: &Arc<Self>) -> Arc<dyn SubscribableResource> {
        self.clone()
    }

    pub fn loads(&self) -> usize {
        self.loads_started.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.loads_aborted.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> usize {
        self.streams_disposed.load(Ordering::SeqCst)
    }

    /// 当前仍在投递的流数量。
    pub fn live_streams(&self) -> usize {
        self.opened() - self.disposed()
    }

    pub fn last_namespaces(&self) -> Option<Vec<String>> {
        self.namespaces_seen.lock().last().cloned()
    }
}

/// 加载 Future 被丢弃而未完成时记一次中断。
struct AbortProbe<'a> {
    counter: &'a AtomicUsize,
    armed: bool,
}

impl Drop for AbortProbe<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SubscribableResource for FakeResource {
    fn name(&self) -> &str {
        self.name
    }

    fn is_namespaced(&self) -> bool {
        self.namespaced
    }

    async fn load_snapshot(
        &self,
        namespaces: &[String],
        _signal: &CancellationScope,
    ) -> Result<(), WatchError> {
        self.loads_started.fetch_add(1, Ordering::SeqCst);
        self.namespaces_seen.lock().push(namespaces.to_vec());
        let mut probe = AbortProbe {
            counter: &self.loads_aborted,
            armed: true,
        };

        let script = *self.script.lock();
        let outcome = match script {
            LoadScript::Succeed => Ok(()),
            LoadScript::Fail(detail) => Err(WatchError::transport(self.name, detail)),
            LoadScript::ReportCancelled => Err(WatchError::Cancelled),
            LoadScript::Hold => std::future::pending::<Result<(), WatchError>>().await,
            LoadScript::HoldUntilReleased => {
                self.gate.notified().await;
                Ok(())
            }
        };
        probe.armed = false;
        self.loads_completed.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    fn open_stream(&self, _signal: &CancellationScope) -> StreamDisposer {
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        let disposed = Arc::clone(&self.streams_disposed);
        StreamDisposer::new(move || {
            disposed.fetch_add(1, Ordering::SeqCst);
        })
    }
}

/// 以给定初始选择构造协调器，返回选择句柄以便测试驱动变化。
pub fn coordinator_with(initial: NamespaceScopeSnapshot) -> (SubscriptionCoordinator, NamespaceSelection) {
    let selection = NamespaceSelection::new(initial);
    let coordinator = SubscriptionCoordinator::new(
        Arc::new(selection.clone()),
        Arc::new(TokioExecutor::current()),
    );
    (coordinator, selection)
}

/// 让出执行权若干次，推进单线程运行时上已派发的任务。
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
