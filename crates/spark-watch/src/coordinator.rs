//! # SubscriptionCoordinator：watch 订阅复用器
//!
//! ## 核心意图（Why）
//! - 多个界面组件会并发、重叠地请求“保持某资源列表最新”；协调器把这些请求收敛为最少数量的
//!   实时流：同一资源在默认作用域下至多一个 watch，且只有最后一个订阅者离开时才拆除；
//! - 命名空间选择发生重要变化时，默认作用域的 watch 需先完整中断旧尝试，再以新命名空间重启；
//! - 自身触发的取消与远端失败必须严格区分，取消永远不会以错误形式暴露给调用方。
//!
//! ## 架构定位（Where）
//! - 依赖 [`RefCounter`] 维护共享计数、[`CancellationScope`] 提供层级中断、
//!   [`ScopeChangeObserver`] 触发重订阅，任务通过 [`WatchExecutor`] 交给宿主运行时。
//!
//! ## 行为契约（What）
//! - **默认作用域**（未指定命名空间）：加入共享 watch；首个订阅者启动“加载快照 → 打开流”并登记观察者，
//!   之后的订阅者只增加计数；计数归零时取消作用域并停止观察者；
//! - **显式作用域**（指定命名空间）：总是启动独立的 watch，不触碰计数，清理时无条件取消；
//! - 一次 `subscribe` 的全部资源共用一个幂等的 [`Subscription`]，失败按资源粒度隔离。
//!
//! ## 风险提示（Trade-offs）
//! - 注册表与计数共用一把锁，保证“计数归零即移除 watch”与“新订阅者重建 watch”不会交错；
//!   锁内不调用任何外部回调，流停止回调与失败回调都在释放锁之后执行。

use std::{
    collections::HashMap,
    fmt,
    string::String,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    vec::Vec,
};

use dashmap::DashMap;
use futures::{
    StreamExt,
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use parking_lot::Mutex;
use tracing::{Instrument, debug, error, warn};

use crate::{
    cancellation::CancellationScope,
    error::WatchError,
    executor::WatchExecutor,
    namespace::{NamespaceScopeSnapshot, NamespaceSelectionState},
    observer::ScopeChangeObserver,
    ref_count::RefCounter,
    resource::{ResourceId, SubscribableResource},
};

/// 调用方提供的加载失败回调。
pub type FailureCallback = Arc<dyn Fn(&ResourceFailure) + Send + Sync>;

/// 某个资源的一次快照加载失败。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceFailure {
    /// 失败资源的名称。
    pub resource: Arc<str>,
    /// 失败原因，永远不会是 [`WatchError::Cancelled`]。
    pub error: WatchError,
}

/// `subscribe` 的可选参数。
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    namespaces: Option<Vec<String>>,
    on_load_failure: Option<FailureCallback>,
}

impl SubscribeOptions {
    /// 默认作用域、失败经由 [`Subscription`] 的失败流上报。
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定显式命名空间，切换到独立 watch 模式。
    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = Some(namespaces.into_iter().map(Into::into).collect());
        self
    }

    /// 指定加载失败回调。
    pub fn on_load_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ResourceFailure) + Send + Sync + 'static,
    {
        self.on_load_failure = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("namespaces", &self.namespaces)
            .field("on_load_failure", &self.on_load_failure.is_some())
            .finish()
    }
}

/// 协调器的运行时统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// 默认作用域下存活的共享 watch 数量。
    pub shared_watches: usize,
    /// 共享 watch 的订阅者总数。
    pub shared_subscribers: usize,
    /// 尚未清理的独立 watch 数量。
    pub dedicated_watches: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WatchMode {
    Shared,
    Dedicated,
}

impl WatchMode {
    fn as_str(self) -> &'static str {
        match self {
            WatchMode::Shared => "shared",
            WatchMode::Dedicated => "dedicated",
        }
    }
}

#[derive(Clone)]
enum FailureSink {
    Callback(FailureCallback),
    Channel(UnboundedSender<ResourceFailure>),
}

impl FailureSink {
    fn deliver(&self, failure: ResourceFailure) {
        match self {
            FailureSink::Callback(callback) => callback(&failure),
            FailureSink::Channel(sender) => {
                if sender.unbounded_send(failure).is_err() {
                    debug!("failure receiver already dropped");
                }
            }
        }
    }
}

/// 某个 watch 当前存活订阅者的失败汇点，以订阅编号区分。
///
/// - **契约 (What)**：订阅者释放后立即移除其汇点，之后的失败只投递给仍然存活的订阅者。
#[derive(Clone, Default)]
struct FailureSinks {
    entries: Arc<Mutex<Vec<(u64, FailureSink)>>>,
}

impl FailureSinks {
    fn single(subscription: u64, sink: &FailureSink) -> Self {
        let sinks = Self::default();
        sinks.attach(subscription, sink);
        sinks
    }

    fn attach(&self, subscription: u64, sink: &FailureSink) {
        self.entries.lock().push((subscription, sink.clone()));
    }

    fn detach(&self, subscription: u64) {
        let mut entries = self.entries.lock();
        if let Some(index) = entries.iter().position(|(id, _)| *id == subscription) {
            entries.remove(index);
        }
    }

    /// 在锁外逐一投递，回调内允许再次订阅或清理。
    fn deliver(&self, failure: &ResourceFailure) {
        let targets: Vec<FailureSink> =
            self.entries.lock().iter().map(|(_, sink)| sink.clone()).collect();
        for sink in targets {
            sink.deliver(failure.clone());
        }
    }
}

/// 一次 watch 尝试的全部输入。
struct Attempt {
    resource: Arc<dyn SubscribableResource>,
    namespaces: Vec<String>,
    scope: CancellationScope,
    sinks: FailureSinks,
    mode: WatchMode,
}

struct SharedWatch {
    resource: Arc<dyn SubscribableResource>,
    /// watch 级作用域，清理时取消；每次尝试都从它派生。
    scope: CancellationScope,
    /// 当前尝试的作用域。
    attempt: CancellationScope,
    observer: Option<ScopeChangeObserver>,
    sinks: FailureSinks,
}

struct DedicatedWatch {
    resource: Arc<str>,
    scope: CancellationScope,
}

#[derive(Default)]
struct Registry {
    counts: RefCounter<ResourceId>,
    watches: HashMap<ResourceId, SharedWatch>,
}

struct Shared {
    selection: Arc<dyn NamespaceSelectionState>,
    executor: Arc<dyn WatchExecutor>,
    root: CancellationScope,
    registry: Mutex<Registry>,
    dedicated: DashMap<u64, DedicatedWatch>,
    next_dedicated_id: AtomicU64,
    next_subscription_id: AtomicU64,
}

enum Release {
    Shared { id: ResourceId, subscription: u64 },
    Dedicated(u64),
}

/// watch 订阅复用器。
///
/// # 教案式说明
/// - **意图 (Why)**：对外只暴露 `subscribe → Subscription::cleanup` 一条路径，计数、注册表与观察者
///   全部由协调器独占，外部无法绕过不变量直接修改；
/// - **契约 (What)**：`Clone` 得到共享同一注册表的句柄；[`SubscriptionCoordinator::shutdown`] 之后的订阅
///   不再产生任何网络活动，但清理依旧保持计数平衡。
#[derive(Clone)]
pub struct SubscriptionCoordinator {
    shared: Arc<Shared>,
}

impl SubscriptionCoordinator {
    /// 以命名空间选择状态与执行器构造协调器。
    pub fn new(
        selection: Arc<dyn NamespaceSelectionState>,
        executor: Arc<dyn WatchExecutor>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                selection,
                executor,
                root: CancellationScope::new(),
                registry: Mutex::new(Registry::default()),
                dedicated: DashMap::new(),
                next_dedicated_id: AtomicU64::new(0),
                next_subscription_id: AtomicU64::new(0),
            }),
        }
    }

    /// 为一批资源建立订阅，返回聚合的清理句柄。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - `options` 未指定命名空间时进入默认作用域模式，否则为每个资源启动独立 watch；
    ///   - 未提供 `on_load_failure` 时，失败经由 [`Subscription::next_failure`] 上报；
    ///   - 同批次中某个资源失败不会影响其他资源；
    /// - **执行 (How)**：本方法不挂起，加载与打开流在执行器上异步进行，返回时网络活动可能尚未开始。
    pub fn subscribe(
        &self,
        resources: &[Arc<dyn SubscribableResource>],
        options: SubscribeOptions,
    ) -> Subscription {
        let SubscribeOptions {
            namespaces,
            on_load_failure,
        } = options;
        let (sink, failures) = match on_load_failure {
            Some(callback) => (FailureSink::Callback(callback), None),
            None => {
                let (sender, receiver) = mpsc::unbounded();
                (FailureSink::Channel(sender), Some(receiver))
            }
        };

        let subscription = self
            .shared
            .next_subscription_id
            .fetch_add(1, Ordering::Relaxed);
        let releases = resources
            .iter()
            .map(|resource| match &namespaces {
                Some(namespaces) => {
                    self.shared
                        .start_dedicated(resource, namespaces, subscription, &sink)
                }
                None => Shared::join_shared(&self.shared, resource, subscription, &sink),
            })
            .collect();

        Subscription {
            shared: Arc::clone(&self.shared),
            releases: Mutex::new(releases),
            released: AtomicBool::new(false),
            failures,
        }
    }

    /// 中断全部存活的 watch 并停止所有观察者。
    ///
    /// - **契约 (What)**：幂等；已发出的 [`Subscription`] 仍可正常清理，之后的订阅不再启动网络活动。
    pub fn shutdown(&self) {
        if !self.shared.root.cancel() {
            return;
        }
        let registry = self.shared.registry.lock();
        for watch in registry.watches.values() {
            if let Some(observer) = &watch.observer {
                observer.stop();
            }
        }
        debug!(
            shared_watches = registry.watches.len(),
            dedicated_watches = self.shared.dedicated.len(),
            "watch coordinator shut down"
        );
    }

    /// 是否已调用过 [`SubscriptionCoordinator::shutdown`]。
    pub fn is_shut_down(&self) -> bool {
        self.shared.root.is_cancelled()
    }

    /// `resource` 在默认作用域下的订阅者数量。
    pub fn subscriber_count(&self, resource: &Arc<dyn SubscribableResource>) -> usize {
        self.shared
            .registry
            .lock()
            .counts
            .count(&ResourceId::of(resource))
    }

    /// 当前统计快照。
    pub fn stats(&self) -> WatchStats {
        let registry = self.shared.registry.lock();
        WatchStats {
            shared_watches: registry.watches.len(),
            shared_subscribers: registry.counts.total(),
            dedicated_watches: self.shared.dedicated.len(),
        }
    }
}

impl fmt::Debug for SubscriptionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionCoordinator")
            .field("stats", &self.stats())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Shared {
    /// 加入或创建 `resource` 的共享 watch。
    fn join_shared(
        this: &Arc<Shared>,
        resource: &Arc<dyn SubscribableResource>,
        subscription: u64,
        sink: &FailureSink,
    ) -> Release {
        let id = ResourceId::of(resource);
        let release = Release::Shared { id, subscription };
        let mut registry = this.registry.lock();
        let count = registry.counts.increment(&id);
        if count > 1 {
            if let Some(watch) = registry.watches.get(&id) {
                watch.sinks.attach(subscription, sink);
            }
            debug!(resource = resource.name(), count, "joined shared watch");
            return release;
        }

        let scope = this.root.child();
        // 观察者先于读取命名空间创建，保证初次加载与后续变化之间没有遗漏的窗口。
        let observer = (resource.is_namespaced() && !scope.is_cancelled())
            .then(|| Shared::observe_selection(this, id));
        let namespaces = match &observer {
            Some(observer) => observer.last_seen().namespaces,
            None => this.selection.current().namespaces,
        };
        let attempt = scope.child();
        let sinks = FailureSinks::single(subscription, sink);
        registry.watches.insert(
            id,
            SharedWatch {
                resource: Arc::clone(resource),
                scope,
                attempt: attempt.clone(),
                observer,
                sinks: sinks.clone(),
            },
        );
        drop(registry);

        debug!(
            resource = resource.name(),
            namespaces = ?namespaces,
            "starting shared watch"
        );
        this.spawn_attempt(Attempt {
            resource: Arc::clone(resource),
            namespaces,
            scope: attempt,
            sinks,
            mode: WatchMode::Shared,
        });
        release
    }

    fn observe_selection(this: &Arc<Shared>, id: ResourceId) -> ScopeChangeObserver {
        let weak: Weak<Shared> = Arc::downgrade(this);
        ScopeChangeObserver::observe(&*this.selection, move |next| {
            if let Some(shared) = weak.upgrade() {
                shared.restart(id, next);
            }
        })
    }

    /// 中断共享 watch 的当前尝试，并以新选择重启。
    fn restart(&self, id: ResourceId, next: &NamespaceScopeSnapshot) {
        let (previous, attempt) = {
            let mut registry = self.registry.lock();
            let Some(watch) = registry.watches.get_mut(&id) else {
                return;
            };
            let fresh = watch.scope.child();
            let previous = std::mem::replace(&mut watch.attempt, fresh.clone());
            let attempt = Attempt {
                resource: Arc::clone(&watch.resource),
                namespaces: next.namespaces.clone(),
                scope: fresh,
                sinks: watch.sinks.clone(),
                mode: WatchMode::Shared,
            };
            (previous, attempt)
        };

        // 旧尝试必须在新尝试派发前完成中断：取消会同步停止已打开的流。
        previous.cancel();
        debug!(
            resource = attempt.resource.name(),
            all_selected = next.all_selected,
            namespaces = ?next.namespaces,
            "restarting shared watch after namespace change"
        );
        self.spawn_attempt(attempt);
    }

    fn start_dedicated(
        &self,
        resource: &Arc<dyn SubscribableResource>,
        namespaces: &[String],
        subscription: u64,
        sink: &FailureSink,
    ) -> Release {
        let id = self.next_dedicated_id.fetch_add(1, Ordering::Relaxed);
        let scope = self.root.child();
        self.dedicated.insert(
            id,
            DedicatedWatch {
                resource: Arc::from(resource.name()),
                scope: scope.clone(),
            },
        );
        debug!(
            resource = resource.name(),
            namespaces = ?namespaces,
            "starting dedicated watch"
        );
        self.spawn_attempt(Attempt {
            resource: Arc::clone(resource),
            namespaces: namespaces.to_vec(),
            scope,
            sinks: FailureSinks::single(subscription, sink),
            mode: WatchMode::Dedicated,
        });
        Release::Dedicated(id)
    }

    fn spawn_attempt(&self, attempt: Attempt) {
        self.executor
            .spawn(Box::pin(run_attempt(attempt).in_current_span()));
    }

    fn release(&self, release: &Release) -> Result<(), WatchError> {
        match release {
            Release::Dedicated(id) => {
                let Some((_, watch)) = self.dedicated.remove(id) else {
                    return Err(WatchError::invariant(
                        "dedicated watch released more than once",
                    ));
                };
                watch.scope.cancel();
                debug!(resource = &*watch.resource, "dedicated watch torn down");
                Ok(())
            }
            Release::Shared { id, subscription } => {
                let watch = {
                    let mut registry = self.registry.lock();
                    let remaining = registry.counts.decrement(id)?;
                    if remaining > 0 {
                        if let Some(watch) = registry.watches.get(id) {
                            watch.sinks.detach(*subscription);
                        }
                        debug!(%id, remaining, "left shared watch");
                        return Ok(());
                    }
                    registry.watches.remove(id)
                };
                let Some(watch) = watch else {
                    return Err(WatchError::invariant(
                        "reference count reached zero for a resource without a shared watch",
                    ));
                };
                watch.sinks.detach(*subscription);
                if let Some(observer) = &watch.observer {
                    observer.stop();
                }
                watch.scope.cancel();
                debug!(resource = watch.resource.name(), "shared watch torn down");
                Ok(())
            }
        }
    }
}

/// 执行一次“加载快照 → 打开流”。
///
/// # 教案式注释
/// - **执行 (How)**：
///   1. 快照加载与尝试作用域竞争，作用域先完成即视为取消；
///   2. 资源返回的取消、或作用域已取消后才浮现的传输错误，都按取消吞掉；
///   3. 其余错误投递给失败汇点，并且不再打开流；
///   4. 成功后再次确认作用域存活，打开流并把停止句柄挂到作用域的取消回调上。
async fn run_attempt(attempt: Attempt) {
    let Attempt {
        resource,
        namespaces,
        scope,
        sinks,
        mode,
    } = attempt;
    let name = resource.name();

    let loaded = scope
        .run_until_cancelled(resource.load_snapshot(&namespaces, &scope))
        .await
        .and_then(|outcome| outcome);
    match loaded {
        Ok(()) => {}
        Err(err) if err.is_cancellation() || scope.is_cancelled() => {
            debug!(resource = name, watch_mode = mode.as_str(), "watch attempt cancelled");
            return;
        }
        Err(err) => {
            warn!(
                resource = name,
                watch_mode = mode.as_str(),
                error = %err,
                "snapshot load failed"
            );
            sinks.deliver(&ResourceFailure {
                resource: Arc::from(name),
                error: err,
            });
            return;
        }
    }

    if scope.is_cancelled() {
        debug!(resource = name, watch_mode = mode.as_str(), "watch attempt cancelled");
        return;
    }
    let mut disposer = resource.open_stream(&scope);
    scope.on_cancel(move || disposer.dispose());
    debug!(resource = name, watch_mode = mode.as_str(), "watch stream opened");
}

/// 一次 `subscribe` 调用返回的聚合清理句柄。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - [`Subscription::cleanup`] 幂等，首次调用独立释放批次中的每个资源；
///   - 句柄被丢弃时自动执行清理；
///   - 未提供失败回调时，失败通过 [`Subscription::next_failure`] / [`Subscription::try_next_failure`] 读取。
/// - **风险 (Trade-offs)**：共享 watch 的失败投递给当时仍存活的每个订阅者；清理返回后，
///   本订阅的回调不会再被调用。
pub struct Subscription {
    shared: Arc<Shared>,
    releases: Mutex<Vec<Release>>,
    released: AtomicBool,
    failures: Option<UnboundedReceiver<ResourceFailure>>,
}

impl Subscription {
    /// 释放批次中的全部资源；第二次及之后的调用没有任何效果。
    ///
    /// - **契约 (What)**：即便某个资源的释放违反不变量，其余资源仍会被释放；返回遇到的第一个错误。
    pub fn cleanup(&self) -> Result<(), WatchError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let releases = std::mem::take(&mut *self.releases.lock());
        let mut first_error = None;
        for release in &releases {
            if let Err(err) = self.shared.release(release) {
                error!(error = %err, "subscription cleanup violated a watch invariant");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// 是否已执行过清理。
    pub fn is_cleaned_up(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// 等待下一条加载失败。
    ///
    /// - **契约 (What)**：提供了失败回调时立即返回 `None`；否则在所有相关 watch 结束前保持挂起。
    pub async fn next_failure(&mut self) -> Option<ResourceFailure> {
        match self.failures.as_mut() {
            Some(receiver) => receiver.next().await,
            None => None,
        }
    }

    /// 非阻塞地读取一条已到达的加载失败。
    pub fn try_next_failure(&mut self) -> Option<ResourceFailure> {
        self.failures.as_mut()?.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // 错误已在 `cleanup` 内记录。
        let _ = self.cleanup();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("cleaned_up", &self.is_cleaned_up())
            .finish()
    }
}

#[cfg(all(test, feature = "runtime-tokio"))]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use tracing_test::traced_test;

    use super::{SubscribeOptions, SubscriptionCoordinator};
    use crate::{
        cancellation::CancellationScope,
        error::WatchError,
        executor::TokioExecutor,
        namespace::{NamespaceScopeSnapshot, NamespaceSelection},
        resource::{StreamDisposer, SubscribableResource},
    };

    /// 加载要么挂起要么以传输错误失败的最小资源。
    struct Scripted {
        fail: bool,
        streams: AtomicUsize,
    }

    #[async_trait]
    impl SubscribableResource for Scripted {
        fn name(&self) -> &str {
            "pods"
        }

        fn is_namespaced(&self) -> bool {
            true
        }

        async fn load_snapshot(
            &self,
            _namespaces: &[String],
            _signal: &CancellationScope,
        ) -> Result<(), WatchError> {
            if self.fail {
                return Err(WatchError::transport("pods", "connection refused"));
            }
            futures::future::pending::<Result<(), WatchError>>().await
        }

        fn open_stream(&self, _signal: &CancellationScope) -> StreamDisposer {
            self.streams.fetch_add(1, Ordering::SeqCst);
            StreamDisposer::noop()
        }
    }

    fn coordinator() -> SubscriptionCoordinator {
        let selection = NamespaceSelection::new(NamespaceScopeSnapshot::explicit(["default"]));
        SubscriptionCoordinator::new(Arc::new(selection), Arc::new(TokioExecutor::current()))
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn transport_failure_is_logged_as_warning() {
        let coordinator = coordinator();
        let resource: Arc<dyn SubscribableResource> = Arc::new(Scripted {
            fail: true,
            streams: AtomicUsize::new(0),
        });
        let mut subscription = coordinator.subscribe(&[resource], SubscribeOptions::new());
        settle().await;

        let failure = subscription.try_next_failure().expect("失败应经由失败流上报");
        assert_eq!(&*failure.resource, "pods");
        assert!(logs_contain("snapshot load failed"));
        subscription.cleanup().expect("失败后清理依旧安全");
    }

    #[tokio::test]
    #[traced_test]
    async fn cancellation_is_never_logged_as_warning() {
        let coordinator = coordinator();
        let scripted = Arc::new(Scripted {
            fail: false,
            streams: AtomicUsize::new(0),
        });
        let resource: Arc<dyn SubscribableResource> = scripted.clone();
        let mut subscription = coordinator.subscribe(&[resource], SubscribeOptions::new());
        settle().await;

        subscription.cleanup().expect("清理成功");
        settle().await;

        assert!(logs_contain("watch attempt cancelled"));
        assert!(!logs_contain("snapshot load failed"));
        assert!(subscription.try_next_failure().is_none(), "取消不得作为失败上报");
        assert_eq!(scripted.streams.load(Ordering::SeqCst), 0, "取消后不得打开流");
    }
}
