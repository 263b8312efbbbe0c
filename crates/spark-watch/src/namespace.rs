//! # 命名空间选择：快照、变化分类与进程内状态
//!
//! ## 核心意图（Why）
//! - 默认作用域的 watch 跟随“当前选中的命名空间”；本模块定义该状态的只读契约
//!   [`NamespaceSelectionState`]，以及判断一次变化是否值得重启 watch 的分类规则；
//! - 同时提供进程内实现 [`NamespaceSelection`]，供宿主直接使用或在测试中驱动变化。
//!
//! ## 分类规则（What）
//! - 前后两次都是“选中全部命名空间”时，即便底层命名空间数量变化（集群侧新增/删除），
//!   也视为**不重要**，避免集群拓扑抖动引发重启风暴；
//! - 其余情况下，只要“全选”标记或命名空间集合（与顺序无关）发生变化即为**重要**。

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};

use parking_lot::{Mutex, RwLock};

use crate::config::SelectionConfig;

/// 某一时刻的命名空间选择。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceScopeSnapshot {
    /// 当前选中的命名空间；“全选”时为集群中已知的全部命名空间。
    pub namespaces: Vec<String>,
    /// 用户是否选择了“全部命名空间”。
    pub all_selected: bool,
}

impl NamespaceScopeSnapshot {
    /// 显式列表形式的选择。
    pub fn explicit<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
            all_selected: false,
        }
    }

    /// “全选”形式的选择，`namespaces` 为物化后的全部命名空间。
    pub fn all<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
            all_selected: true,
        }
    }

    /// 以集合语义比较命名空间成员，忽略顺序与重复项。
    pub fn same_members(&self, other: &Self) -> bool {
        let left: HashSet<&str> = self.namespaces.iter().map(String::as_str).collect();
        let right: HashSet<&str> = other.namespaces.iter().map(String::as_str).collect();
        left == right
    }
}

/// 一次选择变化的分类结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeChange {
    /// 全选标记与成员集合均未变化。
    Unchanged,
    /// 前后均为“全选”，仅物化出的命名空间列表变化。
    Insignificant,
    /// 需要中断并以新命名空间重启 watch。
    Significant,
}

impl ScopeChange {
    /// 是否需要重启。
    pub fn requires_restart(self) -> bool {
        matches!(self, ScopeChange::Significant)
    }
}

/// 按“全选 → 全选不重启”的规则对变化分类。
pub fn classify_change(
    previous: &NamespaceScopeSnapshot,
    next: &NamespaceScopeSnapshot,
) -> ScopeChange {
    if previous.all_selected && next.all_selected {
        return if previous.same_members(next) {
            ScopeChange::Unchanged
        } else {
            ScopeChange::Insignificant
        };
    }
    if previous.all_selected != next.all_selected || !previous.same_members(next) {
        ScopeChange::Significant
    } else {
        ScopeChange::Unchanged
    }
}

/// 选择变化的监听器。
pub type SelectionListener = Arc<dyn Fn(&NamespaceScopeSnapshot) + Send + Sync>;

/// 外部命名空间选择状态的只读契约。
///
/// # 教案式说明
/// - **意图 (Why)**：复用器只读取选择并订阅其变化，从不修改；以 trait 暴露便于宿主接入
///   自己的响应式状态；
/// - **契约 (What)**：
///   - `current` 返回最新快照；
///   - `subscribe` 登记监听器，返回的 [`SelectionSubscription`] 被取消或丢弃后不再收到通知；
///   - 实现方应在不持有内部锁的情况下调用监听器，监听器内允许再次读取 `current`。
pub trait NamespaceSelectionState: Send + Sync + 'static {
    /// 读取当前选择。
    fn current(&self) -> NamespaceScopeSnapshot;

    /// 登记变化监听器。
    fn subscribe(&self, listener: SelectionListener) -> SelectionSubscription;
}

/// 监听器登记凭证，取消或丢弃时注销监听器。
#[must_use = "dropping the subscription unregisters the listener"]
pub struct SelectionSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl SelectionSubscription {
    /// 以注销闭包构造凭证，供 [`NamespaceSelectionState`] 的实现方使用。
    pub fn new<F>(unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// 注销监听器；重复调用无副作用。
    pub fn unsubscribe(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }

    /// 是否仍处于登记状态。
    pub fn is_active(&self) -> bool {
        self.unsubscribe.is_some()
    }
}

impl Drop for SelectionSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for SelectionSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionSubscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// 进程内的命名空间选择状态。
///
/// # 教案式说明
/// - **意图 (Why)**：为宿主提供开箱即用的 [`NamespaceSelectionState`] 实现，也作为测试中驱动
///   选择变化的入口；
/// - **逻辑 (How)**：快照存放在 `RwLock` 中；监听器以递增编号登记在有序表中，`select` 写入新值后
///   先克隆监听器列表、释放锁，再逐一通知；
/// - **契约 (What)**：`Clone` 得到共享同一状态的句柄；每次 `select` 都会通知，是否重启由观察者判定。
#[derive(Clone, Default)]
pub struct NamespaceSelection {
    inner: Arc<SelectionInner>,
}

#[derive(Default)]
struct SelectionInner {
    value: RwLock<NamespaceScopeSnapshot>,
    listeners: Mutex<ListenerTable>,
}

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    entries: BTreeMap<u64, SelectionListener>,
}

impl NamespaceSelection {
    /// 以初始快照构造选择状态。
    pub fn new(initial: NamespaceScopeSnapshot) -> Self {
        Self {
            inner: Arc::new(SelectionInner {
                value: RwLock::new(initial),
                listeners: Mutex::new(ListenerTable::default()),
            }),
        }
    }

    /// 依据配置中的初始选择构造。
    pub fn from_config(config: &SelectionConfig) -> Self {
        Self::new(NamespaceScopeSnapshot {
            namespaces: config.namespaces.clone(),
            all_selected: config.all_selected,
        })
    }

    /// 写入新选择并通知所有监听器。
    pub fn select(&self, next: NamespaceScopeSnapshot) {
        *self.inner.value.write() = next.clone();
        let listeners: Vec<SelectionListener> =
            self.inner.listeners.lock().entries.values().cloned().collect();
        for listener in listeners {
            listener(&next);
        }
    }

    /// 当前登记的监听器数量。
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().entries.len()
    }
}

impl NamespaceSelectionState for NamespaceSelection {
    fn current(&self) -> NamespaceScopeSnapshot {
        self.inner.value.read().clone()
    }

    fn subscribe(&self, listener: SelectionListener) -> SelectionSubscription {
        let id = {
            let mut table = self.inner.listeners.lock();
            let id = table.next_id;
            table.next_id += 1;
            table.entries.insert(id, listener);
            id
        };
        let weak: Weak<SelectionInner> = Arc::downgrade(&self.inner);
        SelectionSubscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().entries.remove(&id);
            }
        })
    }
}

impl fmt::Debug for NamespaceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceSelection")
            .field("current", &*self.inner.value.read())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
