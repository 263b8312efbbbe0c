//! # RefCounter：共享 watch 的引用计数
//!
//! ## 核心意图（Why）
//! - 协调器依赖“计数恰好一次归零”来决定何时拆除真实的网络资源，因此计数必须严格单调、
//!   不可为负，并在归零时移除条目，让下一次订阅从全新周期开始。
//!
//! ## 行为契约（What）
//! - `increment`：首次调用创建计数为 1 的条目，返回新计数；
//! - `decrement`：返回新计数；对不存在的条目调用返回
//!   [`WatchError::InvariantViolation`](crate::error::WatchError::InvariantViolation)，映射保持不变；
//! - 计数归零时条目被移除，而不是保留为 0。
//!
//! ## 风险提示（Trade-offs）
//! - 结构本身不做同步，由协调器在其注册表锁内独占修改，保证与 watch 注册表的原子配合。

use std::{collections::HashMap, hash::Hash};

use crate::error::WatchError;

/// 按资源身份维护订阅计数。
#[derive(Debug)]
pub struct RefCounter<K> {
    counts: HashMap<K, usize>,
}

impl<K> Default for RefCounter<K> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
        }
    }
}

impl<K> RefCounter<K>
where
    K: Hash + Eq + Clone,
{
    /// 创建空的计数表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 为 `key` 增加一个引用，返回新计数（≥1）。
    pub fn increment(&mut self, key: &K) -> usize {
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// 为 `key` 释放一个引用，返回新计数（≥0）。
    ///
    /// # 教案式注释
    /// - **契约 (What)**：
    ///   - **前置条件**：`key` 必须存在未释放的引用，否则返回不变量破坏错误且不修改映射；
    ///   - **后置条件**：返回 0 时条目已被移除，`contains(key)` 为 `false`。
    pub fn decrement(&mut self, key: &K) -> Result<usize, WatchError> {
        let Some(count) = self.counts.get_mut(key) else {
            return Err(WatchError::invariant(
                "decrement called for a resource without outstanding references",
            ));
        };
        match count.checked_sub(1) {
            Some(0) => {
                self.counts.remove(key);
                Ok(0)
            }
            Some(next) => {
                *count = next;
                Ok(next)
            }
            // 条目只会以 ≥1 的计数存在，走到这里意味着内部状态已被破坏。
            None => Err(WatchError::invariant("reference count would become negative")),
        }
    }

    /// 当前计数；不存在的条目视为 0。
    pub fn count(&self, key: &K) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// 是否存在 `key` 的条目。
    pub fn contains(&self, key: &K) -> bool {
        self.counts.contains_key(key)
    }

    /// 存在未释放引用的条目数量。
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// 计数表是否为空。
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// 所有条目的引用总和。
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::RefCounter;

    #[test]
    fn first_increment_creates_entry_at_one() {
        let mut counter = RefCounter::new();
        assert_eq!(counter.increment(&"pods"), 1);
        assert_eq!(counter.increment(&"pods"), 2);
        assert_eq!(counter.count(&"pods"), 2);
        assert_eq!(counter.count(&"services"), 0);
    }

    #[test]
    fn reaching_zero_removes_entry() {
        let mut counter = RefCounter::new();
        counter.increment(&"pods");
        assert_eq!(counter.decrement(&"pods"), Ok(0));
        assert!(!counter.contains(&"pods"), "归零后条目必须被移除而非保留为 0");
        assert!(counter.is_empty());

        // 新周期重新从 1 开始。
        assert_eq!(counter.increment(&"pods"), 1);
    }

    #[test]
    fn decrement_without_increment_is_invariant_violation() {
        let mut counter: RefCounter<&str> = RefCounter::new();
        let err = counter.decrement(&"pods").expect_err("未订阅即释放必须失败");
        assert!(err.is_invariant_violation());
        assert!(counter.is_empty(), "失败的释放不得修改映射");
    }

    #[test]
    fn extra_decrement_after_zero_fails_loudly() {
        let mut counter = RefCounter::new();
        counter.increment(&"pods");
        counter.decrement(&"pods").expect("首次释放成功");
        assert!(counter.decrement(&"pods").is_err(), "重复释放不得返回负数");
    }

    proptest! {
        /// 对同一资源执行相同次数的增减后，计数为 0 且条目不存在。
        #[test]
        fn balanced_sequences_leave_no_entry(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let mut counter = RefCounter::new();
            let mut outstanding = 0usize;
            for inc in ops {
                if inc || outstanding == 0 {
                    outstanding += 1;
                    prop_assert_eq!(counter.increment(&7u32), outstanding);
                } else {
                    outstanding -= 1;
                    prop_assert_eq!(counter.decrement(&7u32), Ok(outstanding));
                }
            }
            while outstanding > 0 {
                outstanding -= 1;
                prop_assert_eq!(counter.decrement(&7u32), Ok(outstanding));
            }
            prop_assert!(!counter.contains(&7u32));
            prop_assert_eq!(counter.total(), 0);
        }
    }
}
