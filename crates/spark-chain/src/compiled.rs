use std::{fmt, slice, sync::Arc};

use crate::{interceptor::InterceptorEntry, phase::Phase};

/// 按全局顺序展开后的拦截器序列。
///
/// # 教案式说明
/// - **意图（Why）**：执行期只需要一条只读的扁平序列；以 `Arc` 持有，单次执行期间 Pipeline 的后续
///   修改不会影响已经开始的执行。
/// - **契约（What）**：序列等于各阶段（按阶段顺序）拦截器（按注册顺序）的拼接；空序列不分配内存。
pub struct InterceptorChain<S, C>(Option<Arc<Vec<InterceptorEntry<S, C>>>>);

impl<S, C> InterceptorChain<S, C> {
    pub(crate) fn empty() -> Self {
        Self(None)
    }

    pub(crate) fn from_arc(items: Arc<Vec<InterceptorEntry<S, C>>>) -> Self {
        if items.is_empty() {
            Self(None)
        } else {
            Self(Some(items))
        }
    }

    pub fn len(&self) -> usize {
        self.0.as_ref().map_or(0, |items| items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<&InterceptorEntry<S, C>> {
        self.0.as_ref().and_then(|items| items.get(index))
    }

    pub fn iter(&self) -> slice::Iter<'_, InterceptorEntry<S, C>> {
        self.as_slice().iter()
    }

    pub fn as_slice(&self) -> &[InterceptorEntry<S, C>] {
        match &self.0 {
            Some(items) => items.as_slice(),
            None => &[],
        }
    }

    /// 按顺序收集诊断标签。
    pub fn labels(&self) -> Vec<&str> {
        self.iter().map(InterceptorEntry::label).collect()
    }

    /// 判断两条序列是否共享同一份底层存储（两个空序列视为相同）。
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Some(left), Some(right)) => Arc::ptr_eq(left, right),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<S, C> Clone for InterceptorChain<S, C> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<S, C> fmt::Debug for InterceptorChain<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.labels()).finish()
    }
}

impl<'a, S, C> IntoIterator for &'a InterceptorChain<S, C> {
    type Item = &'a InterceptorEntry<S, C>;
    type IntoIter = slice::Iter<'a, InterceptorEntry<S, C>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// 编译缓存的存储形态。
pub(crate) enum CachedOrder<S, C> {
    /// 需要重建。
    NeedsRebuild,
    /// 没有任何拦截器。
    Empty,
    /// 只有一个阶段有拦截器，缓存直接复用该阶段的列表。
    Phase {
        phase: Phase,
        items: Arc<Vec<InterceptorEntry<S, C>>>,
    },
    /// 跨阶段拼接出的独占列表。
    Owned(Arc<Vec<InterceptorEntry<S, C>>>),
}

impl<S, C> Clone for CachedOrder<S, C> {
    fn clone(&self) -> Self {
        match self {
            CachedOrder::NeedsRebuild => CachedOrder::NeedsRebuild,
            CachedOrder::Empty => CachedOrder::Empty,
            CachedOrder::Phase { phase, items } => CachedOrder::Phase {
                phase: phase.clone(),
                items: Arc::clone(items),
            },
            CachedOrder::Owned(items) => CachedOrder::Owned(Arc::clone(items)),
        }
    }
}

/// 编译缓存：存储形态 + “是否已交给执行帧或其他 Pipeline” 标记。
///
/// `handed_out` 为真时，快速追加路径不再适用，任何修改都回退为失效重建。
pub(crate) struct CompiledOrder<S, C> {
    state: CachedOrder<S, C>,
    handed_out: bool,
}

impl<S, C> CompiledOrder<S, C> {
    pub(crate) fn new() -> Self {
        Self {
            state: CachedOrder::Empty,
            handed_out: false,
        }
    }

    /// 采纳另一个 Pipeline 已交出的缓存。
    pub(crate) fn adopted(state: CachedOrder<S, C>) -> Self {
        Self {
            state,
            handed_out: true,
        }
    }

    pub(crate) fn state(&self) -> &CachedOrder<S, C> {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut CachedOrder<S, C> {
        &mut self.state
    }

    pub(crate) fn is_handed_out(&self) -> bool {
        self.handed_out
    }

    #[cfg(test)]
    pub(crate) fn needs_rebuild(&self) -> bool {
        matches!(self.state, CachedOrder::NeedsRebuild)
    }

    pub(crate) fn invalidate(&mut self) {
        self.state = CachedOrder::NeedsRebuild;
        self.handed_out = false;
    }

    pub(crate) fn install(&mut self, state: CachedOrder<S, C>) {
        self.state = state;
        self.handed_out = false;
    }

    pub(crate) fn mark_handed_out(&mut self) {
        self.handed_out = true;
    }

    /// 当前缓存对应的序列；需要重建时返回 `None`。
    pub(crate) fn chain(&self) -> Option<InterceptorChain<S, C>> {
        match &self.state {
            CachedOrder::NeedsRebuild => None,
            CachedOrder::Empty => Some(InterceptorChain::empty()),
            CachedOrder::Phase { items, .. } | CachedOrder::Owned(items) => {
                Some(InterceptorChain::from_arc(Arc::clone(items)))
            }
        }
    }

    /// 缓存复用的阶段（仅单阶段形态）。
    pub(crate) fn source_phase(&self) -> Option<&Phase> {
        match &self.state {
            CachedOrder::Phase { phase, .. } => Some(phase),
            _ => None,
        }
    }
}
