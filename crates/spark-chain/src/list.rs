//! 单个阶段的拦截器列表，以 `Arc<Vec<_>>` + 显式 `shared` 标记实现写时复制。
//!
//! # 教案式说明
//! - **意图（Why）**：从模板 Pipeline 派生大量实例时，各阶段列表应当共享而不是复制；只有真正
//!   写入的一方才付出复制成本。
//! - **逻辑（How）**：
//!   - [`InterceptorList::share`] 把列表交给另一个持有者（编译缓存、合并目标）时置位 `shared`；
//!   - 写入前若 `shared` 为真，先复制出私有 `Vec` 再清除标记；
//!   - `Arc::make_mut` 作为最后一道防线：即便标记遗漏，只要引用计数大于一也会复制。
//! - **契约（What）**：`shared` 列表永远不会被原地修改。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::interceptor::InterceptorEntry;

pub(crate) struct InterceptorList<S, C> {
    items: Arc<Vec<InterceptorEntry<S, C>>>,
    shared: AtomicBool,
}

impl<S, C> InterceptorList<S, C> {
    pub(crate) fn new() -> Self {
        Self {
            items: Arc::new(Vec::new()),
            shared: AtomicBool::new(false),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    pub(crate) fn entries(&self) -> &[InterceptorEntry<S, C>] {
        &self.items
    }

    /// 把列表交给另一个持有者；此后本方的首次写入会先复制。
    ///
    /// 取 `&self` 是因为执行期（只持有 `&Pipeline`）编译缓存时也需要共享阶段列表。
    pub(crate) fn share(&self) -> Arc<Vec<InterceptorEntry<S, C>>> {
        self.mark_shared();
        Arc::clone(&self.items)
    }

    pub(crate) fn mark_shared(&self) {
        self.shared.store(true, Ordering::Release);
    }

    /// 只读快照，不标记共享；调用方必须保证在本方下一次写入前释放该快照，或自行处理复制。
    pub(crate) fn snapshot(&self) -> Arc<Vec<InterceptorEntry<S, C>>> {
        Arc::clone(&self.items)
    }

    pub(crate) fn push(&mut self, entry: InterceptorEntry<S, C>) {
        self.ensure_private();
        Arc::make_mut(&mut self.items).push(entry);
    }

    /// 把 `other` 的条目追加到本列表之后。
    ///
    /// 本列表为空时直接结构性采纳对方的 `Arc`（双方都标记为共享），否则复制后追加。
    pub(crate) fn absorb(&mut self, other: &InterceptorList<S, C>) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.items = other.share();
            self.shared.store(true, Ordering::Release);
            return;
        }
        self.ensure_private();
        Arc::make_mut(&mut self.items).extend(other.entries().iter().cloned());
    }

    /// 结构性复制：新列表与本列表共享底层 `Vec`，双方都标记为共享。
    pub(crate) fn share_clone(&self) -> Self {
        Self {
            items: self.share(),
            shared: AtomicBool::new(true),
        }
    }

    fn ensure_private(&mut self) {
        if *self.shared.get_mut() {
            self.items = Arc::new(self.items.as_ref().clone());
            *self.shared.get_mut() = false;
        }
    }
}

impl<S, C> fmt::Debug for InterceptorList<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorList")
            .field("len", &self.len())
            .field("shared", &self.is_shared())
            .finish()
    }
}
