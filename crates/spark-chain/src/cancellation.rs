use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::Waker,
};

use futures::task::AtomicWaker;

/// 单次执行的取消令牌。
///
/// # 教案式说明
/// - **意图（Why）**：取消必须以“失败”的形式进入仍在 `proceed()` 中等待的拦截器，让它们按普通
///   错误路径释放作用域内资源；仅仅丢弃 Future 做不到这一点。
/// - **逻辑（How）**：原子位记录是否已取消；驱动执行的 [`Execution`](crate::Execution) 每次轮询都把
///   当前 waker 登记到 [`AtomicWaker`]，`cancel()` 首次触发时唤醒它，驱动随即把取消投递给挂起续体。
/// - **契约（What）**：令牌可任意克隆，所有克隆共享同一原子位；`cancel()` 返回 `true` 表示本次调用
///   首次触发取消。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    waker: AtomicWaker,
}

impl Cancellation {
    /// 创建处于“未取消”状态的令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询当前是否已被取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 标记取消并唤醒正在驱动执行的任务。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.waker.wake();
        }
        first
    }

    /// 派生共享同一原子位的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }

    pub(crate) fn register(&self, waker: &Waker) {
        self.inner.waker.register(waker);
    }
}
