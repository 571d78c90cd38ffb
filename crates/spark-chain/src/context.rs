//! # context 模块说明
//!
//! ## 角色定位（Why）
//! - 执行帧 [`Frame`] 保存一次执行的全部可变状态：当前主体、游标、是否已终止，以及蹦床驱动与
//!   `proceed()` 之间传递结果的“投递槽”；
//! - [`PipelineContext`] 是拦截器看到的执行句柄，`proceed()` 返回的 [`Proceed`] Future 在两种
//!   执行器下表现一致。
//!
//! ## 协议（How）
//! - 蹦床模式：`Proceed` 首次轮询时登记“请求继续”并返回 `Pending`；驱动发现请求后把当前拦截器
//!   标记为等待中，继续调用后续拦截器；后续全部返回（或终止、失败、取消）后，驱动把结果写入投递槽
//!   并重新轮询等待者，`Proceed` 从投递槽取出结果；
//! - 直接模式：`Proceed` 直接持有嵌套的循环 Future（见 [`crate::direct`]）。
//! - 等待中的 `Proceed` 被丢弃（外层超时或 `select!` 先行完成）时记入放弃列表，驱动据此丢弃
//!   仍在运行的内层拦截器。
//!
//! ## 契约（What）
//! - 帧状态锁从不跨越拦截器调用持有；
//! - 同一时刻至多一个未被驱动消费的继续请求、至多一个未被取走的投递，违反即 panic。

use std::{
    borrow::Cow,
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use spin::Mutex;
use tracing::trace;

use crate::{
    cancellation::Cancellation,
    compiled::InterceptorChain,
    config::ExecutionMode,
    diagnostics::PendingFrame,
    direct,
    error::{PipelineError, Result},
    future::BoxFuture,
    interceptor::InterceptorEntry,
    phase::Phase,
};

const TARGET: &str = "spark_chain::engine";

pub(crate) struct Frame<S, C> {
    context: C,
    chain: InterceptorChain<S, C>,
    mode: ExecutionMode,
    trace_pending: bool,
    cancellation: Cancellation,
    state: Mutex<FrameState<S>>,
}

struct FrameState<S> {
    subject: S,
    cursor: usize,
    finished: bool,
    /// 尚未被驱动消费的继续请求，记录发起者序号。
    proceed_request: Option<usize>,
    /// 投递给某个等待者的结果。
    delivery: Option<(usize, Result<S>)>,
    /// 在等待中被放弃的 `proceed()`（例如外层超时先于剩余链完成），由驱动取走后回收内层。
    abandoned: Vec<usize>,
    /// 仍在 `proceed()` 中等待的拦截器序号，仅在追踪打开时维护。
    pending: Vec<usize>,
    /// 直接模式下正在执行的拦截器序号，栈顶即最内层。
    active: Vec<usize>,
}

/// 驱动从帧上取得的下一步动作。
pub(crate) enum Step<S, C> {
    Invoke {
        index: usize,
        entry: InterceptorEntry<S, C>,
        subject: S,
    },
    Resolve(Result<S>),
}

impl<S, C> Frame<S, C> {
    pub(crate) fn new(
        context: C,
        subject: S,
        chain: InterceptorChain<S, C>,
        mode: ExecutionMode,
        trace_pending: bool,
        cancellation: Cancellation,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            chain,
            mode,
            trace_pending,
            cancellation,
            state: Mutex::new(FrameState {
                subject,
                cursor: 0,
                finished: false,
                proceed_request: None,
                delivery: None,
                abandoned: Vec::new(),
                pending: Vec::new(),
                active: Vec::new(),
            }),
        })
    }

    pub(crate) fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub(crate) fn chain(&self) -> &InterceptorChain<S, C> {
        &self.chain
    }

    pub(crate) fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// 取走继续请求；返回 `true` 表示拦截器 `index` 正在等待 `proceed()`。
    pub(crate) fn take_proceed_request(&self, index: usize) -> bool {
        matches!(self.state.lock().proceed_request.take(), Some(requester) if requester == index)
    }

    pub(crate) fn clear_proceed_request(&self) {
        self.state.lock().proceed_request = None;
    }

    /// 把结果投递给等待者 `index`。
    ///
    /// # Panics
    /// - 上一次投递尚未被取走（同一等待者被恢复两次）。
    pub(crate) fn deliver(&self, index: usize, result: Result<S>) {
        let mut state = self.state.lock();
        assert!(
            state.delivery.is_none(),
            "pipeline frame resumed twice: previous result was never consumed"
        );
        state.delivery = Some((index, result));
    }

    /// 拦截器 `index` 是否放弃了仍在等待的 `proceed()`；查询即清除记录。
    pub(crate) fn take_abandoned(&self, index: usize) -> bool {
        let mut state = self.state.lock();
        let before = state.abandoned.len();
        state.abandoned.retain(|abandoned| *abandoned != index);
        state.abandoned.len() != before
    }

    /// 驱动自行丢弃拦截器后，清除它们留下的放弃记录。
    pub(crate) fn clear_abandoned(&self) {
        self.state.lock().abandoned.clear();
    }

    pub(crate) fn label_of(&self, index: usize) -> Cow<'static, str> {
        self.chain
            .get(index)
            .map(InterceptorEntry::label_cow)
            .unwrap_or(Cow::Borrowed("<unknown>"))
    }

    fn trace_enter(&self, state: &mut FrameState<S>, index: usize) {
        if self.trace_pending {
            state.pending.push(index);
        }
    }

    fn trace_leave(&self, state: &mut FrameState<S>, index: usize) {
        if self.trace_pending {
            if let Some(position) = state.pending.iter().rposition(|pending| *pending == index) {
                state.pending.remove(position);
            }
        }
    }

    pub(crate) fn enter_active(&self, index: usize) {
        self.state.lock().active.push(index);
    }

    pub(crate) fn leave_active(&self) {
        self.state.lock().active.pop();
    }

    pub(crate) fn innermost_active(&self) -> Option<usize> {
        self.state.lock().active.last().copied()
    }
}

impl<S: Clone, C> Frame<S, C> {
    /// 蹦床驱动的单步推进。
    pub(crate) fn next_step(&self) -> Step<S, C> {
        let mut state = self.state.lock();
        if self.cancellation.is_cancelled() {
            return Step::Resolve(Err(PipelineError::Cancelled));
        }
        if state.finished || state.cursor >= self.chain.len() {
            return Step::Resolve(Ok(state.subject.clone()));
        }
        let index = state.cursor;
        match self.chain.get(index) {
            Some(entry) => {
                state.cursor += 1;
                Step::Invoke {
                    index,
                    entry: entry.clone(),
                    subject: state.subject.clone(),
                }
            }
            None => Step::Resolve(Ok(state.subject.clone())),
        }
    }

    /// 直接执行器的单步推进：游标先自增再返回待调用的拦截器。
    pub(crate) fn advance(&self) -> Result<Option<(usize, InterceptorEntry<S, C>, S)>> {
        match self.next_step() {
            Step::Invoke {
                index,
                entry,
                subject,
            } => Ok(Some((index, entry, subject))),
            Step::Resolve(Err(error)) => Err(error),
            Step::Resolve(Ok(_)) => Ok(None),
        }
    }

    pub(crate) fn subject(&self) -> S {
        self.state.lock().subject.clone()
    }
}

/// 拦截器可见的执行句柄。
///
/// # 教案式说明
/// - **意图（Why）**：拦截器只需要四种能力：读上下文、读/换主体、继续、终止；句柄按值传入拦截器，
///   可以自由移动进 `async` 块。
/// - **契约（What）**：
///   - `proceed()` 执行剩余拦截器并返回它们作用后的主体；链已结束或已终止时立即返回当前主体；
///   - `finish()` 之后不再调用任何拦截器，仍在等待的外层拦截器以当前主体恢复；
///   - 句柄仅在所属执行期间有意义，执行结束后调用 `proceed()` 会直接返回当前主体。
pub struct PipelineContext<S, C> {
    frame: Arc<Frame<S, C>>,
    index: usize,
}

impl<S, C> PipelineContext<S, C> {
    pub(crate) fn new(frame: Arc<Frame<S, C>>, index: usize) -> Self {
        Self { frame, index }
    }

    /// 整次执行共享的只读上下文。
    pub fn context(&self) -> &C {
        &self.frame.context
    }

    /// 当前拦截器在全局顺序中的序号。
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> &str {
        self.frame
            .chain
            .get(self.index)
            .map_or("<unknown>", InterceptorEntry::label)
    }

    pub fn phase(&self) -> Option<&Phase> {
        self.frame.chain.get(self.index).map(InterceptorEntry::phase)
    }

    /// 借用当前主体，避免克隆。
    ///
    /// 闭包执行期间持有帧状态锁，闭包内不得再调用本句柄的任何方法。
    pub fn with_subject<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.frame.state.lock().subject)
    }

    /// 终止执行：后续拦截器不再被调用。
    pub fn finish(&self) {
        let mut state = self.frame.state.lock();
        if !state.finished {
            state.finished = true;
            trace!(target: TARGET, index = self.index, "pipeline finished early");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.frame.state.lock().finished
    }

    pub fn cancellation(&self) -> Cancellation {
        self.frame.cancellation.clone()
    }

    /// 当前仍在 `proceed()` 中等待的拦截器，由外到内排列。
    ///
    /// 追踪未打开时返回空列表。
    pub fn pending_frames(&self) -> Vec<PendingFrame> {
        if !self.frame.trace_pending {
            return Vec::new();
        }
        let Some(state) = self.frame.state.try_lock() else {
            return vec![PendingFrame::Unavailable];
        };
        state
            .pending
            .iter()
            .map(|index| match self.frame.chain.get(*index) {
                Some(entry) => PendingFrame::Interceptor {
                    index: *index,
                    label: entry.label_cow(),
                    phase: entry.phase().clone(),
                },
                None => PendingFrame::Unavailable,
            })
            .collect()
    }
}

impl<S: Clone, C> PipelineContext<S, C> {
    /// 当前主体的副本。
    pub fn subject(&self) -> S {
        self.frame.subject()
    }
}

impl<S, C> PipelineContext<S, C>
where
    S: Clone + Send + 'static,
    C: Send + Sync + 'static,
{
    /// 执行剩余拦截器。
    pub fn proceed(&self) -> Proceed<S, C> {
        Proceed::new(Arc::clone(&self.frame), self.index, None)
    }

    /// 替换主体后执行剩余拦截器。
    pub fn proceed_with(&self, subject: S) -> Proceed<S, C> {
        Proceed::new(Arc::clone(&self.frame), self.index, Some(subject))
    }
}

impl<S, C> Clone for PipelineContext<S, C> {
    fn clone(&self) -> Self {
        Self {
            frame: Arc::clone(&self.frame),
            index: self.index,
        }
    }
}

impl<S, C> fmt::Debug for PipelineContext<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("index", &self.index)
            .field("label", &self.label())
            .finish_non_exhaustive()
    }
}

enum ProceedState<S> {
    Start(Option<S>),
    Awaiting,
    Direct(BoxFuture<'static, Result<S>>),
    Done,
}

/// `proceed()` / `proceed_with()` 返回的 Future，输出剩余拦截器作用后的主体。
///
/// 必须在发起它的拦截器 Future 内部等待；丢弃它等同于放弃本次继续请求。
#[must_use = "proceed() does nothing unless awaited"]
pub struct Proceed<S, C> {
    frame: Arc<Frame<S, C>>,
    index: usize,
    state: ProceedState<S>,
}

impl<S, C> Unpin for Proceed<S, C> {}

impl<S, C> Proceed<S, C> {
    fn new(frame: Arc<Frame<S, C>>, index: usize, replacement: Option<S>) -> Self {
        Self {
            frame,
            index,
            state: ProceedState::Start(replacement),
        }
    }
}

impl<S, C> Future for Proceed<S, C>
where
    S: Clone + Send + 'static,
    C: Send + Sync + 'static,
{
    type Output = Result<S>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ProceedState::Start(replacement) => {
                    let replacement = replacement.take();
                    let frame = &this.frame;
                    let mut state = frame.state.lock();
                    if let Some(subject) = replacement {
                        state.subject = subject;
                    }
                    if frame.is_cancelled() {
                        this.state = ProceedState::Done;
                        return Poll::Ready(Err(PipelineError::Cancelled));
                    }
                    if state.finished || state.cursor >= frame.chain.len() {
                        let subject = state.subject.clone();
                        this.state = ProceedState::Done;
                        return Poll::Ready(Ok(subject));
                    }
                    frame.trace_enter(&mut state, this.index);
                    match frame.mode {
                        ExecutionMode::Trampoline => {
                            assert!(
                                state.proceed_request.is_none(),
                                "interceptor `{}` requested proceed() twice without awaiting the first call",
                                frame.label_of(this.index)
                            );
                            state.proceed_request = Some(this.index);
                            drop(state);
                            trace!(target: TARGET, index = this.index, "proceed requested");
                            this.state = ProceedState::Awaiting;
                            return Poll::Pending;
                        }
                        ExecutionMode::Direct => {
                            drop(state);
                            this.state =
                                ProceedState::Direct(direct::proceed_loop(Arc::clone(frame)));
                        }
                    }
                }
                ProceedState::Awaiting => {
                    let mut state = this.frame.state.lock();
                    let delivered = state
                        .delivery
                        .as_ref()
                        .is_some_and(|(target, _)| *target == this.index);
                    if !delivered {
                        return Poll::Pending;
                    }
                    let Some((_, result)) = state.delivery.take() else {
                        return Poll::Pending;
                    };
                    this.frame.trace_leave(&mut state, this.index);
                    drop(state);
                    this.state = ProceedState::Done;
                    return Poll::Ready(result);
                }
                ProceedState::Direct(inner) => {
                    let result = match inner.as_mut().poll(cx) {
                        Poll::Ready(result) => result,
                        Poll::Pending => return Poll::Pending,
                    };
                    this.frame.trace_leave(&mut this.frame.state.lock(), this.index);
                    this.state = ProceedState::Done;
                    return Poll::Ready(result);
                }
                ProceedState::Done => panic!("`Proceed` polled after completion"),
            }
        }
    }
}

impl<S, C> Drop for Proceed<S, C> {
    fn drop(&mut self) {
        match self.state {
            ProceedState::Awaiting => {
                let mut state = self.frame.state.lock();
                if state.proceed_request == Some(self.index) {
                    // 驱动尚未接手，请求作废即可。
                    state.proceed_request = None;
                } else {
                    state.abandoned.push(self.index);
                }
                if state
                    .delivery
                    .as_ref()
                    .is_some_and(|(target, _)| *target == self.index)
                {
                    state.delivery = None;
                }
                self.frame.trace_leave(&mut state, self.index);
            }
            ProceedState::Direct(_) => {
                let mut state = self.frame.state.lock();
                self.frame.trace_leave(&mut state, self.index);
            }
            ProceedState::Start(_) | ProceedState::Done => {}
        }
    }
}
