//! # engine 模块说明
//!
//! ## 角色定位（Why）
//! - 拦截器可能在 `proceed()` 之前、之中、之后任意位置挂起；引擎既要保持同步调用/返回的语义，
//!   又不能随拦截器数量增长原生调用栈；
//! - [`Execution`] 是对外唯一的执行 Future，内部按配置选择蹦床驱动或直接循环。
//!
//! ## 蹦床驱动（How）
//! - 显式维护挂起续体栈：每个尚未返回的拦截器 Future 一层，`awaiting` 表示它正卡在 `proceed()`；
//! - 栈顶在等待（或栈为空）时推进游标调用下一个拦截器；否则轮询栈顶：
//!   - 同步完成：出栈，隐式继续；
//!   - 失败：出栈，把错误投递给下一层等待者；到达根部则作为执行结果返回；
//!   - 挂起且登记了继续请求：标记等待，继续循环；
//!   - 真正挂起：由外到内轮询等待中的拦截器（它们可能把 `proceed()` 与超时等 Future 组合），
//!     某层先行完成或放弃 `proceed()` 时丢弃其内层，否则把 `Pending` 交还给外层运行时。
//! - 链结束或被终止时，把当前主体逐层投递给等待者；没有任何挂起时首轮轮询即完成。
//!
//! ## 取消（What）
//! - 每次轮询把 waker 登记到取消令牌；首次观察到取消时丢弃正在等待外部工作的栈顶拦截器，
//!   其余等待者依次以 [`PipelineError::Cancelled`] 恢复，可在作用域内完成清理。

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tracing::{debug, trace};

use crate::{
    cancellation::Cancellation,
    config::ExecutionMode,
    context::{Frame, PipelineContext, Step},
    direct,
    error::{PipelineError, Result},
    future::BoxFuture,
};

const TARGET: &str = "spark_chain::engine";

struct PendingLevel {
    index: usize,
    future: BoxFuture<'static, Result<()>>,
    awaiting: bool,
}

struct Trampoline {
    stack: Vec<PendingLevel>,
    cancel_observed: bool,
}

/// 轮询等待者的结果。
enum Scan<S> {
    /// 没有等待者取得进展。
    Idle,
    /// 栈结构已变化，驱动循环需要重新推进。
    Changed,
    /// 失败到达根部，执行结束。
    Finished(Result<S>),
}

enum Driver<S> {
    Trampoline(Trampoline),
    Direct(Option<BoxFuture<'static, Result<S>>>),
    Done,
}

/// 一次执行的 Future，输出最终主体或沿链传播出的错误。
///
/// # 契约
/// - 完成后再次轮询会 panic；
/// - 丢弃 `Execution` 会同步丢弃所有尚未返回的拦截器 Future。
#[must_use = "pipeline execution does nothing unless polled"]
pub struct Execution<S, C> {
    frame: Arc<Frame<S, C>>,
    driver: Driver<S>,
}

impl<S, C> Unpin for Execution<S, C> {}

impl<S, C> Execution<S, C>
where
    S: Clone + Send + 'static,
    C: Send + Sync + 'static,
{
    pub(crate) fn start(frame: Arc<Frame<S, C>>) -> Self {
        let driver = match frame.mode() {
            ExecutionMode::Trampoline => Driver::Trampoline(Trampoline {
                stack: Vec::new(),
                cancel_observed: false,
            }),
            ExecutionMode::Direct => {
                Driver::Direct(Some(direct::proceed_loop(Arc::clone(&frame))))
            }
        };
        trace!(
            target: TARGET,
            interceptors = frame.chain().len(),
            mode = ?frame.mode(),
            "execution started"
        );
        Self { frame, driver }
    }
}

impl<S, C> Execution<S, C> {
    /// 本次执行的取消令牌。
    pub fn cancellation(&self) -> Cancellation {
        self.frame.cancellation().clone()
    }

    /// 挂起续体栈当前深度（直接模式与已完成时为 0）。
    pub fn pending_depth(&self) -> usize {
        match &self.driver {
            Driver::Trampoline(trampoline) => trampoline.stack.len(),
            Driver::Direct(_) | Driver::Done => 0,
        }
    }
}

impl<S, C> Future for Execution<S, C>
where
    S: Clone + Send + 'static,
    C: Send + Sync + 'static,
{
    type Output = Result<S>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let frame = &this.frame;
        frame.cancellation().register(cx.waker());

        let output = match &mut this.driver {
            Driver::Trampoline(trampoline) => trampoline.poll(frame, cx),
            Driver::Direct(root) => {
                if frame.is_cancelled() {
                    if root.take().is_some() {
                        debug!(target: TARGET, "direct execution cancelled");
                    }
                    Poll::Ready(Err(PipelineError::Cancelled))
                } else {
                    match root {
                        Some(future) => future.as_mut().poll(cx),
                        None => Poll::Ready(Err(PipelineError::Cancelled)),
                    }
                }
            }
            Driver::Done => panic!("pipeline execution polled after completion"),
        };

        if output.is_ready() {
            this.driver = Driver::Done;
        }
        output
    }
}

impl Trampoline {
    fn poll<S, C>(&mut self, frame: &Arc<Frame<S, C>>, cx: &mut Context<'_>) -> Poll<Result<S>>
    where
        S: Clone + Send + 'static,
        C: Send + Sync + 'static,
    {
        loop {
            if !self.cancel_observed && frame.is_cancelled() {
                self.cancel_observed = true;
                if self.stack.last().is_some_and(|level| !level.awaiting) {
                    if let Some(level) = self.stack.pop() {
                        debug!(
                            target: TARGET,
                            index = level.index,
                            label = %frame.label_of(level.index),
                            "cancellation dropped suspended interceptor"
                        );
                    }
                    frame.clear_proceed_request();
                    frame.clear_abandoned();
                }
            }

            if self.stack.last().is_none_or(|level| level.awaiting) {
                match frame.next_step() {
                    Step::Invoke {
                        index,
                        entry,
                        subject,
                    } => {
                        trace!(target: TARGET, index, label = entry.label(), "invoking interceptor");
                        let ctx = PipelineContext::new(Arc::clone(frame), index);
                        let future = entry.intercept(ctx, subject);
                        self.stack.push(PendingLevel {
                            index,
                            future,
                            awaiting: false,
                        });
                    }
                    Step::Resolve(result) => match self.stack.last_mut() {
                        None => return Poll::Ready(result),
                        Some(level) => {
                            trace!(
                                target: TARGET,
                                index = level.index,
                                ok = result.is_ok(),
                                "resuming pending proceed"
                            );
                            level.awaiting = false;
                            frame.deliver(level.index, result);
                        }
                    },
                }
                continue;
            }

            let Some(level) = self.stack.last_mut() else {
                continue;
            };
            let index = level.index;
            match level.future.as_mut().poll(cx) {
                Poll::Ready(result) => {
                    self.stack.pop();
                    if let Some(output) = self.complete(frame, index, result) {
                        return Poll::Ready(output);
                    }
                }
                Poll::Pending => {
                    if frame.take_proceed_request(index) {
                        level.awaiting = true;
                        continue;
                    }
                    match self.poll_awaiting(frame, cx) {
                        Scan::Changed => continue,
                        Scan::Finished(output) => return Poll::Ready(output),
                        Scan::Idle => {
                            trace!(target: TARGET, index, depth = self.stack.len(), "interceptor suspended");
                            return Poll::Pending;
                        }
                    }
                }
            }
        }
    }

    /// 处理已出栈拦截器的返回：成功即隐式继续；失败投递给下一层等待者，到达根部则结束执行。
    fn complete<S, C>(
        &mut self,
        frame: &Arc<Frame<S, C>>,
        index: usize,
        result: Result<()>,
    ) -> Option<Result<S>>
    where
        S: Clone + Send + 'static,
        C: Send + Sync + 'static,
    {
        frame.clear_proceed_request();
        let error = match result {
            Ok(()) => return None,
            Err(error) => error,
        };
        match self.stack.last_mut() {
            None => {
                debug!(target: TARGET, index, code = error.code(), "execution failed");
                Some(Err(error))
            }
            Some(parent) => {
                assert!(
                    parent.awaiting,
                    "interceptor #{} resumed with a failure but was never suspended in proceed()",
                    parent.index
                );
                debug!(
                    target: TARGET,
                    index,
                    resumed = parent.index,
                    code = error.code(),
                    "failure delivered to pending proceed"
                );
                parent.awaiting = false;
                frame.deliver(parent.index, Err(error));
                None
            }
        }
    }

    /// 栈顶真正挂起后，由外到内轮询仍在 `proceed()` 中等待的拦截器。
    ///
    /// 某层完成（例如超时先于剩余链触发）时丢弃其全部内层并按普通返回处理；某层放弃 `proceed()`
    /// 但仍未完成时同样丢弃内层，它自身成为新的栈顶。
    fn poll_awaiting<S, C>(&mut self, frame: &Arc<Frame<S, C>>, cx: &mut Context<'_>) -> Scan<S>
    where
        S: Clone + Send + 'static,
        C: Send + Sync + 'static,
    {
        let top = self.stack.len().saturating_sub(1);
        for depth in 0..top {
            let level = &mut self.stack[depth];
            if !level.awaiting {
                continue;
            }
            let index = level.index;
            let polled = level.future.as_mut().poll(cx);
            let abandoned = frame.take_abandoned(index);
            match polled {
                Poll::Pending if !abandoned => {}
                Poll::Pending => {
                    let awaiting = frame.take_proceed_request(index);
                    self.unwind_above(frame, depth);
                    self.stack[depth].awaiting = awaiting;
                    return if awaiting { Scan::Changed } else { Scan::Idle };
                }
                Poll::Ready(result) => {
                    self.unwind_above(frame, depth);
                    self.stack.pop();
                    return match self.complete(frame, index, result) {
                        Some(output) => Scan::Finished(output),
                        None => Scan::Changed,
                    };
                }
            }
        }
        Scan::Idle
    }

    /// 由内到外丢弃 `depth` 之上的全部层。
    fn unwind_above<S, C>(&mut self, frame: &Arc<Frame<S, C>>, depth: usize) {
        while self.stack.len() > depth + 1 {
            if let Some(level) = self.stack.pop() {
                debug!(
                    target: TARGET,
                    index = level.index,
                    label = %frame.label_of(level.index),
                    "outer interceptor moved on, inner interceptor dropped"
                );
            }
        }
        frame.clear_abandoned();
    }
}

impl<S, C> fmt::Debug for Execution<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.driver {
            Driver::Trampoline(_) => "trampoline",
            Driver::Direct(_) => "direct",
            Driver::Done => "done",
        };
        f.debug_struct("Execution")
            .field("driver", &state)
            .field("pending_depth", &self.pending_depth())
            .finish_non_exhaustive()
    }
}
