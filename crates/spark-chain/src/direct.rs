//! 非挂起参考执行器：扁平 `while` 循环逐个调用拦截器，`proceed()` 以嵌套循环实现。
//!
//! 没有拦截器真正挂起时，它与蹦床驱动在调用顺序、主体替换、终止与失败传播上完全一致，
//! 可作为执行语义的可执行说明，也用于确定性追踪。

use std::{
    sync::Arc,
    task::{Context, Poll},
};

use futures::task::noop_waker_ref;
use tracing::debug;

use crate::{
    context::{Frame, PipelineContext},
    error::{PipelineError, Result},
    future::BoxFuture,
};

const TARGET: &str = "spark_chain::engine";

/// 从帧的当前游标开始执行到链尾（或终止），返回最终主体。
pub(crate) fn proceed_loop<S, C>(frame: Arc<Frame<S, C>>) -> BoxFuture<'static, Result<S>>
where
    S: Clone + Send + 'static,
    C: Send + Sync + 'static,
{
    Box::pin(async move {
        while let Some((index, entry, subject)) = frame.advance()? {
            frame.enter_active(index);
            let outcome = entry
                .intercept(PipelineContext::new(Arc::clone(&frame), index), subject)
                .await;
            frame.leave_active();
            outcome?;
        }
        Ok::<S, PipelineError>(frame.subject())
    })
}

/// 以空 waker 轮询一次；仍未完成即视为拦截器在非挂起执行器中挂起。
pub(crate) fn run_to_completion<S, C>(frame: Arc<Frame<S, C>>) -> Result<S>
where
    S: Clone + Send + 'static,
    C: Send + Sync + 'static,
{
    let mut root = proceed_loop(Arc::clone(&frame));
    let mut cx = Context::from_waker(noop_waker_ref());
    match root.as_mut().poll(&mut cx) {
        Poll::Ready(result) => result,
        Poll::Pending => {
            let label = frame
                .innermost_active()
                .map(|index| frame.label_of(index))
                .unwrap_or_else(|| "<unknown>".into());
            debug!(target: TARGET, label = %label, "interceptor suspended in direct executor");
            drop(root);
            Err(PipelineError::UnexpectedSuspension { label })
        }
    }
}
