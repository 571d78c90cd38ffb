use std::{borrow::Cow, fmt, future::Future, sync::Arc};

use crate::{context::PipelineContext, error::Result, future::BoxFuture, phase::Phase};

/// 拦截器：Pipeline 中的最小处理单元。
///
/// # 教案式说明
/// - **意图（Why）**：认证、日志、压缩等特性只需要“拿到当前主体与执行上下文，决定继续、替换、
///   终止或失败”，统一成一个 trait 便于以 `Arc<dyn Interceptor>` 共享到多个 Pipeline。
/// - **逻辑（How）**：`intercept` 返回 `'static` 的 [`BoxFuture`]；执行器把它放进挂起续体栈，
///   Future 内部可以 `ctx.proceed().await` 等待后续拦截器完成。
/// - **契约（What）**：
///   - 返回 `Ok(())` 且未调用 `proceed`/`finish` 时，执行链自动继续下一个拦截器；
///   - 返回 `Err` 时错误投递给最近一个仍在等待 `proceed()` 的外层拦截器；
///   - `proceed()` 得到的 Future 必须在本拦截器的 Future 内部等待，不能转交给其他任务。
/// - **风险（Trade-offs）**：每次调用都会装箱一个 Future；对极热路径可直接实现该 trait 并复用
///   预先装箱的状态机。
pub trait Interceptor<S, C>: Send + Sync + 'static {
    fn intercept(&self, ctx: PipelineContext<S, C>, subject: S) -> BoxFuture<'static, Result<()>>;
}

/// 把闭包适配为 [`Interceptor`]。
pub struct FnInterceptor<F>(pub F);

impl<S, C, F, Fut> Interceptor<S, C> for FnInterceptor<F>
where
    F: Fn(PipelineContext<S, C>, S) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn intercept(&self, ctx: PipelineContext<S, C>, subject: S) -> BoxFuture<'static, Result<()>> {
        Box::pin((self.0)(ctx, subject))
    }
}

/// 把闭包装箱为可共享的拦截器，便于同一实例注册到多个 Pipeline。
pub fn from_fn<S, C, F, Fut>(f: F) -> Arc<dyn Interceptor<S, C>>
where
    S: 'static,
    C: 'static,
    F: Fn(PipelineContext<S, C>, S) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnInterceptor(f))
}

/// 已注册的拦截器条目：标签、所属阶段与处理器本体。
pub struct InterceptorEntry<S, C> {
    label: Cow<'static, str>,
    phase: Phase,
    handler: Arc<dyn Interceptor<S, C>>,
}

impl<S, C> InterceptorEntry<S, C> {
    pub(crate) fn new(
        label: Cow<'static, str>,
        phase: Phase,
        handler: Arc<dyn Interceptor<S, C>>,
    ) -> Self {
        Self {
            label,
            phase,
            handler,
        }
    }

    /// 诊断标签。
    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn label_cow(&self) -> Cow<'static, str> {
        self.label.clone()
    }

    /// 注册时所属的阶段。
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// 判断两个条目是否指向同一个处理器实例。
    pub fn same_handler(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.handler, &other.handler)
    }

    pub(crate) fn intercept(
        &self,
        ctx: PipelineContext<S, C>,
        subject: S,
    ) -> BoxFuture<'static, Result<()>>
    where
        S: 'static,
        C: 'static,
    {
        self.handler.intercept(ctx, subject)
    }
}

impl<S, C> Clone for InterceptorEntry<S, C> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            phase: self.phase.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<S, C> fmt::Debug for InterceptorEntry<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorEntry")
            .field("label", &self.label)
            .field("phase", &self.phase)
            .finish()
    }
}
