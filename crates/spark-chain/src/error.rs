//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 执行链只对外暴露一种错误类型 [`PipelineError`]，覆盖“注册期错误”“拦截器失败”“取消”
//!   以及“非挂起执行器中出现挂起”四类语义；
//! - 每个变体都映射到稳定错误码（见 [`codes`]），采用 `<域>.<语义>` 命名，
//!   便于日志与告警直接按码聚合。
//!
//! ## 设计要求（What）
//! - 拦截器失败保留原始错误作为 `source`，调用方可以通过 [`PipelineError::downcast_ref`]
//!   还原出拦截器抛出的“同一个”错误；
//! - 引擎自身从不吞掉错误，所有重试、降级都由拦截器或外层框架负责。

use std::{borrow::Cow, error::Error, fmt};

use thiserror::Error;

use crate::phase::Phase;

/// 稳定错误码集合。
pub mod codes {
    /// 引用了未注册到当前 Pipeline 的阶段。
    pub const INVALID_PHASE: &str = "pipeline.invalid_phase";
    /// 拦截器（或其等待的异步操作）返回失败。
    pub const INTERCEPTOR_FAILED: &str = "pipeline.interceptor_failed";
    /// 执行被取消。
    pub const CANCELLED: &str = "pipeline.cancelled";
    /// 拦截器在非挂起执行器中真正挂起。
    pub const UNEXPECTED_SUSPENSION: &str = "pipeline.unexpected_suspension";
}

/// `ErrorCause` 封装拦截器抛出的底层原因，保持 `Send + Sync` 以便跨线程传递。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// crate 统一的返回值别名，默认错误类型为 [`PipelineError`]。
pub type Result<T, E = PipelineError> = core::result::Result<T, E>;

/// 执行链错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：注册期错误必须在注册调用处立即暴露，运行期失败则沿挂起续体栈传播；
///   两者共用一个枚举，使拦截器内部可以统一使用 `?`。
/// - **契约 (What)**：
///   - `InvalidPhase` 仅由 `insert_phase_*`、`intercept*`、`phase_interceptors` 返回；
///   - `Interceptor` 包装拦截器自身的失败，`source()` 指向原始错误；
///   - `Cancelled` 由取消令牌触发，可通过 [`Self::is_cancelled`] 与普通失败区分；
///   - `UnexpectedSuspension` 只会出现在 `execute_direct` 中。
/// - **风险 (Trade-offs)**：错误本身不可 `Clone`；引擎向多个等待者传递取消时会为每个等待者
///   构造新的 `Cancelled` 实例。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// 引用的阶段未注册。
    #[error("phase `{phase}` was not registered for this pipeline")]
    InvalidPhase { phase: Phase },

    /// 拦截器执行失败。
    #[error("interceptor failed: {source}")]
    Interceptor {
        #[source]
        source: ErrorCause,
    },

    /// 执行被取消。
    #[error("pipeline execution was cancelled")]
    Cancelled,

    /// 非挂起执行器中出现了真正的挂起。
    #[error("interceptor `{label}` suspended inside the non-suspending executor")]
    UnexpectedSuspension { label: Cow<'static, str> },
}

impl PipelineError {
    /// 将任意错误包装为拦截器失败。
    pub fn interceptor(cause: impl Error + Send + Sync + 'static) -> Self {
        PipelineError::Interceptor {
            source: Box::new(cause),
        }
    }

    /// 以纯文本描述构造拦截器失败，常用于测试或快速原型。
    pub fn failure(message: impl Into<Cow<'static, str>>) -> Self {
        PipelineError::interceptor(FailureMessage(message.into()))
    }

    pub(crate) fn invalid_phase(phase: &Phase) -> Self {
        PipelineError::InvalidPhase {
            phase: phase.clone(),
        }
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidPhase { .. } => codes::INVALID_PHASE,
            PipelineError::Interceptor { .. } => codes::INTERCEPTOR_FAILED,
            PipelineError::Cancelled => codes::CANCELLED,
            PipelineError::UnexpectedSuspension { .. } => codes::UNEXPECTED_SUSPENSION,
        }
    }

    /// 判断是否为取消信号，清理逻辑可据此抑制重复的错误上报。
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }

    /// 返回拦截器失败的原始原因。
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            PipelineError::Interceptor { source } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// 将原始原因向下转型为具体错误类型。
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.cause().and_then(|cause| cause.downcast_ref::<E>())
    }
}

/// `PipelineError::failure` 使用的纯文本原因。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureMessage(Cow<'static, str>);

impl FailureMessage {
    /// 获取描述文本。
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FailureMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for FailureMessage {}
