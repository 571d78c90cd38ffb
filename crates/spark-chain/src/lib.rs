#![deny(unsafe_code)]
#![doc = "spark-chain: 阶段化、可挂起、可合并的拦截器执行链。"]
#![doc = ""]
#![doc = "== 定位 =="]
#![doc = "上层特性（认证、日志、CORS、压缩、路由）把拦截器注册到 Pipeline 的命名阶段；本 crate 保证确定的全局顺序，以及统一的继续 / 替换 / 终止 / 失败协议。"]
#![doc = "拦截器可以在任意位置执行异步 I/O 而挂起，执行引擎以显式续体栈 + 蹦床循环保持同步调用语义，原生调用栈不随拦截器数量增长。"]
#![doc = ""]
#![doc = "== 非目标 =="]
#![doc = "不是任务调度器，不是线程池，也不做网络 I/O；只定义一个逻辑工作单元如何流经一组有序、可变的处理器。"]

//! # 快速上手
//!
//! ```
//! use spark_chain::{Phase, Pipeline};
//!
//! let setup = Phase::new("Setup");
//! let call = Phase::new("Call");
//! let mut pipeline: Pipeline<String, ()> = Pipeline::with_phases([setup.clone(), call.clone()]);
//!
//! pipeline
//!     .intercept(&call, |ctx, subject| async move {
//!         ctx.proceed_with(format!("{subject} -> call")).await?;
//!         Ok(())
//!     })
//!     .unwrap();
//! pipeline
//!     .intercept(&setup, |ctx, subject| async move {
//!         ctx.proceed_with(format!("{subject} -> setup")).await?;
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! let output = futures::executor::block_on(pipeline.execute((), "request".to_owned())).unwrap();
//! assert_eq!(output, "request -> setup -> call");
//! ```

mod attributes;
mod cancellation;
mod compiled;
mod config;
mod context;
mod diagnostics;
mod direct;
mod engine;
pub mod error;
mod future;
mod interceptor;
mod list;
mod phase;
mod pipeline;

pub use attributes::{AttributeKey, Attributes};
pub use cancellation::Cancellation;
pub use compiled::InterceptorChain;
pub use config::{ConfigError, ExecutionMode, PipelineConfig};
pub use context::{PipelineContext, Proceed};
pub use diagnostics::{PendingFrame, PhaseSummary};
pub use engine::Execution;
pub use error::{ErrorCause, PipelineError, Result};
pub use future::BoxFuture;
pub use interceptor::{FnInterceptor, Interceptor, InterceptorEntry, from_fn};
pub use phase::{Phase, PhaseRelation};
pub use pipeline::Pipeline;
