use std::{future::Future, pin::Pin};

/// `BoxFuture` 是拦截器与执行链之间传递异步工作的统一包装。
///
/// # 契约说明（What）
/// - 约束 Future 为 `Send + 'a`，可安全跨线程；
/// - `Pin<Box<_>>` 本身满足 `Unpin`，挂起续体栈可以直接以 `Vec` 存放。
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
