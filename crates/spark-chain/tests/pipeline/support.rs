use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use spark_chain::{Phase, Pipeline};

/// 记录拦截器调用轨迹的执行上下文，克隆后共享同一份轨迹。
#[derive(Clone, Debug, Default)]
pub struct Trail(Arc<Mutex<Vec<String>>>);

impl Trail {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("轨迹锁不应中毒").push(entry.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().expect("轨迹锁不应中毒").clone()
    }
}

pub type TrailPipeline = Pipeline<String, Trail>;

/// 记录标签后直接返回，依赖隐式继续。
pub fn pass_through(pipeline: &mut TrailPipeline, phase: &Phase, label: &'static str) {
    pipeline
        .intercept_labeled(phase, label, move |ctx, _subject| async move {
            ctx.context().push(label);
            Ok(())
        })
        .expect("阶段已注册");
}

/// 在 `proceed()` 前后各记录一次，模拟包裹式拦截器。
pub fn wrapping(pipeline: &mut TrailPipeline, phase: &Phase, label: &'static str) {
    pipeline
        .intercept_labeled(phase, label, move |ctx, _subject| async move {
            ctx.context().push(format!("{label}:enter"));
            let outcome = ctx.proceed().await;
            ctx.context().push(format!("{label}:exit"));
            outcome.map(|_| ())
        })
        .expect("阶段已注册");
}

/// 向主体追加后缀并继续。
pub fn appending(pipeline: &mut TrailPipeline, phase: &Phase, suffix: &'static str) {
    pipeline
        .intercept_labeled(phase, suffix, move |ctx, subject| async move {
            ctx.proceed_with(format!("{subject}{suffix}")).await?;
            Ok(())
        })
        .expect("阶段已注册");
}

/// 首次轮询返回 `Pending` 并立即唤醒，第二次轮询完成；用于制造一次真实挂起。
#[derive(Debug, Default)]
pub struct YieldOnce {
    yielded: bool,
}

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

pub fn yield_once() -> YieldOnce {
    YieldOnce::default()
}

/// 被丢弃时写入轨迹，用于观察挂起拦截器的资源释放。
pub struct DropProbe {
    trail: Trail,
    label: &'static str,
}

impl DropProbe {
    pub fn new(trail: &Trail, label: &'static str) -> Self {
        Self {
            trail: trail.clone(),
            label,
        }
    }
}

impl Drop for DropProbe {
    fn drop(&mut self) {
        self.trail.push(format!("{}:dropped", self.label));
    }
}
