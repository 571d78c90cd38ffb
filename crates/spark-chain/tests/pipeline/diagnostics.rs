use std::task::Poll;

use futures::{FutureExt, executor::block_on};
use spark_chain::{
    ExecutionMode, PendingFrame, Phase, PipelineConfig, PipelineError, error::codes,
};
use tracing_test::traced_test;

use super::support::{Trail, TrailPipeline, pass_through, wrapping, yield_once};

/// 记录当前挂起帧标签的拦截器。
fn pending_probe(pipeline: &mut TrailPipeline, phase: &Phase) {
    pipeline
        .intercept_labeled(phase, "probe", |ctx, _subject| async move {
            let frames: Vec<String> = ctx
                .pending_frames()
                .iter()
                .map(|frame| match frame {
                    PendingFrame::Interceptor { label, .. } => label.to_string(),
                    PendingFrame::Unavailable => "<unavailable>".to_owned(),
                })
                .collect();
            ctx.context().push(frames.join(","));
            Ok(())
        })
        .expect("阶段已注册");
}

fn traced_pipeline(mode: ExecutionMode) -> TrailPipeline {
    let setup = Phase::new("Setup");
    let call = Phase::new("Call");
    let mut pipeline = TrailPipeline::with_phases([setup.clone(), call.clone()]).with_config(
        PipelineConfig::default()
            .with_mode(mode)
            .with_trace_pending(true),
    );
    wrapping(&mut pipeline, &setup, "outer");
    pass_through(&mut pipeline, &setup, "plain");
    wrapping(&mut pipeline, &call, "inner");
    pending_probe(&mut pipeline, &call);
    pipeline
}

#[test]
fn display_lists_phases_with_handler_counts() {
    let setup = Phase::new("Setup");
    let call = Phase::new("Call");
    let mut pipeline = TrailPipeline::with_phases([setup.clone(), call.clone()]);
    pass_through(&mut pipeline, &call, "a");
    pass_through(&mut pipeline, &call, "b");

    assert_eq!(
        pipeline.to_string(),
        "Phase `Setup`, 0 handlers\nPhase `Call`, 2 handlers\n"
    );

    let summary = pipeline.summary();
    assert_eq!(summary.len(), 2);
    assert_eq!(summary[1].phase, call);
    assert_eq!(summary[1].interceptors, ["a", "b"]);
}

/// 打开追踪后，拦截器可以看到仍在 `proceed()` 中等待的外层拦截器。
#[test]
fn pending_frames_list_outstanding_proceeds() {
    for mode in [ExecutionMode::Trampoline, ExecutionMode::Direct] {
        let pipeline = traced_pipeline(mode);
        let trail = Trail::default();
        block_on(pipeline.execute(trail.clone(), String::new())).expect("执行应成功");
        assert_eq!(
            trail.snapshot(),
            ["outer:enter", "plain", "inner:enter", "outer,inner", "inner:exit", "outer:exit"],
            "模式 {mode:?} 下挂起帧轨迹不符"
        );
    }
}

#[test]
fn pending_frames_are_empty_without_tracing() {
    let call = Phase::new("Call");
    let mut pipeline = TrailPipeline::with_phases([call.clone()]);
    wrapping(&mut pipeline, &call, "outer");
    pending_probe(&mut pipeline, &call);

    let trail = Trail::default();
    block_on(pipeline.execute(trail.clone(), String::new())).expect("执行应成功");
    assert_eq!(trail.snapshot(), ["outer:enter", "", "outer:exit"]);
}

/// 非挂起执行器遇到真正挂起时报告最内层的拦截器。
#[test]
fn direct_executor_reports_unexpected_suspension() {
    let call = Phase::new("Call");
    let mut pipeline = TrailPipeline::with_phases([call.clone()]);
    wrapping(&mut pipeline, &call, "outer");
    pipeline
        .intercept_labeled(&call, "sleepy", |_ctx, _subject| async move {
            yield_once().await;
            Ok(())
        })
        .expect("阶段已注册");

    let error = pipeline
        .execute_direct(Trail::default(), String::new())
        .unwrap_err();
    assert_eq!(error.code(), codes::UNEXPECTED_SUSPENSION);
    assert!(
        matches!(&error, PipelineError::UnexpectedSuspension { label } if label == "sleepy"),
        "应报告挂起的拦截器，实际为 {error}"
    );
}

#[test]
#[should_panic(expected = "polled after completion")]
fn polling_a_completed_execution_panics() {
    let pipeline = TrailPipeline::new();
    let mut execution = pipeline.execute(Trail::default(), String::new());
    let waker = futures::task::noop_waker();
    let mut cx = std::task::Context::from_waker(&waker);
    assert!(matches!(execution.poll_unpin(&mut cx), Poll::Ready(Ok(_))));
    let _ = execution.poll_unpin(&mut cx);
}

#[test]
fn config_loaded_from_toml_selects_executor() {
    let config = PipelineConfig::from_toml_str("mode = \"direct\"\ntrace_pending = true\n")
        .expect("合法配置应解析成功");
    let pipeline = TrailPipeline::new().with_config(config);
    assert_eq!(pipeline.config().mode, ExecutionMode::Direct);
    assert!(pipeline.config().trace_pending);
}

/// 编译与执行过程输出结构化日志，便于按 target 过滤。
#[traced_test]
#[test]
fn registration_and_execution_emit_structured_logs() {
    let call = Phase::new("Call");
    let mut pipeline = TrailPipeline::with_phases([call.clone()]);
    pass_through(&mut pipeline, &call, "a");
    pipeline
        .intercept_labeled(&call, "failing", |_ctx, _subject| async move {
            Err(PipelineError::failure("boom"))
        })
        .expect("阶段已注册");

    let outcome = pipeline
        .execute(Trail::default(), String::new())
        .now_or_never()
        .expect("同步链必须在首次轮询完成");
    assert!(outcome.is_err());

    assert!(logs_contain("phase appended"));
    assert!(logs_contain("compiled order rebuilt"));
    assert!(logs_contain("execution failed"));
    assert!(logs_contain(codes::INTERCEPTOR_FAILED));
}
