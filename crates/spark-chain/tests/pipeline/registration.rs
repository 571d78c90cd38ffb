use spark_chain::{
    AttributeKey, Phase, PhaseRelation, Pipeline, PipelineError, error::codes, from_fn,
};

use super::support::{Trail, TrailPipeline, pass_through};

/// 阶段按身份比较：同名阶段互不干扰。
#[test]
fn same_named_phases_stay_distinct() {
    let first = Phase::new("Call");
    let second = Phase::new("Call");
    let mut pipeline = TrailPipeline::with_phases([first.clone(), second.clone()]);

    pass_through(&mut pipeline, &first, "a");

    assert_eq!(pipeline.phases().len(), 2, "同名阶段应各自占据槽位");
    assert_eq!(
        pipeline.phase_interceptors(&first).expect("已注册").labels(),
        ["a"]
    );
    assert!(
        pipeline
            .phase_interceptors(&second)
            .expect("已注册")
            .is_empty(),
        "注册到第一个阶段的拦截器不得出现在第二个阶段"
    );
}

#[test]
fn add_phase_is_idempotent() {
    let call = Phase::new("Call");
    let mut pipeline = TrailPipeline::new();
    pipeline.add_phase(call.clone());
    pipeline.add_phase(call.clone());
    assert_eq!(pipeline.phases(), [call]);
}

#[test]
fn relative_insertion_places_phases_around_reference() {
    let setup = Phase::new("Setup");
    let call = Phase::new("Call");
    let auth = Phase::new("Auth");
    let render = Phase::new("Render");
    let mut pipeline = TrailPipeline::with_phases([setup.clone(), call.clone()]);

    pipeline
        .insert_phase_before(&call, auth.clone())
        .expect("Call 已注册");
    pipeline
        .insert_phase_after(&setup, render.clone())
        .expect("Setup 已注册");

    assert_eq!(
        pipeline.phases(),
        [setup.clone(), render.clone(), auth.clone(), call.clone()]
    );

    let relations: Vec<_> = pipeline
        .summary()
        .into_iter()
        .map(|summary| summary.relation)
        .collect();
    assert_eq!(
        relations,
        [
            PhaseRelation::Last,
            PhaseRelation::After(setup),
            PhaseRelation::Before(call),
            PhaseRelation::Last,
        ]
    );
}

#[test]
fn inserting_an_existing_phase_is_a_no_op() {
    let setup = Phase::new("Setup");
    let call = Phase::new("Call");
    let mut pipeline = TrailPipeline::with_phases([setup.clone(), call.clone()]);

    pipeline
        .insert_phase_before(&setup, call.clone())
        .expect("已存在的阶段应直接忽略");
    assert_eq!(pipeline.phases(), [setup, call]);
}

#[test]
fn unregistered_reference_is_rejected() {
    let call = Phase::new("Call");
    let missing = Phase::new("Missing");
    let mut pipeline = TrailPipeline::with_phases([call]);

    let error = pipeline
        .insert_phase_after(&missing, Phase::new("Late"))
        .unwrap_err();
    assert_eq!(error.code(), codes::INVALID_PHASE);
    assert!(matches!(error, PipelineError::InvalidPhase { ref phase } if *phase == missing));
    assert_eq!(pipeline.phases().len(), 1, "失败的插入不得改变阶段列表");
}

#[test]
fn intercepting_an_unregistered_phase_fails_immediately() {
    let mut pipeline = TrailPipeline::with_phases([Phase::new("Call")]);
    let stray = Phase::new("Stray");

    let error = pipeline
        .intercept(&stray, |_ctx, _subject| async { Ok(()) })
        .unwrap_err();
    assert_eq!(error.code(), codes::INVALID_PHASE);
    assert!(pipeline.is_empty());
    assert!(pipeline.phase_interceptors(&stray).is_err());
}

/// 阶段与拦截器都按注册顺序排列，跨阶段按阶段顺序。
#[test]
fn compiled_order_follows_phase_then_registration_order() {
    let before = Phase::new("Before");
    let call = Phase::new("Call");
    let after = Phase::new("After");
    let mut pipeline = TrailPipeline::with_phases([before.clone(), call.clone(), after.clone()]);

    pass_through(&mut pipeline, &after, "z");
    pass_through(&mut pipeline, &call, "b");
    pass_through(&mut pipeline, &before, "a");
    pass_through(&mut pipeline, &call, "c");

    assert_eq!(pipeline.compiled_order().labels(), ["a", "b", "c", "z"]);
    assert_eq!(pipeline.interceptor_count(), 4);
}

/// `[Before, Call, After]` + Call 中的 `a`，在 Call 前插入 Auth 并注册 `b`。
#[test]
fn auth_inserted_before_call_runs_first() {
    let before = Phase::new("Before");
    let call = Phase::new("Call");
    let after = Phase::new("After");
    let auth = Phase::new("Auth");
    let mut pipeline = TrailPipeline::with_phases([before, call.clone(), after.clone()]);

    pass_through(&mut pipeline, &call, "a");
    pipeline
        .insert_phase_before(&call, auth.clone())
        .expect("Call 已注册");
    pass_through(&mut pipeline, &auth, "b");
    assert_eq!(pipeline.compiled_order().labels(), ["b", "a"]);

    let mut extension = TrailPipeline::with_phases([after.clone()]);
    pass_through(&mut extension, &after, "c");
    pipeline.merge(&extension);
    assert_eq!(pipeline.compiled_order().labels(), ["b", "a", "c"]);

    let trail = Trail::default();
    futures::executor::block_on(pipeline.execute(trail.clone(), String::new()))
        .expect("执行应成功");
    assert_eq!(trail.snapshot(), ["b", "a", "c"]);
}

#[test]
fn phases_without_interceptors_keep_pipeline_empty() {
    let pipeline = TrailPipeline::with_phases([Phase::new("Setup"), Phase::new("Call")]);
    assert!(pipeline.is_empty());
    assert!(pipeline.compiled_order().is_empty());
}

/// 同一处理器实例可以注册到多个 Pipeline。
#[test]
fn shared_handler_is_reused_across_pipelines() {
    let call = Phase::new("Call");
    let handler = from_fn(|ctx: spark_chain::PipelineContext<String, Trail>, _subject| async move {
        ctx.context().push("shared");
        Ok(())
    });

    let first: TrailPipeline = Pipeline::with_interceptors(call.clone(), [handler.clone()]);
    let mut second = TrailPipeline::with_phases([call.clone()]);
    second
        .intercept_handler(&call, handler)
        .expect("阶段已注册");

    let first_order = first.compiled_order();
    let second_order = second.compiled_order();
    let (Some(left), Some(right)) = (first_order.get(0), second_order.get(0)) else {
        panic!("两个 Pipeline 都应包含一个拦截器");
    };
    assert!(left.same_handler(right));
    assert_eq!(left.label(), "Call#0");
}

#[test]
fn attributes_travel_with_clones() {
    const INSTALLED: AttributeKey<&'static str> = AttributeKey::new("feature.installed");

    let mut pipeline = TrailPipeline::with_phases([Phase::new("Call")]);
    pipeline.attributes_mut().put(INSTALLED, "auth");

    let copy = pipeline.clone();
    assert_eq!(copy.attributes().get(INSTALLED), Some(&"auth"));
    assert!(pipeline.attributes().contains(INSTALLED));
}
