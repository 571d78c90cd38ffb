//! 执行器等价性与编译顺序确定性的性质测试。
//!
//! # 教案式说明
//! - **意图（Why）**：蹦床驱动与直接循环在没有挂起时必须观察上等价；挂起只改变调度，不改变语义；
//!   编译缓存的快速追加路径必须与完全重建得到相同顺序。
//! - **逻辑（How）**：用 proptest 生成拦截器行为序列（透传、包裹、替换主体、终止、失败、吞掉失败），
//!   分别以直接执行器、蹦床驱动、以及“每个拦截器都挂起”的蹦床驱动执行，比较结果与调用轨迹。
//! - **契约（What）**：三种执行方式的最终主体、错误文本与轨迹逐项相等。

use futures::executor::block_on;
use proptest::prelude::*;
use spark_chain::{Phase, Pipeline, PipelineError};

use super::support::{Trail, yield_once};

#[derive(Clone, Copy, Debug)]
enum Behavior {
    Pass,
    Wrap,
    Replace(u8),
    Finish,
    Fail,
    Recover,
}

fn behavior() -> impl Strategy<Value = Behavior> {
    prop_oneof![
        3 => Just(Behavior::Pass),
        3 => Just(Behavior::Wrap),
        3 => any::<u8>().prop_map(Behavior::Replace),
        1 => Just(Behavior::Finish),
        1 => Just(Behavior::Fail),
        1 => Just(Behavior::Recover),
    ]
}

type NumberPipeline = Pipeline<u64, Trail>;

fn build(behaviors: &[(usize, Behavior)], phase_count: usize, suspend: bool) -> NumberPipeline {
    let phases: Vec<Phase> = (0..phase_count)
        .map(|index| Phase::new(format!("P{index}")))
        .collect();
    let mut pipeline = NumberPipeline::with_phases(phases.iter().cloned());

    for (position, (phase_index, behavior)) in behaviors.iter().copied().enumerate() {
        let phase = &phases[phase_index % phase_count];
        pipeline
            .intercept_labeled(phase, format!("i{position}"), move |ctx, subject| async move {
                if suspend {
                    yield_once().await;
                }
                let trail = ctx.context().clone();
                trail.push(format!("i{position}:{subject}"));
                match behavior {
                    Behavior::Pass => Ok(()),
                    Behavior::Wrap => {
                        let result = ctx.proceed().await;
                        if suspend {
                            yield_once().await;
                        }
                        trail.push(format!("i{position}:exit:{}", result.is_ok()));
                        result.map(|_| ())
                    }
                    Behavior::Replace(salt) => ctx
                        .proceed_with(subject.wrapping_mul(31).wrapping_add(u64::from(salt)))
                        .await
                        .map(|_| ()),
                    Behavior::Finish => {
                        ctx.finish();
                        Ok(())
                    }
                    Behavior::Fail => Err(PipelineError::failure(format!("i{position} failed"))),
                    Behavior::Recover => {
                        if let Err(error) = ctx.proceed().await {
                            trail.push(format!("i{position}:recovered:{error}"));
                        }
                        Ok(())
                    }
                }
            })
            .expect("阶段已注册");
    }
    pipeline
}

type Observation = (Result<u64, String>, Vec<String>);

fn observe_direct(pipeline: &NumberPipeline, seed: u64) -> Observation {
    let trail = Trail::default();
    let result = pipeline
        .execute_direct(trail.clone(), seed)
        .map_err(|error| error.to_string());
    (result, trail.snapshot())
}

fn observe_trampoline(pipeline: &NumberPipeline, seed: u64) -> Observation {
    let trail = Trail::default();
    let result = block_on(pipeline.execute(trail.clone(), seed)).map_err(|error| error.to_string());
    (result, trail.snapshot())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 96, .. ProptestConfig::default() })]

    /// 无挂起时两种执行器完全一致；全部挂起时蹦床驱动结果不变。
    #[test]
    fn executors_agree_with_and_without_suspension(
        behaviors in prop::collection::vec((0usize..4, behavior()), 0..12),
        phase_count in 1usize..4,
        seed in any::<u64>(),
    ) {
        let synchronous = build(&behaviors, phase_count, false);
        let direct = observe_direct(&synchronous, seed);
        let trampoline = observe_trampoline(&synchronous, seed);
        prop_assert_eq!(&direct, &trampoline, "直接执行器与蹦床驱动必须一致");

        let suspending = build(&behaviors, phase_count, true);
        let suspended = observe_trampoline(&suspending, seed);
        prop_assert_eq!(&suspended, &trampoline, "挂起不得改变执行语义");
    }

    /// 每次注册后都编译（触发快速追加）与最后一次性重建得到相同顺序，且等于按阶段稳定排序的结果。
    #[test]
    fn fast_append_matches_full_rebuild(
        registrations in prop::collection::vec(0usize..4, 0..24),
        phase_count in 1usize..5,
    ) {
        let phases: Vec<Phase> = (0..phase_count)
            .map(|index| Phase::new(format!("P{index}")))
            .collect();
        let mut incremental = NumberPipeline::with_phases(phases.iter().cloned());
        let mut rebuilt = NumberPipeline::with_phases(phases.iter().cloned());

        for (position, target) in registrations.iter().enumerate() {
            let phase = &phases[target % phase_count];
            for pipeline in [&mut incremental, &mut rebuilt] {
                pipeline
                    .intercept_labeled(phase, format!("r{position}"), |_ctx, _subject| async { Ok(()) })
                    .expect("阶段已注册");
            }
            let _ = incremental.compiled_order();
        }

        let mut expected: Vec<(usize, String)> = registrations
            .iter()
            .enumerate()
            .map(|(position, target)| (target % phase_count, format!("r{position}")))
            .collect();
        expected.sort_by_key(|(phase, _)| *phase);
        let expected: Vec<&str> = expected.iter().map(|(_, label)| label.as_str()).collect();

        let incremental_order = incremental.compiled_order();
        let rebuilt_order = rebuilt.compiled_order();
        prop_assert_eq!(incremental_order.labels(), rebuilt_order.labels());
        prop_assert_eq!(rebuilt_order.labels(), expected);
    }
}
