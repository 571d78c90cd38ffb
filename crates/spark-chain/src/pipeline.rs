//! # pipeline 模块说明
//!
//! ## 角色定位（Why）
//! - `Pipeline` 是“阶段图 + 编译缓存”的组合：注册期（`&mut self`）维护阶段顺序与各阶段拦截器，
//!   执行期（`&self`）按需编译出扁平序列并交给执行帧；
//! - 上层特性只通过这里的注册 API 接入，彼此之间不需要知道对方的存在。
//!
//! ## 核心策略（How）
//! - 阶段槽位惰性提升：`add_phase` 只登记裸阶段，首次注册拦截器时才分配列表；
//! - 拦截器列表写时复制（见 [`crate::list`]），模板 Pipeline 可以零复制地派生出大量实例；
//! - 编译缓存三种形态：空序列不分配、单阶段直接复用阶段列表、多阶段拼接；追加到“拥有序列尾部”
//!   的阶段且缓存尚未交出时，直接在缓存上追加而不失效。
//!
//! ## 契约（What）
//! - 阶段身份在同一 Pipeline 内唯一；重复添加是空操作；
//! - 编译缓存要么处于“需要重建”，要么恰好等于按阶段顺序拼接的各阶段拦截器；
//! - 已开始的执行永远看不到之后的注册修改。

use std::{borrow::Cow, fmt, future::Future, sync::Arc};

use spin::Mutex;
use tracing::{debug, trace};

use crate::{
    attributes::Attributes,
    cancellation::Cancellation,
    compiled::{CachedOrder, CompiledOrder, InterceptorChain},
    config::{ExecutionMode, PipelineConfig},
    context::{Frame, PipelineContext},
    diagnostics::PhaseSummary,
    direct,
    engine::Execution,
    error::{PipelineError, Result},
    interceptor::{FnInterceptor, Interceptor, InterceptorEntry},
    list::InterceptorList,
    phase::{Phase, PhaseRelation},
};

const TARGET: &str = "spark_chain::pipeline";

/// 已提升的阶段：阶段令牌、定位关系与拦截器列表。
struct PhaseContent<S, C> {
    phase: Phase,
    relation: PhaseRelation,
    interceptors: InterceptorList<S, C>,
}

impl<S, C> PhaseContent<S, C> {
    fn new(phase: Phase, relation: PhaseRelation) -> Self {
        Self {
            phase,
            relation,
            interceptors: InterceptorList::new(),
        }
    }
}

enum PhaseSlot<S, C> {
    Bare(Phase),
    Content(PhaseContent<S, C>),
}

impl<S, C> PhaseSlot<S, C> {
    fn phase(&self) -> &Phase {
        match self {
            PhaseSlot::Bare(phase) => phase,
            PhaseSlot::Content(content) => &content.phase,
        }
    }

    fn relation(&self) -> PhaseRelation {
        match self {
            PhaseSlot::Bare(_) => PhaseRelation::Last,
            PhaseSlot::Content(content) => content.relation.clone(),
        }
    }

    fn interceptors(&self) -> Option<&InterceptorList<S, C>> {
        match self {
            PhaseSlot::Bare(_) => None,
            PhaseSlot::Content(content) => Some(&content.interceptors),
        }
    }

    fn interceptor_len(&self) -> usize {
        self.interceptors().map_or(0, InterceptorList::len)
    }

    fn promote(&mut self) -> &mut PhaseContent<S, C> {
        if let PhaseSlot::Bare(phase) = self {
            let phase = phase.clone();
            *self = PhaseSlot::Content(PhaseContent::new(phase, PhaseRelation::Last));
        }
        match self {
            PhaseSlot::Content(content) => content,
            PhaseSlot::Bare(_) => unreachable!("阶段槽位刚刚完成提升"),
        }
    }

    fn share_clone(&self) -> Self {
        match self {
            PhaseSlot::Bare(phase) => PhaseSlot::Bare(phase.clone()),
            PhaseSlot::Content(content) => PhaseSlot::Content(PhaseContent {
                phase: content.phase.clone(),
                relation: content.relation.clone(),
                interceptors: content.interceptors.share_clone(),
            }),
        }
    }
}

/// 阶段化、可挂起、可合并的拦截器执行链。
///
/// # 教案式说明
/// - **意图（Why）**：为“主体沿一组独立注册的处理器流动”提供确定的全局顺序与统一的
///   继续 / 终止 / 失败协议；处理器可以执行异步 I/O 而不阻塞工作线程。
/// - **逻辑（How）**：
///   - 阶段顺序即槽位顺序，同阶段内按注册顺序；
///   - 执行时取编译缓存的共享快照构造执行帧，由 [`Execution`] 驱动；
/// - **契约（What）**：
///   - 注册需要 `&mut self`，执行只需要 `&self`，多个执行可以并发进行；
///   - 泛型 `S` 为被处理的主体，`C` 为整个执行期间只读的上下文。
/// - **风险（Trade-offs）**：编译缓存由 `spin::Mutex` 保护，只在编译与交出快照时短暂持锁；
///   大量并发执行首次编译时会在锁上自旋。
pub struct Pipeline<S, C> {
    slots: Vec<PhaseSlot<S, C>>,
    interceptor_count: usize,
    compiled: Mutex<CompiledOrder<S, C>>,
    config: PipelineConfig,
    attributes: Attributes,
}

impl<S, C> Pipeline<S, C> {
    /// 创建不含任何阶段的 Pipeline。
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            interceptor_count: 0,
            compiled: Mutex::new(CompiledOrder::new()),
            config: PipelineConfig::default(),
            attributes: Attributes::new(),
        }
    }

    /// 按给定顺序登记阶段。
    pub fn with_phases(phases: impl IntoIterator<Item = Phase>) -> Self {
        let mut pipeline = Self::new();
        for phase in phases {
            pipeline.add_phase(phase);
        }
        pipeline
    }

    /// 创建只含一个阶段、并预先注册一组拦截器的 Pipeline。
    pub fn with_interceptors(
        phase: Phase,
        interceptors: impl IntoIterator<Item = Arc<dyn Interceptor<S, C>>>,
    ) -> Self {
        let mut pipeline = Self::with_phases([phase]);
        for handler in interceptors {
            pipeline.push_entry(0, None, handler);
        }
        pipeline
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn set_config(&mut self, config: PipelineConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    /// 按执行顺序返回全部阶段。
    pub fn phases(&self) -> Vec<Phase> {
        self.slots.iter().map(|slot| slot.phase().clone()).collect()
    }

    pub fn has_phase(&self, phase: &Phase) -> bool {
        self.position(phase).is_some()
    }

    /// 是否没有任何拦截器（与阶段数量无关）。
    pub fn is_empty(&self) -> bool {
        self.interceptor_count == 0
    }

    pub fn interceptor_count(&self) -> usize {
        self.interceptor_count
    }

    /// 追加阶段；阶段已存在时为空操作。
    pub fn add_phase(&mut self, phase: Phase) {
        if self.has_phase(&phase) {
            return;
        }
        debug!(target: TARGET, phase = %phase, "phase appended");
        self.slots.push(PhaseSlot::Bare(phase));
    }

    /// 将 `phase` 插入到 `reference` 之前。
    ///
    /// # 错误
    /// - `reference` 未注册时返回 [`PipelineError::InvalidPhase`]；`phase` 已存在时为空操作。
    pub fn insert_phase_before(&mut self, reference: &Phase, phase: Phase) -> Result<()> {
        self.insert_relative(phase, PhaseRelation::Before(reference.clone()))
    }

    /// 将 `phase` 插入到 `reference` 之后，错误语义同 [`Self::insert_phase_before`]。
    pub fn insert_phase_after(&mut self, reference: &Phase, phase: Phase) -> Result<()> {
        self.insert_relative(phase, PhaseRelation::After(reference.clone()))
    }

    /// 向 `phase` 追加一个闭包拦截器，标签自动生成为 `"<阶段名>#<序号>"`。
    pub fn intercept<F, Fut>(&mut self, phase: &Phase, f: F) -> Result<()>
    where
        F: Fn(PipelineContext<S, C>, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(phase, None, Arc::new(FnInterceptor(f)))
    }

    /// 与 [`Self::intercept`] 相同，但显式指定诊断标签。
    pub fn intercept_labeled<F, Fut>(
        &mut self,
        phase: &Phase,
        label: impl Into<Cow<'static, str>>,
        f: F,
    ) -> Result<()>
    where
        F: Fn(PipelineContext<S, C>, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(phase, Some(label.into()), Arc::new(FnInterceptor(f)))
    }

    /// 注册一个已装箱的拦截器，适合同一实例在多个 Pipeline 间复用。
    pub fn intercept_handler(
        &mut self,
        phase: &Phase,
        handler: Arc<dyn Interceptor<S, C>>,
    ) -> Result<()> {
        self.register(phase, None, handler)
    }

    /// 共享某个阶段当前的拦截器列表；该阶段此后的写入会先复制。
    pub fn phase_interceptors(&self, phase: &Phase) -> Result<InterceptorChain<S, C>> {
        let slot = self
            .slot(phase)
            .ok_or_else(|| PipelineError::invalid_phase(phase))?;
        Ok(match slot.interceptors() {
            Some(list) => InterceptorChain::from_arc(list.share()),
            None => InterceptorChain::empty(),
        })
    }

    /// 显式编译并返回全局顺序，不把缓存标记为已交出。
    pub fn compiled_order(&self) -> InterceptorChain<S, C> {
        let mut compiled = self.compiled.lock();
        self.compile_locked(&mut compiled)
    }

    /// 合并另一个 Pipeline 的阶段与拦截器。
    ///
    /// # 教案式说明
    /// - **逻辑（How）**：
    ///   - `from` 没有阶段：空操作；
    ///   - 本 Pipeline 没有阶段：结构性采纳 `from` 的全部列表与编译缓存，不复制任何拦截器；
    ///   - 否则按 `from` 记录的关系重放缺失阶段（多轮进行，直到所有引用已就位的阶段都放下；
    ///     某轮没有进展时剩余阶段按 `Last` 追加），再把同名阶段的拦截器追加到本方之后。
    /// - **契约（What）**：同一阶段内，本方拦截器在前、合并来的在后；合并从不失败。
    pub fn merge(&mut self, from: &Pipeline<S, C>) {
        if from.slots.is_empty() {
            return;
        }

        if self.slots.is_empty() {
            self.slots = from.slots.iter().map(PhaseSlot::share_clone).collect();
            self.interceptor_count += from.interceptor_count;
            *self.compiled.get_mut() = CompiledOrder::adopted(from.shared_state());
            debug!(
                target: TARGET,
                phases = self.slots.len(),
                interceptors = self.interceptor_count,
                "pipeline adopted structurally"
            );
            return;
        }

        self.compiled.get_mut().invalidate();
        self.replay_phases(from);

        let mut merged = 0;
        for slot in &from.slots {
            let Some(list) = slot.interceptors().filter(|list| !list.is_empty()) else {
                continue;
            };
            let Some(index) = self.position(slot.phase()) else {
                continue;
            };
            self.slots[index].promote().interceptors.absorb(list);
            merged += list.len();
        }
        self.interceptor_count += merged;
        debug!(
            target: TARGET,
            phases = self.slots.len(),
            merged,
            "pipeline merged"
        );
    }

    /// 丢弃本方全部注册，改为结构性采纳 `from`。配置与属性保持不变。
    pub fn reset_from(&mut self, from: &Pipeline<S, C>) {
        self.slots.clear();
        self.interceptor_count = 0;
        self.compiled.get_mut().invalidate();
        self.merge(from);
    }

    /// 每个阶段的注册概况，按执行顺序排列。
    pub fn summary(&self) -> Vec<PhaseSummary> {
        self.slots
            .iter()
            .map(|slot| PhaseSummary {
                phase: slot.phase().clone(),
                relation: slot.relation(),
                interceptors: slot
                    .interceptors()
                    .map(|list| {
                        list.entries()
                            .iter()
                            .map(InterceptorEntry::label_cow)
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect()
    }

    fn position(&self, phase: &Phase) -> Option<usize> {
        self.slots.iter().position(|slot| slot.phase() == phase)
    }

    fn slot(&self, phase: &Phase) -> Option<&PhaseSlot<S, C>> {
        self.slots.iter().find(|slot| slot.phase() == phase)
    }

    fn insert_relative(&mut self, phase: Phase, relation: PhaseRelation) -> Result<()> {
        if self.has_phase(&phase) {
            return Ok(());
        }
        let at = match &relation {
            PhaseRelation::Last => self.slots.len(),
            PhaseRelation::Before(reference) => self
                .position(reference)
                .ok_or_else(|| PipelineError::invalid_phase(reference))?,
            PhaseRelation::After(reference) => {
                self.position(reference)
                    .ok_or_else(|| PipelineError::invalid_phase(reference))?
                    + 1
            }
        };
        debug!(target: TARGET, phase = %phase, relation = ?relation, at, "phase inserted");
        self.slots
            .insert(at, PhaseSlot::Content(PhaseContent::new(phase, relation)));
        Ok(())
    }

    fn replay_phases(&mut self, from: &Pipeline<S, C>) {
        let mut remaining: Vec<&PhaseSlot<S, C>> = from
            .slots
            .iter()
            .filter(|slot| !self.has_phase(slot.phase()))
            .collect();

        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|slot| {
                let placed = match slot.relation() {
                    PhaseRelation::Last => {
                        self.add_phase(slot.phase().clone());
                        true
                    }
                    relation => self.insert_relative(slot.phase().clone(), relation).is_ok(),
                };
                !placed
            });
            if remaining.len() == before {
                for slot in remaining.drain(..) {
                    debug!(
                        target: TARGET,
                        phase = %slot.phase(),
                        "merged phase reference missing, appended last"
                    );
                    self.add_phase(slot.phase().clone());
                }
            }
        }
    }

    fn register(
        &mut self,
        phase: &Phase,
        label: Option<Cow<'static, str>>,
        handler: Arc<dyn Interceptor<S, C>>,
    ) -> Result<()> {
        let index = self
            .position(phase)
            .ok_or_else(|| PipelineError::invalid_phase(phase))?;
        self.push_entry(index, label, handler);
        Ok(())
    }

    fn push_entry(
        &mut self,
        index: usize,
        label: Option<Cow<'static, str>>,
        handler: Arc<dyn Interceptor<S, C>>,
    ) {
        let owns_tail = self.slots[index + 1..]
            .iter()
            .all(|slot| slot.interceptor_len() == 0);
        let content = self.slots[index].promote();
        let label = label.unwrap_or_else(|| {
            Cow::Owned(format!("{}#{}", content.phase, content.interceptors.len()))
        });
        let entry = InterceptorEntry::new(label, content.phase.clone(), handler);

        let compiled = self.compiled.get_mut();
        let reuses_phase = !compiled.is_handed_out()
            && compiled.source_phase() == Some(&content.phase);
        let extends_owned = !compiled.is_handed_out()
            && owns_tail
            && matches!(compiled.state(), CachedOrder::Owned(_));

        if reuses_phase {
            // 先释放缓存持有的快照，阶段列表才能原地追加。
            compiled.invalidate();
            content.interceptors.push(entry);
            compiled.install(CachedOrder::Phase {
                phase: content.phase.clone(),
                items: content.interceptors.snapshot(),
            });
            trace!(target: TARGET, phase = %content.phase, "fast append on phase-backed order");
        } else if extends_owned {
            content.interceptors.push(entry.clone());
            if let CachedOrder::Owned(items) = compiled.state_mut() {
                Arc::make_mut(items).push(entry);
            }
            trace!(target: TARGET, phase = %content.phase, "fast append on compiled tail");
        } else {
            compiled.invalidate();
            content.interceptors.push(entry);
        }
        self.interceptor_count += 1;
    }

    fn rebuild(&self) -> CachedOrder<S, C> {
        if self.interceptor_count == 0 {
            return CachedOrder::Empty;
        }
        let mut populated = self.slots.iter().filter_map(|slot| {
            slot.interceptors()
                .filter(|list| !list.is_empty())
                .map(|list| (slot.phase(), list))
        });
        match (populated.next(), populated.next()) {
            (None, _) => CachedOrder::Empty,
            (Some((phase, list)), None) => CachedOrder::Phase {
                phase: phase.clone(),
                items: list.snapshot(),
            },
            _ => {
                let mut items = Vec::with_capacity(self.interceptor_count);
                for list in self.slots.iter().filter_map(PhaseSlot::interceptors) {
                    items.extend(list.entries().iter().cloned());
                }
                CachedOrder::Owned(Arc::new(items))
            }
        }
    }

    fn compile_locked(&self, compiled: &mut CompiledOrder<S, C>) -> InterceptorChain<S, C> {
        if let Some(chain) = compiled.chain() {
            return chain;
        }
        compiled.install(self.rebuild());
        debug!(
            target: TARGET,
            interceptors = self.interceptor_count,
            phase_backed = compiled.source_phase().is_some(),
            "compiled order rebuilt"
        );
        compiled.chain().unwrap_or_else(InterceptorChain::empty)
    }

    /// 编译并把缓存标记为已交出，返回缓存形态的共享副本。
    fn shared_state(&self) -> CachedOrder<S, C> {
        let mut compiled = self.compiled.lock();
        self.compile_locked(&mut compiled);
        self.hand_out(&mut compiled);
        compiled.state().clone()
    }

    fn shared_chain(&self) -> InterceptorChain<S, C> {
        let mut compiled = self.compiled.lock();
        let chain = self.compile_locked(&mut compiled);
        self.hand_out(&mut compiled);
        chain
    }

    fn hand_out(&self, compiled: &mut CompiledOrder<S, C>) {
        compiled.mark_handed_out();
        if let Some(list) = compiled
            .source_phase()
            .and_then(|phase| self.slot(phase))
            .and_then(PhaseSlot::interceptors)
        {
            list.mark_shared();
        }
    }
}

impl<S, C> Pipeline<S, C>
where
    S: Clone + Send + 'static,
    C: Send + Sync + 'static,
{
    /// 以 `subject` 为初始主体执行整条链，返回驱动执行的 Future。
    ///
    /// 执行器由 [`PipelineConfig::mode`] 决定；没有任何拦截器挂起时，首次轮询即完成。
    pub fn execute(&self, context: C, subject: S) -> Execution<S, C> {
        self.execute_with_cancellation(context, subject, Cancellation::new())
    }

    /// 与 [`Self::execute`] 相同，但使用外部提供的取消令牌。
    pub fn execute_with_cancellation(
        &self,
        context: C,
        subject: S,
        cancellation: Cancellation,
    ) -> Execution<S, C> {
        let frame = Frame::new(
            context,
            subject,
            self.shared_chain(),
            self.config.mode,
            self.config.trace_pending,
            cancellation,
        );
        Execution::start(frame)
    }

    /// 用非挂起执行器同步执行整条链。
    ///
    /// # 错误
    /// - 任一拦截器真正挂起时返回 [`PipelineError::UnexpectedSuspension`]，挂起的拦截器随即被丢弃。
    pub fn execute_direct(&self, context: C, subject: S) -> Result<S> {
        let frame = Frame::new(
            context,
            subject,
            self.shared_chain(),
            ExecutionMode::Direct,
            self.config.trace_pending,
            Cancellation::new(),
        );
        direct::run_to_completion(frame)
    }
}

impl<C> Pipeline<(), C>
where
    C: Send + Sync + 'static,
{
    /// 无主体 Pipeline 的便捷入口。
    pub fn execute_unit(&self, context: C) -> Execution<(), C> {
        self.execute(context, ())
    }
}

impl<S, C> Default for Pipeline<S, C> {
    fn default() -> Self {
        Self::new()
    }
}

/// 克隆即“新建并合并自身”：阶段列表结构性共享，任一方后续修改都不会影响另一方。
impl<S, C> Clone for Pipeline<S, C> {
    fn clone(&self) -> Self {
        let mut pipeline = Pipeline::new().with_config(self.config.clone());
        pipeline.attributes = self.attributes.clone();
        pipeline.merge(self);
        pipeline
    }
}

impl<S, C> fmt::Display for Pipeline<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for summary in self.summary() {
            writeln!(f, "{summary}")?;
        }
        Ok(())
    }
}

impl<S, C> fmt::Debug for Pipeline<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("phases", &self.phases())
            .field("interceptor_count", &self.interceptor_count)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
