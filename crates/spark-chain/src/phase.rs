use std::{
    borrow::Cow,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

/// 阶段令牌：只携带名称、不携带行为的排序锚点。
///
/// # 教案式说明
/// - **意图（Why）**：各特性（认证、日志、压缩……）只需要声明“我在哪个阶段执行”，阶段本身
///   不应持有任何状态；以令牌形式存在即可。
/// - **逻辑（How）**：内部为 `Arc<PhaseName>`，比较与哈希都基于指针身份；`clone` 只增加引用计数，
///   克隆出的令牌与原令牌是同一个阶段。
/// - **契约（What）**：两个同名阶段互不相等；向其中一个注册的拦截器永远不会出现在另一个的槽位中。
#[derive(Clone)]
pub struct Phase {
    inner: Arc<PhaseName>,
}

struct PhaseName {
    name: Cow<'static, str>,
}

impl Phase {
    /// 创建新的阶段令牌。
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            inner: Arc::new(PhaseName { name: name.into() }),
        }
    }

    /// 获取展示名称。
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl PartialEq for Phase {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Phase {}

impl Hash for Phase {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Phase").field(&self.name()).finish()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 阶段相对于其他阶段的定位方式。
///
/// 仅在合并另一个 Pipeline 时用于重放阶段拓扑，不影响同一阶段内拦截器的顺序。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhaseRelation {
    /// 追加在末尾。
    Last,
    /// 位于引用阶段之前。
    Before(Phase),
    /// 位于引用阶段之后。
    After(Phase),
}
