use serde::Deserialize;
use thiserror::Error;

/// 执行模式：决定 `Pipeline::execute` 使用哪一种执行器。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// 挂起感知的蹦床执行器，允许拦截器真正挂起。
    #[default]
    Trampoline,
    /// 直接循环执行器，拦截器以嵌套 `await` 的方式串联，用于诊断与确定性追踪。
    Direct,
}

/// Pipeline 运行期配置。
///
/// # 教案式说明
/// - **意图（Why）**：宿主需要在不改代码的情况下切换执行器或打开挂起帧追踪，配置可随其他
///   运行期参数一起写入 TOML。
/// - **逻辑（How）**：`serde` 反序列化，缺省字段取 [`Default`]；未知字段直接拒绝，防止拼写错误
///   被静默忽略。
/// - **契约（What）**：配置只影响执行路径的选择与诊断能力，不影响执行结果。
///
/// ```toml
/// mode = "direct"
/// trace_pending = true
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// 执行器选择。
    pub mode: ExecutionMode,
    /// 是否记录挂起帧轨迹，供 `PipelineContext::pending_frames` 查询。
    pub trace_pending: bool,
}

impl PipelineConfig {
    /// 从 TOML 文本解析配置。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(ConfigError::Parse)
    }

    /// 以链式写法切换执行模式。
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// 以链式写法开关挂起帧追踪。
    pub fn with_trace_pending(mut self, enabled: bool) -> Self {
        self.trace_pending = enabled;
        self
    }
}

/// 配置解析错误。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to parse pipeline config: {0}")]
    Parse(#[source] toml::de::Error),
}
