use std::{borrow::Cow, fmt};

use crate::phase::{Phase, PhaseRelation};

/// 单个阶段的注册概况，由 `Pipeline::summary` 生成。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub relation: PhaseRelation,
    /// 按注册顺序排列的拦截器标签。
    pub interceptors: Vec<Cow<'static, str>>,
}

impl fmt::Display for PhaseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Phase `{}`, {} handlers",
            self.phase,
            self.interceptors.len()
        )
    }
}

/// 一个仍在 `proceed()` 中等待的拦截器帧。
///
/// 仅当 `PipelineConfig::trace_pending` 打开时记录；帧状态恰好被并发修改锁住时返回
/// [`PendingFrame::Unavailable`]，调用方应将其视为“本次无法采样”而非错误。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingFrame {
    Interceptor {
        index: usize,
        label: Cow<'static, str>,
        phase: Phase,
    },
    Unavailable,
}

impl fmt::Display for PendingFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingFrame::Interceptor {
                index,
                label,
                phase,
            } => write!(f, "#{index} `{label}` in phase `{phase}`"),
            PendingFrame::Unavailable => f.write_str("<frame state unavailable>"),
        }
    }
}
