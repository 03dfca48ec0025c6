//! 进度事件协议
//!
//! 一个 job 的事件流必须满足：
//!
//! ```text
//! Started → (StepStarted → [Preview]* → StepCompleted)* → (Completed | Error)
//! ```
//!
//! 事件只是瞬时的 pub/sub 消息，不做持久化。

use serde::{Deserialize, Serialize};

/// 进度事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// 分析开始
    Started {
        total_steps: usize,
        /// 各步骤的显示名称，按声明顺序
        #[serde(default)]
        steps: Vec<String>,
    },
    /// 某个步骤开始
    StepStarted {
        step: String,
        #[serde(default)]
        step_name: String,
        #[serde(default)]
        step_number: usize,
        #[serde(default)]
        total_steps: usize,
        progress: u32,
        /// 已耗时（秒）
        elapsed: u64,
        #[serde(default)]
        estimated_remaining: u64,
        #[serde(default)]
        message: String,
    },
    /// 某个步骤结束（成功或失败）
    StepCompleted {
        step: String,
        #[serde(default)]
        step_name: String,
        summary: String,
        progress: u32,
    },
    /// 部分结果预览
    Preview {
        step: String,
        data: serde_json::Value,
    },
    /// 全部完成（至少一个步骤成功）
    Completed {
        total_time: u64,
        progress: u32,
        #[serde(default)]
        message: String,
        #[serde(default)]
        redirect_url: Option<String>,
    },
    /// 全部步骤失败
    Error { message: String, retryable: bool },
}

impl ProgressEvent {
    /// 事件类型名（与序列化后的 `type` 字段一致）
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Started { .. } => "started",
            ProgressEvent::StepStarted { .. } => "step_started",
            ProgressEvent::StepCompleted { .. } => "step_completed",
            ProgressEvent::Preview { .. } => "preview",
            ProgressEvent::Completed { .. } => "completed",
            ProgressEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed { .. } | ProgressEvent::Error { .. }
        )
    }

    /// 事件携带的进度值（如果有）
    pub fn progress(&self) -> Option<u32> {
        match self {
            ProgressEvent::StepStarted { progress, .. }
            | ProgressEvent::StepCompleted { progress, .. }
            | ProgressEvent::Completed { progress, .. } => Some(*progress),
            _ => None,
        }
    }
}

/// 实际发布到 topic 上的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub job_id: String,
    /// 同一个 job 内从 1 开始连续递增
    pub seq: u64,
    /// Unix 时间戳（秒）
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

impl EventEnvelope {
    pub fn new(job_id: impl Into<String>, seq: u64, event: ProgressEvent) -> Self {
        Self {
            job_id: job_id.into(),
            seq,
            timestamp: chrono::Utc::now().timestamp(),
            event,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// 按线性外推估算剩余时间（秒）
///
/// `estimated_total = elapsed * 100 / progress`，`progress == 0` 时返回 0。
pub fn estimate_remaining(progress: u32, elapsed: u64) -> u64 {
    if progress == 0 {
        return 0;
    }
    let estimated_total = elapsed.saturating_mul(100) / u64::from(progress);
    estimated_total.saturating_sub(elapsed)
}
