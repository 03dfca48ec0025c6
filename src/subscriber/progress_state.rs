//! 客户端状态机
//!
//! 只由收到的事件驱动：
//!
//! ```text
//! Idle → Started → Processing → { Completed | Error }
//! ```
//!
//! 不认识的事件类型直接忽略；终止之后的事件也忽略。

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::models::{estimate_remaining, ProgressEvent, TOTAL_WEIGHT};

/// 完成后跳转前的停留时间
pub const DEFAULT_GRACE_DELAY: Duration = Duration::from_secs(3);

/// 服务端用来标记失败步骤的摘要
const FAILED_SUMMARY: &str = "failed";

/// 客户端阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Started,
    Processing,
    Completed,
    Error,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Error)
    }
}

/// 单个步骤的显示状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StepView {
    Pending,
    Running,
    Done(String),
    Failed,
}

/// 步骤列表中的一行
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRow {
    /// 步骤 ID；只从 `started` 得知名称时为空
    pub id: Option<String>,
    pub name: String,
    pub view: StepView,
}

/// 终止后延迟执行的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredAction {
    /// 跳转到结果页
    Navigate { url: Option<String>, after: Duration },
}

impl DeferredAction {
    pub fn after(&self) -> Duration {
        match self {
            DeferredAction::Navigate { after, .. } => *after,
        }
    }
}

/// 客户端进度状态
#[derive(Debug, Clone)]
pub struct ProgressState {
    phase: Phase,
    steps: Vec<StepRow>,
    total_steps: usize,
    progress: u32,
    elapsed: u64,
    remaining: u64,
    total_time: Option<u64>,
    message: Option<String>,
    error: Option<String>,
    retry_available: bool,
    last_preview: Option<(String, serde_json::Value)>,
    deferred: Option<DeferredAction>,
    grace_delay: Duration,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressState {
    pub fn new() -> Self {
        Self::with_grace_delay(DEFAULT_GRACE_DELAY)
    }

    pub fn with_grace_delay(grace_delay: Duration) -> Self {
        Self {
            phase: Phase::Idle,
            steps: Vec::new(),
            total_steps: 0,
            progress: 0,
            elapsed: 0,
            remaining: 0,
            total_time: None,
            message: None,
            error: None,
            retry_available: false,
            last_preview: None,
            deferred: None,
            grace_delay,
        }
    }

    /// 应用一个事件
    ///
    /// # 返回
    /// 状态是否发生变化
    pub fn apply(&mut self, event: &ProgressEvent) -> bool {
        if self.phase.is_terminal() {
            debug!("已经结束，忽略 {} 事件", event.kind());
            return false;
        }

        match event {
            ProgressEvent::Started { total_steps, steps } => {
                if self.phase != Phase::Idle {
                    debug!("重复的 started 事件，忽略");
                    return false;
                }
                self.phase = Phase::Started;
                self.total_steps = *total_steps;
                self.steps = steps
                    .iter()
                    .map(|name| StepRow {
                        id: None,
                        name: name.clone(),
                        view: StepView::Pending,
                    })
                    .collect();
            }
            ProgressEvent::StepStarted {
                step,
                step_name,
                total_steps,
                progress,
                elapsed,
                message,
                ..
            } => {
                self.phase = Phase::Processing;
                if *total_steps > 0 {
                    self.total_steps = *total_steps;
                }
                self.row_mut(step, step_name).view = StepView::Running;
                self.elapsed = self.elapsed.max(*elapsed);
                self.update_progress(*progress);
                if !message.is_empty() {
                    self.message = Some(message.clone());
                }
            }
            ProgressEvent::StepCompleted {
                step,
                step_name,
                summary,
                progress,
            } => {
                self.phase = Phase::Processing;
                self.row_mut(step, step_name).view = if summary == FAILED_SUMMARY {
                    StepView::Failed
                } else {
                    StepView::Done(summary.clone())
                };
                self.update_progress(*progress);
            }
            ProgressEvent::Preview { step, data } => {
                if self.phase == Phase::Started {
                    self.phase = Phase::Processing;
                }
                self.last_preview = Some((step.clone(), data.clone()));
            }
            ProgressEvent::Completed {
                total_time,
                message,
                redirect_url,
                ..
            } => {
                self.phase = Phase::Completed;
                self.progress = TOTAL_WEIGHT;
                self.remaining = 0;
                self.total_time = Some(*total_time);
                if !message.is_empty() {
                    self.message = Some(message.clone());
                }
                self.deferred = Some(DeferredAction::Navigate {
                    url: redirect_url.clone(),
                    after: self.grace_delay,
                });
            }
            ProgressEvent::Error { message, retryable } => {
                self.phase = Phase::Error;
                self.error = Some(message.clone());
                self.retry_available = *retryable;
            }
        }
        true
    }

    /// 应用一条原始 JSON 消息
    ///
    /// 无法解析或类型未知的消息直接忽略。
    pub fn apply_json(&mut self, payload: &str) -> bool {
        match serde_json::from_str::<ProgressEvent>(payload) {
            Ok(event) => self.apply(&event),
            Err(e) => {
                debug!("忽略无法识别的消息: {}", e);
                false
            }
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// 显示的百分比
    pub fn progress(&self) -> u32 {
        self.progress
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn steps(&self) -> &[StepRow] {
        &self.steps
    }

    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    /// 预计剩余时间（秒）
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn total_time(&self) -> Option<u64> {
        self.total_time
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn retry_available(&self) -> bool {
        self.retry_available
    }

    pub fn last_preview(&self) -> Option<&(String, serde_json::Value)> {
        self.last_preview.as_ref()
    }

    pub fn deferred_action(&self) -> Option<&DeferredAction> {
        self.deferred.as_ref()
    }

    /// 取走延迟动作，保证只执行一次
    pub fn take_deferred_action(&mut self) -> Option<DeferredAction> {
        self.deferred.take()
    }

    /// 一行状态描述，用于日志
    pub fn status_line(&self) -> String {
        match self.phase {
            Phase::Idle => "等待开始".to_string(),
            Phase::Started => format!("已开始，共 {} 个步骤", self.total_steps),
            Phase::Processing => format!(
                "[{}%] {} | 已用 {} | 剩余约 {}",
                self.progress,
                self.message.as_deref().unwrap_or("分析中"),
                format_time(self.elapsed),
                format_time(self.remaining)
            ),
            Phase::Completed => format!(
                "[100%] 完成，总耗时 {}",
                format_time(self.total_time.unwrap_or(self.elapsed))
            ),
            Phase::Error => format!(
                "出错: {}{}",
                self.error.as_deref().unwrap_or("未知错误"),
                if self.retry_available { "（可重试）" } else { "" }
            ),
        }
    }

    fn update_progress(&mut self, progress: u32) {
        self.progress = self.progress.max(progress.min(TOTAL_WEIGHT));
        self.remaining = estimate_remaining(self.progress, self.elapsed);
    }

    /// 找到对应的步骤行；`started` 只给了名称，第一次见到 ID 时补上
    fn row_mut(&mut self, step: &str, step_name: &str) -> &mut StepRow {
        let idx = self
            .steps
            .iter()
            .position(|row| row.id.as_deref() == Some(step))
            .or_else(|| {
                self.steps
                    .iter()
                    .position(|row| row.id.is_none() && (row.name == step_name || row.name == step))
            });

        let idx = match idx {
            Some(idx) => idx,
            None => {
                let name = if step_name.is_empty() { step } else { step_name };
                self.steps.push(StepRow {
                    id: None,
                    name: name.to_string(),
                    view: StepView::Pending,
                });
                self.steps.len() - 1
            }
        };

        let row = &mut self.steps[idx];
        row.id.get_or_insert_with(|| step.to_string());
        row
    }
}

/// 秒数格式化为 `m:ss`
pub fn format_time(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}
