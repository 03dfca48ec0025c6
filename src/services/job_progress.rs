//! 单个 job 的进度发布器
//!
//! 同一个 job 的所有事件都经过这里，保证：
//! - 恰好一个 `started`，并且是第一条
//! - 每个步骤 `step_started → [preview]* → step_completed`
//! - 恰好一个终止事件（`completed` 或 `error`），之后不再发布任何事件
//! - `seq` 连续递增，`progress` 单调不减，只有 `completed` 时等于 100
//!
//! 进度 = 已完成步骤的权重之和 + 进行中步骤权重的一半。

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::Instant;
use tracing::warn;

use crate::error::PublishError;
use crate::models::{estimate_remaining, EventEnvelope, ProgressEvent, TaskSpec, TOTAL_WEIGHT};
use crate::services::broadcaster::Broadcaster;

/// 终止前允许显示的最大进度
const MAX_PROGRESS_BEFORE_TERMINAL: u32 = TOTAL_WEIGHT - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepState {
    Pending,
    InFlight,
    Done,
}

#[derive(Debug)]
struct StepEntry {
    id: String,
    name: String,
    weight: u32,
    state: StepState,
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    seq: u64,
    steps: Vec<StepEntry>,
    started_steps: usize,
    progress: u32,
}

impl Inner {
    fn step_index(&self, step: &str) -> Result<usize, PublishError> {
        self.steps
            .iter()
            .position(|s| s.id == step)
            .ok_or_else(|| PublishError::UnknownStep {
                step: step.to_string(),
            })
    }

    fn ensure_running(&self, event: &'static str) -> Result<(), PublishError> {
        match self.phase {
            Phase::Idle => Err(PublishError::NotStarted { event }),
            Phase::Running => Ok(()),
            Phase::Terminal => Err(PublishError::AfterTerminal { event }),
        }
    }

    fn recompute_progress(&mut self) -> u32 {
        let raw: u32 = self
            .steps
            .iter()
            .map(|s| match s.state {
                StepState::Pending => 0,
                StepState::InFlight => s.weight / 2,
                StepState::Done => s.weight,
            })
            .sum();
        self.progress = self.progress.max(raw.min(MAX_PROGRESS_BEFORE_TERMINAL));
        self.progress
    }
}

/// 单个 job 的进度发布器
pub struct JobProgress {
    job_id: String,
    broadcaster: Arc<dyn Broadcaster>,
    started_at: Instant,
    inner: Mutex<Inner>,
}

impl JobProgress {
    pub fn new(job_id: impl Into<String>, specs: &[TaskSpec], broadcaster: Arc<dyn Broadcaster>) -> Self {
        let steps = specs
            .iter()
            .map(|spec| StepEntry {
                id: spec.id.clone(),
                name: spec.display_name().to_string(),
                weight: spec.weight,
                state: StepState::Pending,
            })
            .collect();

        Self {
            job_id: job_id.into(),
            broadcaster,
            started_at: Instant::now(),
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                seq: 0,
                steps,
                started_steps: 0,
                progress: 0,
            }),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// 当前进度
    pub fn progress(&self) -> u32 {
        self.lock().progress
    }

    /// 已耗时（秒）
    pub fn elapsed_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// 发布 `started`
    pub fn start(&self) -> Result<(), PublishError> {
        let mut inner = self.lock();
        if inner.phase != Phase::Idle {
            return self.reject(PublishError::AlreadyStarted);
        }
        inner.phase = Phase::Running;

        let event = ProgressEvent::Started {
            total_steps: inner.steps.len(),
            steps: inner.steps.iter().map(|s| s.name.clone()).collect(),
        };
        self.emit(&mut inner, event);
        Ok(())
    }

    /// 发布 `step_started`，该步骤的一半权重计入进度
    pub fn step_started(&self, step: &str, message: &str) -> Result<(), PublishError> {
        let mut inner = self.lock();
        if let Err(e) = inner.ensure_running("step_started") {
            return self.reject(e);
        }
        let idx = match inner.step_index(step) {
            Ok(idx) => idx,
            Err(e) => return self.reject(e),
        };
        if inner.steps[idx].state != StepState::Pending {
            return self.reject(PublishError::StepAlreadyStarted {
                step: step.to_string(),
            });
        }

        inner.steps[idx].state = StepState::InFlight;
        inner.started_steps += 1;
        let progress = inner.recompute_progress();
        let elapsed = self.elapsed_secs();

        let event = ProgressEvent::StepStarted {
            step: step.to_string(),
            step_name: inner.steps[idx].name.clone(),
            step_number: inner.started_steps,
            total_steps: inner.steps.len(),
            progress,
            elapsed,
            estimated_remaining: estimate_remaining(progress, elapsed),
            message: message.to_string(),
        };
        self.emit(&mut inner, event);
        Ok(())
    }

    /// 发布 `preview`，只允许在步骤进行中
    pub fn preview(&self, step: &str, data: serde_json::Value) -> Result<(), PublishError> {
        let mut inner = self.lock();
        if let Err(e) = inner.ensure_running("preview") {
            return self.reject(e);
        }
        let idx = match inner.step_index(step) {
            Ok(idx) => idx,
            Err(e) => return self.reject(e),
        };
        if inner.steps[idx].state != StepState::InFlight {
            return self.reject(PublishError::StepNotInFlight {
                step: step.to_string(),
                event: "preview",
            });
        }

        let event = ProgressEvent::Preview {
            step: step.to_string(),
            data,
        };
        self.emit(&mut inner, event);
        Ok(())
    }

    /// 发布 `step_completed`，该步骤的全部权重计入进度
    pub fn step_completed(&self, step: &str, summary: &str) -> Result<(), PublishError> {
        let mut inner = self.lock();
        if let Err(e) = inner.ensure_running("step_completed") {
            return self.reject(e);
        }
        let idx = match inner.step_index(step) {
            Ok(idx) => idx,
            Err(e) => return self.reject(e),
        };
        if inner.steps[idx].state != StepState::InFlight {
            return self.reject(PublishError::StepNotInFlight {
                step: step.to_string(),
                event: "step_completed",
            });
        }

        inner.steps[idx].state = StepState::Done;
        let progress = inner.recompute_progress();

        let event = ProgressEvent::StepCompleted {
            step: step.to_string(),
            step_name: inner.steps[idx].name.clone(),
            summary: summary.to_string(),
            progress,
        };
        self.emit(&mut inner, event);
        Ok(())
    }

    /// 发布 `completed`，进度置为 100，返回总耗时（秒）
    pub fn complete(&self, message: &str, redirect_url: Option<String>) -> Result<u64, PublishError> {
        let mut inner = self.lock();
        if let Err(e) = inner.ensure_running("completed") {
            return self.reject(e);
        }
        inner.phase = Phase::Terminal;
        inner.progress = TOTAL_WEIGHT;
        let total_time = self.elapsed_secs();

        let event = ProgressEvent::Completed {
            total_time,
            progress: TOTAL_WEIGHT,
            message: message.to_string(),
            redirect_url,
        };
        self.emit(&mut inner, event);
        Ok(total_time)
    }

    /// 发布 `error`
    pub fn fail(&self, message: &str, retryable: bool) -> Result<(), PublishError> {
        let mut inner = self.lock();
        if let Err(e) = inner.ensure_running("error") {
            return self.reject(e);
        }
        inner.phase = Phase::Terminal;

        let event = ProgressEvent::Error {
            message: message.to_string(),
            retryable,
        };
        self.emit(&mut inner, event);
        Ok(())
    }

    // ========== 内部实现 ==========

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 在锁内发布，保证发布顺序与 seq 一致
    fn emit(&self, inner: &mut Inner, event: ProgressEvent) {
        inner.seq += 1;
        let envelope = EventEnvelope::new(self.job_id.clone(), inner.seq, event);
        self.broadcaster.publish(&self.job_id, envelope);
    }

    fn reject<T>(&self, err: PublishError) -> Result<T, PublishError> {
        warn!("[Job {}] 进度事件被拒绝: {}", self.job_id, err);
        Err(err)
    }
}
