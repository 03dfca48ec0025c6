//! 任务处理上下文
//!
//! 封装"我正在处理哪个 job 的哪一个步骤"这一信息

use std::fmt::Display;

/// 任务处理上下文
#[derive(Debug, Clone)]
pub struct TaskCtx {
    /// 所属 job
    pub job_id: String,

    /// 任务 ID
    pub task_id: String,

    /// 在 job 中的声明顺序（从1开始，仅用于日志显示）
    pub step_index: usize,

    /// 步骤总数
    pub total_steps: usize,
}

impl TaskCtx {
    pub fn new(
        job_id: impl Into<String>,
        task_id: impl Into<String>,
        step_index: usize,
        total_steps: usize,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: task_id.into(),
            step_index,
            total_steps,
        }
    }
}

impl Display for TaskCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[Job {} 任务 {} ({}/{})]",
            self.job_id, self.task_id, self.step_index, self.total_steps
        )
    }
}
