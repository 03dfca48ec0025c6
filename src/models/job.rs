//! Job：一次用户请求对应的完整多步骤分析

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::task::{TaskId, TaskOutcome, TaskSpec};
use crate::error::ConfigurationError;

/// 所有步骤权重之和
pub const TOTAL_WEIGHT: u32 = 100;

/// 经过校验的任务计划
///
/// 只能通过 [`JobPlan::new`] 构造，保证：
/// - job_id 非空
/// - 至少一个任务
/// - 任务 ID 不重复
/// - 权重之和恰好为 100
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPlan {
    job_id: String,
    specs: Vec<TaskSpec>,
}

impl JobPlan {
    pub fn new(job_id: impl Into<String>, specs: Vec<TaskSpec>) -> Result<Self, ConfigurationError> {
        let job_id = job_id.into();
        if job_id.trim().is_empty() {
            return Err(ConfigurationError::EmptyJobId);
        }
        if specs.is_empty() {
            return Err(ConfigurationError::EmptyPlan { job_id });
        }

        let mut seen = HashSet::new();
        let mut total: u32 = 0;
        for spec in &specs {
            if !seen.insert(spec.id.as_str()) {
                return Err(ConfigurationError::DuplicateTask {
                    task_id: spec.id.clone(),
                });
            }
            if spec.weight > TOTAL_WEIGHT {
                return Err(ConfigurationError::WeightOutOfRange {
                    task_id: spec.id.clone(),
                    weight: spec.weight,
                });
            }
            total += spec.weight;
        }

        if total != TOTAL_WEIGHT {
            return Err(ConfigurationError::WeightSum {
                job_id,
                actual: total,
            });
        }

        Ok(Self { job_id, specs })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn specs(&self) -> &[TaskSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn into_parts(self) -> (String, Vec<TaskSpec>) {
        (self.job_id, self.specs)
    }
}

/// Job 的最终状态
///
/// 至少一个任务成功即为 `Completed`，全部失败为 `Failed`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// 执行完毕的 Job
///
/// `outcomes` 严格按照 TaskSpec 的声明顺序排列，与完成顺序无关。
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub specs: Vec<TaskSpec>,
    pub outcomes: Vec<(TaskId, TaskOutcome)>,
    pub progress: u32,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub total_time: Duration,
}

impl Job {
    pub fn outcome(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == task_id)
            .map(|(_, outcome)| outcome)
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }

    /// 按声明顺序拼接所有成功步骤的文本，失败步骤标注为失败
    pub fn combined_text(&self) -> String {
        self.specs
            .iter()
            .zip(self.outcomes.iter())
            .map(|(spec, (_, outcome))| match outcome {
                TaskOutcome::Success { text } => format!("## {}\n{}", spec.display_name(), text),
                TaskOutcome::Failure { kind, .. } => {
                    format!("## {}\n(failed: {})", spec.display_name(), kind)
                }
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
