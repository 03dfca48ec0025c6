//! 错误类型
//!
//! 库内部的错误全部在这里定义，按层次划分：
//! - `ConfigurationError`：任务配置不合法（权重之和不为 100 等），开始前直接失败
//! - `PoolError`：凭证池构造失败
//! - `OrchestratorError`：编排层对外暴露的错误
//! - `PublishError`：事件序列违规（只记录日志，不会传给工作协程）
//! - `ConfigError`：环境变量解析失败
//!
//! 任务级别的失败（限流、瞬时错误、永久错误）不是 `Err`，
//! 而是记录在 [`crate::models::TaskOutcome`] 里。

use thiserror::Error;


/// 任务配置错误
///
/// 在任何事件发布之前检查，永不重试。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// 任务列表为空
    #[error("任务列表为空 (job: {job_id})")]
    EmptyPlan { job_id: String },

    /// job_id 为空
    #[error("job_id 不能为空")]
    EmptyJobId,

    /// 权重之和不为 100
    #[error("任务权重之和必须为 100，实际为 {actual} (job: {job_id})")]
    WeightSum { job_id: String, actual: u32 },

    /// 单个任务权重超出范围
    #[error("任务 {task_id} 的权重 {weight} 超出范围 [0, 100]")]
    WeightOutOfRange { task_id: String, weight: u32 },

    /// 任务 ID 重复
    #[error("任务 ID 重复: {task_id}")]
    DuplicateTask { task_id: String },
}

/// 凭证池错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// 没有任何凭证
    #[error("凭证池中没有任何 API Key")]
    NoCredentials,
}

/// 编排层错误
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("后台任务异常退出: {0}")]
    Join(String),
}

/// 事件发布错误
///
/// 表示调用方违反了事件序列：
/// `Started → (StepStarted → [Preview]* → StepCompleted)* → (Completed | Error)`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("重复的 started 事件")]
    AlreadyStarted,

    #[error("started 之前不能发布 {event}")]
    NotStarted { event: &'static str },

    #[error("步骤 {step} 不在进行中，不能发布 {event}")]
    StepNotInFlight { step: String, event: &'static str },

    #[error("步骤 {step} 已经开始")]
    StepAlreadyStarted { step: String },

    #[error("未知步骤: {step}")]
    UnknownStep { step: String },

    #[error("终止事件之后不能再发布 {event}")]
    AfterTerminal { event: &'static str },
}

/// 配置错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
}
