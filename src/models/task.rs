//! 分析步骤（任务）定义与结果

use serde::{Deserialize, Serialize};
use std::fmt;

/// 任务标识
pub type TaskId = String;

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 交给 provider 的请求内容，编排层不解析
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// 用户消息
    pub prompt: String,
    /// 系统角色（可选）
    #[serde(default)]
    pub system_role: Option<String>,
    /// 回复的最大 token 数（可选）
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl TaskPayload {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_role: None,
            max_tokens: None,
        }
    }

    pub fn with_system_role(mut self, role: impl Into<String>) -> Self {
        self.system_role = Some(role.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// 单个分析步骤
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// 步骤 ID（事件里的 `step`）
    pub id: TaskId,
    /// 显示名称
    #[serde(default)]
    pub name: String,
    /// 步骤开始时展示给用户的提示
    #[serde(default)]
    pub message: String,
    /// 占总进度的权重（0-100）
    pub weight: u32,
    /// 首次调用之后的最大重试次数，缺省为 3（即最多调用 4 次）
    #[serde(default)]
    pub max_retries: Option<u32>,
    pub payload: TaskPayload,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, weight: u32, payload: TaskPayload) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            message: String::new(),
            weight,
            max_retries: None,
            payload,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    /// 显示名称，未配置时使用 ID
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// 失败类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 重试耗尽后仍被限流
    RateLimited,
    /// 超时或服务端瞬时错误，重试耗尽
    Transient,
    /// 请求本身有问题，不重试
    Permanent,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::Permanent)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        };
        f.write_str(s)
    }
}

/// 单个任务的最终结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { text: String },
    Failure { kind: FailureKind, message: String },
}

impl TaskOutcome {
    pub fn success(text: impl Into<String>) -> Self {
        TaskOutcome::Success { text: text.into() }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            TaskOutcome::Success { text } => Some(text),
            TaskOutcome::Failure { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            TaskOutcome::Success { .. } => None,
            TaskOutcome::Failure { kind, .. } => Some(*kind),
        }
    }
}
