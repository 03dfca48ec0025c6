//! 文本生成服务的抽象接口
//!
//! 编排层只依赖三种结果：成功、限流、失败。具体的 HTTP 协议由实现方负责。

use async_trait::async_trait;
use std::time::Duration;

use crate::models::{Credential, FailureKind, TaskPayload};

/// 一次调用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderResponse {
    /// 成功，返回文本
    Success(String),
    /// 被限流，可能附带建议等待时间
    RateLimited { wait_hint: Option<Duration> },
    /// 失败；`kind` 只会是 `Transient` 或 `Permanent`
    Failure { kind: FailureKind, message: String },
}

impl ProviderResponse {
    pub fn transient(message: impl Into<String>) -> Self {
        ProviderResponse::Failure {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProviderResponse::Failure {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }
}

/// 文本生成服务
///
/// 实现方在 `timeout` 内完成一次调用；编排层另外还会用同样的上限包一层超时。
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn send(
        &self,
        credential: &Credential,
        payload: &TaskPayload,
        timeout: Duration,
    ) -> ProviderResponse;
}
