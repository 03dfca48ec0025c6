//! 单个任务的处理流程 - 流程层
//!
//! 核心职责：定义"一个分析步骤"的完整处理流程
//!
//! 流程顺序：
//! 1. 发布 step_started
//! 2. 取 key（首轮可能已经预先分配）→ 等待剩余冷却 → 调用服务（带超时）
//! 3. 按结果上报凭证池：成功清零、限流冷却、瞬时错误计数
//! 4. 可重试就换一个 key 重来，首次调用之外最多再试 `max_retries` 次
//! 5. 发布 preview（可选）和 step_completed，成功摘要带字数和尝试次数

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::clients::{ProviderClient, ProviderResponse};
use crate::infrastructure::CredentialPool;
use crate::models::{Credential, FailureKind, TaskOutcome, TaskSpec};
use crate::services::JobProgress;
use crate::utils::logging::truncate_text;
use crate::workflow::task_ctx::TaskCtx;

/// 失败步骤的摘要，客户端据此把步骤标成失败
pub const SUMMARY_FAILED: &str = "failed";

/// 成功步骤的摘要
pub fn success_summary(chars: usize, attempts: u32) -> String {
    format!("完成：{} 字，第 {} 次尝试成功", chars, attempts)
}

/// 流程参数
#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// 单次调用超时
    pub call_timeout: Duration,
    /// 成功后是否发布 preview
    pub emit_previews: bool,
    /// preview 摘录的最大字符数
    pub preview_chars: usize,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(120),
            emit_previews: true,
            preview_chars: 200,
        }
    }
}

/// 单个任务的处理流程
///
/// - 决定何时取 key、何时重试、何时放弃
/// - 不持有任何 key，每次尝试都向凭证池借用
/// - 失败只体现在返回的 [`TaskOutcome`] 里，不会影响其他任务
pub struct TaskFlow {
    pool: Arc<CredentialPool>,
    provider: Arc<dyn ProviderClient>,
    progress: Arc<JobProgress>,
    settings: FlowSettings,
}

impl TaskFlow {
    pub fn new(
        pool: Arc<CredentialPool>,
        provider: Arc<dyn ProviderClient>,
        progress: Arc<JobProgress>,
        settings: FlowSettings,
    ) -> Self {
        Self {
            pool,
            provider,
            progress,
            settings,
        }
    }

    /// 执行一个任务
    ///
    /// # 参数
    /// - `spec`: 任务定义
    /// - `ctx`: 日志上下文
    /// - `lease`: 首轮预先分配的 key，没有则现取
    ///
    /// # 返回
    /// 该任务的最终结果，不会返回错误
    pub async fn run(&self, spec: &TaskSpec, ctx: &TaskCtx, lease: Option<Credential>) -> TaskOutcome {
        info!("{} ▶️ 开始: {}", ctx, spec.display_name());
        // 违反序列的情况已经在 JobProgress 里记录
        let _ = self.progress.step_started(&spec.id, &spec.message);

        let (outcome, attempts) = self.attempt_until_done(spec, ctx, lease).await;

        match &outcome {
            TaskOutcome::Success { text } => {
                let chars = text.chars().count();
                info!("{} ✓ 完成 ({} 字，尝试 {} 次)", ctx, chars, attempts);
                if self.settings.emit_previews {
                    let data = json!({
                        "excerpt": truncate_text(text, self.settings.preview_chars),
                        "length": chars,
                    });
                    let _ = self.progress.preview(&spec.id, data);
                }
                let summary = success_summary(chars, attempts);
                let _ = self.progress.step_completed(&spec.id, &summary);
            }
            TaskOutcome::Failure { kind, message } => {
                warn!("{} ❌ 失败 ({}): {}", ctx, kind, message);
                let _ = self.progress.step_completed(&spec.id, SUMMARY_FAILED);
            }
        }

        outcome
    }

    /// 重试循环：首次调用加最多 `max_retries` 次重试，相邻两次不使用同一个 key
    ///
    /// 返回结果和实际调用次数
    async fn attempt_until_done(
        &self,
        spec: &TaskSpec,
        ctx: &TaskCtx,
        lease: Option<Credential>,
    ) -> (TaskOutcome, u32) {
        let max_attempts = spec.max_retries().saturating_add(1);
        let mut credential = lease.unwrap_or_else(|| self.pool.acquire());
        let mut attempt = 1;

        loop {
            self.wait_for_cooldown(&credential, ctx).await;
            debug!(
                "{} 第 {}/{} 次尝试，使用 {}",
                ctx, attempt, max_attempts, credential
            );

            let failure = match self.call_provider(spec, &credential).await {
                ProviderResponse::Success(text) => {
                    self.pool.report_success(&credential);
                    return (TaskOutcome::success(text), attempt);
                }
                ProviderResponse::RateLimited { wait_hint } => {
                    let wait = wait_hint.unwrap_or(self.pool.settings().default_rate_limit_wait);
                    self.pool.quarantine(&credential, wait);
                    TaskOutcome::failure(
                        FailureKind::RateLimited,
                        format!("被限流，建议等待 {:.1} 秒", wait.as_secs_f64()),
                    )
                }
                ProviderResponse::Failure {
                    kind: FailureKind::Permanent,
                    message,
                } => {
                    error!("{} 不可重试的错误: {}", ctx, message);
                    return (TaskOutcome::failure(FailureKind::Permanent, message), attempt);
                }
                ProviderResponse::Failure { message, .. } => {
                    self.pool.report_failure(&credential, &message);
                    TaskOutcome::failure(FailureKind::Transient, message)
                }
            };

            if attempt >= max_attempts {
                warn!("{} 已尝试 {} 次，放弃", ctx, attempt);
                return (failure, attempt);
            }

            attempt += 1;
            credential = self.pool.acquire_excluding(credential.id());
            info!("{} 🔄 换用 {} 重试 ({}/{})", ctx, credential, attempt, max_attempts);
        }
    }

    /// 调用服务，超时按瞬时错误处理
    async fn call_provider(&self, spec: &TaskSpec, credential: &Credential) -> ProviderResponse {
        let timeout = self.settings.call_timeout;
        match tokio::time::timeout(timeout, self.provider.send(credential, &spec.payload, timeout)).await {
            Ok(response) => response,
            Err(_) => ProviderResponse::transient(format!("调用超时 ({} 秒)", timeout.as_secs())),
        }
    }

    /// 所有 key 都在冷却时，凭证池会返回最早恢复的那个，这里把剩余时间等完
    async fn wait_for_cooldown(&self, credential: &Credential, ctx: &TaskCtx) {
        if let Some(left) = self.pool.cooldown_remaining(credential.id()) {
            info!(
                "{} ⏳ {} 冷却中，等待 {:.1} 秒",
                ctx,
                credential.id(),
                left.as_secs_f64()
            );
            tokio::time::sleep(left).await;
        }
    }
}
